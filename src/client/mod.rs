//! The chat client: a terminal relay that follows the cluster through failovers.
mod agent;
mod terminal;

pub use agent::ClientError;
pub use agent::ClientExit;
pub(crate) use agent::ClientFailoverAgent;
pub use terminal::StdioTerminal;
pub use terminal::Terminal;
