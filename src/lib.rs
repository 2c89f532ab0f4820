mod actor;
mod api;
mod client;
mod cluster;
mod directory;
mod replica;
mod server;

pub use api::create_root_logger_for_file;
pub use api::create_root_logger_for_stdout;
pub use api::run_chat_client;
pub use api::try_create_chat_node;
pub use api::ChatClientConfig;
pub use api::ChatNode;
pub use api::ChatNodeConfig;
pub use api::ChatNodeCreationError;
pub use api::ChatOptions;
pub use api::NodeError;
pub use client::ClientError;
pub use client::ClientExit;
pub use client::StdioTerminal;
pub use client::Terminal;
pub use cluster::NodeRole;
pub use cluster::NodeRoleListener;

// The crate root holds nothing but `mod` and `pub use` statements.
// No `mod` is `pub`. Public types are exported one `pub use` at a time.
