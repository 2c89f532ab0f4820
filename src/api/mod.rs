//! The library's public surface: configuration, construction of nodes and clients, and logging.
mod client;
mod logging;
mod options;
mod wiring;

pub use client::run_chat_client;
pub use client::ChatClientConfig;
pub use logging::create_root_logger_for_file;
pub use logging::create_root_logger_for_stdout;
pub use options::ChatOptions;
pub use wiring::try_create_chat_node;
pub use wiring::ChatNode;
pub use wiring::ChatNodeConfig;
pub use wiring::ChatNodeCreationError;
pub use wiring::NodeError;

pub(crate) use options::ChatOptionsValidated;
