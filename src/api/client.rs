use crate::api::options::{ChatOptions, ChatOptionsValidated};
use crate::client::{ClientError, ClientExit, ClientFailoverAgent, Terminal};
use crate::cluster::ClusterTopology;
use std::convert::TryFrom;
use std::net::IpAddr;

pub struct ChatClientConfig {
    /// Address of the original leader.
    pub server_ip: IpAddr,
    pub base_port: u16,
    pub info_logger: slog::Logger,
    pub options: ChatOptions,
}

/// Runs a chat client against the cluster until the user leaves, deletes their account, or no
/// member is left to talk to.
pub async fn run_chat_client<T: Terminal>(config: ChatClientConfig, terminal: T) -> Result<ClientExit, ClientError> {
    let options = ChatOptionsValidated::try_from(config.options)
        .map_err(|e| ClientError::IllegalOptions(e.to_string()))?;
    let topology = ClusterTopology::for_client(config.base_port, config.server_ip);

    ClientFailoverAgent::new(config.info_logger, terminal, topology, options)
        .run()
        .await
}
