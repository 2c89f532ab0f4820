use crate::api::ChatOptionsValidated;
use crate::client::terminal::Terminal;
use crate::cluster::{
    connect_with_timeout, framed_halves, ClusterTopology, ConnectError, FrameReader, FrameWriter, Hello,
    MemberIndex, TopologyPublication,
};
use crate::server::DELETE_CONFIRMATION;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;

const DELETE_MENU_CHOICE: &str = "3";

/// Why a chat client stopped without an error.
#[derive(Debug, Eq, PartialEq)]
pub enum ClientExit {
    /// The user confirmed deletion of their account.
    AccountDeleted,
    /// The terminal ran out of input.
    InputClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("No reachable server left in the cluster")]
    NoReachableServer,
    #[error("Unexpected failure connecting to the cluster: {0}")]
    Connect(String),
    #[error("Illegal options for configuring client: {0}")]
    IllegalOptions(String),
    #[error("Terminal failure: {0}")]
    Terminal(#[from] io::Error),
}

impl From<ConnectError> for ClientError {
    fn from(e: ConnectError) -> Self {
        if e.is_retryable() {
            ClientError::NoReachableServer
        } else {
            ClientError::Connect(e.to_string())
        }
    }
}

struct ServerLink {
    address: SocketAddr,
    reader: FrameReader,
    writer: FrameWriter,
    // Every (re)connect starts with a topology publication.
    awaiting_topology: bool,
}

enum ClientEvent {
    Input(io::Result<Option<String>>),
    Server(Option<io::Result<bytes::BytesMut>>),
}

/// ClientFailoverAgent relays between the user's terminal and whichever member currently leads,
/// moving on to the next member in succession order whenever the connection drops.
pub(crate) struct ClientFailoverAgent<T> {
    logger: slog::Logger,
    terminal: T,
    topology: ClusterTopology,
    options: ChatOptionsValidated,
    pending_deletion: bool,
}

impl<T: Terminal> ClientFailoverAgent<T> {
    pub(crate) fn new(
        logger: slog::Logger,
        terminal: T,
        topology: ClusterTopology,
        options: ChatOptionsValidated,
    ) -> Self {
        ClientFailoverAgent {
            logger,
            terminal,
            topology,
            options,
            pending_deletion: false,
        }
    }

    pub(crate) async fn run(mut self) -> Result<ClientExit, ClientError> {
        let entry_point = self
            .topology
            .address_of(self.topology.leader())
            .ok_or(ClientError::NoReachableServer)?;
        let mut server = open_server_link(entry_point, &self.options).await?;
        self.terminal
            .display(&format!("Successfully connected to server @ {}", entry_point))
            .await?;

        loop {
            let event = tokio::select! {
                line = self.terminal.next_line() => ClientEvent::Input(line),
                frame = server.reader.next() => ClientEvent::Server(frame),
            };

            match event {
                ClientEvent::Input(line) => {
                    let line = match line? {
                        Some(line) => line,
                        None => return Ok(ClientExit::InputClosed),
                    };
                    if let Some(exit) = self.forward_input(&mut server, line).await? {
                        return Ok(exit);
                    }
                }
                ClientEvent::Server(Some(Ok(frame))) => self.show_frame(&mut server, &frame).await?,
                ClientEvent::Server(Some(Err(e))) => {
                    slog::warn!(self.logger, "Read from {} failed: {:?}", server.address, e);
                    server = self.failover(server.address).await?;
                }
                ClientEvent::Server(None) => {
                    server = self.failover(server.address).await?;
                }
            }
        }
    }

    /// Sends one line to the server. Some(exit) if that line ends the client.
    async fn forward_input(&mut self, server: &mut ServerLink, line: String) -> Result<Option<ClientExit>, ClientError> {
        // Sent as typed so message text survives. Only the menu choices are compared trimmed.
        let choice = line.trim().to_string();
        if let Err(e) = server.writer.send(Bytes::from(line)).await {
            // The read side will notice too, and drive the failover from there.
            slog::warn!(self.logger, "Write to {} failed: {:?}", server.address, e);
            return Ok(None);
        }

        if self.pending_deletion {
            if choice == DELETE_CONFIRMATION {
                slog::info!(self.logger, "Account deletion confirmed, exiting");
                return Ok(Some(ClientExit::AccountDeleted));
            }
            self.pending_deletion = false;
        }
        if choice == DELETE_MENU_CHOICE {
            self.pending_deletion = true;
        }

        Ok(None)
    }

    async fn show_frame(&mut self, server: &mut ServerLink, frame: &[u8]) -> Result<(), ClientError> {
        if server.awaiting_topology {
            server.awaiting_topology = false;
            match TopologyPublication::decode(frame) {
                Ok(publication) => {
                    self.topology.learn_backups(&publication.backups);
                    slog::debug!(self.logger, "Known backups now {:?}", self.topology.backups());
                    self.terminal.display(&publication.banner).await?;
                    return Ok(());
                }
                Err(e) => slog::warn!(self.logger, "Server did not start with a topology frame: {}", e),
            }
        }

        self.terminal.display(&String::from_utf8_lossy(frame)).await?;
        Ok(())
    }

    /// Gives the next member time to finish promotion, then tries every member after the one we
    /// lost, in order.
    async fn failover(&mut self, lost: SocketAddr) -> Result<ServerLink, ClientError> {
        self.terminal.display(&format!("Server @ {} disconnected!", lost)).await?;
        tokio::time::sleep(self.options.reconnect_delay).await;

        let bound = self.topology.member_bound();
        let mut candidate = self.topology.leader();
        while candidate < bound {
            candidate = MemberIndex::new(candidate.as_usize() + 1);
            let address = match self.topology.address_of(candidate) {
                Some(address) => address,
                None => continue,
            };

            self.terminal
                .display(&format!("Attempting to connect to backup server @ {}", address))
                .await?;
            match open_server_link(address, &self.options).await {
                Ok(link) => {
                    self.topology.settle_leader(candidate);
                    self.pending_deletion = false;
                    self.terminal
                        .display(&format!("Successfully connected to backup server @ {}", address))
                        .await?;
                    return Ok(link);
                }
                Err(e) if e.is_retryable() => {
                    slog::info!(self.logger, "Backup {:?} unavailable: {}", candidate, e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.terminal.display("Unable to connect to any server. Exiting.").await?;
        Err(ClientError::NoReachableServer)
    }
}

/// Connects to a member and introduces ourselves as a client.
async fn open_server_link(address: SocketAddr, options: &ChatOptionsValidated) -> Result<ServerLink, ConnectError> {
    let stream = connect_with_timeout(address, options.connect_timeout).await?;
    let (reader, mut writer) = framed_halves(stream, options.max_frame_length);
    writer
        .send(Hello::Client.encode())
        .await
        .map_err(|e| ConnectError::Unreachable(address, e))?;

    Ok(ServerLink {
        address,
        reader,
        writer,
        awaiting_topology: true,
    })
}
