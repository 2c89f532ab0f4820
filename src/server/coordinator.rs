use crate::actor::{self, DirectoryClient};
use crate::api::ChatOptionsValidated;
use crate::cluster::{framed_halves, ClusterTopology, FrameReader, FrameWriter, Hello, MemberIndex, NodeRole, NodeRoleNotifier};
use crate::directory::{ConnectionId, UserDirectory};
use crate::server::outbox::spawn_writer;
use crate::server::replication::{BackupLink, ReplicationChannel};
use crate::server::session::SessionHandler;
use futures::StreamExt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;

const DIRECTORY_QUEUE_SIZE: usize = 64;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long the leader waits for backups before it starts serving.
#[derive(Clone, Copy, Debug)]
pub(crate) enum DiscoveryMode {
    /// The original leader blocks until every configured backup has joined.
    WaitForAll,
    /// A promoted leader gives each expected backup this long to show up.
    Bounded(Duration),
}

/// A connection that introduced itself, sorted by what it said it was.
enum Admission {
    Backup(BackupLink),
    Client(ClientConnection),
}

struct ClientConnection {
    peer: SocketAddr,
    reader: FrameReader,
    writer: FrameWriter,
}

/// LeaderCoordinator is the leader's accept loop. It first gathers its backups, then admits
/// clients (and any backups that show up late) for as long as the process lives.
pub(crate) struct LeaderCoordinator {
    logger: slog::Logger,
    listener: TcpListener,
    topology: ClusterTopology,
    directory: UserDirectory,
    replica_count: usize,
    options: ChatOptionsValidated,
    role_notifier: NodeRoleNotifier,
    next_connection: u64,
}

impl LeaderCoordinator {
    pub(crate) fn new(
        logger: slog::Logger,
        listener: TcpListener,
        topology: ClusterTopology,
        directory: UserDirectory,
        replica_count: usize,
        options: ChatOptionsValidated,
        role_notifier: NodeRoleNotifier,
    ) -> Self {
        LeaderCoordinator {
            logger,
            listener,
            topology,
            directory,
            replica_count,
            options,
            role_notifier,
            next_connection: 1,
        }
    }

    /// Number of members that follow us in succession order.
    fn expected_backups(&self) -> usize {
        let me = self.topology.me().unwrap_or(MemberIndex::ORIGINAL_LEADER);
        self.replica_count.saturating_sub(me.as_usize())
    }

    pub(crate) async fn run(mut self, mode: DiscoveryMode) {
        self.role_notifier.notify_new_role(NodeRole::Leader);
        slog::info!(
            self.logger,
            "Leading the cluster, discovering up to {} backups ({:?})",
            self.expected_backups(),
            mode
        );

        let (links, early_clients) = self.discover_backups(mode).await;
        let addresses: Vec<SocketAddr> = links.iter().map(|link| link.address).collect();
        self.topology.replace_backups(&addresses);
        slog::info!(self.logger, "Discovery finished with backups {:?}", self.topology.backups());

        let replication = ReplicationChannel::new(self.logger.clone(), links);
        replication.publish_topology();

        let directory = std::mem::take(&mut self.directory);
        let (directory_client, directory_actor) =
            actor::create(self.logger.clone(), DIRECTORY_QUEUE_SIZE, directory, replication);
        tokio::spawn(directory_actor.run_event_loop());

        for client in early_clients {
            let connection = self.allocate_connection();
            self.start_session(client, connection, &directory_client).await;
        }

        self.serve(directory_client).await;
    }

    async fn discover_backups(&mut self, mode: DiscoveryMode) -> (Vec<BackupLink>, Vec<ClientConnection>) {
        let mut links: Vec<BackupLink> = Vec::new();
        let mut early_clients = Vec::new();
        let mut remaining = self.expected_backups();

        while remaining > 0 {
            let accepted = match mode {
                DiscoveryMode::WaitForAll => self.listener.accept().await.map(Some),
                DiscoveryMode::Bounded(timeout) => {
                    match tokio::time::timeout(timeout, self.listener.accept()).await {
                        Ok(result) => result.map(Some),
                        Err(_elapsed) => Ok(None),
                    }
                }
            };

            match accepted {
                Ok(Some((stream, peer))) => match self.handshake(stream, peer).await {
                    Some(Admission::Backup(link)) => {
                        let rejoined = links.iter().any(|existing| existing.member == link.member);
                        if rejoined {
                            slog::info!(self.logger, "Backup {:?} @ {} reconnected", link.member, link.address);
                            links.retain(|existing| existing.member != link.member);
                        } else {
                            slog::info!(self.logger, "Backup {:?} @ {} joined", link.member, link.address);
                            remaining -= 1;
                        }
                        links.push(link);
                    }
                    Some(Admission::Client(client)) => {
                        slog::info!(self.logger, "Client @ {} arrived during discovery", client.peer);
                        early_clients.push(client);
                    }
                    None => {}
                },
                Ok(None) => {
                    slog::info!(self.logger, "No backup arrived in time, continuing with one fewer");
                    remaining -= 1;
                }
                Err(e) => {
                    slog::warn!(self.logger, "Accept failed during discovery: {:?}", e);
                    match mode {
                        DiscoveryMode::WaitForAll => tokio::time::sleep(ACCEPT_BACKOFF).await,
                        DiscoveryMode::Bounded(_) => remaining -= 1,
                    }
                }
            }
        }

        (links, early_clients)
    }

    async fn serve(mut self, directory_client: DirectoryClient) {
        loop {
            let listener = &self.listener;
            let (stream, peer) = accept_with_backoff(&self.logger, move || listener.accept()).await;

            let connection = self.allocate_connection();
            let admitter = self.admitter();
            let directory_client = directory_client.clone();
            tokio::spawn(async move {
                match admitter.handshake(stream, peer).await {
                    Some(Admission::Backup(link)) => {
                        if directory_client.attach_backup(link).await.is_err() {
                            slog::warn!(admitter.logger, "Directory gone, could not attach backup @ {}", peer);
                        }
                    }
                    Some(Admission::Client(client)) => {
                        admitter.start_session(client, connection, &directory_client).await;
                    }
                    None => {}
                }
            });
        }
    }

    fn allocate_connection(&mut self) -> ConnectionId {
        let connection = ConnectionId::new(self.next_connection);
        self.next_connection += 1;
        connection
    }

    fn admitter(&self) -> Admitter {
        Admitter {
            logger: self.logger.clone(),
            topology: self.topology.clone(),
            replica_count: self.replica_count,
            options: self.options.clone(),
        }
    }

    async fn handshake(&self, stream: TcpStream, peer: SocketAddr) -> Option<Admission> {
        self.admitter().handshake(stream, peer).await
    }

    async fn start_session(&self, client: ClientConnection, connection: ConnectionId, directory: &DirectoryClient) {
        self.admitter().start_session(client, connection, directory).await
    }
}

/// The part of the coordinator that per-connection tasks need once the accept loop is running.
struct Admitter {
    logger: slog::Logger,
    topology: ClusterTopology,
    replica_count: usize,
    options: ChatOptionsValidated,
}

impl Admitter {
    /// Reads the hello frame. None means the connection was dropped.
    async fn handshake(&self, stream: TcpStream, peer: SocketAddr) -> Option<Admission> {
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = framed_halves(stream, self.options.max_frame_length);

        let first_frame = match tokio::time::timeout(self.options.handshake_timeout, reader.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                slog::warn!(self.logger, "Dropping {}, unreadable hello: {:?}", peer, e);
                return None;
            }
            Ok(None) => {
                slog::debug!(self.logger, "{} hung up before saying hello", peer);
                return None;
            }
            Err(_elapsed) => {
                slog::warn!(self.logger, "Dropping {}, no hello within {:?}", peer, self.options.handshake_timeout);
                return None;
            }
        };

        match Hello::decode(&first_frame) {
            Ok(Hello::Client) => Some(Admission::Client(ClientConnection { peer, reader, writer })),
            Ok(Hello::Backup(member)) => self.admit_backup(member, peer, reader, writer),
            Err(e) => {
                slog::warn!(self.logger, "Dropping {}: {}", peer, e);
                None
            }
        }
    }

    fn admit_backup(
        &self,
        member: MemberIndex,
        peer: SocketAddr,
        reader: FrameReader,
        writer: FrameWriter,
    ) -> Option<Admission> {
        if member <= self.topology.leader() || member.as_usize() > self.replica_count {
            slog::warn!(self.logger, "Dropping {}, {:?} is not a valid backup index", peer, member);
            return None;
        }
        let port = self.topology.port_of(member)?;

        let logger = self.logger.new(slog::o!("peer" => format!("backup-{}", member)));
        let outbox = spawn_writer(logger.clone(), writer);
        tokio::spawn(watch_backup(logger, reader));

        Some(Admission::Backup(BackupLink {
            member,
            address: SocketAddr::new(peer.ip(), port),
            outbox,
        }))
    }

    async fn start_session(&self, client: ClientConnection, connection: ConnectionId, directory: &DirectoryClient) {
        let logger = self
            .logger
            .new(slog::o!("conn" => format!("{:?}", connection), "peer" => client.peer.to_string()));
        slog::info!(logger, "Client connected");

        let outbox = spawn_writer(logger.clone(), client.writer);
        if directory.connection_opened(connection, outbox.clone()).await.is_err() {
            slog::warn!(logger, "Directory gone, refusing client");
            return;
        }

        let session = SessionHandler::new(
            logger,
            connection,
            client.reader,
            outbox,
            directory.clone(),
            self.options.login_attempts,
        );
        tokio::spawn(session.run());
    }
}

/// Retries `accept` until it succeeds, pausing after each failure. Accept errors are usually fd
/// exhaustion, which only clears once other connections close.
async fn accept_with_backoff<F, Fut, T>(logger: &slog::Logger, mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                slog::warn!(logger, "Failed to accept connection, retrying in {:?}: {:?}", ACCEPT_BACKOFF, e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Backups never send anything after their hello. Reading anyway tells us when one goes away.
async fn watch_backup(logger: slog::Logger, mut reader: FrameReader) {
    while let Some(frame) = reader.next().await {
        if let Err(e) = frame {
            slog::debug!(logger, "Backup read failed: {:?}", e);
            break;
        }
    }
    slog::info!(logger, "Backup disconnected");
}
