use crate::api::ChatOptionsValidated;
use crate::cluster::{
    connect_with_timeout, framed_halves, ClusterTopology, ConnectError, FrameReader, FrameWriter, Hello,
    MemberIndex, NodeRole, NodeRoleNotifier, TopologyPublication,
};
use crate::directory::{Snapshot, UserDirectory};
use crate::server::LeaderCoordinator;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// LeaderLink is a backup's connection to the member it currently follows.
pub(crate) struct LeaderLink {
    address: SocketAddr,
    reader: FrameReader,
    // Never written after the hello, but dropping it would half-close the connection and the
    // leader would take that as us leaving.
    _writer: FrameWriter,
}

/// Connects to `address` and introduces ourselves as backup `me`.
pub(crate) async fn open_leader_link(
    address: SocketAddr,
    me: MemberIndex,
    options: &ChatOptionsValidated,
) -> Result<LeaderLink, ConnectError> {
    let stream = connect_with_timeout(address, options.connect_timeout).await?;
    let (reader, mut writer) = framed_halves(stream, options.max_frame_length);
    writer
        .send(Hello::Backup(me).encode())
        .await
        .map_err(|e| ConnectError::Unreachable(address, e))?;

    Ok(LeaderLink {
        address,
        reader,
        _writer: writer,
    })
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SuccessionError {
    #[error("Gave up following the cluster: {0}")]
    Connect(ConnectError),
}

enum Succession {
    Follow(LeaderLink),
    Promote,
}

/// BackupReplicaAgent mirrors the leader's directory until every member ahead of it in
/// succession order is gone, then hands over to a LeaderCoordinator.
pub(crate) struct BackupReplicaAgent {
    logger: slog::Logger,
    me: MemberIndex,
    listener: TcpListener,
    topology: ClusterTopology,
    mirror: UserDirectory,
    replica_count: usize,
    options: ChatOptionsValidated,
    role_notifier: NodeRoleNotifier,
}

impl BackupReplicaAgent {
    /// `listener` is our own, already bound, listening socket. Nobody is served on it until we
    /// are promoted; connections that arrive before then wait in the backlog.
    pub(crate) fn new(
        logger: slog::Logger,
        me: MemberIndex,
        listener: TcpListener,
        topology: ClusterTopology,
        replica_count: usize,
        options: ChatOptionsValidated,
        role_notifier: NodeRoleNotifier,
    ) -> Self {
        BackupReplicaAgent {
            logger,
            me,
            listener,
            topology,
            mirror: UserDirectory::new(),
            replica_count,
            options,
            role_notifier,
        }
    }

    /// Follows leaders until promoted. The returned coordinator serves from the mirror.
    pub(crate) async fn run(mut self, mut link: LeaderLink) -> Result<LeaderCoordinator, SuccessionError> {
        loop {
            let leader = self.topology.leader();
            self.role_notifier.notify_new_role(NodeRole::Backup {
                leader_index: leader.as_usize(),
            });
            slog::info!(self.logger, "Following leader {:?} @ {}", leader, link.address);

            self.follow(&mut link).await;

            match self.succeed().await? {
                Succession::Follow(next) => link = next,
                Succession::Promote => break,
            }
        }

        slog::info!(
            self.logger,
            "Promoted to leader with {} mirrored accounts",
            self.mirror.len()
        );
        Ok(LeaderCoordinator::new(
            self.logger,
            self.listener,
            self.topology,
            self.mirror,
            self.replica_count,
            self.options,
            self.role_notifier,
        ))
    }

    /// Applies frames from the leader until its stream ends.
    async fn follow(&mut self, link: &mut LeaderLink) {
        let mut awaiting_topology = true;
        while let Some(frame) = link.reader.next().await {
            match frame {
                Ok(frame) if awaiting_topology => {
                    awaiting_topology = false;
                    self.apply_topology(&frame);
                }
                Ok(frame) => self.apply_snapshot(&frame),
                Err(e) => {
                    slog::warn!(self.logger, "Failed reading from leader @ {}: {:?}", link.address, e);
                    break;
                }
            }
        }
        slog::info!(self.logger, "Lost leader @ {}", link.address);
    }

    fn apply_topology(&mut self, frame: &[u8]) {
        match TopologyPublication::decode(frame) {
            Ok(publication) => {
                self.topology.learn_backups(&publication.backups);
                slog::info!(self.logger, "Leader published backups {:?}", publication.backups);
            }
            Err(e) => slog::warn!(self.logger, "Ignoring malformed topology frame: {}", e),
        }
    }

    fn apply_snapshot(&mut self, frame: &[u8]) {
        match Snapshot::decode(frame) {
            Ok(snapshot) => {
                slog::debug!(
                    self.logger,
                    "Applying snapshot of {} accounts ({} bytes)",
                    snapshot.accounts.len(),
                    frame.len()
                );
                self.mirror.apply_snapshot(snapshot);
            }
            Err(e) => slog::warn!(self.logger, "Ignoring malformed snapshot: {}", e),
        }
    }

    /// Walks forward through succession order until we either reach a live member or ourselves.
    async fn succeed(&mut self) -> Result<Succession, SuccessionError> {
        loop {
            let candidate = self.topology.advance_leader();
            if self.topology.is_self_leader() {
                return Ok(Succession::Promote);
            }

            let address = match self.topology.address_of(candidate) {
                Some(address) => address,
                None => {
                    slog::info!(self.logger, "No address known for member {:?}, skipping", candidate);
                    continue;
                }
            };
            match open_leader_link(address, self.me, &self.options).await {
                Ok(link) => return Ok(Succession::Follow(link)),
                Err(e) if e.is_retryable() => {
                    slog::info!(self.logger, "Skipping member {:?}: {}", candidate, e);
                }
                Err(e) => {
                    slog::error!(self.logger, "{}", e);
                    return Err(SuccessionError::Connect(e));
                }
            }
        }
    }
}
