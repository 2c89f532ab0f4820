//! Everything the leader runs: the accept loop, per-client sessions, and replication to backups.
mod coordinator;
mod outbox;
mod replication;
mod session;

pub(crate) use coordinator::DiscoveryMode;
pub(crate) use coordinator::LeaderCoordinator;
pub(crate) use outbox::Outbox;
pub(crate) use replication::BackupLink;
pub(crate) use replication::ReplicationChannel;
pub(crate) use session::DELETE_CONFIRMATION;
