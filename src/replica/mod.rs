//! What a backup member does: mirror the leader, and take over when its turn comes.
mod agent;

pub(crate) use agent::open_leader_link;
pub(crate) use agent::BackupReplicaAgent;
