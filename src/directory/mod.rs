//! The replicated state: accounts keyed by username, and the snapshot format that carries them
//! from the leader to its backups.
mod account;
mod snapshot;

pub(crate) use account::ConnectionId;
pub(crate) use account::CreateAccountError;
pub(crate) use account::LoginError;
pub(crate) use account::SendMessageError;
pub(crate) use account::UserDirectory;
pub(crate) use snapshot::Snapshot;
