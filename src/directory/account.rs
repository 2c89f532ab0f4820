use crate::directory::snapshot::{AccountRecord, Snapshot};
use std::collections::BTreeMap;
use std::fmt;

/// ConnectionId names one accepted client connection on the leader. Accounts refer to their live
/// connection by id only, so an account never keeps a connection alive.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        ConnectionId(id)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct Account {
    // Opaque, set once at creation, compared by exact match.
    password: String,
    // Pending messages in enqueue order.
    mailbox: Vec<String>,
    active_connection: Option<ConnectionId>,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub(crate) enum CreateAccountError {
    #[error("{0} is already taken")]
    UsernameTaken(String),
    #[error("Username must not be empty")]
    EmptyUsername,
    #[error("Directory actor has exited")]
    ActorExited,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub(crate) enum LoginError {
    #[error("{0} is not a valid username")]
    UnknownUser(String),
    #[error("Incorrect password")]
    WrongPassword,
    #[error("Directory actor has exited")]
    ActorExited,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub(crate) enum SendMessageError {
    #[error("Target user {0} does not exist")]
    UnknownRecipient(String),
    #[error("Directory actor has exited")]
    ActorExited,
}

/// UserDirectory maps usernames to accounts. Usernames are unique and case-sensitive.
///
/// It has no locking of its own. On the leader it is owned by the directory actor, which is what
/// makes every check-then-mutate below atomic with respect to other sessions. On a backup it is
/// the mirror that snapshots are applied to.
#[derive(Default)]
pub(crate) struct UserDirectory {
    accounts: BTreeMap<String, Account>,
}

impl UserDirectory {
    pub(crate) fn new() -> Self {
        UserDirectory::default()
    }

    pub(crate) fn contains(&self, username: &str) -> bool {
        self.accounts.contains_key(username)
    }

    pub(crate) fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Insert-if-absent. The new account starts with an empty mailbox.
    pub(crate) fn create(&mut self, username: &str, password: &str) -> Result<(), CreateAccountError> {
        if username.is_empty() {
            return Err(CreateAccountError::EmptyUsername);
        }
        if self.contains(username) {
            return Err(CreateAccountError::UsernameTaken(username.to_string()));
        }

        self.accounts.insert(
            username.to_string(),
            Account {
                password: password.to_string(),
                mailbox: Vec::new(),
                active_connection: None,
            },
        );
        Ok(())
    }

    pub(crate) fn verify_password(&self, username: &str, password: &str) -> Result<(), LoginError> {
        match self.accounts.get(username) {
            None => Err(LoginError::UnknownUser(username.to_string())),
            Some(account) if account.password != password => Err(LoginError::WrongPassword),
            Some(_) => Ok(()),
        }
    }

    /// Points the account at `connection`, replacing any previous binding. No-op for unknown
    /// usernames.
    pub(crate) fn bind_connection(&mut self, username: &str, connection: ConnectionId) {
        if let Some(account) = self.accounts.get_mut(username) {
            account.active_connection.replace(connection);
        }
    }

    pub(crate) fn active_connection(&self, username: &str) -> Option<ConnectionId> {
        self.accounts.get(username).and_then(|account| account.active_connection)
    }

    /// Flush-and-clear: returns queued messages in enqueue order and leaves the mailbox empty.
    pub(crate) fn take_mailbox(&mut self, username: &str) -> Vec<String> {
        self.accounts
            .get_mut(username)
            .map(|account| std::mem::take(&mut account.mailbox))
            .unwrap_or_default()
    }

    pub(crate) fn enqueue(&mut self, username: &str, message: String) -> Result<(), SendMessageError> {
        match self.accounts.get_mut(username) {
            Some(account) => {
                account.mailbox.push(message);
                Ok(())
            }
            None => Err(SendMessageError::UnknownRecipient(username.to_string())),
        }
    }

    #[cfg(test)]
    pub(crate) fn mailbox(&self, username: &str) -> Option<&[String]> {
        self.accounts.get(username).map(|account| account.mailbox.as_slice())
    }

    pub(crate) fn remove(&mut self, username: &str) -> bool {
        self.accounts.remove(username).is_some()
    }

    /// Known usernames, sorted.
    pub(crate) fn usernames(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            accounts: self
                .accounts
                .iter()
                .map(|(username, account)| AccountRecord {
                    username: username.clone(),
                    password: account.password.clone(),
                    mailbox: account.mailbox.clone(),
                })
                .collect(),
        }
    }

    /// Replaces the whole directory with `snapshot`. Snapshots carry full state, so an account
    /// absent from the snapshot has been deleted on the leader. Applying the same snapshot twice
    /// leaves the directory unchanged.
    pub(crate) fn apply_snapshot(&mut self, snapshot: Snapshot) {
        self.accounts = snapshot
            .accounts
            .into_iter()
            .map(|record| {
                (
                    record.username,
                    Account {
                        password: record.password,
                        mailbox: record.mailbox,
                        active_connection: None,
                    },
                )
            })
            .collect();
    }
}
