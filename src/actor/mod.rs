use crate::directory::{ConnectionId, CreateAccountError, LoginError, SendMessageError, UserDirectory};
use crate::server::{BackupLink, Outbox, ReplicationChannel};
use std::collections::HashMap;
use std::fmt::Debug;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};

pub(crate) fn create(
    logger: slog::Logger,
    buffer_size: usize,
    directory: UserDirectory,
    replication: ReplicationChannel,
) -> (DirectoryClient, DirectoryActor) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let client = DirectoryClient { sender: tx };
    let actor = DirectoryActor {
        logger,
        receiver: rx,
        directory,
        active_connections: HashMap::new(),
        replication,
    };

    (client, actor)
}

// Design choice: the leader's UserDirectory and its set of active connections are owned by this
// one task. Every event below is handled to completion before the next one is looked at, which
// makes each of them a single atomic check-then-mutate with respect to all sessions.
#[derive(Debug)]
enum Event {
    // Connection accepted; it is live until ConnectionClosed.
    ConnectionOpened(ConnectionId, Outbox),
    // Stream end observed by the session. Sent exactly once per connection.
    ConnectionClosed(ConnectionId),
    // A backup connected after discovery.
    AttachBackup(BackupLink),
    CurrentBackups(Callback<Vec<SocketAddr>>),
    IsUsernameTaken(String, Callback<bool>),
    // Insert-if-absent and bind. Replicates on success.
    CreateAccount(CreateAccountInput, Callback<Result<(), CreateAccountError>>),
    // Verify, bind, flush mailbox. Replicates on success.
    Login(LoginInput, Callback<Result<LoginOutput, LoginError>>),
    // Deliver live if the recipient's connection is active, else enqueue. Replicates either way.
    SendMessage(SendMessageInput, Callback<Result<Delivery, SendMessageError>>),
    ListUsers(Callback<Vec<String>>),
    // Replicates if an account was removed.
    DeleteAccount(String, Callback<bool>),
}

#[derive(Debug)]
struct Callback<T: Debug>(oneshot::Sender<T>);

impl<T: Debug> Callback<T> {
    fn send(self, message: T) {
        // Session may have gone away while waiting. Nothing to do about it.
        let _ = self.0.send(message);
    }
}

#[derive(Debug)]
pub(crate) struct CreateAccountInput {
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) connection: ConnectionId,
}

#[derive(Debug)]
pub(crate) struct LoginInput {
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) connection: ConnectionId,
}

#[derive(Debug)]
pub(crate) struct LoginOutput {
    // Mailbox contents at the time of login, in enqueue order. Already cleared in the directory.
    pub(crate) queued_messages: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct SendMessageInput {
    pub(crate) from: String,
    pub(crate) to: String,
    pub(crate) text: String,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Delivery {
    Live,
    Mailbox,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DirectoryError {
    #[error("Directory actor has exited")]
    ActorExited,
}

/// DirectoryClient is the cloneable handle every session uses to reach the directory actor.
#[derive(Clone)]
pub(crate) struct DirectoryClient {
    sender: mpsc::Sender<Event>,
}

impl DirectoryClient {
    pub(crate) async fn connection_opened(&self, connection: ConnectionId, outbox: Outbox) -> Result<(), DirectoryError> {
        self.send(Event::ConnectionOpened(connection, outbox)).await
    }

    pub(crate) async fn connection_closed(&self, connection: ConnectionId) -> Result<(), DirectoryError> {
        self.send(Event::ConnectionClosed(connection)).await
    }

    pub(crate) async fn attach_backup(&self, link: BackupLink) -> Result<(), DirectoryError> {
        self.send(Event::AttachBackup(link)).await
    }

    pub(crate) async fn current_backups(&self) -> Result<Vec<SocketAddr>, DirectoryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::CurrentBackups(Callback(tx))).await?;
        rx.await.map_err(|_| DirectoryError::ActorExited)
    }

    pub(crate) async fn is_username_taken(&self, username: &str) -> Result<bool, DirectoryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::IsUsernameTaken(username.to_string(), Callback(tx)))
            .await?;
        rx.await.map_err(|_| DirectoryError::ActorExited)
    }

    pub(crate) async fn create_account(&self, input: CreateAccountInput) -> Result<(), CreateAccountError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::CreateAccount(input, Callback(tx)))
            .await
            .map_err(|_| CreateAccountError::ActorExited)?;
        rx.await.unwrap_or(Err(CreateAccountError::ActorExited))
    }

    pub(crate) async fn login(&self, input: LoginInput) -> Result<LoginOutput, LoginError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Login(input, Callback(tx)))
            .await
            .map_err(|_| LoginError::ActorExited)?;
        rx.await.unwrap_or(Err(LoginError::ActorExited))
    }

    pub(crate) async fn send_message(&self, input: SendMessageInput) -> Result<Delivery, SendMessageError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::SendMessage(input, Callback(tx)))
            .await
            .map_err(|_| SendMessageError::ActorExited)?;
        rx.await.unwrap_or(Err(SendMessageError::ActorExited))
    }

    pub(crate) async fn list_users(&self) -> Result<Vec<String>, DirectoryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::ListUsers(Callback(tx))).await?;
        rx.await.map_err(|_| DirectoryError::ActorExited)
    }

    pub(crate) async fn delete_account(&self, username: &str) -> Result<bool, DirectoryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::DeleteAccount(username.to_string(), Callback(tx)))
            .await?;
        rx.await.map_err(|_| DirectoryError::ActorExited)
    }

    async fn send(&self, event: Event) -> Result<(), DirectoryError> {
        self.sender.send(event).await.map_err(|_| DirectoryError::ActorExited)
    }
}

/// DirectoryActor is the leader's UserDirectory in actor model.
pub(crate) struct DirectoryActor {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    directory: UserDirectory,
    active_connections: HashMap<ConnectionId, Outbox>,
    replication: ReplicationChannel,
}

impl DirectoryActor {
    pub(crate) async fn run_event_loop(mut self) {
        // Backups discovered with this leadership start from whatever we hold right now. For a
        // promoted leader that is the mirror it kept as a backup.
        self.replicate();

        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
        slog::info!(self.logger, "Directory actor exiting, all clients dropped");
    }

    // This must NOT be async. Anything awaiting in here would let another session's event run in
    // the middle of a check-then-mutate.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::ConnectionOpened(connection, outbox) => {
                self.active_connections.insert(connection, outbox);
            }
            Event::ConnectionClosed(connection) => {
                if self.active_connections.remove(&connection).is_none() {
                    slog::warn!(self.logger, "{:?} closed but was not active", connection);
                }
            }
            Event::AttachBackup(link) => {
                let snapshot = self.directory.snapshot();
                self.replication.attach(link, &snapshot);
            }
            Event::CurrentBackups(callback) => {
                callback.send(self.replication.backup_addresses());
            }
            Event::IsUsernameTaken(username, callback) => {
                callback.send(self.directory.contains(&username));
            }
            Event::CreateAccount(input, callback) => {
                let result = self.create_account(input);
                callback.send(result);
            }
            Event::Login(input, callback) => {
                let result = self.login(input);
                callback.send(result);
            }
            Event::SendMessage(input, callback) => {
                let result = self.send_message(input);
                callback.send(result);
            }
            Event::ListUsers(callback) => {
                callback.send(self.directory.usernames());
            }
            Event::DeleteAccount(username, callback) => {
                let removed = self.directory.remove(&username);
                if removed {
                    slog::info!(self.logger, "Deleted account '{}'", username);
                    self.replicate();
                }
                callback.send(removed);
            }
        }
    }

    fn create_account(&mut self, input: CreateAccountInput) -> Result<(), CreateAccountError> {
        self.directory.create(&input.username, &input.password)?;
        self.directory.bind_connection(&input.username, input.connection);
        slog::info!(self.logger, "{:?} created account '{}'", input.connection, input.username);

        self.replicate();
        Ok(())
    }

    fn login(&mut self, input: LoginInput) -> Result<LoginOutput, LoginError> {
        self.directory.verify_password(&input.username, &input.password)?;
        self.directory.bind_connection(&input.username, input.connection);
        let queued_messages = self.directory.take_mailbox(&input.username);
        slog::info!(
            self.logger,
            "{:?} logged in as '{}', flushing {} queued messages",
            input.connection,
            input.username,
            queued_messages.len()
        );

        self.replicate();
        Ok(LoginOutput { queued_messages })
    }

    fn send_message(&mut self, input: SendMessageInput) -> Result<Delivery, SendMessageError> {
        if !self.directory.contains(&input.to) {
            return Err(SendMessageError::UnknownRecipient(input.to));
        }

        let message = format!("<{}> {}", input.from, input.text);
        let live_outbox = match self.directory.active_connection(&input.to) {
            Some(connection) => self.active_connections.get(&connection),
            None => None,
        };
        // Online but with its writer already gone counts as offline.
        let delivered_live = live_outbox
            .map(|outbox| outbox.send_text(&message).is_ok())
            .unwrap_or(false);

        let delivery = if delivered_live {
            Delivery::Live
        } else {
            self.directory.enqueue(&input.to, message)?;
            Delivery::Mailbox
        };
        slog::debug!(self.logger, "Message from '{}' to '{}': {:?}", input.from, input.to, delivery);

        self.replicate();
        Ok(delivery)
    }

    fn replicate(&self) {
        self.replication.replicate(&self.directory.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct Harness {
        client: DirectoryClient,
        backup_rx: mpsc::Receiver<Bytes>,
    }

    impl Harness {
        fn start(directory: UserDirectory) -> Self {
            let logger = slog::Logger::root(slog::Discard, slog::o!());
            let (backup_outbox, backup_rx) = Outbox::detached();
            let link = BackupLink {
                member: crate::cluster::MemberIndex::new(1),
                address: SocketAddr::from(([127, 0, 0, 1], 1235)),
                outbox: backup_outbox,
            };
            let replication = ReplicationChannel::new(logger.clone(), vec![link]);
            let (client, actor) = create(logger, 10, directory, replication);
            tokio::spawn(actor.run_event_loop());

            Harness { client, backup_rx }
        }

        async fn open(&self, id: u64) -> mpsc::Receiver<Bytes> {
            let (outbox, rx) = Outbox::detached();
            self.client
                .connection_opened(ConnectionId::new(id), outbox)
                .await
                .unwrap();
            rx
        }

        async fn create(&self, username: &str, password: &str, id: u64) -> Result<(), CreateAccountError> {
            self.client
                .create_account(CreateAccountInput {
                    username: username.to_string(),
                    password: password.to_string(),
                    connection: ConnectionId::new(id),
                })
                .await
        }

        async fn login(&self, username: &str, password: &str, id: u64) -> Result<LoginOutput, LoginError> {
            self.client
                .login(LoginInput {
                    username: username.to_string(),
                    password: password.to_string(),
                    connection: ConnectionId::new(id),
                })
                .await
        }

        async fn send(&self, from: &str, to: &str, text: &str) -> Result<Delivery, SendMessageError> {
            self.client
                .send_message(SendMessageInput {
                    from: from.to_string(),
                    to: to.to_string(),
                    text: text.to_string(),
                })
                .await
        }

        async fn last_snapshot(&mut self) -> Bytes {
            // A list round trip guarantees every earlier event has been handled.
            self.client.list_users().await.unwrap();
            let mut last = None;
            while let Ok(frame) = self.backup_rx.try_recv() {
                last = Some(frame);
            }
            last.expect("Expected a replicated snapshot")
        }
    }

    #[tokio::test]
    async fn every_mutation_is_replicated() {
        let mut harness = Harness::start(UserDirectory::new());
        // Initial sync on startup.
        assert!(harness.last_snapshot().await.is_empty());

        harness.open(1).await;
        harness.create("alice", "p1", 1).await.unwrap();
        assert_eq!(&harness.last_snapshot().await[..], b"alice.p1.0.");

        harness.create("bob", "p2", 2).await.unwrap();
        harness.client.connection_closed(ConnectionId::new(2)).await.unwrap();
        assert_eq!(harness.send("alice", "bob", "hi").await, Ok(Delivery::Mailbox));
        assert_eq!(&harness.last_snapshot().await[..], b"alice.p1.0.bob.p2.1.<alice> hi.");

        harness.open(3).await;
        let output = harness.login("bob", "p2", 3).await.unwrap();
        assert_eq!(output.queued_messages, vec!["<alice> hi"]);
        assert_eq!(&harness.last_snapshot().await[..], b"alice.p1.0.bob.p2.0.");

        assert!(harness.client.delete_account("alice").await.unwrap());
        assert_eq!(&harness.last_snapshot().await[..], b"bob.p2.0.");
    }

    #[tokio::test]
    async fn live_recipient_gets_message_immediately_and_never_in_mailbox() {
        let mut harness = Harness::start(UserDirectory::new());
        harness.open(1).await;
        let mut bob_rx = harness.open(2).await;
        harness.create("alice", "p1", 1).await.unwrap();
        harness.create("bob", "p2", 2).await.unwrap();

        assert_eq!(harness.send("alice", "bob", "hello").await, Ok(Delivery::Live));
        assert_eq!(&bob_rx.recv().await.unwrap()[..], b"<alice> hello");
        assert_eq!(&harness.last_snapshot().await[..], b"alice.p1.0.bob.p2.0.");
    }

    #[tokio::test]
    async fn offline_messages_flush_once_in_send_order() {
        let harness = Harness::start(UserDirectory::new());
        harness.create("bob", "p2", 7).await.unwrap();
        // bob's connection 7 was never opened, so bob is offline.
        for text in &["one", "two", "three"] {
            assert_eq!(harness.send("alice", "bob", text).await, Ok(Delivery::Mailbox));
        }

        let first = harness.login("bob", "p2", 8).await.unwrap();
        assert_eq!(first.queued_messages, vec!["<alice> one", "<alice> two", "<alice> three"]);

        let second = harness.login("bob", "p2", 9).await.unwrap();
        assert!(second.queued_messages.is_empty());
    }

    #[tokio::test]
    async fn closed_connection_falls_back_to_mailbox() {
        let harness = Harness::start(UserDirectory::new());
        let bob_rx = harness.open(2).await;
        harness.create("bob", "p2", 2).await.unwrap();

        // Writer gone, but the session has not reported stream end yet.
        drop(bob_rx);
        assert_eq!(harness.send("alice", "bob", "are you there").await, Ok(Delivery::Mailbox));

        let output = harness.login("bob", "p2", 3).await.unwrap();
        assert_eq!(output.queued_messages, vec!["<alice> are you there"]);
    }

    #[tokio::test]
    async fn stalled_reader_falls_back_to_mailbox() {
        let harness = Harness::start(UserDirectory::new());
        let _unread_bob_rx = harness.open(2).await;
        harness.create("bob", "p2", 2).await.unwrap();

        let mut live = 0;
        loop {
            match harness.send("alice", "bob", "spam").await {
                Ok(Delivery::Live) => live += 1,
                Ok(Delivery::Mailbox) => break,
                other => panic!("Unexpected delivery {:?}", other),
            }
            assert!(live < 100_000, "bob's backlog never filled up");
        }
        assert!(live > 0);

        let output = harness.login("bob", "p2", 3).await.unwrap();
        assert_eq!(output.queued_messages, vec!["<alice> spam"]);
    }

    #[tokio::test]
    async fn domain_errors_do_not_replicate() {
        let mut harness = Harness::start(UserDirectory::new());
        harness.create("alice", "p1", 1).await.unwrap();
        let after_create = harness.last_snapshot().await;
        assert!(!after_create.is_empty());

        assert_eq!(
            harness.create("alice", "p9", 2).await,
            Err(CreateAccountError::UsernameTaken("alice".to_string()))
        );
        assert!(matches!(harness.login("alice", "wrong", 2).await, Err(LoginError::WrongPassword)));
        assert!(matches!(harness.login("ghost", "p", 2).await, Err(LoginError::UnknownUser(_))));
        assert_eq!(
            harness.send("alice", "ghost", "boo").await,
            Err(SendMessageError::UnknownRecipient("ghost".to_string()))
        );
        assert!(!harness.client.delete_account("ghost").await.unwrap());

        harness.client.list_users().await.unwrap();
        assert!(harness.backup_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_creations_admit_exactly_one() {
        let harness = Harness::start(UserDirectory::new());

        let mut attempts = Vec::new();
        for id in 0..16 {
            let client = harness.client.clone();
            attempts.push(tokio::spawn(async move {
                client
                    .create_account(CreateAccountInput {
                        username: "alice".to_string(),
                        password: format!("p{}", id),
                        connection: ConnectionId::new(id),
                    })
                    .await
            }));
        }

        let mut successes = 0;
        for attempt in attempts {
            if attempt.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(harness.client.list_users().await.unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn promoted_directory_is_pushed_on_start() {
        let mut mirror = UserDirectory::new();
        mirror.create("alice", "p1").unwrap();

        let mut harness = Harness::start(mirror);
        assert_eq!(&harness.last_snapshot().await[..], b"alice.p1.0.");
        assert!(harness.client.is_username_taken("alice").await.unwrap());
    }
}
