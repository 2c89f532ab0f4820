use crate::actor::{
    CreateAccountInput, Delivery, DirectoryClient, DirectoryError, LoginInput, SendMessageInput,
};
use crate::cluster::{FrameReader, TopologyPublication};
use crate::directory::{ConnectionId, CreateAccountError, LoginError, SendMessageError};
use crate::server::outbox::{Outbox, OutboxError};
use futures::StreamExt;
use std::io;

const WELCOME_BANNER: &str = "Welcome to the chat service!";
pub(crate) const DELETE_CONFIRMATION: &str = "confirm";

const WELCOME_PROMPT: &str = "\nPlease enter 1 or 2:\n1. Create account.\n2. Login.";
const MENU_PROMPT: &str = "\nPlease enter 1, 2, or 3:\n1. Send message.\n2. List all users.\n3. Delete your account.";

/// Where a session is in the conversation with its client. Every state except `Closed` ends by
/// soliciting input, and stream end while soliciting moves any state to `Closed`.
#[derive(Debug, Eq, PartialEq)]
enum SessionState {
    Init,
    Welcome,
    CreateAccount,
    Login,
    Menu { username: String },
    DeleteConfirm { username: String },
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SessionError {
    #[error("Peer closed the connection")]
    ConnectionLost,
    #[error("Failed to read from peer: {0}")]
    Read(io::Error),
    #[error("Directory is unavailable")]
    DirectoryUnavailable,
}

impl From<OutboxError> for SessionError {
    fn from(_: OutboxError) -> Self {
        SessionError::ConnectionLost
    }
}

impl From<DirectoryError> for SessionError {
    fn from(_: DirectoryError) -> Self {
        SessionError::DirectoryUnavailable
    }
}

/// SessionHandler drives one client connection on the leader through account creation, login,
/// messaging, and deletion. Its lifetime is the connection's lifetime.
pub(crate) struct SessionHandler {
    logger: slog::Logger,
    connection: ConnectionId,
    reader: FrameReader,
    outbox: Outbox,
    directory: DirectoryClient,
    login_attempts: u32,
}

impl SessionHandler {
    pub(crate) fn new(
        logger: slog::Logger,
        connection: ConnectionId,
        reader: FrameReader,
        outbox: Outbox,
        directory: DirectoryClient,
        login_attempts: u32,
    ) -> Self {
        SessionHandler {
            logger,
            connection,
            reader,
            outbox,
            directory,
            login_attempts,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut state = SessionState::Init;
        loop {
            state = match self.step(state).await {
                Ok(SessionState::Closed) => break,
                Ok(next) => next,
                Err(SessionError::ConnectionLost) => {
                    slog::info!(self.logger, "Client disconnected");
                    break;
                }
                Err(e) => {
                    slog::warn!(self.logger, "Session ending: {}", e);
                    break;
                }
            };
        }

        // The one and only removal from the active set for this connection.
        if self.directory.connection_closed(self.connection).await.is_err() {
            slog::warn!(self.logger, "Directory gone before {:?} could be released", self.connection);
        }
    }

    async fn step(&mut self, state: SessionState) -> Result<SessionState, SessionError> {
        match state {
            SessionState::Init => self.init().await,
            SessionState::Welcome => self.welcome().await,
            SessionState::CreateAccount => self.create_account().await,
            SessionState::Login => self.login().await,
            SessionState::Menu { username } => self.menu(username).await,
            SessionState::DeleteConfirm { username } => self.delete_confirm(username).await,
            SessionState::Closed => Ok(SessionState::Closed),
        }
    }

    async fn init(&mut self) -> Result<SessionState, SessionError> {
        let backups = self.directory.current_backups().await?;
        self.outbox
            .send(TopologyPublication::new(backups, WELCOME_BANNER).encode())?;

        Ok(SessionState::Welcome)
    }

    async fn welcome(&mut self) -> Result<SessionState, SessionError> {
        loop {
            let choice = self.solicit(WELCOME_PROMPT).await?;
            match choice.as_str() {
                "1" => return Ok(SessionState::CreateAccount),
                "2" => return Ok(SessionState::Login),
                _ => self.say(&format!("{} is not a valid option. Please enter either 1 or 2!", choice))?,
            }
        }
    }

    async fn create_account(&mut self) -> Result<SessionState, SessionError> {
        loop {
            let username = self.solicit("\nPlease enter a username:").await?;
            if username.is_empty() {
                self.say("Username must not be empty.")?;
                continue;
            }
            if self.directory.is_username_taken(&username).await? {
                self.say(&format!("{} is already taken. Please enter a unique username.", username))?;
                continue;
            }

            let password = self.solicit("Please enter a password.").await?;
            let input = CreateAccountInput {
                username: username.clone(),
                password,
                connection: self.connection,
            };
            match self.directory.create_account(input).await {
                Ok(()) => {
                    self.say(&format!("\nSuccessfully created account with username: {}", username))?;
                    self.send_roster().await?;
                    return Ok(SessionState::Menu { username });
                }
                // Someone else took it while we were waiting for the password.
                Err(CreateAccountError::UsernameTaken(_)) => {
                    self.say(&format!("{} is already taken. Please enter a unique username.", username))?;
                }
                Err(CreateAccountError::EmptyUsername) => self.say("Username must not be empty.")?,
                Err(CreateAccountError::ActorExited) => return Err(SessionError::DirectoryUnavailable),
            }
        }
    }

    async fn login(&mut self) -> Result<SessionState, SessionError> {
        for attempt in 1..=self.login_attempts {
            match self.try_login().await? {
                Some(username) => return Ok(SessionState::Menu { username }),
                None => {
                    let remaining = self.login_attempts - attempt;
                    if remaining > 0 {
                        self.say(&format!("Failed to login. You have {} remaining attempt(s).", remaining))?;
                    }
                }
            }
        }

        self.say("Failed to login. Returning to the welcome page.")?;
        Ok(SessionState::Welcome)
    }

    /// One login attempt. Some(username) on success.
    async fn try_login(&mut self) -> Result<Option<String>, SessionError> {
        let username = self.solicit("\nPlease enter your username.").await?;
        if !self.directory.is_username_taken(&username).await? {
            self.say(&format!("\n{} is not a valid username.", username))?;
            return Ok(None);
        }

        let password = self.solicit("Please enter your password.").await?;
        let input = LoginInput {
            username: username.clone(),
            password,
            connection: self.connection,
        };
        match self.directory.login(input).await {
            Ok(output) => {
                self.say("\nSuccessfully logged in.")?;
                if output.queued_messages.is_empty() {
                    self.say("\nYou do not have any queued messages.")?;
                } else {
                    self.say(&format!("\nWelcome back, {}. Unread messages:", username))?;
                    for message in &output.queued_messages {
                        self.say(message)?;
                    }
                }
                self.send_roster().await?;
                Ok(Some(username))
            }
            Err(LoginError::WrongPassword) => {
                self.say("\nIncorrect password.")?;
                Ok(None)
            }
            // Deleted between the two prompts.
            Err(LoginError::UnknownUser(_)) => {
                self.say(&format!("\n{} is not a valid username.", username))?;
                Ok(None)
            }
            Err(LoginError::ActorExited) => Err(SessionError::DirectoryUnavailable),
        }
    }

    async fn menu(&mut self, username: String) -> Result<SessionState, SessionError> {
        let choice = self.solicit(MENU_PROMPT).await?;
        match choice.as_str() {
            "1" => self.send_message(&username).await?,
            "2" => self.list_users().await?,
            "3" => return Ok(SessionState::DeleteConfirm { username }),
            _ => self.say(&format!(
                "\n{} is not a valid option. Please enter either 1, 2, or 3.",
                choice
            ))?,
        }

        Ok(SessionState::Menu { username })
    }

    async fn send_message(&mut self, username: &str) -> Result<(), SessionError> {
        let recipient = self.solicit("\nEnter username of message recipient:").await?;
        if !self.directory.is_username_taken(&recipient).await? {
            self.say(&format!("Target user {} does not exist!", recipient))?;
            return Ok(());
        }

        // Message text is relayed exactly as typed.
        let text = self.solicit_verbatim("Enter your message:").await?;
        let input = SendMessageInput {
            from: username.to_string(),
            to: recipient.clone(),
            text,
        };
        match self.directory.send_message(input).await {
            Ok(Delivery::Live) => self.say("\nMessage delivered to active user.")?,
            Ok(Delivery::Mailbox) => self.say("\nMessage delivered to mailbox.")?,
            Err(SendMessageError::UnknownRecipient(_)) => {
                self.say(&format!("Target user {} does not exist!", recipient))?
            }
            Err(SendMessageError::ActorExited) => return Err(SessionError::DirectoryUnavailable),
        }

        Ok(())
    }

    async fn list_users(&mut self) -> Result<(), SessionError> {
        let usernames = self.directory.list_users().await?;
        self.say(&roster("\nAll users:", &usernames))?;
        Ok(())
    }

    async fn delete_confirm(&mut self, username: String) -> Result<SessionState, SessionError> {
        let confirmation = self
            .solicit(&format!("\nType {} to delete your current account.", DELETE_CONFIRMATION))
            .await?;
        if confirmation != DELETE_CONFIRMATION {
            self.say("\nAccount deletion cancelled.")?;
            return Ok(SessionState::Menu { username });
        }

        self.directory.delete_account(&username).await?;
        slog::info!(self.logger, "'{}' deleted their account", username);
        // Best effort. The client may already be gone.
        let _ = self.say("\nAccount deleted. Goodbye.");

        Ok(SessionState::Closed)
    }

    async fn send_roster(&mut self) -> Result<(), SessionError> {
        let usernames = self.directory.list_users().await?;
        self.say(&roster("\nWelcome to the chatroom!\nAll users:", &usernames))?;
        Ok(())
    }

    fn say(&self, text: &str) -> Result<(), SessionError> {
        self.outbox.send_text(text)?;
        Ok(())
    }

    /// Sends `prompt` and waits for the client's reply, trimmed of surrounding whitespace.
    async fn solicit(&mut self, prompt: &str) -> Result<String, SessionError> {
        let reply = self.solicit_verbatim(prompt).await?;
        Ok(reply.trim().to_string())
    }

    async fn solicit_verbatim(&mut self, prompt: &str) -> Result<String, SessionError> {
        self.say(prompt)?;
        match self.reader.next().await {
            Some(Ok(frame)) => Ok(String::from_utf8_lossy(&frame).into_owned()),
            Some(Err(e)) => Err(SessionError::Read(e)),
            None => Err(SessionError::ConnectionLost),
        }
    }
}

fn roster(heading: &str, usernames: &[String]) -> String {
    let mut text = heading.to_string();
    for (index, username) in usernames.iter().enumerate() {
        text.push_str(&format!("\n{}. {}", index, username));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor;
    use crate::cluster::{framed_halves, FrameWriter};
    use crate::directory::UserDirectory;
    use crate::server::outbox::spawn_writer;
    use crate::server::ReplicationChannel;
    use bytes::Bytes;
    use futures::SinkExt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

    struct TestClient {
        reader: FrameReader,
        writer: FrameWriter,
    }

    impl TestClient {
        async fn send(&mut self, line: &str) {
            self.writer.send(Bytes::from(line.to_string())).await.unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            tokio::time::timeout(Duration::from_secs(5), self.reader.next())
                .await
                .expect("Timed out waiting for a frame")
                .map(|frame| String::from_utf8(frame.unwrap().to_vec()).unwrap())
        }

        /// Reads frames until one contains `needle`, returning it.
        async fn expect(&mut self, needle: &str) -> String {
            loop {
                match self.recv().await {
                    Some(frame) if frame.contains(needle) => return frame,
                    Some(_) => continue,
                    None => panic!("Connection closed while waiting for '{}'", needle),
                }
            }
        }

        async fn expect_closed(&mut self) {
            while let Some(_) = self.recv().await {}
        }
    }

    async fn start_directory() -> DirectoryClient {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let replication = ReplicationChannel::new(logger.clone(), vec![]);
        let (client, actor) = actor::create(logger, 10, UserDirectory::new(), replication);
        tokio::spawn(actor.run_event_loop());
        client
    }

    async fn connect(directory: &DirectoryClient) -> TestClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();

        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let connection = ConnectionId::new(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed));
        let (reader, writer) = framed_halves(server_stream, 1024 * 1024);
        let outbox = spawn_writer(logger.clone(), writer);
        directory.connection_opened(connection, outbox.clone()).await.unwrap();
        let session = SessionHandler::new(logger, connection, reader, outbox, directory.clone(), 3);
        tokio::spawn(session.run());

        let (reader, writer) = framed_halves(client_stream, 1024 * 1024);
        TestClient { reader, writer }
    }

    /// Resends until the directory stops delivering live, i.e. until `to` has left the active set.
    async fn send_until_mailboxed(directory: &DirectoryClient, from: &str, to: &str, text: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let delivery = directory
                .send_message(SendMessageInput {
                    from: from.to_string(),
                    to: to.to_string(),
                    text: text.to_string(),
                })
                .await
                .unwrap();
            if delivery == Delivery::Mailbox {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "{} never left the active set", to);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn create_account(client: &mut TestClient, username: &str, password: &str) {
        client.expect("Please enter 1 or 2").await;
        client.send("1").await;
        client.expect("Please enter a username").await;
        client.send(username).await;
        client.expect("Please enter a password").await;
        client.send(password).await;
        client.expect("Successfully created account").await;
        client.expect("Please enter 1, 2, or 3").await;
    }

    async fn login(client: &mut TestClient, username: &str, password: &str) {
        client.expect("Please enter 1 or 2").await;
        client.send("2").await;
        client.expect("Please enter your username").await;
        client.send(username).await;
        client.expect("Please enter your password").await;
        client.send(password).await;
        client.expect("Successfully logged in").await;
    }

    #[tokio::test]
    async fn first_frame_is_topology_publication() {
        let directory = start_directory().await;
        let mut client = connect(&directory).await;

        let first = client.recv().await.unwrap();
        assert_eq!(
            TopologyPublication::decode(first.as_bytes()).unwrap(),
            TopologyPublication::new(vec![], WELCOME_BANNER)
        );
    }

    #[tokio::test]
    async fn invalid_welcome_choice_reprompts() {
        let directory = start_directory().await;
        let mut client = connect(&directory).await;

        client.expect("Please enter 1 or 2").await;
        for junk in &["7", "abc", ""] {
            client.send(junk).await;
            client.expect("is not a valid option").await;
            client.expect("Please enter 1 or 2").await;
        }
        client.send("1").await;
        client.expect("Please enter a username").await;
    }

    #[tokio::test]
    async fn duplicate_username_reprompts_creation() {
        let directory = start_directory().await;
        let mut alice = connect(&directory).await;
        create_account(&mut alice, "alice", "p1").await;

        let mut imposter = connect(&directory).await;
        imposter.expect("Please enter 1 or 2").await;
        imposter.send("1").await;
        imposter.expect("Please enter a username").await;
        imposter.send("alice").await;
        imposter.expect("alice is already taken").await;
        imposter.expect("Please enter a username").await;
        imposter.send("mallory").await;
        imposter.expect("Please enter a password").await;
        imposter.send("p2").await;
        imposter.expect("Successfully created account with username: mallory").await;

        assert_eq!(directory.list_users().await.unwrap(), vec!["alice", "mallory"]);
    }

    #[tokio::test]
    async fn exhausted_login_attempts_return_to_welcome() {
        let directory = start_directory().await;
        let mut alice = connect(&directory).await;
        create_account(&mut alice, "alice", "p1").await;

        let mut client = connect(&directory).await;
        client.expect("Please enter 1 or 2").await;
        client.send("2").await;

        client.expect("Please enter your username").await;
        client.send("ghost").await;
        client.expect("ghost is not a valid username").await;
        client.expect("2 remaining attempt(s)").await;

        client.expect("Please enter your username").await;
        client.send("alice").await;
        client.expect("Please enter your password").await;
        client.send("wrong").await;
        client.expect("Incorrect password").await;
        client.expect("1 remaining attempt(s)").await;

        client.expect("Please enter your username").await;
        client.send("alice").await;
        client.expect("Please enter your password").await;
        client.send("still wrong").await;
        client.expect("Incorrect password").await;
        client.expect("Returning to the welcome page").await;
        client.expect("Please enter 1 or 2").await;

        // Back at the welcome page, a correct login works.
        client.send("2").await;
        client.expect("Please enter your username").await;
        client.send("alice").await;
        client.expect("Please enter your password").await;
        client.send("p1").await;
        client.expect("Successfully logged in").await;
    }

    #[tokio::test]
    async fn offline_messages_wait_in_mailbox_until_login() {
        let directory = start_directory().await;
        let mut bob = connect(&directory).await;
        create_account(&mut bob, "bob", "p2").await;
        drop(bob);

        // Disconnect is noticed asynchronously. Copies delivered live before then went nowhere.
        send_until_mailboxed(&directory, "alice", "bob", "first").await;

        let mut alice = connect(&directory).await;
        create_account(&mut alice, "alice", "p1").await;
        alice.send("1").await;
        alice.expect("recipient").await;
        alice.send("bob").await;
        alice.expect("Enter your message").await;
        alice.send("second").await;
        alice.expect("Message delivered to mailbox").await;

        let mut bob = connect(&directory).await;
        login(&mut bob, "bob", "p2").await;
        bob.expect("Welcome back, bob. Unread messages:").await;
        assert_eq!(bob.recv().await.unwrap(), "<alice> first");
        assert_eq!(bob.recv().await.unwrap(), "<alice> second");
        drop(bob);

        // Flushed exactly once.
        let mut bob = connect(&directory).await;
        login(&mut bob, "bob", "p2").await;
        bob.expect("You do not have any queued messages").await;
    }

    #[tokio::test]
    async fn online_recipient_receives_immediately() {
        let directory = start_directory().await;
        let mut bob = connect(&directory).await;
        create_account(&mut bob, "bob", "p2").await;
        let mut alice = connect(&directory).await;
        create_account(&mut alice, "alice", "p1").await;

        alice.send("1").await;
        alice.expect("recipient").await;
        alice.send("bob").await;
        alice.expect("Enter your message").await;
        alice.send("hi bob").await;
        alice.expect("Message delivered to active user").await;

        bob.expect("<alice> hi bob").await;
    }

    #[tokio::test]
    async fn message_text_keeps_its_whitespace() {
        let directory = start_directory().await;
        let mut bob = connect(&directory).await;
        create_account(&mut bob, "bob", "p2").await;
        let mut alice = connect(&directory).await;
        create_account(&mut alice, "alice", "p1").await;

        alice.send(" 1 ").await;
        alice.expect("recipient").await;
        alice.send("bob ").await;
        alice.expect("Enter your message").await;
        alice.send("  indented  ").await;
        alice.expect("Message delivered to active user").await;

        assert_eq!(bob.expect("<alice>").await, "<alice>   indented  ");
    }

    #[tokio::test]
    async fn unknown_recipient_returns_to_menu() {
        let directory = start_directory().await;
        let mut alice = connect(&directory).await;
        create_account(&mut alice, "alice", "p1").await;

        alice.send("1").await;
        alice.expect("recipient").await;
        alice.send("nobody").await;
        alice.expect("Target user nobody does not exist!").await;
        alice.expect("Please enter 1, 2, or 3").await;
    }

    #[tokio::test]
    async fn list_enumerates_usernames() {
        let directory = start_directory().await;
        let mut bob = connect(&directory).await;
        create_account(&mut bob, "bob", "p2").await;
        let mut alice = connect(&directory).await;
        create_account(&mut alice, "alice", "p1").await;

        alice.send("2").await;
        assert_eq!(alice.expect("All users:").await, "\nAll users:\n0. alice\n1. bob");
    }

    #[tokio::test]
    async fn deletion_requires_exact_confirmation() {
        let directory = start_directory().await;
        let mut alice = connect(&directory).await;
        create_account(&mut alice, "alice", "p1").await;

        alice.send("3").await;
        alice.expect("Type confirm").await;
        alice.send("yes please").await;
        alice.expect("Account deletion cancelled").await;
        alice.expect("Please enter 1, 2, or 3").await;
        assert_eq!(directory.list_users().await.unwrap(), vec!["alice"]);

        alice.send("3").await;
        alice.expect("Type confirm").await;
        alice.send("confirm").await;
        alice.expect_closed().await;
        assert!(directory.list_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_releases_active_connection() {
        let directory = start_directory().await;
        let mut bob = connect(&directory).await;
        create_account(&mut bob, "bob", "p2").await;
        drop(bob);

        send_until_mailboxed(&directory, "alice", "bob", "ping").await;
    }
}
