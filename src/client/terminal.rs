use std::io::{self, BufRead};
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::mpsc;

/// Terminal is where a chat client reads what the user types and shows what the server says.
///
/// `next_line` must be cancel safe: the client races it against the server connection and drops
/// it whenever the server speaks first.
#[async_trait::async_trait]
pub trait Terminal: Send {
    /// The next line of input without its line ending. None once input is exhausted.
    async fn next_line(&mut self) -> io::Result<Option<String>>;

    async fn display(&mut self, text: &str) -> io::Result<()>;
}

/// StdioTerminal reads stdin on a dedicated thread. A blocking read on the runtime's blocking pool
/// would hold up runtime shutdown until the user pressed enter.
pub struct StdioTerminal {
    lines: mpsc::UnboundedReceiver<io::Result<String>>,
    stdout: Stdout,
}

impl StdioTerminal {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                let failed = line.is_err();
                if tx.send(line).is_err() || failed {
                    return;
                }
            }
        });

        StdioTerminal {
            lines: rx,
            stdout: tokio::io::stdout(),
        }
    }
}

impl Default for StdioTerminal {
    fn default() -> Self {
        StdioTerminal::new()
    }
}

#[async_trait::async_trait]
impl Terminal for StdioTerminal {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.lines.recv().await.transpose()
    }

    async fn display(&mut self, text: &str) -> io::Result<()> {
        self.stdout.write_all(text.as_bytes()).await?;
        self.stdout.write_all(b"\n").await?;
        self.stdout.flush().await
    }
}
