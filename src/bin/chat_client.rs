use clap::Parser;
use failover_chat::{ChatClientConfig, ChatOptions, ClientExit, StdioTerminal};
use std::net::IpAddr;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "chat-client")]
#[command(about = "Chat with the cluster, following it through failovers")]
struct Args {
    #[arg(help = "Address of the original leader")]
    server_ip: IpAddr,
    #[arg(default_value_t = 1234)]
    base_port: u16,
    #[arg(short, long, help = "Log debug output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    // Logs share the terminal with the conversation, so stay quiet unless asked.
    let level = if args.verbose {
        slog::Level::Debug
    } else {
        slog::Level::Warning
    };
    let info_logger = failover_chat::create_root_logger_for_stdout(level);

    let config = ChatClientConfig {
        server_ip: args.server_ip,
        base_port: args.base_port,
        info_logger: info_logger.clone(),
        options: ChatOptions::default(),
    };
    match failover_chat::run_chat_client(config, StdioTerminal::new()).await {
        Ok(ClientExit::AccountDeleted) => {
            println!("Account deleted. Goodbye.");
            ExitCode::SUCCESS
        }
        Ok(ClientExit::InputClosed) => ExitCode::SUCCESS,
        Err(e) => {
            slog::error!(info_logger, "{}", e);
            ExitCode::FAILURE
        }
    }
}
