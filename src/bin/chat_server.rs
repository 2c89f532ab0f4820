use clap::Parser;
use failover_chat::{ChatNodeConfig, ChatOptions};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "chat-server")]
#[command(about = "Runs one member of the chat cluster")]
struct Args {
    #[arg(help = "Address of the original leader (member 0)")]
    entry_point: IpAddr,
    #[arg(help = "This member's position in succession order, 0 for the leader")]
    member_index: usize,
    #[arg(long, default_value_t = 1234)]
    base_port: u16,
    #[arg(long, default_value_t = 2, help = "Number of backups in the cluster")]
    replica_count: usize,
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind_ip: IpAddr,
    #[arg(short, long, help = "Log debug output")]
    verbose: bool,
    #[arg(long, help = "Write logs to a timestamped file in this directory instead of stdout")]
    log_directory: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.verbose {
        slog::Level::Debug
    } else {
        slog::Level::Info
    };
    let info_logger = match &args.log_directory {
        Some(directory) => {
            let name = format!("member-{}", args.member_index);
            match failover_chat::create_root_logger_for_file(directory, &name, level) {
                Ok(logger) => logger,
                Err(e) => {
                    eprintln!("Failed to open log file in {}: {}", directory.display(), e);
                    return ExitCode::FAILURE;
                }
            }
        }
        None => failover_chat::create_root_logger_for_stdout(level),
    };

    let config = ChatNodeConfig {
        member_index: args.member_index,
        entry_point: args.entry_point,
        bind_ip: args.bind_ip,
        base_port: args.base_port,
        replica_count: args.replica_count,
        info_logger: info_logger.clone(),
        options: ChatOptions::default(),
    };
    let node = match failover_chat::try_create_chat_node(config).await {
        Ok(node) => node,
        Err(e) => {
            slog::crit!(info_logger, "Failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match node.wait().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            slog::crit!(info_logger, "{}", e);
            ExitCode::FAILURE
        }
    }
}
