use chrono::Utc;
use slog::Drain;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Root logger writing to the terminal, filtered at `level`.
pub fn create_root_logger_for_stdout(level: slog::Level) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();

    slog::Logger::root(drain, slog::o!())
}

/// Root logger writing to `<directory>/<name>_<UTC timestamp>.log`, creating the directory if
/// needed.
pub fn create_root_logger_for_file(directory: &Path, name: &str, level: slog::Level) -> io::Result<slog::Logger> {
    fs::create_dir_all(directory)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path(directory, name))?;

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();

    Ok(slog::Logger::root(drain, slog::o!()))
}

fn log_path(directory: &Path, name: &str) -> PathBuf {
    let now = Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
    directory.join(format!("{}_{}.log", name, now))
}
