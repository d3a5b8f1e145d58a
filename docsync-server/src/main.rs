//! docsync server binary.
//!
//! Loads configuration (defaults, then `--config` file, then `DOCSYNC_*`
//! environment, then flags), serves until Ctrl-C or SIGTERM and flushes every
//! loaded document before exiting.

use clap::{Parser, Subcommand};
use docsync_collab::{AuthGate, ConfigError, Role, ServerConfig, SyncServer};
use log::{error, info};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

/// Real-time collaborative document sync server
#[derive(Parser, Debug)]
#[command(name = "docsync-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<String>,

    /// RocksDB directory; documents stay in memory without one
    #[arg(short, long)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a token signed with the configured secret
    Token {
        #[arg(long)]
        user: String,

        #[arg(long)]
        doc: String,

        /// reader or editor
        #[arg(long, default_value = "editor", value_parser = parse_role)]
        role: Role,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
    },
}

fn parse_role(value: &str) -> Result<Role, String> {
    match value {
        "reader" => Ok(Role::Reader),
        "editor" => Ok(Role::Editor),
        other => Err(format!("unknown role '{other}', expected reader or editor")),
    }
}

fn load_config(cli: &Cli) -> Result<ServerConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config.apply_env()?;
    if let Some(bind) = &cli.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(storage) = &cli.storage {
        config.storage_path = Some(storage.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if let Some(Command::Token {
        user,
        doc,
        role,
        ttl,
    }) = &cli.command
    {
        config.validate()?;
        let gate = AuthGate::new(&config.jwt_secret);
        println!("{}", gate.issue(user, doc, *role, Duration::from_secs(*ttl))?);
        return Ok(());
    }

    info!("Starting docsync server on {}", config.bind_addr);
    let server = SyncServer::new(config)?;
    let report = server.run(shutdown_signal()).await?;

    if report.failed > 0 {
        error!("{} documents could not be saved on shutdown", report.failed);
        return Err(format!("{} documents failed to save", report.failed).into());
    }
    info!("Stopped, {} documents saved on shutdown", report.saved);
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        }
        _ = terminate() => {}
    }
    info!("Shutdown requested");
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to listen for SIGTERM: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = std::env::temp_dir().join(format!("docsync-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("docsync.toml");
        std::fs::write(&path, "bind_addr = \"127.0.0.1:1\"\ndebounce_ms = 900\n").unwrap();

        let cli = Cli::try_parse_from([
            "docsync-server",
            "--config",
            path.to_str().unwrap(),
            "--bind",
            "0.0.0.0:7000",
            "--storage",
            "/tmp/docsync-data",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.debounce_ms, 900);
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/docsync-data")));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_token_subcommand() {
        let cli = Cli::try_parse_from([
            "docsync-server",
            "token",
            "--user",
            "u1",
            "--doc",
            "doc-42",
            "--role",
            "reader",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Token { role, ttl, .. }) => {
                assert_eq!(role, Role::Reader);
                assert_eq!(ttl, 3600);
            }
            None => panic!("expected token subcommand"),
        }
    }

    #[test]
    fn test_parse_role_rejects_unknown() {
        assert!(parse_role("admin").is_err());
        assert_eq!(parse_role("editor"), Ok(Role::Editor));
    }
}
