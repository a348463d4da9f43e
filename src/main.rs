//! Kuro Mock - CLI Entry Point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kuro_mock::logging::{init_logging, LogFormat};
use kuro_mock::{MockDefinition, MockServer, ProtocolHandler, RuntimeSettings};
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(
    name = "kuro-mock",
    about = "Protocol mocking engine - HTTP, TCP, WebSocket and SFTP mocks from declarative definitions",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error); KURO_LOG overrides it
    #[arg(short = 'L', long, default_value = "info", global = true)]
    log_level: Level,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Human, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start every definition and serve until Ctrl-C
    Run {
        /// Definition files (.yaml, .yml or .json)
        #[arg(required = true)]
        definitions: Vec<PathBuf>,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Load and validate definitions, then exit
    Validate {
        #[arg(required = true)]
        definitions: Vec<PathBuf>,
    },

    /// Print a sample definition and exit
    Example,
}

#[derive(clap::Args, Debug)]
struct SettingsArgs {
    /// Address every listener binds to
    #[arg(long, env = "KURO_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Backing directory for SFTP mocks
    #[arg(long, env = "KURO_SFTP_ROOT", default_value = "sftp_root")]
    sftp_root: PathBuf,

    /// SSH host private key for SFTP mocks (ephemeral key when unset)
    #[arg(long, env = "KURO_HOST_KEY")]
    host_key: Option<PathBuf>,

    /// HTTP graceful shutdown window in milliseconds
    #[arg(long, env = "KURO_SHUTDOWN_GRACE_MS", default_value_t = 5000)]
    shutdown_grace_ms: u64,
}

impl From<SettingsArgs> for RuntimeSettings {
    fn from(args: SettingsArgs) -> Self {
        RuntimeSettings {
            host: args.host,
            sftp_root: args.sftp_root,
            host_key_path: args.host_key,
            shutdown_grace_ms: args.shutdown_grace_ms,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.log_format, args.log_level);

    match args.command {
        Command::Example => {
            println!("{}", include_str!("../demos/tcp-ping.yaml"));
            Ok(())
        }
        Command::Validate { definitions } => {
            for path in &definitions {
                let def = load(path)?;
                println!(
                    "{}: valid {} mock on port {}",
                    path.display(),
                    def.protocol,
                    def.port
                );
            }
            Ok(())
        }
        Command::Run {
            definitions,
            settings,
        } => run(&definitions, settings.into()).await,
    }
}

fn load(path: &Path) -> Result<MockDefinition> {
    info!(path = %path.display(), "Loading definition");
    MockDefinition::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

async fn run(paths: &[PathBuf], settings: RuntimeSettings) -> Result<()> {
    let mut servers = Vec::with_capacity(paths.len());

    for path in paths {
        let started = match load(path) {
            Ok(def) => MockServer::launch(&def, settings.clone())
                .await
                .with_context(|| format!("failed to start {}", path.display())),
            Err(e) => Err(e),
        };

        match started {
            Ok(server) => servers.push(server),
            Err(e) => {
                stop_all(&mut servers).await;
                return Err(e);
            }
        }
    }

    info!(mocks = servers.len(), "All mocks running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("Shutting down");
    stop_all(&mut servers).await;
    Ok(())
}

async fn stop_all(servers: &mut [MockServer]) {
    for server in servers.iter_mut() {
        if let Err(e) = server.stop().await {
            error!(protocol = %server.protocol(), error = %e, "Failed to stop mock");
        }
    }
}
