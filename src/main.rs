//! Binary entrypoint for the groupbbs CLI.
//!
//! Commands:
//! - `start [--host <addr>] [--port <n>]` - run the server until Ctrl-C
//! - `init` - write a starter `config.toml` and create the data directory
//! - `status` - print configuration and a summary of the saved groups and boards
//!
//! See the library crate docs for module-level details: `groupbbs::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use groupbbs::bbs::BbsServer;
use groupbbs::config::Config;
use groupbbs::storage::Storage;

#[derive(Parser)]
#[command(name = "groupbbs")]
#[command(about = "A multi-user group bulletin board server over TCP")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the BBS server
    Start {
        /// Address to listen on (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// TCP port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Initialize a new BBS configuration
    Init,
    /// Show BBS status and statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { host, port } => {
            let mut config = Config::load(&cli.config).await?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting groupbbs v{}", env!("CARGO_PKG_VERSION"));

            let mut bbs = BbsServer::new(config).await?;
            bbs.run().await?;
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            info!("Initializing new BBS configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
            let cfg = Config::load(&cli.config).await?;
            let storage = Storage::new(&cfg.storage).await?;
            info!("Data directory ready at {}", storage.base_dir().display());
        }
        Commands::Status => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            let bbs = BbsServer::new(config).await?;
            bbs.show_status().await?;
        }
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let configured = config
        .as_ref()
        .and_then(|cfg| cfg.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    // CLI verbosity overrides the configured level
    let level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });
    if let Some(f) = log_file {
        let mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Foreground runs also echo to the console
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
