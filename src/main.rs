#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # nshd
//!
//! Shell daemon for peers on an encrypted overlay message bus.
//!
//! ## Subcommands
//!
//! - `nshd` (default): run the daemon
//! - `nshd addr`: print the daemon's bus address and exit
//!
//! On first run the base directory, wallet, wallet password, and an empty
//! authorized file are created. Authorized principals are listed one per line
//! in the authorized file as `<address-or-public-key> [uid] [gid]`.

use std::path::Path;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use nshd::config::Config;
use nshd::{daemon, identity};

/// Shell daemon for authorized peers on an encrypted overlay message bus.
#[derive(Parser, Debug)]
#[command(name = "nshd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Directory holding the wallet, password, and authorized files.
    #[arg(short = 'b', long, global = true)]
    base_dir: Option<String>,

    /// Wallet file path.
    #[arg(short = 'w', long, global = true)]
    wallet: Option<String>,

    /// Wallet password file path.
    #[arg(short = 'p', long, global = true)]
    password_file: Option<String>,

    /// Authorized principals file path.
    #[arg(long, visible_alias = "auth", global = true)]
    authorized_pk_file: Option<String>,

    /// Shell spawned for interactive sessions.
    #[arg(short = 's', long, global = true)]
    shell: Option<String>,

    /// Route plain async commands to per-principal sessions
    /// (`--session`, `--session false`, or `--no-session`).
    #[arg(
        long,
        visible_alias = "sess",
        global = true,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    session: Option<bool>,

    /// Run every async command as a one-shot.
    #[arg(long, global = true, conflicts_with = "session")]
    no_session: bool,

    /// Identifier prefixed to the public key in our address.
    #[arg(short = 'i', long, visible_alias = "id", global = true)]
    identifier: Option<String>,

    /// Default timeout for synchronous commands, in ms.
    #[arg(long, visible_alias = "sto", global = true)]
    sync_exec_timeout: Option<u64>,

    /// Default timeout for asynchronous commands, in ms (0 = unbounded).
    #[arg(long, visible_alias = "ato", global = true)]
    async_exec_timeout: Option<u64>,

    /// Log command text.
    #[arg(long, visible_alias = "lc", global = true)]
    log_cmd: bool,

    /// Exit when the network stays unreachable for too long.
    #[arg(long, global = true)]
    must_keepalive: bool,

    /// Relay WebSocket URL (repeatable).
    #[arg(long = "relay", global = true)]
    relays: Vec<String>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Print the daemon's address and exit.
    Addr,
}

impl Cli {
    /// Flags take precedence over env vars and the config file.
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.base_dir {
            config.daemon.base_dir.clone_from(dir);
        }
        if let Some(w) = &self.wallet {
            config.daemon.wallet = Some(w.clone());
        }
        if let Some(p) = &self.password_file {
            config.daemon.password_file = Some(p.clone());
        }
        if let Some(a) = &self.authorized_pk_file {
            config.daemon.authorized_file = Some(a.clone());
        }
        if let Some(s) = &self.shell {
            config.shell.shell.clone_from(s);
        }
        if let Some(s) = self.session {
            config.shell.session = s;
        }
        if self.no_session {
            config.shell.session = false;
        }
        if let Some(id) = &self.identifier {
            config.daemon.identifier.clone_from(id);
        }
        if let Some(t) = self.sync_exec_timeout {
            config.exec.sync_timeout_ms = t;
        }
        if let Some(t) = self.async_exec_timeout {
            config.exec.async_timeout_ms = t;
        }
        if self.log_cmd {
            config.exec.log_cmd = true;
        }
        if self.must_keepalive {
            config.keepalive.must_keepalive = true;
        }
        if !self.relays.is_empty() {
            config.transport.relays.clone_from(&self.relays);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = Config::load(cli.config.as_deref()).map(|mut config| {
        cli.apply(&mut config);
        config
    });

    // Logs go to stderr so `nshd addr` prints only the address on stdout.
    let level = loaded
        .as_ref()
        .map_or_else(|_| "info".to_string(), |c| c.logging.level.clone());
    let log_filter = std::env::var("RUST_LOG").unwrap_or(level);
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match loaded {
        Ok(config) => match run(cli.command.as_ref(), config).await {
            Ok(()) => 0,
            Err(e) => {
                error!("{e}");
                1
            }
        },
        Err(e) => {
            error!("{e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(
    command: Option<&Commands>,
    config: Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let base_dir = &config.daemon.base_dir;
    if !Path::new(base_dir).exists() {
        std::fs::create_dir_all(base_dir)
            .map_err(|e| format!("Failed to create base dir {base_dir}: {e}"))?;
        info!("Created base dir {base_dir}");
    }

    let identity = identity::load_or_create(
        Path::new(&config.wallet_path()),
        Path::new(&config.password_path()),
    )?;

    if command == Some(&Commands::Addr) {
        println!("{}", identity.address(&config.daemon.identifier));
        return Ok(());
    }

    info!("nshd v{} starting", env!("CARGO_PKG_VERSION"));
    daemon::run(config, identity).await?;
    Ok(())
}
