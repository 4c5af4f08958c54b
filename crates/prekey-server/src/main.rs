//! Prekey server binary.
//!
//! # Usage
//!
//! ```bash
//! # Register a bundle from a JSON file (or "-" for stdin)
//! prekey-server --db prekeys.redb register bundle.json
//!
//! # Fetch a bundle for alice, consuming one of her one-time prekeys
//! prekey-server bundle alice
//!
//! # Upload more one-time prekeys from stdin
//! echo '{"user_id":"alice","opks":[{"key_id":"k9","public_key":"..."}]}' \
//!     | prekey-server refill -
//!
//! # Watch for users running low on one-time prekeys until Ctrl-C
//! prekey-server --audit-log audit.jsonl monitor --threshold 5 --interval-secs 30
//! ```

use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};
use prekey_server::{
    Environment, MonitorConfig, PrekeyServer, RefillOpkRequest, RegisterBundleRequest,
    RequestContext, RotateSpkRequest, ServerConfig, ServerError, SystemEnv,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// X3DH prekey bundle server
#[derive(Parser, Debug)]
#[command(name = "prekey-server")]
#[command(about = "X3DH prekey bundle storage and distribution")]
#[command(version)]
struct Args {
    /// Path to the key store database
    #[arg(long, default_value = "prekeys.redb")]
    db: PathBuf,

    /// Append audit events to this JSON-lines file instead of the log
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Actor recorded in audit events (defaults to the target user)
    #[arg(long)]
    actor: Option<String>,

    /// Give up on store work after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register identity key, signed prekey and one-time prekeys
    Register {
        /// JSON registration request ("-" for stdin)
        file: PathBuf,
    },

    /// Fetch a user's bundle, consuming one one-time prekey
    Bundle {
        /// Bundle owner
        user_id: String,
    },

    /// Upload more one-time prekeys
    Refill {
        /// JSON refill request ("-" for stdin)
        file: PathBuf,
    },

    /// Replace a user's signed prekey
    Rotate {
        /// JSON rotation request ("-" for stdin)
        file: PathBuf,
    },

    /// Count a user's unused one-time prekeys
    Count {
        /// Key owner
        user_id: String,
    },

    /// Watch for users running low on one-time prekeys until Ctrl-C
    Monitor {
        /// Flag users with fewer unused one-time prekeys than this
        #[arg(long, default_value_t = prekey_server::DEFAULT_THRESHOLD)]
        threshold: usize,
        /// Seconds between scans
        #[arg(long, default_value_t = prekey_server::DEFAULT_INTERVAL.as_secs())]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    // Diagnostics on stderr, command results on stdout
    tracing_subscriber::registry().with(fmt::layer().with_writer(io::stderr)).with(filter).init();

    let monitor = match &args.command {
        Command::Monitor { threshold, interval_secs } => MonitorConfig {
            threshold: *threshold,
            interval: Duration::from_secs(*interval_secs),
        },
        _ => MonitorConfig::default(),
    };

    let config =
        ServerConfig { db_path: args.db.clone(), audit_log: args.audit_log.clone(), monitor };

    // Only the request commands hold the database open
    let open = || PrekeyServer::open(&config);

    let mut ctx = RequestContext::new();
    ctx.actor_id = args.actor.clone();
    ctx.deadline_secs =
        args.timeout_secs.map(|timeout| SystemEnv::new().wall_clock_secs().saturating_add(timeout));

    match args.command {
        Command::Register { file } => {
            let req: RegisterBundleRequest = read_json(&file)?;
            open()?.service().store_bundle(&ctx, &req)?;
            write_json(&json!({ "status": "bundle stored", "user_id": req.user_id }))?;
        },
        Command::Bundle { user_id } => {
            let bundle = open()?.service().get_bundle(&ctx, &user_id)?;
            write_json(&bundle)?;
        },
        Command::Refill { file } => {
            let req: RefillOpkRequest = read_json(&file)?;
            open()?.service().refill_opks(&ctx, &req.user_id, &req.opks)?;
            write_json(&json!({
                "status": "refilled",
                "user_id": req.user_id,
                "num_opks": req.opks.len(),
            }))?;
        },
        Command::Rotate { file } => {
            let req: RotateSpkRequest = read_json(&file)?;
            open()?.service().rotate_spk(
                &ctx,
                &req.user_id,
                &req.new_spk,
                &req.signature,
                req.expires_at,
            )?;
            write_json(&json!({ "status": "rotated", "user_id": req.user_id }))?;
        },
        Command::Count { user_id } => {
            let count = open()?.service().count_available_opks(&ctx, &user_id)?;
            write_json(&json!({ "user_id": user_id, "available_opks": count }))?;
        },
        Command::Monitor { .. } => {
            let handle = PrekeyServer::monitor(&config)?.spawn();
            tracing::info!(
                db = %config.db_path.display(),
                "monitoring one-time prekeys, Ctrl-C to stop"
            );

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown requested");
            handle.stop().await?;
        },
    }

    Ok(())
}

/// Parse JSON from `path`, or stdin when `path` is "-".
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ServerError> {
    let bytes = if path == Path::new("-") {
        let mut bytes = Vec::new();
        io::stdin().lock().read_to_end(&mut bytes)?;
        bytes
    } else {
        fs::read(path)?
    };

    Ok(serde_json::from_slice(&bytes)?)
}

fn write_json(value: &impl Serialize) -> Result<(), ServerError> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value).map_err(io::Error::from)?;
    writeln!(out)?;
    Ok(())
}
