//! Provenance Registry CLI
//!
//! Commands for managing a provenance registry state file.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use fs2::FileExt;
use provenance_registry::{
    Checksum, Identity, ProductMetadata, ProductRegistry, ProvenanceConfig, RegisterRequest,
    SerialHash,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "provenance-registry")]
#[command(about = "Tamper-evident product provenance registry")]
struct Cli {
    /// Path to the registry state file (overrides config)
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// Config file to load
    #[arg(short, long)]
    config: Option<String>,

    /// Identity submitting the operation
    #[arg(long = "as", value_name = "IDENTITY")]
    caller: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Descriptive metadata fields
#[derive(Args)]
struct MetadataArgs {
    /// Product name
    #[arg(long)]
    name: String,
    /// Product description
    #[arg(long)]
    description: String,
    /// Creation time in milliseconds since the Unix epoch
    #[arg(long)]
    created_at_ms: i64,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty state file
    Init,

    /// Register a product
    Register {
        /// Serial fingerprint (0x-hex or raw serial)
        serial: String,
        /// Metadata digest, if the metadata record is not given
        #[arg(long)]
        hash: Option<String>,
        /// External metadata pointer (e.g. ipfs://...)
        #[arg(long)]
        uri: Option<String>,
        /// Product name; with --description, hashes the metadata here
        #[arg(long, requires = "description")]
        name: Option<String>,
        /// Product description
        #[arg(long, requires = "name")]
        description: Option<String>,
        /// Creation time in milliseconds (defaults to now)
        #[arg(long)]
        created_at_ms: Option<i64>,
    },

    /// Transfer a product to a new owner
    Transfer {
        serial: String,
        new_owner: String,
    },

    /// Flag a product as disputed
    Flag {
        serial: String,
        reason: String,
    },

    /// Clear a product's flag
    Clear {
        serial: String,
    },

    /// Show a product
    Show {
        serial: String,
        /// Print the full record including history
        #[arg(long)]
        full: bool,
    },

    /// List registered serials in registration order
    List,

    /// Show the ownership history of a product
    History {
        serial: String,
    },

    /// Show the event log, optionally for one product
    Events {
        serial: Option<String>,
    },

    /// Print the metadata digest for a record
    Fingerprint {
        serial: String,
        #[command(flatten)]
        metadata: MetadataArgs,
    },

    /// Check a metadata record against the stored digest
    Verify {
        serial: String,
        #[command(flatten)]
        metadata: MetadataArgs,
    },
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn millis(ms: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("invalid timestamp {}", ms))
}

/// Exclusive advisory lock on a state file, released on drop
///
/// Every command loads, changes and saves the whole file; the lock keeps a
/// second process from saving over an operation it never loaded.
struct StateLock {
    _file: File,
}

impl StateLock {
    fn acquire(state_path: &Path) -> anyhow::Result<Self> {
        let lock_path = state_path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening {}", lock_path.display()))?;

        if file.try_lock_exclusive().is_err() {
            eprintln!("⏳ Waiting for another process using {}", state_path.display());
            file.lock_exclusive()
                .with_context(|| format!("locking {}", lock_path.display()))?;
        }
        Ok(Self { _file: file })
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ProvenanceConfig::load_from(cli.config.as_deref()).context("loading config")?;
    let state_path = cli.state.clone().unwrap_or_else(|| config.state_path());
    let _lock = StateLock::acquire(&state_path)?;
    let registry = ProductRegistry::open(&state_path, &config)
        .with_context(|| format!("opening {}", state_path.display()))?;

    let caller = || -> anyhow::Result<Identity> {
        let Some(raw) = cli.caller.as_deref() else {
            bail!("this command needs --as <IDENTITY>");
        };
        Ok(Identity::parse(raw)?)
    };

    match cli.command {
        Commands::Init => {
            registry.save(&state_path)?;
            println!("📦 Registry initialized at {}", state_path.display());
        }

        Commands::Register {
            serial,
            hash,
            uri,
            name,
            description,
            created_at_ms,
        } => {
            let mut request = match (name, description) {
                (Some(name), Some(description)) => {
                    let created_at = match created_at_ms {
                        Some(ms) => millis(ms)?,
                        None => Utc::now(),
                    };
                    let metadata = ProductMetadata::new(name, description, serial, created_at);
                    let request = RegisterRequest::from_metadata(metadata)?;
                    if let Some(hash) = hash {
                        if Checksum::from_hex(&hash)? != request.metadata_hash {
                            bail!("--hash does not match the given metadata");
                        }
                    }
                    request
                }
                _ => {
                    let Some(hash) = hash else {
                        bail!("give either --hash or --name and --description");
                    };
                    RegisterRequest::new(SerialHash::parse(&serial)?, Checksum::from_hex(&hash)?)
                }
            };
            if let Some(uri) = uri {
                request = request.with_uri(uri);
            }
            let metadata_hash = request.metadata_hash;

            let receipt = registry.register(&caller()?, request)?;
            registry.save(&state_path)?;
            println!("✅ Registered {}", receipt.serial_hash);
            println!("🔒 Metadata hash: {}", metadata_hash);
            println!("🧾 Tx: {}", receipt.tx_id);
        }

        Commands::Transfer { serial, new_owner } => {
            let serial = SerialHash::parse(&serial)?;
            let receipt = registry.transfer(&caller()?, &serial, &Identity::parse(&new_owner)?)?;
            registry.save(&state_path)?;
            println!("✅ {} now owned by {}", serial, new_owner);
            println!("🧾 Tx: {}", receipt.tx_id);
        }

        Commands::Flag { serial, reason } => {
            let serial = SerialHash::parse(&serial)?;
            let receipt = registry.flag(&caller()?, &serial, &reason)?;
            registry.save(&state_path)?;
            println!("🚩 Flagged {}", serial);
            println!("🧾 Tx: {}", receipt.tx_id);
        }

        Commands::Clear { serial } => {
            let serial = SerialHash::parse(&serial)?;
            let receipt = registry.clear_flag(&caller()?, &serial)?;
            registry.save(&state_path)?;
            println!("✅ Cleared flag on {}", serial);
            println!("🧾 Tx: {}", receipt.tx_id);
        }

        Commands::Show { serial, full } => {
            let serial = SerialHash::parse(&serial)?;
            if full {
                println!("{}", serde_json::to_string_pretty(&registry.product(&serial)?)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&registry.get_product(&serial)?)?);
            }
        }

        Commands::List => {
            if registry.is_empty() {
                println!("No products registered yet.");
            } else {
                println!("📚 Registered products:");
                for product in registry.products() {
                    let marker = if product.is_flagged() { " 🚩" } else { "" };
                    println!("  {} owner={}{}", product.serial_hash, product.current_owner, marker);
                }
            }
        }

        Commands::History { serial } => {
            let serial = SerialHash::parse(&serial)?;
            for record in registry.transfer_history(&serial)? {
                let from = record
                    .previous_owner
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "(registered)".to_string());
                println!(
                    "  {} {} -> {}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    from,
                    record.new_owner
                );
            }
        }

        Commands::Events { serial } => {
            let events = match serial {
                Some(serial) => registry.events_for(&SerialHash::parse(&serial)?),
                None => registry.events(),
            };
            for event in events {
                println!("{}", serde_json::to_string(&event)?);
            }
        }

        Commands::Fingerprint { serial, metadata } => {
            let record = ProductMetadata::new(
                metadata.name,
                metadata.description,
                serial,
                millis(metadata.created_at_ms)?,
            );
            println!("{}", record.fingerprint()?);
        }

        Commands::Verify { serial, metadata } => {
            let serial_hash = SerialHash::parse(&serial)?;
            let record = ProductMetadata::new(
                metadata.name,
                metadata.description,
                serial,
                millis(metadata.created_at_ms)?,
            );
            if registry.verify_metadata(&serial_hash, &record)? {
                println!("✅ Metadata verified for {}", serial_hash);
            } else {
                eprintln!("❌ Metadata does not match the registered digest for {}", serial_hash);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
