//! Headless Aegis mesh node.
//!
//! Wires the core together: config → identity keys → contact book and
//! relation graph → relay transport → session manager → session executor
//! and graph sync. The admin subcommands cover the contact lifecycle that
//! a UI would normally drive.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aegis_crypto::keys::{load_or_create_keys, verify_key_fingerprint};
use aegis_mesh::{SessionExec, SessionManager, SyncService, Transport};
use aegis_proto::AppConfig;
use aegis_store::{ContactBook, RelationGraph};
use aegis_tools::NullKnowledgeBase;

#[derive(Parser)]
#[command(name = "aegis-node", about = "Aegis mesh node", version)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the relay and serve sessions until interrupted.
    Run,
    /// Print this node's identity fingerprint for out-of-band comparison.
    Fingerprint,
    /// Add a peer to the contact book as pending.
    AddContact {
        alias: String,
        peer_id: String,
        /// The peer's base64 Ed25519 verify key.
        verify_key: String,
    },
    /// Mark a pending contact as trusted after verifying fingerprints.
    Trust { peer_id: String },
    /// List the contact book.
    Contacts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    match cli.command {
        Command::Run => run(cfg).await,
        Command::Fingerprint => {
            let (_sk, vk) = load_or_create_keys(&cfg.mesh.peer_id, &cfg.paths.keys_dir)?;
            println!("{}", verify_key_fingerprint(&vk));
            Ok(())
        }
        Command::AddContact { alias, peer_id, verify_key } => {
            let contacts = ContactBook::open(&cfg.paths.contacts_db).await?;
            contacts.add_pending(&alias, &peer_id, &verify_key).await?;
            println!("added {alias} ({peer_id}) as pending");
            Ok(())
        }
        Command::Trust { peer_id } => {
            let contacts = ContactBook::open(&cfg.paths.contacts_db).await?;
            contacts.trust_contact(&peer_id).await?;
            println!("{peer_id} is now trusted");
            Ok(())
        }
        Command::Contacts => {
            let contacts = ContactBook::open(&cfg.paths.contacts_db).await?;
            for contact in contacts.all_contacts().await? {
                println!(
                    "{:<16} {:<24} {:<8} {}",
                    contact.alias, contact.peer_id, contact.status, contact.verify_key_b64
                );
            }
            Ok(())
        }
    }
}

async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    let (signing_key, verify_key) =
        load_or_create_keys(&cfg.mesh.peer_id, &cfg.paths.keys_dir)?;
    info!(
        peer_id = %cfg.mesh.peer_id,
        fingerprint = %verify_key_fingerprint(&verify_key),
        "identity loaded"
    );

    let contacts = ContactBook::open(&cfg.paths.contacts_db).await?;
    let graph = Arc::new(RelationGraph::open(&cfg.paths.memory_graph_db).await?);

    let transport = Transport::new(&cfg.mesh.peer_id, &cfg.mesh.nexus_url, &signing_key)?;
    transport
        .connect()
        .await
        .context("relay unreachable at startup")?;

    let sessions = SessionManager::new(
        Arc::clone(&transport),
        signing_key,
        Arc::new(contacts),
        cfg.mesh.session_max_age_sec,
    );
    // Headless default: approve every verified invite, loudly. Embedders
    // with a user interface replace this with a real prompt.
    sessions.set_on_consent_request(Arc::new(|peer_id, session_id, _consent| {
        async move {
            warn!(peer_id, session_id, "auto-approving verified invite (no UI wired)");
            true
        }
        .boxed()
    }));
    let maintenance = sessions.spawn_maintenance();

    SessionExec::install(
        Arc::clone(&sessions),
        Arc::new(NullKnowledgeBase),
        None,
        cfg.assistant.clone(),
    );
    SyncService::install(Arc::clone(&graph), Arc::clone(&transport));

    info!(nexus = %cfg.mesh.nexus_url, "node running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    maintenance.abort();
    Ok(())
}
