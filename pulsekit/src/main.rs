//! pulsekit - event tracking SDK runner and queue inspector
//!
//! Runs an analytics session from the command line, records events into the
//! local queue, and inspects or drives the push worker's store.

mod push;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pulsekit_core::events::{BatchContext, EventApiClient};
use pulsekit_core::push::WorkerStore;
use pulsekit_core::session::{ensure_device_identity, session_token};
use pulsekit_core::storage::{user, LocalStore};
use pulsekit_core::transport::{ReqwestTransport, Transport};
use pulsekit_core::{
    Config, Database, EventQueueManager, EventRecorder, FlushConfig, Profile, QueuedEvent, SendOutcome,
    Session, SessionParts,
};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "pulsekit")]
#[command(about = "Run analytics sessions and inspect the local event queue")]
#[command(version)]
struct Args {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the stored profile and queue size
    Status,

    /// Queue a named event for the stored user
    Track {
        /// Event name
        name: String,

        /// Event payload as a JSON object
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// List queued events
    Queue,

    /// Send queued events now
    Flush,

    /// Start a session and keep it running until Ctrl-C
    Run {
        /// Stop after this many seconds
        #[arg(long)]
        for_secs: Option<u64>,
    },

    /// Drive or inspect the push worker store
    #[command(subcommand)]
    Push(push::PushCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging
    let _log_guard = pulsekit_core::logging::init(&config.logging, config.sdk.mode)
        .context("failed to initialize logging")?;

    match args.command {
        Command::Status => status(&config, args.json),
        Command::Track { name, payload } => track(&config, &name, payload.as_deref(), args.json),
        Command::Queue => queue(&config, args.json),
        Command::Flush => flush(&config, args.json).await,
        Command::Run { for_secs } => run(config, for_secs).await,
        Command::Push(command) => push::execute(command, args.json).await,
    }
}

fn open_store() -> Result<LocalStore> {
    let db_path = Config::store_path();
    let db = Database::open(&db_path).context("failed to open store")?;
    db.migrate().context("failed to run store migrations")?;
    Ok(LocalStore::new(Arc::new(db)))
}

/// Stored profile, queue and recorder for the configured user
struct OfflineSession {
    profile: Arc<Profile>,
    queue: Arc<EventQueueManager>,
    recorder: EventRecorder,
}

impl OfflineSession {
    /// Fails unless a previous `pulsekit run` resolved the user
    fn open(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.sdk.validate().context("invalid configuration")?;
        let store = open_store()?;

        let profile = Arc::new(
            Profile::load(store.clone(), &config.sdk.external_user_id)
                .context("failed to load profile")?,
        );
        let Some(user_id) = profile.user_id().filter(|_| profile.is_resolved()) else {
            anyhow::bail!(
                "no stored profile for '{}'; run `pulsekit run` first",
                config.sdk.external_user_id
            );
        };

        let (device_id, _) = ensure_device_identity(&store, chrono::Utc::now())
            .context("failed to read device identity")?;
        let now = chrono::Utc::now().timestamp_millis();
        let client = EventApiClient::new(
            &config.sdk.api_url(),
            BatchContext {
                session_token: session_token(config.sdk.app_id, &user_id, now, &config.sdk.api_key),
                app_version: config.sdk.app_version.clone(),
                user_id: user_id.clone(),
                device_id,
            },
            transport,
        );
        let (_, flush_config) = watch::channel(FlushConfig::default());
        let queue = Arc::new(EventQueueManager::new(store.clone(), &user_id, client, flush_config));
        let recorder = EventRecorder::new(Arc::clone(&profile), store, Arc::clone(&queue));

        Ok(Self {
            profile,
            queue,
            recorder,
        })
    }
}

fn offline_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    let transport = ReqwestTransport::new(Duration::from_secs(config.sdk.http_timeout_secs))
        .context("failed to create HTTP client")?;
    Ok(Arc::new(transport))
}

fn format_ms(ms: Option<i64>) -> String {
    ms.and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn status(config: &Config, json: bool) -> Result<()> {
    let store = open_store()?;
    let external_user_id = &config.sdk.external_user_id;
    let profile = Profile::load(store.clone(), external_user_id).context("failed to load profile")?;
    let snapshot = profile.snapshot();

    let user_id = snapshot.user_id.clone().filter(|_| snapshot.identity_resolved);
    let queued = match &user_id {
        Some(user_id) => store.event_count(user_id)?,
        None => 0,
    };
    let flush_frequency: Option<u64> = match &user_id {
        Some(user_id) => store.get_user(user_id, user::LAST_FLUSH_FREQUENCY)?,
        None => None,
    };
    let pending_push = match (&user_id, Config::worker_store_path().exists()) {
        (Some(user_id), true) => WorkerStore::open(&Config::worker_store_path())
            .context("failed to open worker store")?
            .push_events_for_user(user_id)?
            .len(),
        _ => 0,
    };

    if json {
        let value = serde_json::json!({
            "profile": snapshot,
            "queued_events": queued,
            "flush_frequency_ms": flush_frequency,
            "pending_push_events": pending_push,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Config:              {}", Config::config_path().display());
    println!(
        "External user:       {}",
        if external_user_id.is_empty() { "-" } else { external_user_id }
    );
    match &user_id {
        Some(user_id) => println!("User id:             {}", user_id),
        None => println!("User id:             not identified"),
    }
    println!("Seqnum:              {}", snapshot.seqnum);
    println!("First session:       {}", format_ms(snapshot.first_session));
    println!("Last session:        {}", format_ms(snapshot.last_session));
    println!("QA user:             {}", if snapshot.qa { "yes" } else { "no" });
    println!("Queued events:       {}", queued);
    match flush_frequency {
        Some(ms) => println!("Flush frequency:     {} ms", ms),
        None => println!("Flush frequency:     default"),
    }
    println!("Pending push events: {}", pending_push);
    Ok(())
}

fn track(config: &Config, name: &str, payload: Option<&str>, json: bool) -> Result<()> {
    let payload = payload
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("payload must be valid JSON")?;
    if let Some(payload) = &payload {
        anyhow::ensure!(payload.is_object(), "payload must be a JSON object");
    }

    let session = OfflineSession::open(config, offline_transport(config)?)?;
    let event = session
        .recorder
        .named_event(name, payload)
        .with_context(|| format!("failed to queue '{}'", name))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&event)?);
    } else {
        println!("Queued '{}' (seqnum {})", name, event.seqnum);
    }
    Ok(())
}

fn describe(event: &QueuedEvent) -> String {
    match &event.kind {
        pulsekit_core::EventKind::Event { name, .. } => name.clone(),
        pulsekit_core::EventKind::SessionStart {
            name: Some(name), ..
        } => name.clone(),
        _ => String::new(),
    }
}

fn queue(config: &Config, json: bool) -> Result<()> {
    let session = OfflineSession::open(config, offline_transport(config)?)?;
    let events = session.queue.queued_events()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!("No queued events.");
        return Ok(());
    }

    println!("{:>8}  {:<23}  {:<22}  NAME", "SEQNUM", "TIME", "TYPE");
    for event in &events {
        println!(
            "{:>8}  {:<23}  {:<22}  {}",
            event.seqnum,
            format_ms(Some(event.time)),
            event.event_type(),
            describe(event)
        );
    }
    println!("\n{} event(s) queued", events.len());
    Ok(())
}

async fn flush(config: &Config, json: bool) -> Result<()> {
    let session = OfflineSession::open(config, offline_transport(config)?)?;
    let outcome = session.queue.send_events().await.context("flush failed")?;

    if json {
        let value = match &outcome {
            SendOutcome::Skipped => serde_json::json!({"outcome": "skipped"}),
            SendOutcome::Empty => serde_json::json!({"outcome": "empty"}),
            SendOutcome::Delivered { events } => {
                serde_json::json!({"outcome": "delivered", "events": events})
            }
            SendOutcome::Rejected { status, events } => {
                serde_json::json!({"outcome": "rejected", "status": status, "events": events})
            }
            SendOutcome::Retryable { reason } => {
                serde_json::json!({"outcome": "retryable", "reason": reason})
            }
        };
        println!("{}", value);
        return Ok(());
    }

    match outcome {
        SendOutcome::Skipped => println!("Another flush is in progress."),
        SendOutcome::Empty => println!("No queued events."),
        SendOutcome::Delivered { events } => println!("Delivered {} event(s).", events),
        SendOutcome::Rejected { status, events } => {
            println!("Collector rejected the batch (HTTP {}); {} event(s) discarded.", status, events)
        }
        SendOutcome::Retryable { reason } => {
            println!("Flush failed, events kept for the next attempt: {}", reason)
        }
    }
    tracing::debug!(seqnum = session.profile.seqnum(), "Flush command finished");
    Ok(())
}

async fn run(config: Config, for_secs: Option<u64>) -> Result<()> {
    let parts = SessionParts::from_config(&config).context("failed to prepare session")?;
    let session = Session::start(config, parts)
        .await
        .context("failed to start session")?;

    println!("Session started for user {}", session.user_id());
    println!(
        "Flushing every {} ms{}",
        session.info().flush.flush_frequency,
        if session.is_restored() { " (restored session)" } else { "" }
    );
    println!("Press Ctrl-C to stop.");

    let deadline = async {
        match for_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted");
        }
        _ = deadline => {}
    }

    session.shutdown().await;
    let stats = session.stats();
    println!(
        "Session ended: {} batch(es), {} event(s) sent, {} discarded",
        stats.batches_sent, stats.events_sent, stats.events_discarded
    );
    Ok(())
}
