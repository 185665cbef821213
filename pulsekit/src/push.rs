//! `pulsekit push` subcommands
//!
//! Feed browser events to a worker running over the on-disk worker store and
//! inspect what it has captured.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use pulsekit_core::push::{BrowserEvent, LogNotifier, PushPayload, PushWorker, WorkerStore};
use pulsekit_core::Config;

#[derive(Subcommand)]
pub enum PushCommand {
    /// Deliver a push for a campaign to the worker
    SimulateReceived {
        campaign: i64,

        /// Mark this user current before delivering
        #[arg(long)]
        user: Option<String>,
    },

    /// Click a campaign's notification
    SimulateClicked {
        campaign: i64,

        /// Mark this user current before clicking
        #[arg(long)]
        user: Option<String>,

        /// Deep link opened by the click
        #[arg(long)]
        deeplink: Option<String>,
    },

    /// List push events captured for a user, without consuming them
    Pending { user: String },
}

fn open_worker_store() -> Result<Arc<WorkerStore>> {
    let path = Config::worker_store_path();
    let store = WorkerStore::open(&path)
        .with_context(|| format!("failed to open worker store at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn payload(campaign: i64, deeplink: Option<String>) -> PushPayload {
    PushPayload {
        campaign_id: campaign,
        title: format!("Campaign {}", campaign),
        body: None,
        icon: None,
        image: None,
        deeplink,
        custom_payload: None,
    }
}

pub async fn execute(command: PushCommand, json: bool) -> Result<()> {
    match command {
        PushCommand::SimulateReceived { campaign, user } => {
            simulate(BrowserEvent::Push(payload(campaign, None)), user.as_deref(), json).await
        }
        PushCommand::SimulateClicked {
            campaign,
            user,
            deeplink,
        } => {
            let event = BrowserEvent::NotificationClick(payload(campaign, deeplink));
            simulate(event, user.as_deref(), json).await
        }
        PushCommand::Pending { user } => pending(&user, json),
    }
}

async fn simulate(event: BrowserEvent, user: Option<&str>, json: bool) -> Result<()> {
    let store = open_worker_store()?;
    if let Some(user) = user {
        store
            .set_current_user(user)
            .context("failed to set current user")?;
    }
    let current = store
        .current_user()
        .context("failed to read current user")?;
    let Some(current) = current else {
        anyhow::bail!("the worker has no current user; pass --user or run `pulsekit run` first");
    };

    let before = store.push_events_for_user(&current.user_id)?.len();
    let (handle, task) = PushWorker::new(Arc::clone(&store), Arc::new(LogNotifier)).spawn();
    handle
        .dispatch(event)
        .await
        .context("failed to deliver event to the worker")?;

    // The worker drains its mailbox and exits once the last handle is gone
    drop(handle);
    task.await.context("push worker failed")?;

    let after = store.push_events_for_user(&current.user_id)?.len();
    if json {
        println!(
            "{}",
            serde_json::json!({"user_id": current.user_id, "captured": after.saturating_sub(before), "pending": after})
        );
    } else {
        println!(
            "Captured {} event(s) for {} ({} pending)",
            after.saturating_sub(before),
            current.user_id,
            after
        );
    }
    Ok(())
}

fn pending(user: &str, json: bool) -> Result<()> {
    let store = open_worker_store()?;
    let records = store
        .push_events_for_user(user)
        .context("failed to read push events")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No pending push events for {}.", user);
        return Ok(());
    }

    println!("{:>6}  {:<9}  {:>9}  EVENT", "ID", "TYPE", "CAMPAIGN");
    for record in &records {
        println!(
            "{:>6}  {:<9}  {:>9}  {}",
            record.id,
            record.event_type.as_str(),
            record
                .campaign_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.event
        );
    }
    Ok(())
}
