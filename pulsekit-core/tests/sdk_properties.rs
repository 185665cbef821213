//! Integration tests for the event pipeline and the push bridge
//!
//! Components are wired together the way a session wires them, against a
//! scripted transport and in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use pulsekit_core::client_info::ClientInfo;
use pulsekit_core::events::{BatchContext, EventApiClient, EventQueueManager, SendOutcome};
use pulsekit_core::profile::{IdentifyRequest, Profile};
use pulsekit_core::push::{LogNotifier, PushWorker, WorkerStore};
use pulsekit_core::resources::{ConfigFetcher, ResourcesSettings};
use pulsekit_core::storage::{user, LocalStore};
use pulsekit_core::transport::{HttpResponse, ScriptedTransport};
use pulsekit_core::types::{FlushConfig, PushEventType, QueuedEvent};
use pulsekit_core::EventRecorder;
use serde_json::json;
use tokio::sync::watch;

const BATCH: &str = "/1/batch";
const RESOURCES: &str = "user_resources_and_campaigns";
const IDENTIFY: &str = "/identify";

struct Harness {
    transport: Arc<ScriptedTransport>,
    store: LocalStore,
    profile: Arc<Profile>,
    queue: Arc<EventQueueManager>,
    recorder: EventRecorder,
}

fn identify_request() -> IdentifyRequest {
    IdentifyRequest {
        identify_url: "https://1.identity.test/identify".to_string(),
        api_key: "web_sdk-test".to_string(),
        unique_device_id: "device-1".to_string(),
    }
}

/// Resolve "abc" to "u1" and build a queue and recorder for it
async fn harness() -> Harness {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(IDENTIFY, HttpResponse::new(200, r#"{"swrve_id":"u1"}"#));

    let store = LocalStore::in_memory().unwrap();
    let profile = Arc::new(Profile::load(store.clone(), "abc").unwrap());
    profile
        .identify(transport.as_ref(), &identify_request())
        .await
        .unwrap();

    let client = EventApiClient::new(
        "https://1.api.test",
        BatchContext {
            session_token: "1=u1=0=hash".to_string(),
            app_version: "1.0".to_string(),
            user_id: "u1".to_string(),
            device_id: "device-1".to_string(),
        },
        transport.clone(),
    );
    let (_tx, rx) = watch::channel(FlushConfig::default());
    let queue = Arc::new(EventQueueManager::new(store.clone(), "u1", client, rx));
    let recorder = EventRecorder::new(profile.clone(), store.clone(), queue.clone());

    Harness {
        transport,
        store,
        profile,
        queue,
        recorder,
    }
}

fn fetcher(h: &Harness) -> ConfigFetcher {
    ConfigFetcher::new(
        h.store.clone(),
        h.profile.clone(),
        h.transport.clone(),
        ResourcesSettings {
            content_url: "https://1.content.test".to_string(),
            api_key: "web_sdk-test".to_string(),
            app_version: "1.0".to_string(),
        },
        ClientInfo::collect(Some("en")),
    )
}

/// Seqnums of every event the collector has seen, in send order
fn sent_seqnums(transport: &ScriptedTransport) -> Vec<u64> {
    transport
        .requests_to(BATCH)
        .iter()
        .filter_map(|r| r.body.as_ref())
        .flat_map(|body| body["data"].as_array().cloned().unwrap_or_default())
        .filter_map(|event| event["seqnum"].as_u64())
        .collect()
}

fn seqnums(events: &[QueuedEvent]) -> Vec<u64> {
    events.iter().map(|e| e.seqnum).collect()
}

// ============================================
// Profile
// ============================================

#[tokio::test]
async fn test_identify_creates_fresh_profile() {
    let h = harness().await;
    let before = chrono::Utc::now().timestamp_millis();

    assert_eq!(h.transport.requests_to(IDENTIFY).len(), 1);
    let request = &h.transport.requests_to(IDENTIFY)[0];
    let body = request.body.as_ref().unwrap();
    assert_eq!(body["external_user_id"], "abc");
    assert_eq!(body["api_key"], "web_sdk-test");
    assert_eq!(body["unique_device_id"], "device-1");

    let snapshot = h.profile.snapshot();
    assert_eq!(snapshot.user_id.as_deref(), Some("u1"));
    assert_eq!(snapshot.seqnum, 0);
    assert!(!snapshot.qa);
    assert!(snapshot.identity_resolved);
    let first_session = snapshot.first_session.unwrap();
    assert!((before - first_session).abs() < 5_000);

    // A second load resolves from storage alone
    let reloaded = Profile::load(h.store.clone(), "abc").unwrap();
    assert!(reloaded.is_resolved());
    assert_eq!(h.transport.requests_to(IDENTIFY).len(), 1);
}

// ============================================
// Event queue
// ============================================

#[tokio::test]
async fn test_seqnums_contiguous_across_flushes() {
    let h = harness().await;
    h.transport.always(BATCH, HttpResponse::new(200, "{}"));

    for _ in 0..3 {
        h.profile.update_seqnum().unwrap();
    }
    let start = h.profile.seqnum();
    assert_eq!(start, 3);

    for i in 0..10 {
        h.recorder
            .named_event(&format!("step_{}", i), None)
            .unwrap();
        if i % 3 == 0 {
            h.queue.send_events().await.unwrap();
        }
    }

    let mut all = sent_seqnums(&h.transport);
    all.extend(seqnums(&h.queue.queued_events().unwrap()));
    assert_eq!(all, (start..start + 10).collect::<Vec<_>>());
    assert_eq!(h.profile.seqnum(), start + 10);
    assert_eq!(h.store.get_user::<u64>("u1", user::SEQNUM).unwrap(), Some(start + 10));
}

#[tokio::test]
async fn test_concurrent_recording_keeps_storage_order() {
    let h = harness().await;

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..200 {
                    h.recorder.named_event("tap", None).unwrap();
                }
            });
        }
    });

    let stored = seqnums(&h.queue.queued_events().unwrap());
    assert_eq!(stored, (0..1600).collect::<Vec<_>>());
    assert_eq!(h.profile.seqnum(), 1600);
}

#[tokio::test]
async fn test_successful_flush_empties_queue() {
    let h = harness().await;
    h.transport.respond(BATCH, HttpResponse::new(200, "{}"));

    h.recorder.named_event("a", None).unwrap();
    h.recorder.purchase("sword", "gold", 5.0, 1).unwrap();

    let outcome = h.queue.send_events().await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered { events: 2 });
    assert_eq!(h.store.event_count("u1").unwrap(), 0);
}

#[tokio::test]
async fn test_event_written_during_send_survives() {
    let h = harness().await;
    h.recorder.named_event("before", None).unwrap();
    let held = h.transport.hold(BATCH, HttpResponse::new(200, "{}"));

    let queue = h.queue.clone();
    let send = tokio::spawn(async move { queue.send_events().await });

    held.entered.await.unwrap();
    let during = h.recorder.named_event("during", None).unwrap();
    held.release.send(()).unwrap();

    let outcome = send.await.unwrap().unwrap();
    assert_eq!(outcome, SendOutcome::Delivered { events: 1 });

    let remaining = h.queue.queued_events().unwrap();
    assert_eq!(seqnums(&remaining), vec![during.seqnum]);

    h.transport.respond(BATCH, HttpResponse::new(200, "{}"));
    h.queue.send_events().await.unwrap();
    assert_eq!(sent_seqnums(&h.transport), vec![0, during.seqnum]);
}

#[tokio::test]
async fn test_server_error_keeps_batch_until_success() {
    let h = harness().await;
    h.recorder.named_event("one", None).unwrap();
    h.recorder.named_event("two", None).unwrap();

    h.transport.respond(BATCH, HttpResponse::new(503, "unavailable"));
    let outcome = h.queue.send_events().await.unwrap();
    assert!(matches!(outcome, SendOutcome::Retryable { .. }));
    assert_eq!(h.store.event_count("u1").unwrap(), 2);

    h.transport.respond(BATCH, HttpResponse::new(200, "{}"));
    h.queue.send_events().await.unwrap();
    assert_eq!(h.store.event_count("u1").unwrap(), 0);
    assert_eq!(h.queue.stats().retryable_failures, 1);
}

// ============================================
// Session configuration
// ============================================

#[tokio::test]
async fn test_unreachable_resources_fall_back() {
    let h = harness().await;
    let fetcher = fetcher(&h);

    h.transport.fail(RESOURCES);
    let info = fetcher.get_info_for_session().await;
    assert_eq!(info.flush, FlushConfig::default());
    assert_eq!(info.flush.flush_frequency, 60_000);
    assert_eq!(info.flush.flush_refresh_delay, 5_000);

    h.transport.respond(
        RESOURCES,
        HttpResponse::new(200, json!({"flush_frequency": 30_000, "flush_refresh_delay": 2_000}).to_string())
            .with_etag("v1"),
    );
    fetcher.get_info_for_session().await;

    h.transport.fail(RESOURCES);
    let info = fetcher.get_info_for_session().await;
    assert_eq!(info.flush.flush_frequency, 30_000);
    assert_eq!(info.flush.flush_refresh_delay, 2_000);
    assert_eq!(fetcher.current().flush_frequency, 30_000);
}

#[tokio::test]
async fn test_orphan_etag_not_sent() {
    let h = harness().await;
    let fetcher = fetcher(&h);
    h.profile.set_etag("stale").unwrap();

    h.transport.respond(RESOURCES, HttpResponse::new(200, "{}"));
    fetcher.get_info_for_session().await;

    let requests = h.transport.requests_to(RESOURCES);
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].url.contains("etag="));
    assert!(h.profile.etag().is_none());
}

// ============================================
// Push bridge
// ============================================

#[tokio::test]
async fn test_worker_hands_over_push_data_once() {
    let store = Arc::new(WorkerStore::open_in_memory().unwrap());
    store
        .store_push_event("u1", PushEventType::Clicked, "Pulse.Messages.Push-9.engaged", Some(9), 2_000)
        .unwrap();
    store
        .store_push_event("u1", PushEventType::Received, "Pulse.Messages.Push-9.delivered", Some(9), 1_000)
        .unwrap();

    let (handle, _task) = PushWorker::new(store.clone(), Arc::new(LogNotifier)).spawn();
    let timeout = Duration::from_secs(5);

    let records = handle.fetch_push_data("u1", timeout).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].timestamp <= records[1].timestamp);
    assert_eq!(records[0].event_type, PushEventType::Received);

    let again = handle.fetch_push_data("u1", timeout).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(store.push_event_count().unwrap(), 0);
}
