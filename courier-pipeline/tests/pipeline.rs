use std::sync::Arc;
use std::time::Duration;

use courier_pipeline::Core;
use courier_pipeline::notifications::{DiscardReason, NotificationListener};
use courier_pipeline::plugins::PluginEntry;
use courier_pipeline::services::sender::{RetryBackoff, RetryState, SenderPlugin};
use courier_pipeline::services::transport::{TransportError, TransportOutcome, Transports};
use courier_pipeline::testutils::{
    CapturePlugin, MockTransport, RecordingListener, TEST_IKEY, test_config,
};
use courier_protocol::TelemetryItem;
use serde_json::{Value, json};

fn envelopes(transport: &MockTransport) -> Vec<Value> {
    transport
        .bodies()
        .iter()
        .flat_map(|body| serde_json::from_str::<Vec<Value>>(body).unwrap())
        .collect()
}

struct Pipeline {
    core: Core,
    transport: Arc<MockTransport>,
    listener: Arc<RecordingListener>,
}

fn pipeline(config: Value, extra: Vec<PluginEntry>) -> Pipeline {
    let transport = Arc::new(MockTransport::new());
    let listener = Arc::new(RecordingListener::default());

    let core = Core::new();
    core.add_notification_listener(listener.clone() as Arc<dyn NotificationListener>);

    let sender = SenderPlugin::new()
        .with_transports(Transports::new(transport.clone()))
        .with_retry(RetryState::new(RetryBackoff::fixed(1.0)));

    let mut plugins = vec![PluginEntry::telemetry(sender)];
    plugins.extend(extra);
    core.initialize(test_config(config), plugins).unwrap();

    Pipeline {
        core,
        transport,
        listener,
    }
}

#[tokio::test(start_paused = true)]
async fn test_track_flush_roundtrip() {
    let enricher = CapturePlugin::new("enricher", 10).tagging("cloud.role", "checkout");
    let p = pipeline(json!({}), vec![PluginEntry::telemetry(enricher)]);

    p.core.track(TelemetryItem::event("purchase"));
    p.core
        .track(TelemetryItem::trace("slow query", courier_protocol::SeverityLevel::Warning));
    p.core.flush_and_wait().await;

    let envelopes = envelopes(&p.transport);
    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0]["iKey"], TEST_IKEY);
    assert_eq!(envelopes[0]["tags"]["cloud.role"], "checkout");
    assert_eq!(
        envelopes[0]["name"],
        format!("Telemetry.{}.Event", TEST_IKEY.replace('-', ""))
    );
    assert_eq!(envelopes[1]["data"]["baseType"], "MessageData");
    assert_eq!(p.listener.sent(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_items_queued_before_initialization() {
    let transport = Arc::new(MockTransport::new());
    let core = Core::new();
    core.track(TelemetryItem::event("before"));

    core.initialize(
        test_config(json!({})),
        vec![PluginEntry::telemetry(
            SenderPlugin::new().with_transports(Transports::new(transport.clone())),
        )],
    )
    .unwrap();
    core.flush_and_wait().await;

    let envelopes = envelopes(&transport);
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0]["data"]["baseData"]["name"], "before");
}

#[tokio::test(start_paused = true)]
async fn test_offline_retry_backs_off() {
    let p = pipeline(json!({}), Vec::new());
    p.transport
        .push_outcome(TransportOutcome::Failed(TransportError::Offline));

    p.core.track(TelemetryItem::event("offline"));
    p.core.flush_and_wait().await;
    assert_eq!(p.transport.request_count(), 1);

    // a single offline failure waits ten times the regular backoff
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(p.transport.request_count(), 1);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(p.transport.request_count(), 2);
    assert_eq!(p.listener.sent(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disable_at_runtime() {
    let p = pipeline(json!({}), Vec::new());
    p.transport.push_status(503);

    p.core.track(TelemetryItem::event("pending"));
    p.core.set_telemetry_enabled(false);
    p.core.flush_and_wait().await;

    p.core.track(TelemetryItem::event("dropped"));
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(p.transport.request_count(), 1);
    assert_eq!(p.listener.discarded(DiscardReason::Unknown), 1);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_sends_pending() {
    let p = pipeline(json!({}), Vec::new());

    p.core.track(TelemetryItem::metric("queue.depth", 4.0));
    p.core.teardown().await;

    let envelopes = envelopes(&p.transport);
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0]["data"]["baseType"], "MetricData");
}
