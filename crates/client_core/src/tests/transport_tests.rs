use super::*;
use crate::test_support::{wait_until, MemoryConnector, RecordingSink};

fn session_with(
    connector: Arc<MemoryConnector>,
) -> (Arc<TransportSession>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let policy = ReconnectPolicy {
        jitter: false,
        ..ReconnectPolicy::default()
    };
    let session = TransportSession::new(connector, sink.clone(), policy);
    (session, sink)
}

fn join(id: &str) -> ClientRequest {
    ClientRequest::JoinConversation {
        conversation_id: ConversationId::from(id),
    }
}

#[test]
fn backoff_doubles_and_caps_without_jitter() {
    let policy = ReconnectPolicy {
        initial_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(4),
        multiplier: 2.0,
        jitter: false,
    };
    let delays: Vec<u64> = (0..6)
        .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
        .collect();
    assert_eq!(delays, [500, 1000, 2000, 4000, 4000, 4000]);
}

#[test]
fn jittered_backoff_stays_within_thirty_percent() {
    let policy = ReconnectPolicy::default();
    for _ in 0..50 {
        let delay = policy.delay_for(1).as_millis() as u64;
        assert!((700..=1300).contains(&delay), "delay {delay} out of range");
    }
}

#[tokio::test]
async fn emit_before_connect_is_rejected_without_panicking() {
    let (session, _sink) = session_with(Arc::new(MemoryConnector::default()));
    assert_eq!(session.emit(&join("c1")), Err(TransportError::NotConnected));
    session.disconnect();
    assert_eq!(session.status(), LinkStatus::Disconnected);
}

#[tokio::test]
async fn repeated_connect_reuses_the_live_link() {
    let connector = Arc::new(MemoryConnector::default());
    let (session, _sink) = session_with(connector.clone());

    session.connect(Some("secret")).await;
    session.connect(Some("secret")).await;

    assert!(session.is_connected());
    assert_eq!(connector.calls(), 1);
    assert_eq!(connector.credentials(), [Some("secret".to_string())]);

    session.emit(&join("c1")).expect("emit");
    let mut end = connector.take_end();
    assert_eq!(end.drain(), [join("c1")]);
}

#[tokio::test]
async fn inbound_frames_reach_sink_in_order() {
    let connector = Arc::new(MemoryConnector::default());
    let (session, sink) = session_with(connector.clone());
    session.connect(None).await;

    let end = connector.take_end();
    end.push_raw("first");
    end.push_raw("second");

    assert!(wait_until(|| sink.frames.lock().unwrap().len() == 2).await);
    assert_eq!(sink.frames.lock().unwrap().as_slice(), ["first", "second"]);
    session.disconnect();
}

#[tokio::test]
async fn disconnect_is_idempotent_and_stops_emission() {
    let connector = Arc::new(MemoryConnector::default());
    let (session, _sink) = session_with(connector.clone());
    session.connect(None).await;

    session.disconnect();
    session.disconnect();

    assert_eq!(session.status(), LinkStatus::Disconnected);
    assert_eq!(session.emit(&join("c1")), Err(TransportError::NotConnected));

    session.connect(None).await;
    assert!(session.is_connected());
    assert_eq!(connector.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_is_silent_and_retried_in_background() {
    let connector = Arc::new(MemoryConnector::failing_first(2));
    let (session, _sink) = session_with(connector.clone());
    session.set_active_room(Some(ConversationId::from("c5")));

    session.connect(Some("tok")).await;
    assert_eq!(session.status(), LinkStatus::Connecting);

    assert!(wait_until(|| session.is_connected()).await);
    assert_eq!(connector.calls(), 3);

    let mut end = connector.take_end();
    assert_eq!(end.drain(), [join("c5")]);
    session.disconnect();
}

#[tokio::test(start_paused = true)]
async fn dropped_link_reconnects_and_replays_active_room() {
    let connector = Arc::new(MemoryConnector::default());
    let (session, _sink) = session_with(connector.clone());
    session.connect(Some("tok")).await;
    session.set_active_room(Some(ConversationId::from("c2")));

    let first = connector.take_end();
    drop(first);

    assert!(wait_until(|| connector.links() == 1 && session.is_connected()).await);
    let mut second = connector.take_end();
    assert_eq!(second.drain(), [join("c2")]);
    assert_eq!(
        connector.credentials(),
        [Some("tok".to_string()), Some("tok".to_string())]
    );
    session.disconnect();
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let connector = Arc::new(MemoryConnector::failing_first(100));
    let (session, _sink) = session_with(connector.clone());

    session.connect(None).await;
    session.disconnect();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(connector.calls(), 1);
    assert_eq!(session.status(), LinkStatus::Disconnected);
}
