mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tasmota_link::transport_bus::{handler, Bus, LocalBus};
use tasmota_link::{LinkError, Session, SessionConfig, SessionState};
use tokio::time::Instant;

use support::{settle, Call, RecordingBus};

const PRESENCE: &str = "tele/+/LWT";

async fn started(bus: Arc<RecordingBus>) -> Arc<Session> {
    let session = Arc::new(Session::owning(bus, SessionConfig::default()));
    session.start().await.expect("start");
    session
}

#[tokio::test]
async fn owned_session_answers_a_power_command() {
    let bus = Arc::new(LocalBus::new());
    let device = Arc::downgrade(&bus);
    bus.subscribe(
        "cmnd/1/POWER",
        u32::MAX,
        handler(move |message| {
            let device = device.clone();
            async move {
                if let Some(bus) = device.upgrade() {
                    let _ = bus.publish("stat/1/POWER", message.payload, false, 0).await;
                }
            }
        }),
    )
    .await
    .unwrap();

    let session = Session::owning(bus.clone(), SessionConfig::default());
    session.start().await.unwrap();
    let reply = session
        .call("1", "POWER", "POWER", Some(b"ON"))
        .await
        .expect("reply");
    assert_eq!(reply, Bytes::from_static(b"ON"));

    session.close().await.unwrap();
    assert!(bus.is_closed());
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_after_the_configured_seconds() {
    let bus = Arc::new(RecordingBus::new());
    let session = started(bus.clone()).await;
    session.set_response_timeout_secs(1);

    let began = Instant::now();
    let err = session
        .call("2", "POWER", "POWER", None)
        .await
        .expect_err("no reply");
    let waited = began.elapsed();

    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "operation not completed in 1 seconds");
    assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));
    assert_eq!(bus.active().len(), 2);
}

#[tokio::test]
async fn presence_events_follow_delivery_order() {
    let bus = Arc::new(RecordingBus::new());
    let session = started(bus.clone()).await;
    let connected = session.connected_events();
    let disconnected = session.disconnected_events();

    bus.deliver("tele/3/LWT", b"Offline").await;
    assert_eq!(disconnected.recv().await.as_deref(), Some("3"));
    bus.deliver("tele/3/LWT", b"Online").await;
    assert_eq!(connected.recv().await.as_deref(), Some("3"));

    let producer = {
        let bus = bus.clone();
        tokio::spawn(async move {
            for topic in ["tele/a/LWT", "tele/b/LWT", "tele/c/LWT"] {
                bus.deliver(topic, b"Online").await;
            }
        })
    };
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.extend(connected.recv().await);
    }
    producer.await.unwrap();
    assert_eq!(seen, ["a", "b", "c"]);
    assert_eq!(disconnected.try_recv(), None);
}

#[tokio::test]
async fn close_cancels_every_pending_call() {
    let bus = Arc::new(RecordingBus::new());
    let session = started(bus.clone()).await;
    session.set_response_timeout_secs(30);

    let peers = ["40", "41", "42", "43", "44"];
    let pending: Vec<_> = peers
        .iter()
        .copied()
        .map(|peer| {
            let session = session.clone();
            tokio::spawn(async move { session.call(peer, "STATUS", "STATUS1", Some(b"1")).await })
        })
        .collect();
    settle(|| bus.publishes().len() == peers.len()).await;
    assert_eq!(bus.active().len(), 2 + peers.len());

    tokio::time::timeout(Duration::from_secs(1), session.close())
        .await
        .expect("close is bounded")
        .unwrap();
    let results = tokio::time::timeout(Duration::from_secs(1), join_all(pending))
        .await
        .expect("calls unblocked");

    for (peer, result) in peers.iter().zip(results) {
        let expected = format!("stat/{peer}/STATUS1");
        let err = result.unwrap().expect_err("cancelled");
        assert!(matches!(err, LinkError::Cancelled { ref topic } if *topic == expected));

        let ids = bus.subscribed_ids(&expected);
        assert_eq!(ids.len(), 1);
        assert_eq!(bus.unsubscribe_count(&expected, ids[0]), 1);
    }
    assert_eq!(session.state(), SessionState::Closed);
    assert!(bus.calls().contains(&Call::Close));
    assert!(bus.active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn timeout_change_applies_to_later_calls_only() {
    let bus = Arc::new(RecordingBus::new());
    let session = started(bus.clone()).await;
    session.set_response_timeout_secs(5);

    let began = Instant::now();
    let (result, ()) = tokio::join!(session.call("9", "POWER", "POWER", None), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        session.set_response_timeout_secs(1);
    });
    let waited = began.elapsed();

    let err = result.expect_err("no reply");
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "operation not completed in 5 seconds");
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
    assert_eq!(session.response_timeout_secs(), 1);
}

#[tokio::test]
async fn each_call_holds_exactly_one_temporary_subscription() {
    let bus = Arc::new(RecordingBus::new());
    let session = started(bus.clone()).await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.call("5", "POWER", "POWER", Some(b"TOGGLE")).await })
    };
    settle(|| !bus.publishes().is_empty()).await;

    let temporary: Vec<_> = bus
        .active()
        .into_iter()
        .filter(|(filter, _)| filter != PRESENCE)
        .collect();
    assert_eq!(temporary.len(), 1);
    let (filter, id) = temporary[0].clone();
    assert_eq!(filter, "stat/5/POWER");
    assert_eq!(
        bus.publishes(),
        vec![("cmnd/5/POWER".to_string(), Bytes::from_static(b"TOGGLE"))]
    );

    bus.deliver("stat/5/POWER", b"ON").await;
    // A second reply is dropped without blocking delivery.
    bus.deliver("stat/5/POWER", b"OFF").await;
    assert_eq!(pending.await.unwrap().unwrap(), Bytes::from_static(b"ON"));

    assert_eq!(bus.unsubscribe_count(&filter, id), 1);
    assert_eq!(bus.active().len(), 2);
}

#[tokio::test]
async fn failed_presence_setup_leaves_the_session_created() {
    let bus = Arc::new(RecordingBus::new());
    bus.fail_subscribe_at(2);
    let session = Session::owning(bus.clone(), SessionConfig::default());

    let err = session.start().await.expect_err("setup failure");
    assert!(matches!(err, LinkError::Setup { ref filter, .. } if filter == PRESENCE));
    assert_eq!(session.state(), SessionState::Created);
    assert!(bus.active().is_empty());
    assert_eq!(bus.subscribed_ids(PRESENCE), vec![1, 2]);
    assert_eq!(bus.unsubscribe_count(PRESENCE, 1), 1);
    assert!(!bus.calls().contains(&Call::Serve));
}

#[tokio::test]
async fn failed_serve_releases_presence_subscriptions() {
    let bus = Arc::new(RecordingBus::new());
    bus.fail_serve();
    let session = Session::owning(bus.clone(), SessionConfig::default());

    assert!(matches!(
        session.start().await,
        Err(LinkError::Transport(_))
    ));
    assert_eq!(session.state(), SessionState::Created);
    assert!(bus.active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_publish_is_reported_with_the_timeout() {
    let bus = Arc::new(RecordingBus::new());
    bus.fail_publishes();
    let session = started(bus.clone()).await;
    session.set_response_timeout_secs(2);

    let began = Instant::now();
    let err = session
        .call("6", "POWER", "POWER", Some(b"OFF"))
        .await
        .expect_err("timeout");
    assert!(began.elapsed() >= Duration::from_secs(2));
    match err {
        LinkError::Timeout {
            timeout,
            publish_error,
        } => {
            assert_eq!(timeout, Duration::from_secs(2));
            assert!(publish_error.is_some());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(bus.active().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_calls_get_distinct_subscription_ids() {
    let bus = Arc::new(RecordingBus::new());
    let session = started(bus.clone()).await;
    session.set_response_timeout_secs(1);

    let calls = (0..8).map(|_| session.call("7", "POWER", "POWER", None));
    let results = join_all(calls).await;
    assert!(results.iter().all(|result| matches!(result, Err(err) if err.is_timeout())));

    let mut ids = bus.subscribed_ids("stat/7/POWER");
    assert_eq!(ids.len(), 8);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert!(ids.iter().all(|id| *id > 2));
    assert_eq!(bus.active().len(), 2);
}

#[tokio::test]
async fn shared_transport_is_never_served_or_closed() {
    let bus = Arc::new(RecordingBus::new());
    let session = Session::with_bus(bus.clone(), SessionConfig::default().with_qos(1));
    session.start().await.unwrap();
    session.power_on("8").await.unwrap();
    session.close().await.unwrap();

    let calls = bus.calls();
    assert!(!calls.contains(&Call::Serve));
    assert!(!calls.contains(&Call::Close));
    assert!(calls.contains(&Call::Publish {
        topic: "cmnd/8/POWER".into(),
        payload: Bytes::from_static(b"ON"),
        qos: 1,
    }));
}
