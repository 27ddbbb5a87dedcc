//! Integration tests for pad event interception on a running graph.
//!
//! Events are injected with `send_event` while the graph streams; a second
//! interceptor downstream of the policy under test records what got
//! through.

use graphbridge::caps::RtpCodecParameters;
use graphbridge::engine::{GraphState, PadRef};
use graphbridge::event::{ForceKeyUnit, Segment};
use graphbridge::interceptor::{CapsNegotiation, CapsRewrite, KeyUnitWatcher};
use graphbridge::prelude::*;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const CAPS: &str = "application/x-rtp, media=(string)video, payload=(int)96, clock-rate=(int)90000, encoding-name=(string)VP8";

type Seen = Arc<Mutex<Vec<String>>>;

fn recorder() -> (impl EventPolicy + 'static, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let policy = move |_dir: PadDirection, event: &PadEvent| {
        log.lock().unwrap().push(event.name().to_string());
        ProbeReturn::Forward
    };
    (policy, seen)
}

fn session(desc: &str, name: &str) -> Session<LocalEngine> {
    let engine = LocalEngine::from_description(desc).unwrap();
    let config = SessionConfig::new(name)
        .with_source(SourceConfig::default().with_pull_timeout(Duration::from_millis(5)));
    Session::new(engine, config).unwrap()
}

fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn wait_playing(session: &Session<LocalEngine>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(LifecycleEvent::StateChangeComplete(GraphState::Playing)) =
            session.poll_event(Duration::from_millis(20))
        {
            return;
        }
    }
    panic!("graph never reached PLAYING");
}

// ============================================================================
// Mandatory events
// ============================================================================

/// Test that flushes keep their order when everything around them is dropped.
#[test]
fn test_flush_order_survives_dropped_events() {
    let mut session = session(
        &format!("packetsrc name=media caps=\"{CAPS}\" ! appsink name=out"),
        "flush-order",
    );
    let (transport, _tx) = ChannelTransport::new();
    session.attach_source("media", transport).unwrap();

    let drop_all = |_dir: PadDirection, _event: &PadEvent| ProbeReturn::Drop;
    let gate = session
        .intercept("out", PadDirection::Sink, drop_all)
        .unwrap();
    let (record, seen) = recorder();
    session.intercept("out", PadDirection::Sink, record).unwrap();

    session.play().unwrap();
    wait_playing(&session);

    let engine = Arc::clone(session.engine().unwrap());
    let media = engine.element_by_name("media").unwrap();
    let pad = PadRef::src(media);
    let injected = [
        PadEvent::FlushStart,
        PadEvent::Segment(Segment::default()),
        PadEvent::Custom {
            name: "app-marker".into(),
            upstream: false,
        },
        PadEvent::FlushStop { reset_time: true },
    ];
    for event in injected {
        assert!(engine.send_event(pad, event).unwrap());
    }

    assert!(wait_for(Duration::from_secs(5), || {
        seen.lock().unwrap().iter().any(|n| n == "flush-stop")
    }));
    session.end_stream();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut ended = false;
    while !ended && Instant::now() < deadline {
        ended = session.poll_event(Duration::from_millis(20)) == Some(LifecycleEvent::EndOfStream);
    }
    assert!(ended);

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["flush-start", "flush-stop", "eos"]
    );
    let stats = gate.stats();
    assert_eq!(stats.overridden, 3);
    // stream-start, the initial segment and caps, the injected segment and marker.
    assert_eq!(stats.dropped, 5);

    session.teardown().unwrap();
}

/// Test that events injected before PLAYING are refused.
#[test]
fn test_send_event_requires_streaming() {
    let session = session("packetsrc name=media ! appsink name=out", "not-playing");
    let engine = session.engine().unwrap();
    let media = engine.element_by_name("media").unwrap();
    assert!(!engine.send_event(PadRef::src(media), PadEvent::FlushStart).unwrap());
}

// ============================================================================
// Rewrites and observers
// ============================================================================

/// Test that a caps rewrite upstream is what the sink and the negotiation see.
#[test]
fn test_caps_rewrite_reaches_sink() {
    let mut session = session(
        &format!("packetsrc name=media caps=\"{CAPS}\" ! appsink name=out"),
        "caps",
    );
    let (transport, _tx) = ChannelTransport::new();
    session.attach_source("media", transport).unwrap();

    let target = RtpCodecParameters::new("video/VP8", 90_000, 102);
    session
        .intercept(
            "media",
            PadDirection::Source,
            CapsRewrite::new(target).with_ssrc(0xBEEF),
        )
        .unwrap();
    let (negotiation, negotiated) = CapsNegotiation::new();
    session
        .intercept("out", PadDirection::Sink, negotiation)
        .unwrap();
    session.play().unwrap();

    let codec = negotiated
        .codec_parameters(Duration::from_secs(5))
        .unwrap();
    assert_eq!(codec.payload_type, 102);
    assert_eq!(codec.clock_rate, 90_000);

    let props = session.properties().unwrap();
    let out = props.element("out").unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        props
            .get_string(&out, "caps")
            .is_ok_and(|caps| caps.contains("payload=(int)102"))
    }));

    session.teardown().unwrap();
}

/// Test that a key-unit request from the sink reaches the source pad.
#[test]
fn test_key_unit_request_travels_upstream() {
    let mut session = session("packetsrc name=media ! appsink name=out", "key-unit");
    let (transport, _tx) = ChannelTransport::new();
    session.attach_source("media", transport).unwrap();

    let (watcher, requests) = KeyUnitWatcher::channel();
    session
        .intercept("media", PadDirection::Source, watcher)
        .unwrap();
    session.play().unwrap();
    wait_playing(&session);

    let engine = session.engine().unwrap();
    let out = engine.element_by_name("out").unwrap();
    let request = ForceKeyUnit {
        count: 3,
        ..ForceKeyUnit::upstream()
    };
    assert!(engine
        .send_event(PadRef::sink(out), PadEvent::ForceKeyUnit(request))
        .unwrap());

    let seen = requests.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(seen.count, 3);

    session.teardown().unwrap();
}

/// Test that interceptors stop seeing events once the session is torn down.
#[test]
fn test_detached_after_teardown() {
    let mut session = session("packetsrc name=media ! appsink name=out", "detach");
    let (transport, _tx) = ChannelTransport::new();
    session.attach_source("media", transport).unwrap();
    let (record, seen) = recorder();
    let interceptor = session
        .intercept("out", PadDirection::Sink, record)
        .unwrap();
    session.play().unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        !seen.lock().unwrap().is_empty()
    }));
    session.teardown().unwrap();

    let before = interceptor.stats().seen;
    thread::sleep(Duration::from_millis(50));
    assert_eq!(interceptor.stats().seen, before);
}
