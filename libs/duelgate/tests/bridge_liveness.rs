//! Hang detection and failure containment: slow engines are waited on,
//! dead peers fail the call in bounded time, and a failed bridge never
//! serves again.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use duelgate::{
    BridgeConfig, BridgeError, DuelBackend, DuelOptions, LivenessPolicy, PeerSegment, ShmBridge,
    DEFAULT_CAPACITY,
};

use support::{
    recording_set, EngineKnobs, FailingSupervisor, MockSupervisor, StillbornSupervisor, TestEngine,
};

fn launch_with_poll(knobs: Arc<EngineKnobs>, poll: Duration) -> (ShmBridge, MockSupervisor) {
    let mut supervisor = MockSupervisor::new(TestEngine::new(knobs));
    let bridge = ShmBridge::launch(
        BridgeConfig::new("duelgate-peer")
            .with_capacity(64 * 1024)
            .with_liveness(LivenessPolicy::new(poll)),
        &mut supervisor,
    )
    .unwrap();
    (bridge, supervisor)
}

#[test]
fn test_slow_but_alive_engine_is_waited_on() {
    let knobs = Arc::new(EngineKnobs::default());
    knobs.process_delay_ms.store(200, Ordering::SeqCst);
    let (bridge, _sup) = launch_with_poll(knobs, Duration::from_millis(50));
    let (set, _) = recording_set();
    let duel = bridge.create_duel(&DuelOptions::default(), set).unwrap();

    // Several wait windows elapse while the engine computes; the call
    // still completes because the peer stays alive.
    let started = Instant::now();
    assert_eq!(bridge.process(duel).unwrap(), duel.0 as i32);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[test]
fn test_dead_peer_fails_the_call_and_poisons_the_bridge() {
    let knobs = Arc::new(EngineKnobs::default());
    let (bridge, _sup) = launch_with_poll(knobs.clone(), Duration::from_millis(50));
    let (set, _) = recording_set();
    let duel = bridge.create_duel(&DuelOptions::default(), set).unwrap();

    knobs.fail_process.store(true, Ordering::SeqCst);
    let started = Instant::now();
    let err = bridge.process(duel).unwrap_err();
    assert!(matches!(err, BridgeError::HungPeer));
    // Detection is bounded by the poll interval, not by any long
    // deadline.
    assert!(started.elapsed() < Duration::from_secs(2));

    // Everything after the failure is refused outright.
    assert!(matches!(
        bridge.version().unwrap_err(),
        BridgeError::Poisoned
    ));
    assert!(matches!(
        bridge.process(duel).unwrap_err(),
        BridgeError::Poisoned
    ));
}

#[test]
fn test_heartbeat_failure_reaps_the_peer_and_unlinks() {
    let mut supervisor = StillbornSupervisor::new();
    let cleaned = supervisor.cleaned.clone();
    let names = supervisor.segment_name.clone();
    let err = ShmBridge::launch(BridgeConfig::new("duelgate-peer"), &mut supervisor)
        .err()
        .unwrap();
    assert!(matches!(err, BridgeError::Heartbeat(_)));
    assert!(cleaned.load(Ordering::SeqCst));

    let name = names.lock().clone().unwrap();
    assert!(PeerSegment::attach(&name, DEFAULT_CAPACITY).is_err());
}

#[test]
fn test_launch_failure_unlinks_the_segment() {
    let mut supervisor = FailingSupervisor::default();
    let names = supervisor.segment_name.clone();
    let err = ShmBridge::launch(BridgeConfig::new("duelgate-peer"), &mut supervisor)
        .err()
        .unwrap();
    assert!(matches!(err, BridgeError::Launch(_)));

    let name = names.lock().clone().unwrap();
    assert!(PeerSegment::attach(&name, DEFAULT_CAPACITY).is_err());
}
