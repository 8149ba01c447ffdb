mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use analog_line::config::MonitorConfig;
use analog_line::host::*;
use analog_line::line::LineEvent;
use analog_line::{EngineError, Leg, Monitor, Search};
use common::*;

const TRUNK: &str = r#"
    [[line]]
    channel = 1
    signalling = "fxs_ls"
    context = "incoming"
    [line.callerid]
    use-callerid = false
"#;

const DISTINCTIVE: &str = r#"
    [[line]]
    channel = 1
    signalling = "fxs_ls"
    context = "incoming"
    [line.callerid]
    use-callerid = false
    [[line.distinctive-ring]]
    pattern = [2000, -1, 500]
    range = 600
    context = "fax"
    [[line.distinctive-ring]]
    pattern = [800, 800, 800]
    context = "office"
"#;

fn inbound_call(rig: &Rig, now: Instant) -> CallId {
    rig.event_at(1, LineEvent::RingOffHook, now);
    rig.host.last_origination().unwrap().call
}

#[test]
fn distinctive_ring_selects_its_context() {
    let rig = Rig::new(DISTINCTIVE);
    let start = Instant::now();
    let call = inbound_call(&rig, start);
    assert!(!rig.host.last_origination().unwrap().start_pbx);

    let mut at = start;
    for gap in [2500, 2500, 500] {
        at += Duration::from_millis(gap);
        rig.event_at(1, LineEvent::RingOffHook, at);
    }
    let actions = rig.host.take();
    assert!(actions.contains(&HostAction::CallerId { call, caller: None, context: Some("fax".to_owned()) }));
    assert!(rig.registry.with_line(1, |line, _| line.inbound.is_none()).unwrap());
}

#[test]
fn unmatched_cadence_keeps_the_line_context() {
    let rig = Rig::new(DISTINCTIVE);
    let start = Instant::now();
    let call = inbound_call(&rig, start);

    let mut at = start;
    for gap in [3000, 3000, 3000] {
        at += Duration::from_millis(gap);
        rig.event_at(1, LineEvent::RingOffHook, at);
    }
    assert!(rig.host.take().contains(&HostAction::CallerId { call, caller: None, context: None }));
}

#[test]
fn plain_inbound_ring_starts_the_dialplan() {
    let rig = Rig::new(TRUNK);
    let call = inbound_call(&rig, Instant::now());
    let origination = rig.host.last_origination().unwrap();
    assert!(origination.start_pbx);
    assert_eq!(origination.context, "incoming");
    assert_eq!(rig.state_on(1, Leg::Real), Some(CallState::Ring));
    assert_eq!(rig.registry.with_line(1, |line, _| line.ringt).unwrap(), 400);

    rig.event(1, LineEvent::RingOffHook);
    assert!(rig.host.controls(call).contains(&Control::Ring));
}

#[test]
fn ring_timeout_after_four_hundred_frames() {
    let rig = Rig::new(TRUNK);
    let call = inbound_call(&rig, Instant::now());
    let mut frame = [0u8; 160];
    for _ in 0..399 {
        rig.registry.read(1, call, &mut frame).unwrap();
    }
    assert!(!rig.host.hung_up(call));
    rig.registry.read(1, call, &mut frame).unwrap();
    assert!(rig.host.take().contains(&HostAction::Hangup(call, HangupCause::Normal)));
}

#[test]
fn polarity_inside_the_guard_delay_is_ignored() {
    let rig = Rig::new(&format!("{}[line.features]\nhangup-on-polarity-switch = true\n", TRUNK));
    let requested = rig.registry.request(Search::Line(1), None, None).unwrap();
    rig.registry.call(1, requested.call, "1/5551234").unwrap();
    assert_eq!(rig.probe(1).dialed(), vec!["T5551234w".to_owned()]);
    assert_eq!(rig.state_on(1, Leg::Real), Some(CallState::Dialing));

    rig.event(1, LineEvent::RingOffHook);
    assert_eq!(rig.state_on(1, Leg::Real), Some(CallState::Up));
    assert!(rig.host.controls(requested.call).contains(&Control::Answer));

    let answered = rig.registry.with_line(1, |line, _| line.polarity_at).unwrap().unwrap();
    rig.event_at(1, LineEvent::Polarity, answered + Duration::from_millis(100));
    assert!(!rig.host.hung_up(requested.call));

    rig.event_at(1, LineEvent::Polarity, answered + Duration::from_millis(1000));
    assert!(rig.host.hung_up(requested.call));
}

#[test]
fn guard_time_blocks_reuse() {
    let rig = Rig::new(TRUNK);
    let call = inbound_call(&rig, Instant::now());
    rig.registry.answer(1, call).unwrap();
    rig.registry.hangup(1, call).unwrap();

    assert!(matches!(rig.registry.request(Search::Line(1), None, None), Err(EngineError::LineBusy(1))));
    let later = rig.registry.with_line(1, |line, env| {
        let now = env.now;
        (line.is_available(now + Duration::from_millis(1500)), line.is_available(now + Duration::from_millis(2100)))
    }).unwrap();
    assert_eq!(later, (false, true));
}

#[test]
fn far_end_hangup_reaches_the_host() {
    let rig = Rig::new(TRUNK);
    let call = inbound_call(&rig, Instant::now());
    rig.registry.answer(1, call).unwrap();
    rig.event(1, LineEvent::OnHook);
    assert!(rig.host.take().contains(&HostAction::Hangup(call, HangupCause::Normal)));
}

const MAILBOX_STATION: &str = r#"
    [[line]]
    channel = 1
    signalling = "fxo_ls"
    [line.mwi]
    mailbox = "100"
    send-fsk = true
"#;

fn monitor(rig: &mut Rig) -> Monitor {
    let config = MonitorConfig {
        mwi_quiet_secs: 3,
        realtime_priority: false,
        ..Default::default()
    };
    let doorbell = rig.doorbell.take().unwrap();
    Monitor::new(rig.registry.clone(), doorbell, config, Arc::new(AtomicBool::new(true)))
}

#[test]
fn message_waiting_yields_to_the_subscriber() {
    let mut rig = Rig::new(MAILBOX_STATION);
    let mut monitor = monitor(&mut rig);
    rig.store.set(2);
    let start = Instant::now() + Duration::from_secs(10);

    monitor.pass(start);
    assert!(rig.host.take().contains(&HostAction::Mwi { line: 1, active: true }));
    assert!(rig.registry.with_line(1, |line, _| line.mwi.is_some()).unwrap());

    // Phone picked up in the middle of the spill
    monitor.pass(start + Duration::from_millis(20));
    rig.probe(1).inject(LineEvent::RingOffHook);
    monitor.pass(start + Duration::from_millis(40));
    assert!(rig.registry.with_line(1, |line, _| line.mwi.is_none()).unwrap());
    assert_eq!(rig.state_on(1, Leg::Real), Some(CallState::Reserved));
    let call = rig.host.last_origination().unwrap().call;

    // Nothing is sent while the line is in use
    rig.store.set(0);
    monitor.pass(start + Duration::from_secs(20));
    assert!(rig.host.take().is_empty());

    rig.registry.hangup(1, call).unwrap();
    rig.probe(1).inject(LineEvent::OnHook);
    monitor.pass(start + Duration::from_secs(21));
    monitor.pass(start + Duration::from_secs(30));
    assert!(rig.host.take().contains(&HostAction::Mwi { line: 1, active: false }));
}
