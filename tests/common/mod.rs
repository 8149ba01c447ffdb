#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Instant;
use analog_line::engine::MAX_EVENTS_PER_PASS;
use analog_line::host::*;
use analog_line::line::loopback::{LineProbe, LoopbackDevice};
use analog_line::line::LineEvent;
use analog_line::{parse_config, EngineError, Registry};

/// A host that remembers everything the driver asked of it.
#[derive(Default)]
pub struct Recorder {
    pub originated: Mutex<Vec<Origination>>,
    pub actions: Mutex<Vec<HostAction>>,
}

impl CallControl for Recorder {
    fn originate(&self, origination: &Origination) -> Result<(), EngineError> {
        self.originated.lock().unwrap().push(origination.clone());
        Ok(())
    }

    fn dispatch(&self, action: HostAction) {
        self.actions.lock().unwrap().push(action);
    }
}

impl Recorder {
    pub fn take(&self) -> Vec<HostAction> {
        std::mem::take(&mut *self.actions.lock().unwrap())
    }

    pub fn last_origination(&self) -> Option<Origination> {
        self.originated.lock().unwrap().last().cloned()
    }

    pub fn controls(&self, call: CallId) -> Vec<Control> {
        self.actions.lock().unwrap().iter()
            .filter_map(|action| match action {
                HostAction::Control(id, control) if *id == call => Some(*control),
                _ => None,
            })
            .collect()
    }

    pub fn hung_up(&self, call: CallId) -> bool {
        self.actions.lock().unwrap().iter()
            .any(|action| matches!(action, HostAction::Hangup(id, _) if *id == call))
    }
}

/// Message store whose count can change under a running test.
#[derive(Default)]
pub struct Mailbox(pub AtomicU32);

impl Mailbox {
    pub fn set(&self, count: u32) {
        self.0.store(count, Ordering::SeqCst);
    }
}

impl MessageStore for Mailbox {
    fn message_count(&self, _mailbox: &str) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Rig {
    pub registry: Arc<Registry>,
    pub device: Arc<LoopbackDevice>,
    pub host: Arc<Recorder>,
    pub store: Arc<Mailbox>,
    pub doorbell: Option<mpsc::Receiver<u32>>,
}

impl Rig {
    pub fn new(config: &str) -> Self {
        let config = parse_config(config).unwrap();
        let device = Arc::new(LoopbackDevice::new());
        let host = Arc::new(Recorder::default());
        let store = Arc::new(Mailbox::default());
        let (registry, doorbell) = Registry::new(&config, device.clone(), host.clone(), store.clone()).unwrap();
        Self {
            registry: Arc::new(registry),
            device,
            host,
            store,
            doorbell: Some(doorbell),
        }
    }

    pub fn probe(&self, line: u32) -> LineProbe {
        self.device.probe(line).unwrap()
    }

    /// Feeds one hardware event to a line and handles it at `now`.
    pub fn event_at(&self, line: u32, event: LineEvent, now: Instant) {
        self.probe(line).inject(event);
        self.registry.with_line(line, |line, env| {
            env.now = now;
            line.process_events(env, MAX_EVENTS_PER_PASS);
        }).unwrap();
    }

    pub fn event(&self, line: u32, event: LineEvent) {
        self.event_at(line, event, Instant::now());
    }

    pub fn call_on(&self, line: u32, leg: analog_line::Leg) -> Option<CallId> {
        self.registry.with_line(line, |line, _env| line.call(leg)).unwrap()
    }

    pub fn state_on(&self, line: u32, leg: analog_line::Leg) -> Option<CallState> {
        self.registry.with_line(line, |line, _env| line.state(leg)).unwrap()
    }
}

pub const STATION: &str = r#"
    [[line]]
    channel = 1
    signalling = "fxo_ls"
    context = "house"
"#;
