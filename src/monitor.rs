//! The background loop that watches every line without a call.

use std::sync::{mpsc, Arc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use log::{debug, info, trace, warn};
use thread_priority::{set_current_thread_priority, ThreadPriority};
use crate::codec::FRAME_MS;
use crate::config::MonitorConfig;
use crate::engine::MAX_EVENTS_PER_PASS;
use crate::error::EngineError;
use crate::registry::Registry;

pub struct Monitor {
    registry: Arc<Registry>,
    doorbell: mpsc::Receiver<u32>,
    config: MonitorConfig,
    running: Arc<AtomicBool>,
    /// Some idle line needs audio serviced every frame.
    sampling: bool,
    /// Last line whose mailbox was consulted.
    mwi_cursor: Option<u32>,
}

impl Monitor {
    pub fn new(registry: Arc<Registry>, doorbell: mpsc::Receiver<u32>, config: MonitorConfig, running: Arc<AtomicBool>) -> Self {
        Self {
            registry,
            doorbell,
            config,
            running,
            sampling: false,
            mwi_cursor: None,
        }
    }

    /// Runs the monitor on its own thread until `running` is cleared.
    pub fn spawn(mut self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("line-monitor".to_owned())
            .spawn(move || {
                if self.config.realtime_priority {
                    if let Err(err) = set_current_thread_priority(ThreadPriority::Max) {
                        warn!("Unable to raise monitor priority: {:?}", err);
                    }
                }
                self.run();
            })
    }

    pub fn run(&mut self) {
        info!("Monitor started");
        while self.running.load(Ordering::SeqCst) {
            let woken = self.wait();
            trace!("Monitor woken by {:?}", woken);
            self.pass(Instant::now());
        }
        info!("Monitor stopped");
    }

    fn timeout(&self) -> Duration {
        if self.sampling {
            Duration::from_millis(FRAME_MS)
        } else {
            Duration::from_millis(self.config.poll_timeout_ms)
        }
    }

    /// Blocks until a line rings the doorbell or the timeout passes.
    fn wait(&self) -> Option<u32> {
        let woken = match self.doorbell.recv_timeout(self.timeout()) {
            Ok(number) => Some(number),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                // Every line is gone; keep housekeeping on the timeout
                thread::sleep(self.timeout());
                None
            }
        };
        while self.doorbell.try_recv().is_ok() {}
        woken
    }

    /// One sweep over every idle line. Lines with calls are left to their
    /// call's read path.
    pub fn pass(&mut self, now: Instant) {
        let frame = self.config.frame_samples;
        let dtmf_level = self.config.dtmf_cid_level;
        let quiet = Duration::from_secs(self.config.mwi_quiet_secs);
        let mut sampling = false;

        for number in self.registry.numbers() {
            let result = self.registry.try_with_line(number, |line, env| {
                env.now = now;
                if line.is_owned() {
                    return false
                }
                line.process_events(env, MAX_EVENTS_PER_PASS);
                if line.wants_idle_audio() {
                    line.service_idle_audio(env, frame, dtmf_level);
                }
                line.wants_idle_audio()
            });
            match result {
                Ok(wants_audio) => sampling |= wants_audio,
                Err(EngineError::Contended(_)) => debug!("Monitor skipped busy line {}", number),
                Err(err) => debug!("Monitor skipped line {}: {}", number, err),
            }
        }
        self.check_next_mailbox(now, quiet);
        self.sampling = sampling || self.mwi_cursor.map_or(false, |number| {
            self.registry.try_with_line(number, |line, _env| line.wants_idle_audio()).unwrap_or(false)
        });
        self.registry.sweep_removed();
    }

    /// Consults at most one mailbox, starting after the line checked last.
    fn check_next_mailbox(&mut self, now: Instant, quiet: Duration) {
        let mut numbers = self.registry.numbers();
        if let Some(last) = self.mwi_cursor {
            let start = numbers.iter().position(|number| *number > last).unwrap_or(0);
            numbers.rotate_left(start);
        }
        for number in numbers {
            let checked = self.registry.try_with_line(number, |line, env| {
                env.now = now;
                line.check_mwi(env, quiet)
            });
            if let Ok(true) = checked {
                trace!("Monitor checked mailbox on line {}", number);
                self.mwi_cursor = Some(number);
                return
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use super::*;
    use crate::config::parse_config;
    use crate::error::Result;
    use crate::host::*;
    use crate::line::loopback::LoopbackDevice;
    use crate::line::{lock, Leg, LineEvent};

    #[derive(Default)]
    struct Recorder {
        originated: Mutex<Vec<Origination>>,
        fail: bool,
    }

    impl CallControl for Recorder {
        fn originate(&self, origination: &Origination) -> Result<()> {
            self.originated.lock().unwrap().push(origination.clone());
            if self.fail {
                return Err(EngineError::InvalidState("no setup context"))
            }
            Ok(())
        }

        fn dispatch(&self, _action: HostAction) {}
    }

    fn monitor(control: Arc<Recorder>) -> (Monitor, Arc<Registry>, Arc<LoopbackDevice>) {
        let device = Arc::new(LoopbackDevice::new());
        let config = parse_config("[[line]]\nchannel = 1\nsignalling = \"fxo_ks\"\n[[line]]\nchannel = 2\nsignalling = \"fxs_ks\"\n").unwrap();
        let (registry, rx) = Registry::new(&config, device.clone(), control, Arc::new(NoMessages)).unwrap();
        let registry = Arc::new(registry);
        let monitor = Monitor::new(registry.clone(), rx, config.monitor.clone(), Arc::new(AtomicBool::new(true)));
        (monitor, registry, device)
    }

    #[test]
    fn off_hook_originates_a_call() {
        let control = Arc::new(Recorder::default());
        let (mut monitor, registry, device) = monitor(control.clone());
        device.probe(1).unwrap().inject(LineEvent::RingOffHook);
        monitor.pass(Instant::now());

        let originated = control.originated.lock().unwrap().clone();
        assert_eq!(originated.len(), 1);
        assert_eq!(originated[0].line, 1);
        let line = registry.line(1).unwrap();
        assert_eq!(lock(&line).call(Leg::Real), Some(originated[0].call));
    }

    #[test]
    fn failed_origination_is_rolled_back() {
        let control = Arc::new(Recorder { fail: true, ..Default::default() });
        let (mut monitor, registry, device) = monitor(control.clone());
        device.probe(2).unwrap().inject(LineEvent::RingOffHook);
        monitor.pass(Instant::now());

        let line = registry.line(2).unwrap();
        assert!(!lock(&line).is_owned());
    }

    #[test]
    fn owned_lines_are_left_alone() {
        let control = Arc::new(Recorder::default());
        let (mut monitor, registry, device) = monitor(control.clone());
        device.probe(1).unwrap().inject(LineEvent::RingOffHook);
        monitor.pass(Instant::now());
        device.probe(1).unwrap().inject(LineEvent::DtmfDown('5'));
        monitor.pass(Instant::now());
        let line = registry.line(1).unwrap();
        assert!(lock(&line).next_event().is_some());
    }

    struct FullMailbox;

    impl MessageStore for FullMailbox {
        fn message_count(&self, _mailbox: &str) -> u32 {
            3
        }
    }

    #[test]
    fn one_mailbox_per_pass() {
        let device = Arc::new(LoopbackDevice::new());
        let config = parse_config(r#"
            [[line]]
            channel = 1
            signalling = "fxo_ls"
            [line.mwi]
            mailbox = "100"
            send-fsk = true
            [[line]]
            channel = 2
            signalling = "fxo_ls"
            [line.mwi]
            mailbox = "200"
            send-fsk = true
        "#).unwrap();
        let (registry, rx) = Registry::new(&config, device, Arc::new(Recorder::default()), Arc::new(FullMailbox)).unwrap();
        let registry = Arc::new(registry);
        let mut monitor = Monitor::new(registry.clone(), rx, config.monitor.clone(), Arc::new(AtomicBool::new(true)));
        let sending = |registry: &Registry| -> Vec<u32> {
            registry.numbers().into_iter()
                .filter(|number| lock(&registry.line(*number).unwrap()).mwi.is_some())
                .collect()
        };

        let later = Instant::now() + Duration::from_secs(3600);
        monitor.pass(later);
        assert_eq!(sending(&registry), vec![1]);
        assert!(monitor.sampling);
        monitor.pass(later);
        assert_eq!(sending(&registry), vec![1, 2]);
    }
}
