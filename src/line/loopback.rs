//! In-memory line driver. Every control call is recorded so the engine can be
//! driven and observed without hardware.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{mpsc, Arc, Mutex};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use log::trace;
use crate::codec::Law;
use crate::error::ResourceError;
use super::lock;
use super::resource::*;

/// Recorded state of one loopback line or pseudo channel.
#[derive(Debug)]
pub struct LoopbackState {
    pub number: Option<u32>,
    pub events: VecDeque<LineEvent>,
    pub far_off_hook: bool,
    pub hook: Option<HookAction>,
    pub hook_log: Vec<HookAction>,
    pub law: Law,
    pub linear: bool,
    pub conf: ConfRequest,
    pub conf_slot: u32,
    pub gains: Gains,
    pub echo: Option<u32>,
    pub trained: u32,
    pub tone: Option<Tone>,
    pub tone_log: Vec<Option<Tone>>,
    pub polarity_reversed: bool,
    pub dialed: Vec<String>,
    pub dialing: bool,
    pub cadence: Option<usize>,
    pub audio_in: VecDeque<u8>,
    pub written: Vec<u8>,
    /// Reject seizes with `InProgress` (a slow trunk).
    pub slow_seize: bool,
    pub gone: bool,
    doorbell: Option<mpsc::Sender<u32>>,
}

impl LoopbackState {
    fn new(number: Option<u32>, doorbell: Option<mpsc::Sender<u32>>) -> Self {
        Self {
            number,
            events: VecDeque::new(),
            far_off_hook: false,
            hook: None,
            hook_log: vec![],
            law: Law::Ulaw,
            linear: false,
            conf: ConfRequest::leave(),
            conf_slot: 0,
            gains: Gains::default(),
            echo: None,
            trained: 0,
            tone: None,
            tone_log: vec![],
            polarity_reversed: false,
            dialed: vec![],
            dialing: false,
            cadence: None,
            audio_in: VecDeque::new(),
            written: vec![],
            slow_seize: false,
            gone: false,
            doorbell,
        }
    }

    fn ring_doorbell(&self) {
        if let (Some(doorbell), Some(number)) = (&self.doorbell, self.number) {
            doorbell.send(number).ok();
        }
    }
}

/// Test-side handle onto a loopback line.
#[derive(Clone)]
pub struct LineProbe {
    state: Arc<Mutex<LoopbackState>>,
}

impl LineProbe {
    pub fn with<R>(&self, f: impl FnOnce(&mut LoopbackState) -> R) -> R {
        f(&mut lock(&self.state))
    }

    /// Queues an event and rings the doorbell.
    pub fn inject(&self, event: LineEvent) {
        let mut state = lock(&self.state);
        match event {
            LineEvent::RingOffHook => state.far_off_hook = true,
            LineEvent::OnHook => state.far_off_hook = false,
            LineEvent::DialComplete => state.dialing = false,
            _ => {}
        }
        state.events.push_back(event);
        state.ring_doorbell();
    }

    pub fn push_audio(&self, data: &[u8]) {
        let mut state = lock(&self.state);
        state.audio_in.extend(data.iter().copied());
        state.ring_doorbell();
    }

    pub fn tone(&self) -> Option<Tone> {
        lock(&self.state).tone
    }

    pub fn hook(&self) -> Option<HookAction> {
        lock(&self.state).hook
    }

    pub fn dialed(&self) -> Vec<String> {
        lock(&self.state).dialed.clone()
    }

    pub fn conf(&self) -> ConfRequest {
        lock(&self.state).conf
    }

    pub fn echo(&self) -> Option<u32> {
        lock(&self.state).echo
    }

    pub fn written(&self) -> usize {
        lock(&self.state).written.len()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut lock(&self.state).written)
    }
}

struct LoopbackHandle {
    state: Arc<Mutex<LoopbackState>>,
    next_slot: Arc<AtomicU32>,
    conf_calls: Arc<AtomicUsize>,
}

impl LineResource for LoopbackHandle {
    fn set_hook(&mut self, action: HookAction) -> Result<(), ResourceError> {
        let mut state = lock(&self.state);
        if state.gone {
            return Err(ResourceError::Gone)
        }
        trace!("loopback {:?}: hook {:?}", state.number, action);
        state.hook = Some(action);
        state.hook_log.push(action);
        if action == HookAction::Start && state.slow_seize {
            return Err(ResourceError::InProgress)
        }
        Ok(())
    }

    fn is_off_hook(&self) -> Result<bool, ResourceError> {
        let state = lock(&self.state);
        if state.gone {
            return Err(ResourceError::Gone)
        }
        Ok(state.far_off_hook)
    }

    fn get_event(&mut self) -> Result<Option<LineEvent>, ResourceError> {
        let mut state = lock(&self.state);
        if state.gone {
            return Err(ResourceError::Gone)
        }
        Ok(state.events.pop_front())
    }

    fn law(&self) -> Law {
        lock(&self.state).law
    }

    fn set_law(&mut self, law: Law) -> Result<(), ResourceError> {
        lock(&self.state).law = law;
        Ok(())
    }

    fn set_conf(&mut self, request: ConfRequest) -> Result<u32, ResourceError> {
        let mut state = lock(&self.state);
        if state.gone {
            return Err(ResourceError::Gone)
        }
        self.conf_calls.fetch_add(1, Ordering::SeqCst);
        let slot = match request.mode {
            ConfMode::Normal => 0,
            _ => request.slot.unwrap_or_else(|| self.next_slot.fetch_add(1, Ordering::SeqCst)),
        };
        state.conf = ConfRequest { slot: Some(slot), mode: request.mode };
        state.conf_slot = slot;
        Ok(slot)
    }

    fn set_linear(&mut self, linear: bool) -> Result<bool, ResourceError> {
        let mut state = lock(&self.state);
        Ok(std::mem::replace(&mut state.linear, linear))
    }

    fn set_gains(&mut self, gains: &Gains) -> Result<(), ResourceError> {
        lock(&self.state).gains = *gains;
        Ok(())
    }

    fn set_echo_cancel(&mut self, taps: Option<u32>) -> Result<(), ResourceError> {
        lock(&self.state).echo = taps;
        Ok(())
    }

    fn train_echo_canceller(&mut self, ms: u32) -> Result<(), ResourceError> {
        lock(&self.state).trained = ms;
        Ok(())
    }

    fn play_tone(&mut self, tone: Option<Tone>) -> Result<(), ResourceError> {
        let mut state = lock(&self.state);
        if state.gone {
            return Err(ResourceError::Gone)
        }
        state.tone = tone;
        state.tone_log.push(tone);
        Ok(())
    }

    fn set_polarity(&mut self, reversed: bool) -> Result<(), ResourceError> {
        lock(&self.state).polarity_reversed = reversed;
        Ok(())
    }

    fn dial(&mut self, digits: &str) -> Result<(), ResourceError> {
        let mut state = lock(&self.state);
        if state.gone {
            return Err(ResourceError::Gone)
        }
        trace!("loopback {:?}: dial '{}'", state.number, digits);
        state.dialed.push(digits.to_owned());
        state.dialing = true;
        Ok(())
    }

    fn is_dialing(&self) -> bool {
        lock(&self.state).dialing
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ResourceError> {
        let mut state = lock(&self.state);
        if state.gone {
            return Err(ResourceError::Gone)
        }
        let silence = state.law.silence();
        for byte in buf.iter_mut() {
            *byte = state.audio_in.pop_front().unwrap_or(silence);
        }
        Ok(buf.len())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ResourceError> {
        let mut state = lock(&self.state);
        if state.gone {
            return Err(ResourceError::Gone)
        }
        state.written.extend_from_slice(data);
        Ok(data.len())
    }

    fn set_cadence(&mut self, cadence: Option<usize>) -> Result<(), ResourceError> {
        lock(&self.state).cadence = cadence;
        Ok(())
    }
}

/// A line driver that lives entirely in memory.
#[derive(Default)]
pub struct LoopbackDevice {
    lines: Mutex<BTreeMap<u32, Arc<Mutex<LoopbackState>>>>,
    pseudos: Mutex<Vec<Arc<Mutex<LoopbackState>>>>,
    next_slot: Arc<AtomicU32>,
    conf_calls: Arc<AtomicUsize>,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self {
            next_slot: Arc::new(AtomicU32::new(1)),
            ..Default::default()
        }
    }

    pub fn probe(&self, line: u32) -> Option<LineProbe> {
        lock(&self.lines).get(&line).map(|state| LineProbe { state: Arc::clone(state) })
    }

    /// Probes for every pseudo channel opened so far, oldest first.
    pub fn pseudo_probes(&self) -> Vec<LineProbe> {
        lock(&self.pseudos).iter().map(|state| LineProbe { state: Arc::clone(state) }).collect()
    }

    /// Total conference membership changes requested across all resources.
    pub fn conf_calls(&self) -> usize {
        self.conf_calls.load(Ordering::SeqCst)
    }

    fn handle(&self, state: Arc<Mutex<LoopbackState>>) -> Box<dyn LineResource> {
        Box::new(LoopbackHandle {
            state,
            next_slot: Arc::clone(&self.next_slot),
            conf_calls: Arc::clone(&self.conf_calls),
        })
    }
}

impl LineDevice for LoopbackDevice {
    fn open(&self, line: u32, doorbell: mpsc::Sender<u32>) -> Result<Box<dyn LineResource>, ResourceError> {
        let state = Arc::new(Mutex::new(LoopbackState::new(Some(line), Some(doorbell))));
        lock(&self.lines).insert(line, Arc::clone(&state));
        Ok(self.handle(state))
    }

    fn open_pseudo(&self) -> Result<Box<dyn LineResource>, ResourceError> {
        let state = Arc::new(Mutex::new(LoopbackState::new(None, None)));
        lock(&self.pseudos).push(Arc::clone(&state));
        Ok(self.handle(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_ring_the_doorbell() {
        let device = LoopbackDevice::new();
        let (tx, rx) = mpsc::channel();
        let mut hw = device.open(7, tx).unwrap();
        let probe = device.probe(7).unwrap();
        probe.inject(LineEvent::RingOffHook);
        assert_eq!(rx.try_recv(), Ok(7));
        assert!(hw.is_off_hook().unwrap());
        assert_eq!(hw.get_event().unwrap(), Some(LineEvent::RingOffHook));
        assert_eq!(hw.get_event().unwrap(), None);
    }

    #[test]
    fn conference_slots_are_assigned_once() {
        let device = LoopbackDevice::new();
        let mut a = device.open_pseudo().unwrap();
        let mut b = device.open_pseudo().unwrap();
        let slot = a.set_conf(ConfRequest { slot: None, mode: ConfMode::Conference }).unwrap();
        assert_eq!(b.set_conf(ConfRequest { slot: Some(slot), mode: ConfMode::Conference }).unwrap(), slot);
        assert_eq!(a.set_conf(ConfRequest::leave()).unwrap(), 0);
        assert_eq!(device.conf_calls(), 3);
    }

    #[test]
    fn gone_lines_fail() {
        let device = LoopbackDevice::new();
        let (tx, _rx) = mpsc::channel();
        let mut hw = device.open(1, tx).unwrap();
        device.probe(1).unwrap().with(|state| state.gone = true);
        assert_eq!(hw.get_event(), Err(ResourceError::Gone));
        assert!(hw.play_tone(None).unwrap_err().is_fatal());
    }
}
