//! One physical analog line: its hardware resource, the three multiplexed
//! legs and the per-line signalling state the engine works on.

mod resource;
mod subchannel;
mod conference;
pub mod loopback;

use std::collections::VecDeque;
use std::sync::{mpsc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use log::{debug, info, trace, warn};
use crate::callerid::{CallerId, CidSignalling, CidSpill, CidStart, InboundPolicy, InboundSession, MwiSpillType, RingPattern};
use crate::codec::{Law, FRAME_MS};
use crate::config::LineConfig;
use crate::error::{ConfigError, ResourceError};
use crate::host::{CallId, CallLeg, CallState};
use crate::mwi::MwiSender;
use crate::signalling::{Family, Signalling, SignallingBehavior};

pub use self::resource::*;
pub use self::subchannel::*;
pub use self::conference::*;

/// Locks a mutex, taking the data of a poisoned one as it is.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Loop polarity as last reported by the far end.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    Idle,
    Reversed,
}

/// Events the engine injects into its own event stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyntheticEvent {
    Flash,
    OnHook,
    /// The host could not create the call.
    SetupFailed(CallId),
}

/// One item from a line's merged event stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Line(LineEvent),
    Synthetic(SyntheticEvent),
}

/// Digits waiting for the trunk to acknowledge the seize.
#[derive(Clone, Debug, Default)]
pub struct DeferredDial {
    /// Sent on hook-complete or wink.
    pub pending: Option<String>,
    /// Feature group D tandem access: digits sent on the second wink.
    pub final_dial: Option<String>,
    /// Winks seen since the call was placed.
    pub winks: u32,
    /// Tail of the dial string sent after the echo canceller trains.
    pub echo_rest: Option<String>,
    /// Destination as given by the host, kept for second stage dialing.
    pub dest: String,
}

#[derive(Clone, Debug, Default)]
pub struct CallWaiting {
    /// Configured enable, restored on hangup.
    pub permanent: bool,
    pub enabled: bool,
    /// The CAS alert went out and the CPE may acknowledge it.
    pub cas_pending: bool,
    /// Frames until the alert repeats; zero when not repeating.
    pub repeat_frames: u32,
    /// Alerts already sent for the waiting call.
    pub rings: u32,
    /// Identity sent in the call waiting caller id.
    pub caller: Option<CallerId>,
    /// Frames left to wait for the CPE acknowledgement.
    pub ack_frames: u32,
}

/// Caller id settings resolved from configuration.
#[derive(Clone, Debug)]
pub struct CidSettings {
    pub use_callerid: bool,
    pub signalling: CidSignalling,
    pub start: CidStart,
    pub hide_permanent: bool,
    /// Withhold our identity on the current call.
    pub hide: bool,
    pub callwaiting_callerid: bool,
    pub callwaiting_ack: bool,
    pub rings_after_cid: bool,
    pub identity: CallerId,
}

pub struct Line {
    pub number: u32,
    pub config: LineConfig,
    pub signalling: Signalling,
    pub behavior: &'static dyn SignallingBehavior,
    /// Physical resource, always the Real leg's audio path.
    pub hw: Box<dyn LineResource>,
    pub subs: Subchannels,
    /// The leg the subscriber currently hears.
    pub owner: Option<Leg>,
    pub law: Law,
    pub gains: Gains,
    pub cid: CidSettings,
    pub patterns: Vec<RingPattern>,

    pub master: Option<u32>,
    pub slaves: Vec<u32>,
    /// Conference slot owned by this line.
    pub confno: Option<u32>,
    /// The master's own Real leg is mixed with its slaves.
    pub in_conference: bool,
    /// The conference needs a group pass by the registry.
    pub conf_dirty: bool,

    pub polarity: Polarity,
    /// Polarity reversals within the answer delay of this instant are not hangups.
    pub polarity_at: Option<Instant>,
    pub flash_at: Option<Instant>,
    /// Frames left before an unanswered ring is released.
    pub ringt: u32,
    pub ringt_base: u32,
    pub in_alarm: bool,
    pub guard_until: Option<Instant>,
    pub dnd: bool,
    pub outgoing: bool,
    /// Audio is withheld while digits or rings go out.
    pub dialing: bool,
    /// An outbound trunk call with no digits to send.
    pub dialed_none: bool,
    pub echo_on: bool,
    pub dial: DeferredDial,
    pub cw: CallWaiting,
    /// Ring count at which caller id is sent.
    pub cid_rings: u32,
    pub rings: u32,
    pub spill: Option<CidSpill>,
    /// Frames during which received digits are discarded.
    pub suppress_frames: u32,
    pub inbound: Option<InboundSession>,
    pub mwi: Option<MwiSender>,
    pub mwi_type: MwiSpillType,
    /// Last message waiting state sent; `None` forces a resend.
    pub msg_state: Option<bool>,
    pub on_hook_since: Option<Instant>,
    /// DTMF energy detection is settling until this instant.
    pub energy_holdoff: Option<Instant>,
    /// The driver reported the line gone; the registry tears it down.
    pub removed: bool,
    /// A fatal resource error was seen; every leg must hang up.
    pub failed: bool,
    synthetic: VecDeque<SyntheticEvent>,
}

impl Line {
    pub fn open(config: &LineConfig, device: &dyn LineDevice, doorbell: mpsc::Sender<u32>) -> Result<Self, ConfigError> {
        let signalling: Signalling = config.signalling.parse()?;
        let law: Law = config.audio.law.parse()?;
        let cid = CidSettings {
            use_callerid: config.callerid.use_callerid,
            signalling: config.callerid.signalling.parse()?,
            start: config.callerid.start.parse()?,
            hide_permanent: config.callerid.hide_callerid,
            hide: config.callerid.hide_callerid,
            callwaiting_callerid: config.callerid.callwaiting_callerid,
            callwaiting_ack: config.callerid.callwaiting_cid_ack,
            rings_after_cid: config.callerid.distinctive_ring_after_cid,
            identity: CallerId::new(config.callerid.name.as_deref(), config.callerid.number.as_deref()),
        };
        let gains = Gains {
            rx_gain: config.audio.rx_gain,
            tx_gain: config.audio.tx_gain,
            rx_drc: config.audio.rx_drc,
            tx_drc: config.audio.tx_drc,
        };

        let mut hw = device.open(config.channel, doorbell)
            .map_err(|err| ConfigError::Open(config.channel, err))?;
        hw.set_law(law).map_err(|err| ConfigError::Open(config.channel, err))?;
        hw.set_gains(&gains).map_err(|err| ConfigError::Open(config.channel, err))?;
        if let Err(err) = hw.set_echo_cancel(None) {
            warn!("Line {}: unable to reset echo canceller: {}", config.channel, err);
        }

        let ringt_base = (config.timing.ring_timeout_ms / FRAME_MS) as u32;
        let line = Self {
            number: config.channel,
            signalling,
            behavior: signalling.behavior(),
            hw,
            subs: Subchannels::new(),
            owner: None,
            law,
            gains,
            cid,
            patterns: config.distinctive_ring.iter().map(RingPattern::from).collect(),
            master: None,
            slaves: vec![],
            confno: None,
            in_conference: false,
            conf_dirty: false,
            polarity: Polarity::Idle,
            polarity_at: None,
            flash_at: None,
            ringt: 0,
            ringt_base,
            in_alarm: false,
            guard_until: None,
            dnd: config.features.dnd,
            outgoing: false,
            dialing: false,
            dialed_none: false,
            echo_on: false,
            dial: DeferredDial::default(),
            cw: CallWaiting {
                permanent: config.features.call_waiting,
                enabled: config.features.call_waiting,
                ..Default::default()
            },
            cid_rings: config.callerid.cid_rings,
            rings: 0,
            spill: None,
            suppress_frames: 0,
            inbound: None,
            mwi: None,
            mwi_type: config.mwi.spill_type.parse()?,
            msg_state: None,
            on_hook_since: Some(Instant::now()),
            energy_holdoff: None,
            removed: false,
            failed: false,
            synthetic: VecDeque::new(),
            config: config.clone(),
        };
        info!("Opened line {} ({})", line.number, signalling.name());
        Ok(line)
    }

    pub fn family(&self) -> Family {
        self.signalling.family()
    }

    /// Queues an event ahead of the hardware stream.
    pub fn inject(&mut self, event: SyntheticEvent) {
        trace!("Line {}: injected {:?}", self.number, event);
        self.synthetic.push_back(event);
    }

    /// Next event, synthetic ones first.
    pub fn next_event(&mut self) -> Option<Event> {
        if let Some(event) = self.synthetic.pop_front() {
            return Some(Event::Synthetic(event))
        }
        match self.hw.get_event() {
            Ok(event) => event.map(Event::Line),
            Err(err) => {
                self.resource_error("get event", err);
                None
            }
        }
    }

    /// Whether any leg carries a call.
    pub fn is_owned(&self) -> bool {
        self.subs.owned().next().is_some()
    }

    pub fn call(&self, leg: Leg) -> Option<CallId> {
        self.subs[leg].call()
    }

    pub fn state(&self, leg: Leg) -> Option<CallState> {
        self.subs.owner(leg).map(|owner| owner.state)
    }

    /// Attaches a new call to `leg`.
    pub fn attach(&mut self, leg: Leg, call: CallLeg) {
        debug!("Line {}: {} attached to {:?} in {:?}", self.number, call.id, leg, call.state);
        self.subs[leg].owner = Some(call);
    }

    pub fn set_call_state(&mut self, leg: Leg, state: CallState, now: Instant) {
        let number = self.number;
        let Some(owner) = self.subs.owner_mut(leg) else {
            warn!("Line {}: no call on {:?} to move to {:?}", number, leg, state);
            return
        };
        if owner.state == state {
            return
        }
        let prev_state = std::mem::replace(&mut owner.state, state);
        let state_time = now.saturating_duration_since(std::mem::replace(&mut owner.since, now));
        info!("Line {} {:?}: {:?} ({:?}) --> {:?}", number, leg, prev_state, state_time, state);

        // Tones never outlive the state that started them
        if self.subs[leg].tone.is_some() {
            self.play_tone(leg, None);
        }
    }

    /// Logs a resource error, remembering fatal ones.
    pub fn resource_error(&mut self, what: &str, err: ResourceError) {
        if err.is_fatal() {
            warn!("Line {}: {} failed, line lost: {}", self.number, what, err);
            self.failed = true;
        } else {
            warn!("Line {}: {} failed: {}", self.number, what, err);
        }
    }

    fn absorb<T>(&mut self, what: &str, result: Result<T, ResourceError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.resource_error(what, err);
                None
            }
        }
    }

    pub fn set_hook(&mut self, action: HookAction) -> bool {
        trace!("Line {}: hook {:?}", self.number, action);
        let result = self.hw.set_hook(action);
        self.absorb("set hook", result).is_some()
    }

    pub fn ring(&mut self) -> bool {
        self.set_hook(HookAction::Ring)
    }

    pub fn off_hook(&mut self) -> bool {
        self.set_hook(HookAction::OffHook)
    }

    pub fn on_hook(&mut self) -> bool {
        self.set_hook(HookAction::OnHook)
    }

    pub fn is_off_hook(&mut self) -> bool {
        let result = self.hw.is_off_hook();
        self.absorb("hook query", result).unwrap_or(false)
    }

    /// Plays (or with `None` stops) a tone on one leg's audio path.
    pub fn play_tone(&mut self, leg: Leg, tone: Option<Tone>) -> bool {
        let number = self.number;
        let sub = &mut self.subs[leg];
        let Some(resource) = sub.resource(self.hw.as_mut()) else {
            debug!("Line {}: no {:?} leg for tone {:?}", number, leg, tone);
            return false
        };
        match resource.play_tone(tone) {
            Ok(()) => {
                sub.tone = tone;
                true
            },
            Err(err) => {
                self.resource_error("play tone", err);
                false
            }
        }
    }

    pub fn set_echo_canceller(&mut self, enable: bool) {
        if enable == self.echo_on {
            return
        }
        let taps = if enable { self.config.audio.echo_cancel } else { None };
        if enable && taps.is_none() {
            return
        }
        let result = self.hw.set_echo_cancel(taps);
        if self.absorb("set echo canceller", result).is_some() {
            self.echo_on = enable;
            debug!("Line {}: echo canceller {}", self.number, if enable { "on" } else { "off" });
        }
    }

    pub fn train_echo_canceller(&mut self) {
        if let (true, Some(ms)) = (self.echo_on, self.config.timing.echo_training) {
            let result = self.hw.train_echo_canceller(ms);
            self.absorb("train echo canceller", result);
        }
    }

    /// Sends a dial string on the physical line.
    pub fn dial_digits(&mut self, digits: &str) -> bool {
        debug!("Line {}: dialing '{}'", self.number, digits);
        let result = self.hw.dial(digits);
        self.absorb("dial", result).is_some()
    }

    pub fn set_polarity(&mut self, reversed: bool) {
        let result = self.hw.set_polarity(reversed);
        self.absorb("set polarity", result);
    }

    pub fn is_dialing(&self) -> bool {
        self.hw.is_dialing()
    }

    /// Puts the Real resource back to its configured audio settings.
    pub fn restore_audio(&mut self) {
        let result = self.hw.set_linear(false);
        self.absorb("set linear", result);
        let result = self.hw.set_law(self.law);
        self.absorb("set law", result);
        let gains = self.gains;
        let result = self.hw.set_gains(&gains);
        self.absorb("set gains", result);
        self.subs[Leg::Real].linear = false;
    }

    /// Reconciles this line's conference now, or defers to the registry when
    /// other lines are involved.
    pub fn update_conf(&mut self) {
        if self.master.is_none() && self.slaves.is_empty() {
            reconcile_line(self);
        } else {
            self.conf_dirty = true;
        }
    }

    pub fn cancel_spill(&mut self) {
        if let Some(spill) = self.spill.take() {
            debug!("Line {}: cancelled {:?} spill at {}/{}", self.number, spill.kind(), spill.position(), spill.len());
        }
    }

    pub fn inbound_policy(&self) -> InboundPolicy {
        InboundPolicy {
            signalling: self.cid.signalling,
            start: self.cid.start,
            patterns: self.patterns.clone(),
            ring_timeout: Duration::from_millis(self.config.timing.ring_timeout_ms),
            rings_after_cid: self.cid.rings_after_cid,
        }
    }

    /// Whether the line is in its post-call guard time.
    pub fn in_guard_time(&self, now: Instant) -> bool {
        self.guard_until.map(|until| now < until).unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::mpsc;
    use crate::config::parse_config;
    use super::*;

    pub fn line_with(device: &dyn LineDevice, config: &str) -> Line {
        let config = parse_config(config).unwrap();
        let (tx, _rx) = mpsc::channel();
        Line::open(&config.lines[0], device, tx).unwrap()
    }

    pub fn station_line(device: &dyn LineDevice, number: u32) -> Line {
        line_with(device, &format!("[[line]]\nchannel = {}\nsignalling = \"fxo_ls\"\n", number))
    }

    pub fn trunk_line(device: &dyn LineDevice, number: u32) -> Line {
        line_with(device, &format!("[[line]]\nchannel = {}\nsignalling = \"fxs_ls\"\n", number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::*;
    use super::loopback::LoopbackDevice;

    #[test]
    fn synthetic_events_come_first() {
        let device = LoopbackDevice::new();
        let mut line = station_line(&device, 3);
        device.probe(3).unwrap().inject(LineEvent::RingOffHook);
        line.inject(SyntheticEvent::Flash);
        assert_eq!(line.next_event(), Some(Event::Synthetic(SyntheticEvent::Flash)));
        assert_eq!(line.next_event(), Some(Event::Line(LineEvent::RingOffHook)));
        assert_eq!(line.next_event(), None);
    }

    #[test]
    fn state_change_stops_the_tone() {
        let device = LoopbackDevice::new();
        let mut line = station_line(&device, 1);
        let now = Instant::now();
        line.attach(Leg::Real, CallLeg::new(CallId::next(), CallState::Reserved));
        line.play_tone(Leg::Real, Some(Tone::DialTone));
        assert_eq!(device.probe(1).unwrap().tone(), Some(Tone::DialTone));
        line.set_call_state(Leg::Real, CallState::Ring, now);
        assert_eq!(device.probe(1).unwrap().tone(), None);
        assert_eq!(line.subs[Leg::Real].tone, None);
    }

    #[test]
    fn fatal_errors_are_remembered() {
        let device = LoopbackDevice::new();
        let mut line = trunk_line(&device, 1);
        device.probe(1).unwrap().with(|state| state.gone = true);
        assert!(!line.off_hook());
        assert!(line.failed);
    }

    #[test]
    fn ring_timeout_in_frames() {
        let device = LoopbackDevice::new();
        let line = trunk_line(&device, 1);
        assert_eq!(line.ringt_base, 400);
    }
}
