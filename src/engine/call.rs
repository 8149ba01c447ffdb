use std::time::Duration;
use log::{debug, info, warn};
use crate::error::{EngineError, Result};
use crate::host::*;
use crate::line::{DeferredDial, Leg, Line, Polarity, Tone};
use crate::signalling::Family;
use super::Env;

impl Line {
    /// Places an outbound call that the host already attached to one of our legs.
    pub fn place_call(&mut self, env: &mut Env, call: CallId, dest: &str) -> Result<()> {
        let leg = self.subs.find(call).ok_or(EngineError::NotOwner(self.number))?;
        let state = self.state(leg);
        if !matches!(state, Some(CallState::Down | CallState::Reserved)) {
            warn!("Line {}: cannot call out on {} in {:?}", self.number, call, state);
            return Err(EngineError::InvalidState("call is neither down nor reserved"))
        }
        info!("Line {}: calling '{}' on {:?}", self.number, dest, leg);
        self.dial = DeferredDial::default();
        self.dialed_none = false;
        self.outgoing = true;
        let behavior = self.behavior;
        behavior.call(self, env, leg, dest)
    }

    /// The host answered one of our calls.
    pub fn answer(&mut self, env: &mut Env, call: CallId) -> Result<()> {
        let leg = self.subs.find(call).ok_or(EngineError::NotOwner(self.number))?;
        let previous = self.state(leg);
        self.set_call_state(leg, CallState::Up, env.now);
        match self.family() {
            Family::Radio => {
                warn!("Line {}: don't know how to answer a radio", self.number);
                return Err(EngineError::InvalidState("radio lines can't answer"))
            },
            Family::Trunk => self.ringt = 0,
            _ => {},
        }
        debug!("Line {}: took {} off hook", self.number, call);
        if self.config.features.hangup_on_polarity_switch {
            self.polarity_at = Some(env.now);
        }
        self.off_hook();
        self.play_tone(leg, None);
        self.dialing = false;
        if leg == Leg::Real && self.subs[Leg::ThreeWay].in_three_way && previous == Some(CallState::Ringing) {
            debug!("Line {}: finally swapping real and three-way", self.number);
            self.play_tone(Leg::ThreeWay, None);
            self.subs.swap(Leg::ThreeWay, Leg::Real);
            self.owner = Some(Leg::Real);
        }
        match self.family() {
            Family::Trunk => {
                self.set_echo_canceller(true);
                self.train_echo_canceller();
            },
            Family::Station => self.answer_polarity_switch(),
            _ => {},
        }
        self.update_conf();
        Ok(())
    }

    /// The host hung up one of our calls.
    pub fn hangup(&mut self, env: &mut Env, call: CallId) -> Result<()> {
        let Some(leg) = self.subs.find(call) else {
            debug!("Line {}: {} already left its leg", self.number, call);
            if !self.is_owned() {
                self.reset(env, None);
            }
            return Ok(())
        };
        let state = self.state(leg);
        info!("Line {}: hanging up {} on {:?} in {:?}", self.number, call, leg, state);
        self.subs[leg].owner = None;
        self.subs[leg].pending = Default::default();
        self.subs[leg].linear = false;

        match leg {
            Leg::Real => self.hangup_real(env),
            Leg::CallWait => {
                if self.subs[Leg::CallWait].in_three_way {
                    if let Some(third) = self.call(Leg::ThreeWay) {
                        env.control(third, Control::Hold);
                    }
                    self.subs[Leg::ThreeWay].in_three_way = false;
                    self.subs.swap(Leg::ThreeWay, Leg::CallWait);
                    self.release_leg(Leg::ThreeWay);
                } else {
                    self.release_leg(Leg::CallWait);
                }
            },
            Leg::ThreeWay => {
                if self.subs[Leg::CallWait].in_three_way {
                    self.subs[Leg::CallWait].in_three_way = false;
                    if let Some(waiting) = self.call(Leg::CallWait) {
                        env.control(waiting, Control::Hold);
                    }
                }
                self.subs[Leg::Real].in_three_way = false;
                self.release_leg(Leg::ThreeWay);
            },
        }

        if !self.is_owned() {
            self.reset(env, state);
        }
        self.stop_call_waiting();
        self.update_conf();
        Ok(())
    }

    /// Moves whatever is left onto the Real leg after its call went away.
    fn hangup_real(&mut self, env: &mut Env) {
        let waiting = self.subs.has_owner(Leg::CallWait);
        let three_way = self.subs.has_owner(Leg::ThreeWay);
        if waiting && three_way {
            if self.subs[Leg::CallWait].in_three_way {
                self.subs.swap(Leg::CallWait, Leg::Real);
                self.release_leg(Leg::CallWait);
                self.owner = None;
            } else {
                self.subs.swap(Leg::ThreeWay, Leg::Real);
                self.release_leg(Leg::ThreeWay);
                self.owner = if self.subs[Leg::Real].in_three_way { Some(Leg::Real) } else { None };
                self.subs[Leg::Real].in_three_way = false;
            }
        } else if waiting {
            self.subs.swap(Leg::CallWait, Leg::Real);
            self.release_leg(Leg::CallWait);
            self.owner = Some(Leg::Real);
            if let Some(call) = self.call(Leg::Real) {
                if self.state(Leg::Real) != Some(CallState::Up) {
                    env.control(call, Control::Answer);
                    self.set_call_state(Leg::Real, CallState::Up, env.now);
                }
                env.control(call, Control::Unhold);
            }
        } else if three_way {
            self.subs.swap(Leg::ThreeWay, Leg::Real);
            self.release_leg(Leg::ThreeWay);
            if self.subs[Leg::Real].in_three_way {
                self.owner = Some(Leg::Real);
                self.subs[Leg::Real].in_three_way = false;
            } else {
                self.owner = None;
            }
        }
    }

    /// Returns a line with no calls left to idle.
    fn reset(&mut self, env: &mut Env, hung_up: Option<CallState>) {
        self.owner = None;
        self.ringt = 0;
        self.outgoing = false;
        self.dialing = false;
        self.dial = DeferredDial::default();
        self.dialed_none = false;
        self.rings = 0;
        self.cid_rings = self.config.callerid.cid_rings;
        self.cw.enabled = self.cw.permanent;
        self.cw.caller = None;
        self.cw.cas_pending = false;
        self.cid.hide = self.cid.hide_permanent;
        self.inbound = None;
        self.polarity = Polarity::Idle;
        self.subs[Leg::Real].in_three_way = false;
        self.cancel_spill();
        self.set_echo_canceller(false);
        self.on_hook();

        match self.family() {
            Family::Station => {
                if self.is_off_hook() {
                    self.hangup_polarity_switch();
                    self.play_tone(Leg::Real, Some(Tone::Congestion));
                } else {
                    self.play_tone(Leg::Real, None);
                }
            },
            Family::Trunk if hung_up.map_or(false, |state| state != CallState::Reserved) => {
                let guard = Duration::from_millis(self.config.timing.guard_time_ms);
                self.guard_until = Some(env.now + guard);
                self.play_tone(Leg::Real, None);
            },
            _ => {
                self.play_tone(Leg::Real, None);
            },
        }
        self.restore_audio();
        info!("Line {} is idle", self.number);
    }

    /// Progress signalling requested by the host.
    pub fn indicate(&mut self, env: &mut Env, call: CallId, indication: Indication) -> Result<()> {
        let leg = self.subs.find(call).ok_or(EngineError::NotOwner(self.number))?;
        debug!("Line {}: {:?} on {}", self.number, indication, call);
        match indication {
            Indication::Busy => {
                self.play_tone(leg, Some(Tone::Busy));
            },
            Indication::Congestion => {
                self.play_tone(leg, Some(Tone::Congestion));
            },
            Indication::Ringing => {
                if !matches!(self.state(leg), Some(CallState::Up | CallState::Ring)) {
                    self.set_call_state(leg, CallState::Ringing, env.now);
                    self.play_tone(leg, Some(Tone::Ringback));
                }
            },
            Indication::Proceeding => {
                self.play_tone(leg, None);
                self.dialing = false;
            },
            Indication::Stop => {
                self.play_tone(leg, None);
            },
            Indication::Progress | Indication::Hold | Indication::Unhold => {},
        }
        Ok(())
    }

    /// Whether the line can take another call now.
    pub fn is_available(&mut self, now: std::time::Instant) -> bool {
        if self.dnd || self.in_alarm || self.removed || self.in_guard_time(now) {
            return false
        }
        if !self.is_owned() {
            return self.family() != Family::Station || !self.is_off_hook()
        }
        if self.family() != Family::Station || !self.cw.enabled {
            return false
        }
        if self.subs[Leg::CallWait].is_allocated() {
            return false
        }
        let three_way = &self.subs[Leg::ThreeWay];
        if three_way.is_allocated() && !three_way.in_three_way {
            return false
        }
        match self.state(Leg::Real) {
            Some(CallState::Up) => true,
            Some(CallState::Ringing) => !self.outgoing,
            _ => false,
        }
    }

    /// The host could not create a call we originated.
    pub fn setup_failed(&mut self, env: &mut Env, call: CallId) {
        let Some(leg) = self.subs.find(call) else {
            debug!("Line {}: setup failed for {} which already left", self.number, call);
            return
        };
        warn!("Line {}: unable to start setup for {}", self.number, call);
        self.play_tone(leg, Some(Tone::Congestion));
        self.set_echo_canceller(true);
        if let Err(err) = self.hangup(env, call) {
            warn!("Line {}: unable to hang up {}: {}", self.number, call, err);
        }
        env.hangup(call, HangupCause::Congestion);
    }

    /// Turns a leg's pending indications into controls for its call.
    pub fn deliver_pending(&mut self, env: &mut Env, leg: Leg) {
        let Some(call) = self.call(leg) else {
            return
        };
        let pending = std::mem::take(&mut self.subs[leg].pending);
        let flags = [
            (pending.ringing, Control::Ringing),
            (pending.busy, Control::Busy),
            (pending.congestion, Control::Congestion),
            (pending.answer, Control::Answer),
            (pending.flash, Control::Flash),
            (pending.hold, Control::Hold),
            (pending.unhold, Control::Unhold),
        ];
        for (_, control) in flags.iter().filter(|(set, _)| *set) {
            env.control(call, *control);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;
    use super::*;
    use crate::line::loopback::LoopbackDevice;
    use crate::line::testing::*;

    fn with_call(line: &mut Line, state: CallState) -> CallId {
        let call = CallLeg::new(CallId::next(), state);
        let id = call.id;
        line.attach(Leg::Real, call);
        line.owner = Some(Leg::Real);
        id
    }

    #[test]
    fn failed_setup_hangs_up_with_congestion() {
        let device = LoopbackDevice::new();
        let mut line = station_line(&device, 1);
        let call = with_call(&mut line, CallState::Reserved);
        let mut env = Env::new(Instant::now(), &device, &NoMessages);
        line.setup_failed(&mut env, call);
        assert!(!line.is_owned());
        assert!(env.actions().contains(&HostAction::Hangup(call, HangupCause::Congestion)));
        assert!(device.probe(1).unwrap().with(|state| state.tone_log.contains(&Some(Tone::Congestion))));
    }

    #[test]
    fn ringing_indication_plays_ringback() {
        let device = LoopbackDevice::new();
        let mut line = trunk_line(&device, 2);
        let call = with_call(&mut line, CallState::Dialing);
        let mut env = Env::new(Instant::now(), &device, &NoMessages);
        line.indicate(&mut env, call, Indication::Ringing).unwrap();
        assert_eq!(line.state(Leg::Real), Some(CallState::Ringing));
        assert_eq!(device.probe(2).unwrap().tone(), Some(Tone::Ringback));
        line.indicate(&mut env, call, Indication::Stop).unwrap();
        assert_eq!(device.probe(2).unwrap().tone(), None);
    }

    #[test]
    fn unknown_calls_are_rejected() {
        let device = LoopbackDevice::new();
        let mut line = trunk_line(&device, 3);
        let mut env = Env::new(Instant::now(), &device, &NoMessages);
        let stranger = CallId::next();
        assert!(matches!(line.answer(&mut env, stranger), Err(EngineError::NotOwner(3))));
        assert!(matches!(line.place_call(&mut env, stranger, "3/555"), Err(EngineError::NotOwner(3))));
        assert!(line.hangup(&mut env, stranger).is_ok());
    }

    #[test]
    fn do_not_disturb_and_alarm_block_new_calls() {
        let device = LoopbackDevice::new();
        let now = Instant::now();
        let mut line = trunk_line(&device, 4);
        assert!(line.is_available(now));
        line.dnd = true;
        assert!(!line.is_available(now));
        line.dnd = false;
        line.in_alarm = true;
        assert!(!line.is_available(now));
    }

    #[test]
    fn radio_lines_cannot_answer() {
        let device = LoopbackDevice::new();
        let mut line = line_with(&device, "[[line]]\nchannel = 5\nsignalling = \"radio\"\n");
        let call = with_call(&mut line, CallState::Ring);
        let mut env = Env::new(Instant::now(), &device, &NoMessages);
        assert!(line.answer(&mut env, call).is_err());
    }
}
