use log::{debug, info, warn};
use crate::callerid::{caller_id_spill, cid_timestamp, CallerId, CidSpill, SpillKind};
use crate::host::*;
use crate::line::{HookAction, Leg, LineEvent, Line, Polarity};
use crate::signalling::Family;
use super::Env;

/// Longest echo break tail: the pause run plus the two withheld characters.
const ECHO_REST_LEN: usize = 19;
const MAX_ECHO_PAUSES: usize = ECHO_REST_LEN - 2;

/// Splits the last two characters off a long dial string so the echo
/// canceller can train in between. Returns the tail to dial afterwards.
pub(crate) fn echo_break(dial: &mut String, training: u32, divisor: u32) -> Option<String> {
    if dial.len() <= 4 || !dial.is_ascii() {
        return None
    }
    let pauses = ((training / divisor) as usize + 1).min(MAX_ECHO_PAUSES);
    let tail = dial.split_off(dial.len() - 2);
    Some(format!("{}{}", "w".repeat(pauses), tail))
}

impl Line {
    pub(super) fn handle_digit(&mut self, env: &mut Env, digit: char, begin: bool) {
        if self.cw.ack_frames > 0 {
            if !begin && matches!(digit, 'A' | 'D') {
                debug!("Line {}: CPE acknowledged call waiting with '{}'", self.number, digit);
                self.send_call_waiting_cid();
            }
            return
        }
        if self.suppress_frames > 0 {
            debug!("Line {}: dropping digit '{}' after spill", self.number, digit);
            return
        }
        let leg = self.owner.unwrap_or(Leg::Real);
        if let Some(call) = self.call(leg) {
            env.push(HostAction::Digit { call, begin, digit });
        }
    }

    pub(super) fn dial_complete(&mut self, env: &mut Env) {
        if self.in_alarm {
            return
        }
        if self.is_dialing() {
            debug!("Line {}: dial complete while the driver is still dialing", self.number);
            return
        }
        self.set_echo_canceller(true);
        if let Some(rest) = self.dial.echo_rest.take() {
            self.train_echo_canceller();
            if !self.dial_digits(&rest) {
                warn!("Line {}: unable to dial the rest of '{}'", self.number, rest);
            }
            return
        }

        self.dialing = false;
        let Some(call) = self.call(Leg::Real) else {
            return
        };
        if self.signalling.is_two_stage() {
            if self.state(Leg::Real) == Some(CallState::DialingOffhook) {
                self.set_call_state(Leg::Real, CallState::Up, env.now);
                env.control(call, Control::Answer);
                return
            }
            self.set_call_state(Leg::Real, CallState::DialingOffhook, env.now);
        }
        if self.state(Leg::Real) == Some(CallState::Dialing) {
            if self.family() == Family::Em && !self.dialed_none {
                self.set_call_state(Leg::Real, CallState::Ringing, env.now);
            } else if !self.config.features.answer_on_polarity_switch {
                self.set_call_state(Leg::Real, CallState::Up, env.now);
                env.control(call, Control::Answer);
                self.polarity = Polarity::Reversed;
            } else {
                self.polarity = Polarity::Idle;
            }
        }
    }

    pub(super) fn ringer_off(&mut self, env: &mut Env) {
        if self.in_alarm {
            return
        }
        self.rings += 1;
        if self.family() == Family::Station && self.cid.use_callerid {
            if self.rings == self.cid_rings {
                let caller = self.presented_caller(Leg::Real);
                let data = caller_id_spill(&caller, self.cid.signalling, self.law, &cid_timestamp(chrono::Local::now()), false);
                debug!("Line {}: sending caller id after ring {}", self.number, self.rings);
                self.spill = Some(CidSpill::new(SpillKind::CallerId, data));
            } else if self.rings > self.cid_rings {
                self.cw.cas_pending = false;
                if matches!(self.spill.as_ref().map(|spill| spill.kind()), Some(SpillKind::CallerId)) {
                    self.cancel_spill();
                }
            }
        }
        if let Some(call) = self.call(Leg::Real) {
            env.control(call, Control::Ringing);
        }
    }

    /// The caller id a station shows for the call on `leg`.
    pub(crate) fn presented_caller(&self, leg: Leg) -> CallerId {
        self.subs.owner(leg)
            .and_then(|owner| owner.caller.clone())
            .unwrap_or_default()
    }

    /// Our own number, sent as ANI on feature group trunks.
    pub(crate) fn ani(&self) -> Option<String> {
        if self.cid.hide {
            return None
        }
        self.subs.owner(Leg::Real)
            .and_then(|owner| owner.caller.as_ref())
            .and_then(|caller| caller.number.as_str())
            .or_else(|| self.cid.identity.number.as_str())
            .map(str::to_owned)
    }

    /// An event arrived while no leg is current, typically while a held call
    /// rings the phone back.
    pub(super) fn exception(&mut self, env: &mut Env, event: LineEvent) {
        if !matches!(event, LineEvent::RingerOn | LineEvent::RingerOff | LineEvent::HookComplete) {
            if self.subs.has_owner(Leg::Real) {
                self.owner = Some(Leg::Real);
                self.subs[Leg::Real].pending.unhold = true;
            }
        }
        let call = self.call(Leg::Real);
        match event {
            LineEvent::OnHook => {
                self.set_echo_canceller(false);
                if let Some(call) = call {
                    info!("Line {}: {} is still waiting, ringing phone", self.number, call);
                    self.ring();
                    self.stop_call_waiting();
                }
                self.update_conf();
            },
            LineEvent::RingOffHook => {
                self.set_echo_canceller(true);
                self.off_hook();
                if let (Some(call), Some(CallState::Ringing)) = (call, self.state(Leg::Real)) {
                    env.control(call, Control::Answer);
                    self.set_call_state(Leg::Real, CallState::Up, env.now);
                    self.dialing = false;
                }
            },
            LineEvent::WinkFlash => {
                self.flash_at = Some(env.now);
                if let Some(call) = call {
                    if self.state(Leg::Real) != Some(CallState::Up) {
                        env.control(call, Control::Answer);
                        self.set_call_state(Leg::Real, CallState::Up, env.now);
                    }
                    self.stop_call_waiting();
                    self.subs[Leg::Real].pending.unhold = true;
                }
                self.update_conf();
            },
            other => warn!("Line {}: don't know how to absorb {:?} with no owner", self.number, other),
        }
    }

    pub fn polarity_supervision(&mut self, env: &mut Env) {
        let answer_on = self.config.features.answer_on_polarity_switch;
        let hangup_on = self.config.features.hangup_on_polarity_switch;
        let Some(call) = self.call(Leg::Real) else {
            return
        };
        if self.polarity == Polarity::Idle {
            self.polarity = Polarity::Reversed;
            if answer_on && matches!(self.state(Leg::Real), Some(CallState::Dialing | CallState::Ringing)) {
                debug!("Line {}: answering on polarity switch", self.number);
                self.dialing = false;
                self.set_call_state(Leg::Real, CallState::Up, env.now);
                env.control(call, Control::Answer);
                if hangup_on {
                    self.polarity_at = Some(env.now);
                }
            } else {
                debug!("Line {}: ignoring switch to reversed polarity in {:?}", self.number, self.state(Leg::Real));
            }
        }

        if hangup_on && self.polarity == Polarity::Reversed
            && matches!(self.state(Leg::Real), Some(CallState::Up | CallState::Ring)) {
            let delay = std::time::Duration::from_millis(self.config.timing.polarity_on_answer_delay_ms);
            let settled = self.polarity_at
                .map(|at| env.now.saturating_duration_since(at) > delay)
                .unwrap_or(true);
            if settled {
                debug!("Line {}: polarity reversal, hanging up", self.number);
                env.hangup(call, HangupCause::Normal);
                self.polarity = Polarity::Idle;
            } else {
                debug!("Line {}: polarity reversal too close to answer, not hanging up", self.number);
            }
        }
    }

    /// Sends digits held back until the trunk acknowledged the seize.
    pub fn send_deferred_dial(&mut self, env: &mut Env) {
        let Some(digits) = self.dial.pending.take() else {
            return
        };
        let Some(call) = self.call(Leg::Real) else {
            return
        };
        if !self.dial_digits(&digits) {
            warn!("Line {}: unable to send deferred digits '{}'", self.number, digits);
            env.hangup(call, HangupCause::Failure);
            return
        }
        debug!("Line {}: sent deferred digit string '{}'", self.number, digits);
        self.dialing = true;
    }

    /// Ring or answer on trunk, E&M and radio lines.
    pub fn ring_or_answer(&mut self, env: &mut Env) {
        let Some(call) = self.call(Leg::Real) else {
            return
        };
        match self.state(Leg::Real) {
            Some(CallState::PreRing) | Some(CallState::Down) | Some(CallState::Ring) => {
                if self.state(Leg::Real) == Some(CallState::PreRing) {
                    self.set_call_state(Leg::Real, CallState::Ring, env.now);
                }
                debug!("Line {}: ring detected", self.number);
                env.control(call, Control::Ring);
            },
            Some(CallState::Ringing) | Some(CallState::Dialing) if self.outgoing => {
                debug!("Line {}: line answered", self.number);
                self.dialing = false;
                self.set_call_state(Leg::Real, CallState::Up, env.now);
                env.control(call, Control::Answer);
            },
            other => warn!("Line {}: ring/off-hook in weird state {:?}", self.number, other),
        }
    }

    /// e911 and CAMA trunks dial the rest once the far end goes off hook.
    pub fn second_stage_dial(&mut self, env: &mut Env) {
        let Some(call) = self.call(Leg::Real) else {
            return
        };
        let rest = self.dial.dest.split_once('/')
            .map(|(_, digits)| digits)
            .unwrap_or(&self.dial.dest);
        let mut digits = if rest.is_empty() {
            "M*2#".to_owned()
        } else {
            format!("M*0{}#", rest)
        };
        let training = self.config.timing.echo_training.unwrap_or(0);
        self.dial.echo_rest = echo_break(&mut digits, training, 401);
        if !self.dial_digits(&digits) {
            warn!("Line {}: second stage dialing failed", self.number);
            self.on_hook();
            env.hangup(call, HangupCause::Failure);
            return
        }
        self.dialing = true;
    }

    /// Seizes a trunk and sends (or defers) the dial string for `dest`.
    pub fn seize_and_dial(&mut self, env: &mut Env, leg: Leg, dest: &str) -> crate::error::Result<()> {
        use crate::error::{EngineError, ResourceError};
        use crate::signalling::Signalling::*;

        let features = &self.config.features;
        if self.family() == Family::Trunk && (features.answer_on_polarity_switch || features.hangup_on_polarity_switch) {
            self.polarity_at = Some(env.now);
        }
        let digits = dest.split_once('/').map(|(_, digits)| digits).unwrap_or("");
        let stripmsd = self.config.timing.stripmsd;
        if digits.len() < stripmsd {
            warn!("Line {}: number '{}' is shorter than stripmsd ({})", self.number, digits, stripmsd);
            return Err(EngineError::InvalidState("number shorter than stripmsd"))
        }

        let mut in_progress = false;
        if let Err(err) = self.hw.set_hook(HookAction::Start) {
            match err {
                ResourceError::InProgress => in_progress = true,
                err => {
                    self.resource_error("seize", err.clone());
                    return Err(err.into())
                }
            }
        }

        let c = digits.get(stripmsd..).unwrap_or("");
        let ani = self.ani();
        let mut dial = match self.signalling {
            FeatD => match &ani {
                Some(ani) => format!("T*{}*{}*", ani, c),
                None => format!("T**{}*", c),
            },
            FeatDMf => match &ani {
                Some(ani) => format!("M*00{}#*{}#", ani, c),
                None => format!("M*02#*{}#", c),
            },
            FeatDMfTa => {
                let group = &self.config.feature_group;
                self.dial.final_dial = Some(format!("M*{}#", c));
                self.dial.winks = 0;
                format!("M*{}{}#", group.ozz, group.cic)
            },
            E911 => "M*911#".to_owned(),
            FgcCama => format!("P{}", c),
            FgcCamaMf | FeatB => format!("M*{}#", c),
            _ if self.config.pulse => format!("P{}w", c),
            _ => format!("T{}w", c),
        };
        self.dial.echo_rest = match self.config.timing.echo_training {
            Some(training) if training > 0 => echo_break(&mut dial, training, 400),
            _ => None,
        };
        self.dial.dest = dest.to_owned();
        self.outgoing = true;
        self.dialed_none = c.is_empty();

        if in_progress || self.signalling.waits_for_wink() {
            debug!("Line {}: deferring dial string '{}'", self.number, dial);
            self.dial.pending = Some(dial);
        } else if !self.dial_digits(&dial) {
            self.on_hook();
            return Err(EngineError::InvalidState("unable to dial"))
        }
        self.dialing = true;
        self.set_call_state(leg, CallState::Dialing, env.now);
        Ok(())
    }

    /// Common far-end hangup on non-station lines.
    pub fn far_end_hangup(&mut self, env: &mut Env) {
        self.set_echo_canceller(false);
        if let Some(call) = self.call(Leg::Real) {
            env.hangup(call, HangupCause::Normal);
        }
    }

    /// Station lines drop reversed polarity when the phone goes on hook.
    pub fn start_polarity_switch(&mut self) {
        let features = &self.config.features;
        if features.answer_on_polarity_switch || features.hangup_on_polarity_switch {
            self.set_polarity(false);
        }
    }

    /// Station lines reverse polarity on answer.
    pub fn answer_polarity_switch(&mut self) {
        if self.config.features.answer_on_polarity_switch {
            self.set_polarity(true);
        }
    }

    /// Station lines restore polarity on hangup.
    pub fn hangup_polarity_switch(&mut self) {
        let features = &self.config.features;
        if features.hangup_on_polarity_switch {
            let reversed = !features.answer_on_polarity_switch;
            self.set_polarity(reversed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_break_withholds_two_characters() {
        let mut dial = "T5551234w".to_owned();
        let rest = echo_break(&mut dial, 400, 400).unwrap();
        assert_eq!(dial, "T555123");
        assert_eq!(rest, "ww4w");
    }

    #[test]
    fn echo_break_caps_the_pause_run() {
        let mut dial = "M*911#".to_owned();
        let rest = echo_break(&mut dial, 100_000, 401).unwrap();
        assert_eq!(dial, "M*91");
        assert_eq!(rest.len(), 19);
        assert!(rest.ends_with("1#"));
    }

    #[test]
    fn short_strings_are_left_alone() {
        let mut dial = "T1w".to_owned();
        assert_eq!(echo_break(&mut dial, 400, 400), None);
        assert_eq!(dial, "T1w");
    }

    #[test]
    fn polarity_answers_once() {
        use std::time::Instant;
        use crate::host::{CallId, CallLeg, NoMessages};
        use crate::line::loopback::LoopbackDevice;
        use crate::line::testing::line_with;

        let device = LoopbackDevice::new();
        let mut line = line_with(&device, "[[line]]\nchannel = 1\nsignalling = \"fxs_ls\"\n[line.features]\nanswer-on-polarity-switch = true\n");
        let call = CallId::next();
        line.attach(Leg::Real, CallLeg::new(call, CallState::Ringing));
        line.owner = Some(Leg::Real);
        let mut env = Env::new(Instant::now(), &device, &NoMessages);

        line.polarity_supervision(&mut env);
        assert_eq!(line.state(Leg::Real), Some(CallState::Up));
        assert_eq!(line.polarity, Polarity::Reversed);
        line.polarity_supervision(&mut env);
        line.polarity_supervision(&mut env);
        assert_eq!(line.polarity, Polarity::Reversed);
        let answers = env.actions().iter().filter(|action| **action == HostAction::Control(call, Control::Answer)).count();
        assert_eq!(answers, 1);
    }
}
