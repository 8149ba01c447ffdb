use log::{debug, info, warn};
use crate::engine::Env;
use crate::error::{EngineError, Result};
use crate::host::{CallLeg, CallState, Control, HangupCause, Origination};
use crate::line::{HookAction, Leg, Line, Tone};
use super::{dest_digits, Family, SignallingBehavior};

/// Loop, ground and kewl start lines driving an analog telephone.
pub struct Station;

impl SignallingBehavior for Station {
    fn family(&self) -> Family {
        Family::Station
    }

    fn on_hook(&self, line: &mut Line, env: &mut Env) {
        line.start_polarity_switch();
        line.on_hook_since = Some(env.now);
        line.msg_state = None;

        let Some(call) = line.call(Leg::Real) else {
            return
        };
        if line.subs.has_owner(Leg::CallWait) {
            // Ring the phone back for the waiting call
            line.subs.swap(Leg::CallWait, Leg::Real);
            line.release_leg(Leg::CallWait);
            line.stop_call_waiting();
            line.owner = None;
            if line.state(Leg::Real) != Some(CallState::Up) {
                line.dialing = true;
            }
            info!("Line {} still has a waiting call, ringing phone", line.number);
            line.ring();
        } else if line.subs.has_owner(Leg::ThreeWay) {
            let bounced = line.flash_at
                .map(|at| env.now.saturating_duration_since(at) < line.bounce_guard())
                .unwrap_or(false);
            let real_state = line.state(Leg::Real);
            let pbx = line.subs.owner(Leg::Real).map(|owner| owner.pbx).unwrap_or(false);
            if bounced {
                line.drop_bounced_legs(env);
                return
            } else if pbx || real_state == Some(CallState::Up) {
                if line.config.features.transfer {
                    let held = !line.subs[Leg::ThreeWay].in_three_way;
                    line.subs[Leg::Real].in_three_way = false;
                    line.subs[Leg::ThreeWay].in_three_way = false;
                    if !line.config.features.transfer_to_busy && real_state == Some(CallState::Busy) {
                        line.subs.swap(Leg::ThreeWay, Leg::Real);
                        line.owner = None;
                        line.ring();
                    } else {
                        line.attempt_transfer(env, held);
                        return
                    }
                } else if let Some(third) = line.call(Leg::ThreeWay) {
                    env.hangup(third, HangupCause::Normal);
                }
            } else {
                line.subs.swap(Leg::ThreeWay, Leg::Real);
                line.owner = None;
                line.ring();
            }
        }
        line.set_echo_canceller(false);
        env.hangup(call, HangupCause::Normal);
    }

    fn ring_off_hook(&self, line: &mut Line, env: &mut Env) {
        let Some(call) = line.call(Leg::Real) else {
            return
        };
        match line.state(Leg::Real) {
            Some(CallState::Ringing) => {
                line.set_echo_canceller(true);
                line.train_echo_canceller();
                line.subs[Leg::Real].pending.ringing = false;
                line.off_hook();
                line.cancel_spill();
                line.dialing = false;
                line.cw.cas_pending = false;
                debug!("Line {} answered", line.number);
                if let Some(digits) = line.dial.pending.take() {
                    if !line.dial_digits(&digits) {
                        env.hangup(call, HangupCause::Failure);
                        return
                    }
                    debug!("Line {}: sent deferred digit string '{}'", line.number, digits);
                    line.dialing = true;
                    line.set_call_state(Leg::Real, CallState::Dialing, env.now);
                } else {
                    line.set_call_state(Leg::Real, CallState::Up, env.now);
                    env.control(call, Control::Answer);
                    line.answer_polarity_switch();
                }
            },
            Some(CallState::Down) => {
                line.set_call_state(Leg::Real, CallState::Ring, env.now);
                env.control(call, Control::OffHook);
            },
            Some(CallState::Up) => {
                // Back from a call waiting ring-back
                line.off_hook();
                env.control(call, Control::Unhold);
            },
            Some(CallState::Reserved) => {
                let tone = if line.has_messages(env) { Tone::Stutter } else { Tone::DialTone };
                line.play_tone(Leg::Real, Some(tone));
            },
            other => warn!("Line {}: phone off hook in weird state {:?}", line.number, other),
        }
    }

    fn wink_flash(&self, line: &mut Line, env: &mut Env) {
        line.feature_flash(env);
    }

    fn polarity(&self, line: &mut Line, _env: &mut Env) {
        debug!("Line {}: ignoring polarity reversal on a station", line.number);
    }

    fn hook_complete(&self, line: &mut Line, _env: &mut Env) {
        debug!("Line {}: hook complete", line.number);
    }

    fn call(&self, line: &mut Line, env: &mut Env, leg: Leg, dest: &str) -> Result<()> {
        let Some(call) = line.call(leg) else {
            return Err(EngineError::NotOwner(line.number))
        };
        if leg == Leg::Real {
            line.dialing = true;
            line.select_cadence(leg);
            line.dial.pending = match dest_digits(dest) {
                Some(digits) if digits.len() < line.config.timing.stripmsd => {
                    warn!("Number '{}' is shorter than stripmsd ({})", digits, line.config.timing.stripmsd);
                    None
                },
                Some(digits) => {
                    debug!("Line {}: deferred dial string {}", line.number, digits);
                    Some(format!("Tw{}", digits))
                },
                None => None,
            };
            line.rings = 0;
            if !line.ring() {
                return Err(EngineError::InvalidState("unable to ring phone"))
            }
            line.set_call_state(leg, CallState::Ringing, env.now);
        } else {
            line.cw.caller = line.subs.owner(leg).and_then(|owner| owner.caller.clone());
            line.cw.rings = 0;
            line.set_call_state(leg, CallState::Ringing, env.now);
            line.start_call_waiting();
            if !line.play_tone(leg, Some(Tone::Ringback)) {
                warn!("Line {}: unable to generate call waiting ring-back", line.number);
            }
        }
        env.control(call, Control::Ringing);
        Ok(())
    }

    fn seized(&self, line: &mut Line, env: &mut Env) {
        if !line.set_hook(HookAction::OffHook) {
            return
        }
        // Taking the phone off hook ends any visual message waiting spill
        line.cancel_spill();
        line.mwi = None;
        let mut call = CallLeg::new(crate::host::CallId::next(), CallState::Reserved);
        call.since = env.now;
        let id = call.id;
        let immediate = line.config.immediate;
        if immediate {
            line.set_echo_canceller(true);
            call.state = CallState::Ring;
            call.pbx = true;
        }
        let state = call.state;
        line.attach(Leg::Real, call);
        line.owner = Some(Leg::Real);
        let tone = if immediate {
            Tone::Ringback
        } else if line.has_messages(env) {
            Tone::Stutter
        } else {
            Tone::DialTone
        };
        line.play_tone(Leg::Real, Some(tone));
        env.originate(Origination {
            call: id,
            line: line.number,
            leg: Leg::Real,
            state,
            context: line.config.context.clone(),
            start_pbx: immediate,
        });
    }
}
