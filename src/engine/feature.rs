use std::time::Duration;
use log::{debug, info, warn};
use crate::callerid::{call_waiting_spill, caller_id_spill, cid_timestamp, CidSpill, SpillKind};
use crate::codec::call_waiting_alert;
use crate::host::*;
use crate::line::{restore, suspend, Leg, Line, Tone};
use super::Env;

/// Frames between call waiting alerts (10 s).
pub const CW_REPEAT_FRAMES: u32 = 500;
/// Frames the CPE has to acknowledge a CAS alert (500 ms).
pub const CW_ACK_FRAMES: u32 = 25;
/// Frames of digit suppression after a call waiting spill.
pub const SPILL_SUPPRESS_FRAMES: u32 = 5;

impl Line {
    pub fn bounce_guard(&self) -> Duration {
        Duration::from_millis(self.config.timing.bounce_guard_ms)
    }

    pub fn release_leg(&mut self, leg: Leg) {
        if let Err(err) = self.subs.release(leg, self.hw.as_mut()) {
            warn!("Line {}: unable to release {:?}: {}", self.number, leg, err);
        }
    }

    /// Selects the ring cadence the host asked for and the matching caller id ring count.
    pub fn select_cadence(&mut self, leg: Leg) {
        let distinctive = self.subs.owner(leg).and_then(|owner| owner.distinctive);
        if let Err(err) = self.hw.set_cadence(distinctive) {
            self.resource_error("set cadence", err);
        }
        self.cid_rings = distinctive
            .and_then(|index| index.checked_sub(1))
            .and_then(|index| self.patterns.get(index))
            .and_then(|pattern| pattern.cid_rings)
            .unwrap_or(self.config.callerid.cid_rings);
    }

    /// Alerts the subscriber to the call on the CallWait leg.
    pub fn start_call_waiting(&mut self) {
        self.cw.repeat_frames = CW_REPEAT_FRAMES;
        if self.spill.is_some() {
            warn!("Line {}: spill already active, replacing it with the call waiting alert", self.number);
            self.cancel_spill();
        }
        let with_cas = self.cw.rings == 0 && self.cid.callwaiting_callerid;
        let spill = if with_cas && !self.cid.callwaiting_ack {
            let caller = self.cw.caller.clone().unwrap_or_default();
            let data = call_waiting_spill(&caller, self.cid.signalling, self.law, &cid_timestamp(chrono::Local::now()));
            CidSpill::new(SpillKind::CallWaitingCallerId, data)
        } else {
            CidSpill::new(SpillKind::CallWaitingAlert { cas: with_cas }, call_waiting_alert(with_cas, self.law))
        };
        self.cw.cas_pending = with_cas;
        info!("Line {}: call waiting alert {} ({} samples)", self.number, self.cw.rings + 1, spill.len());
        self.spill = Some(spill);
        suspend(self, Leg::Real);
    }

    pub fn stop_call_waiting(&mut self) {
        let acking = self.cw.ack_frames > 0;
        self.cw.repeat_frames = 0;
        self.cw.ack_frames = 0;
        self.suppress_frames = 0;
        let alerting = matches!(
            self.spill.as_ref().map(|spill| spill.kind()),
            Some(SpillKind::CallWaitingAlert { .. } | SpillKind::CallWaitingCallerId)
        );
        if alerting {
            self.cancel_spill();
        }
        if alerting || acking {
            restore(self, Leg::Real);
        }
    }

    /// The CPE acknowledged the CAS alert: send it the waiting caller.
    pub(super) fn send_call_waiting_cid(&mut self) {
        self.cw.ack_frames = 0;
        self.cw.cas_pending = false;
        let caller = self.cw.caller.clone().unwrap_or_default();
        let data = caller_id_spill(&caller, self.cid.signalling, self.law, &cid_timestamp(chrono::Local::now()), true);
        self.spill = Some(CidSpill::new(SpillKind::CallWaitingCallerId, data));
    }

    /// Hangs up both legs of a three-way call after a bounced flash.
    pub fn drop_bounced_legs(&mut self, env: &mut Env) {
        info!("Line {}: flash bounce, hanging up both legs", self.number);
        for leg in [Leg::ThreeWay, Leg::Real] {
            if let Some(call) = self.call(leg) {
                if let Err(err) = self.hangup(env, call) {
                    warn!("Line {}: unable to hang up {}: {}", self.number, call, err);
                }
                env.hangup(call, HangupCause::Normal);
            }
        }
    }

    /// Hands the ThreeWay party over to the Real call's far end.
    pub fn attempt_transfer(&mut self, env: &mut Env, hold: bool) {
        match (self.call(Leg::ThreeWay), self.call(Leg::Real)) {
            (Some(from), Some(to)) => {
                info!("Line {}: transferring {} to {}", self.number, from, to);
                env.push(HostAction::Transfer { from, to, hold });
            },
            _ => warn!("Line {}: nothing to transfer", self.number),
        }
    }

    /// Hook flash on a station: call waiting, three-way calling and transfer.
    pub fn feature_flash(&mut self, env: &mut Env) {
        let previous = self.flash_at.replace(env.now);
        self.cancel_spill();
        self.cw.cas_pending = false;

        let bounced = previous
            .map(|at| env.now.saturating_duration_since(at) < self.bounce_guard())
            .unwrap_or(false);
        if self.subs.has_owner(Leg::ThreeWay) && bounced {
            self.drop_bounced_legs(env);
            return
        }

        if self.subs.has_owner(Leg::CallWait) {
            self.subs.swap(Leg::Real, Leg::CallWait);
            self.play_tone(Leg::Real, None);
            self.owner = Some(Leg::Real);
            debug!("Line {}: making {:?} the new owner", self.number, self.call(Leg::Real));
            if let Some(call) = self.call(Leg::Real) {
                if self.state(Leg::Real) == Some(CallState::Ringing) {
                    env.control(call, Control::Answer);
                    self.set_call_state(Leg::Real, CallState::Up, env.now);
                }
            }
            self.stop_call_waiting();
            if !self.subs[Leg::CallWait].in_three_way {
                if let Some(held) = self.call(Leg::CallWait) {
                    env.control(held, Control::Hold);
                }
            }
            if let Some(call) = self.call(Leg::Real) {
                env.control(call, Control::Unhold);
            }
        } else if !self.subs.has_owner(Leg::ThreeWay) {
            if !self.config.features.three_way_calling {
                if let Some(call) = self.call(Leg::Real) {
                    env.control(call, Control::Flash);
                }
                return
            }
            if self.master.is_some() || !self.slaves.is_empty() {
                debug!("Line {}: no three-way calling while linked", self.number);
                return
            }
            let pbx = self.subs.owner(Leg::Real).map(|owner| owner.pbx).unwrap_or(false);
            if !pbx && !matches!(self.state(Leg::Real), Some(CallState::Up | CallState::Ring)) {
                debug!("Line {}: flash ignored in {:?}", self.number, self.state(Leg::Real));
                return
            }
            if let Err(err) = self.subs.allocate(Leg::ThreeWay, env.device) {
                warn!("Line {}: unable to allocate three-way subchannel: {}", self.number, err);
                return
            }
            let mut call = CallLeg::new(CallId::next(), CallState::Reserved);
            call.since = env.now;
            let id = call.id;
            self.attach(Leg::ThreeWay, call);
            self.subs.swap(Leg::Real, Leg::ThreeWay);
            self.set_echo_canceller(false);
            self.play_tone(Leg::Real, Some(Tone::DialRecall));
            self.owner = Some(Leg::Real);
            env.originate(Origination {
                call: id,
                line: self.number,
                leg: Leg::Real,
                state: CallState::Reserved,
                context: self.config.context.clone(),
                start_pbx: false,
            });
            if let Some(held) = self.call(Leg::ThreeWay) {
                info!("Line {}: started three-way call, holding {}", self.number, held);
                env.control(held, Control::Hold);
            }
        } else if self.subs[Leg::ThreeWay].in_three_way {
            // Drop the last party
            if self.state(Leg::Real) != Some(CallState::Up) && self.state(Leg::ThreeWay) == Some(CallState::Up) {
                self.subs.swap(Leg::Real, Leg::ThreeWay);
            }
            if let Some(third) = self.call(Leg::ThreeWay) {
                info!("Line {}: dumping three-way party {}", self.number, third);
                env.hangup(third, HangupCause::Normal);
            }
            self.subs[Leg::Real].in_three_way = false;
            self.subs[Leg::ThreeWay].in_three_way = false;
        } else {
            let state = self.state(Leg::Real);
            let pbx = self.subs.owner(Leg::Real).map(|owner| owner.pbx).unwrap_or(false);
            let busy_ok = self.config.features.transfer_to_busy || state != Some(CallState::Busy);
            if (pbx || state == Some(CallState::Up)) && busy_ok {
                info!("Line {}: building conference call", self.number);
                self.subs[Leg::Real].in_three_way = true;
                self.subs[Leg::ThreeWay].in_three_way = true;
                let other = if state == Some(CallState::Up) {
                    self.subs.swap(Leg::Real, Leg::ThreeWay);
                    Leg::Real
                } else {
                    Leg::ThreeWay
                };
                if let Some(call) = self.call(other) {
                    env.control(call, Control::Unhold);
                }
                self.owner = Some(Leg::Real);
            } else {
                info!("Line {}: dumping incomplete three-way call", self.number);
                self.subs.swap(Leg::Real, Leg::ThreeWay);
                if let Some(third) = self.call(Leg::ThreeWay) {
                    env.hangup(third, HangupCause::Normal);
                }
                self.owner = Some(Leg::Real);
                if let Some(call) = self.call(Leg::Real) {
                    env.control(call, Control::Unhold);
                }
                self.set_echo_canceller(true);
            }
        }
        self.update_conf();
    }
}
