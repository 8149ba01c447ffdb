use std::time::Duration;
use log::{debug, info, warn};
use crate::callerid::{cid_timestamp, vmwi_spill, CidSignalling, CidStart, InboundSession};
use crate::codec::FskStandard;
use crate::host::*;
use crate::line::{Leg, Line, LineEvent, Polarity};
use crate::mwi::MwiSender;
use crate::signalling::Family;
use super::Env;

/// Quiet time after DTMF energy before sampling again.
const ENERGY_HOLDOFF: Duration = Duration::from_millis(500);

impl Line {
    /// Events on a line with no calls.
    pub fn handle_idle_event(&mut self, env: &mut Env, event: LineEvent) {
        if self.offer_to_mwi(env, event) {
            return
        }
        let behavior = self.behavior;
        match event {
            LineEvent::RingOffHook | LineEvent::WinkFlash if self.in_alarm => {
                debug!("Line {}: ignoring {:?} in alarm", self.number, event);
            },
            LineEvent::RingOffHook => behavior.seized(self, env),
            LineEvent::WinkFlash if self.family() == Family::Station => behavior.seized(self, env),
            LineEvent::OnHook | LineEvent::Alarm => {
                if event == LineEvent::Alarm {
                    warn!("Line {} in alarm", self.number);
                    self.in_alarm = true;
                }
                self.set_echo_canceller(false);
                self.play_tone(Leg::Real, None);
                self.on_hook();
                if self.family() == Family::Station {
                    self.start_polarity_switch();
                    self.on_hook_since = Some(env.now);
                }
            },
            LineEvent::NoAlarm => {
                info!("Line {} alarm cleared", self.number);
                self.in_alarm = false;
            },
            LineEvent::Polarity if self.family() == Family::Trunk => {
                if self.config.features.hangup_on_polarity_switch {
                    self.polarity = Polarity::Reversed;
                }
                if matches!(self.cid.start, CidStart::Polarity | CidStart::PolarityIn) {
                    self.polarity = Polarity::Reversed;
                    info!("Line {}: polarity reversal, looking for caller id", self.number);
                    let session = InboundSession::before_ring(self.inbound_policy(), env.now);
                    self.start_inbound(env, CallState::PreRing, Some(session));
                }
            },
            LineEvent::DtmfCid if self.family() == Family::Trunk && self.cid.start == CidStart::DtmfNoAlert => {
                info!("Line {}: DTMF energy, looking for caller id", self.number);
                let session = InboundSession::before_ring(self.inbound_policy(), env.now);
                self.start_inbound(env, CallState::PreRing, Some(session));
            },
            LineEvent::Removed => {
                info!("Line {} removed by the driver", self.number);
                self.removed = true;
            },
            LineEvent::NeonMwiActive => env.push(HostAction::Mwi { line: self.number, active: true }),
            LineEvent::NeonMwiInactive => env.push(HostAction::Mwi { line: self.number, active: false }),
            other => debug!("Line {}: ignoring {:?} while idle", self.number, other),
        }
    }

    /// Lets a running message waiting send see the event first.
    fn offer_to_mwi(&mut self, env: &mut Env, event: LineEvent) -> bool {
        let Some(sender) = self.mwi.as_mut() else {
            return false
        };
        let result = sender.on_event(self.hw.as_mut(), event, env.now);
        let done = sender.is_done();
        if done {
            self.mwi = None;
        }
        match result {
            Ok(consumed) => consumed,
            Err(err) => {
                self.resource_error("mwi alert", err);
                self.mwi = None;
                false
            }
        }
    }

    /// Far end seized a trunk: an inbound call.
    pub fn inbound_ring(&mut self, env: &mut Env) {
        if self.family() == Family::Trunk {
            self.ringt = self.ringt_base;
        }
        let state = if matches!(self.cid.start, CidStart::PolarityIn | CidStart::DtmfNoAlert) {
            CallState::PreRing
        } else {
            CallState::Ring
        };
        let session = (self.cid.use_callerid || !self.patterns.is_empty())
            .then(|| InboundSession::after_ring(self.inbound_policy(), env.now));
        self.start_inbound(env, state, session);
    }

    fn start_inbound(&mut self, env: &mut Env, state: CallState, session: Option<InboundSession>) {
        let mut call = CallLeg::new(CallId::next(), state);
        call.since = env.now;
        let id = call.id;
        self.mwi = None;
        self.attach(Leg::Real, call);
        self.owner = Some(Leg::Real);
        let start_pbx = session.is_none();
        self.inbound = session;
        env.originate(Origination {
            call: id,
            line: self.number,
            leg: Leg::Real,
            state,
            context: self.config.context.clone(),
            start_pbx,
        });
    }

    /// Whether the monitor should read audio from this idle line.
    pub fn wants_idle_audio(&self) -> bool {
        if self.is_owned() {
            return false
        }
        let energy = self.family() == Family::Trunk && self.cid.start == CidStart::DtmfNoAlert;
        energy || self.mwi.as_ref().map(|sender| sender.needs_audio()).unwrap_or(false)
    }

    /// Reads one frame from an idle line to pace the MWI sender or watch for DTMF energy.
    pub fn service_idle_audio(&mut self, env: &mut Env, frame: usize, dtmf_level: u32) {
        let mut buf = vec![self.law.silence(); frame];
        let count = match self.hw.read(&mut buf) {
            Ok(count) => count,
            Err(err) => {
                self.resource_error("idle read", err);
                return
            }
        };

        if let Some(sender) = self.mwi.as_mut() {
            let result = sender.process(self.hw.as_mut(), count, env.now);
            if sender.is_done() {
                debug!("Line {}: message waiting send complete", self.number);
                self.mwi = None;
            }
            if let Err(err) = result {
                self.resource_error("mwi spill", err);
                self.mwi = None;
            }
            return
        }

        if self.cid.start != CidStart::DtmfNoAlert {
            return
        }
        if self.energy_holdoff.map(|until| env.now < until).unwrap_or(false) {
            return
        }
        let samples = self.law.decode_all(&buf[..count]);
        if samples.is_empty() {
            return
        }
        let level = samples.iter().map(|s| (*s as i32).unsigned_abs()).sum::<u32>() / samples.len() as u32;
        if level > dtmf_level {
            debug!("Line {}: DTMF energy {} over {}", self.number, level, dtmf_level);
            self.energy_holdoff = Some(env.now + ENERGY_HOLDOFF);
            self.handle_idle_event(env, LineEvent::DtmfCid);
        }
    }

    /// Compares the mailbox against the last indication sent and starts a
    /// message waiting send when it changed. Returns whether the mailbox was
    /// consulted at all.
    pub fn check_mwi(&mut self, env: &mut Env, quiet: Duration) -> bool {
        if self.family() != Family::Station || self.is_owned() || self.mwi.is_some() {
            return false
        }
        let Some(mailbox) = self.config.mwi.mailbox.clone() else {
            return false
        };
        let settled = self.on_hook_since
            .map(|since| env.now.saturating_duration_since(since) >= quiet)
            .unwrap_or(false);
        if !settled || self.is_off_hook() {
            return false
        }
        let active = env.store.message_count(&mailbox) > 0;
        if self.msg_state == Some(active) {
            return true
        }
        self.msg_state = Some(active);
        info!("Line {}: mailbox {} {}", self.number, mailbox, if active { "has messages" } else { "is empty" });
        env.push(HostAction::Mwi { line: self.number, active });

        let (send_fsk, send_rpas) = (self.config.mwi.send_fsk, self.config.mwi.send_rpas);
        if !send_fsk && !send_rpas {
            return true
        }
        let standard = match self.cid.signalling {
            CidSignalling::Fsk(standard) => standard,
            CidSignalling::Dtmf => FskStandard::Bell202,
        };
        let data = if send_fsk {
            vmwi_spill(active, self.mwi_type, &self.cid.identity, standard, self.law, &cid_timestamp(chrono::Local::now()))
        } else {
            vec![]
        };
        self.mwi = Some(MwiSender::start(active, data, send_rpas, self.hw.as_mut()));
        true
    }
}
