//! The hook/flash/ring state machine: everything that happens to a locked
//! `Line` in response to line events and host requests.

mod event;
mod feature;
mod call;
mod idle;
mod audio;

use std::time::Instant;
use log::{debug, info, trace, warn};
use crate::callerid::SessionOutcome;
use crate::host::*;
use crate::line::{Event, Leg, LineDevice, LineEvent, Line, SyntheticEvent};
use crate::signalling::Family;

/// Events handled per line per pass, so one chatty line can't starve the rest.
pub const MAX_EVENTS_PER_PASS: usize = 16;

/// What the engine needs from outside a line while it holds the line's lock.
/// Host effects are queued here and delivered once the lock is released.
pub struct Env<'a> {
    /// Time of the current pass; every timing rule reads this rather than the clock.
    pub now: Instant,
    pub device: &'a dyn LineDevice,
    pub store: &'a dyn MessageStore,
    actions: Vec<HostAction>,
}

impl<'a> Env<'a> {
    pub fn new(now: Instant, device: &'a dyn LineDevice, store: &'a dyn MessageStore) -> Self {
        Self {
            now,
            device,
            store,
            actions: vec![],
        }
    }

    pub fn push(&mut self, action: HostAction) {
        trace!("Queued {:?}", action);
        self.actions.push(action);
    }

    pub fn control(&mut self, call: CallId, control: Control) {
        self.push(HostAction::Control(call, control));
    }

    pub fn hangup(&mut self, call: CallId, cause: HangupCause) {
        self.push(HostAction::Hangup(call, cause));
    }

    pub fn originate(&mut self, origination: Origination) {
        self.push(HostAction::Originate(origination));
    }

    pub fn actions(&self) -> &[HostAction] {
        &self.actions
    }

    pub fn take_actions(&mut self) -> Vec<HostAction> {
        std::mem::take(&mut self.actions)
    }
}

impl Line {
    /// Drains up to `max` pending events from the line.
    pub fn process_events(&mut self, env: &mut Env, max: usize) -> usize {
        let mut handled = 0;
        while handled < max {
            let Some(event) = self.next_event() else {
                break
            };
            self.handle_event(env, event);
            handled += 1;
        }
        self.check_failed(env);
        handled
    }

    /// Single entry point for hardware and synthetic events.
    pub fn handle_event(&mut self, env: &mut Env, event: Event) {
        let event = match event {
            Event::Synthetic(SyntheticEvent::SetupFailed(call)) => {
                self.setup_failed(env, call);
                return
            },
            Event::Synthetic(SyntheticEvent::Flash) => LineEvent::WinkFlash,
            Event::Synthetic(SyntheticEvent::OnHook) => LineEvent::OnHook,
            Event::Line(event) => event,
        };
        debug!("Line {}: {:?}", self.number, event);

        if !self.is_owned() {
            self.handle_idle_event(env, event);
            return
        }

        if self.inbound.is_some() && self.session_event(env, event) {
            return
        }

        if self.owner.is_none() && self.family() != Family::Radio {
            self.exception(env, event);
            return
        }

        let behavior = self.behavior;
        match event {
            LineEvent::PulseDigit(digit) => self.handle_digit(env, digit, false),
            LineEvent::DtmfDown(digit) => self.handle_digit(env, digit, true),
            LineEvent::DtmfUp(digit) => self.handle_digit(env, digit, false),
            LineEvent::Alarm => {
                warn!("Line {} in alarm", self.number);
                self.in_alarm = true;
                behavior.on_hook(self, env);
            },
            LineEvent::NoAlarm => {
                info!("Line {} alarm cleared", self.number);
                self.in_alarm = false;
            },
            LineEvent::OnHook => behavior.on_hook(self, env),
            LineEvent::RingOffHook if self.in_alarm => debug!("Line {}: ignoring off-hook in alarm", self.number),
            LineEvent::RingOffHook => behavior.ring_off_hook(self, env),
            LineEvent::WinkFlash if self.in_alarm => debug!("Line {}: ignoring flash in alarm", self.number),
            LineEvent::WinkFlash => behavior.wink_flash(self, env),
            LineEvent::RingBegin => behavior.ring_begin(self, env),
            LineEvent::DialComplete => self.dial_complete(env),
            LineEvent::RingerOn => {},
            LineEvent::RingerOff => self.ringer_off(env),
            LineEvent::HookComplete => behavior.hook_complete(self, env),
            LineEvent::Polarity => behavior.polarity(self, env),
            LineEvent::PulseStart => {
                let pbx = self.subs.owner(Leg::Real).map(|owner| owner.pbx).unwrap_or(false);
                if !pbx {
                    self.play_tone(Leg::Real, None);
                }
            },
            LineEvent::EcDisabled => {
                debug!("Line {}: echo canceller disabled by the driver", self.number);
                self.echo_on = false;
            },
            LineEvent::DtmfCid => {},
            LineEvent::Removed => {
                info!("Line {} removed by the driver", self.number);
                self.removed = true;
            },
            LineEvent::NeonMwiActive => env.push(HostAction::Mwi { line: self.number, active: true }),
            LineEvent::NeonMwiInactive => env.push(HostAction::Mwi { line: self.number, active: false }),
        }
    }

    /// Routes an event through the inbound caller id session. Returns `true`
    /// when the session consumed it.
    fn session_event(&mut self, env: &mut Env, event: LineEvent) -> bool {
        let Some(session) = self.inbound.as_mut() else {
            return false
        };
        let (outcome, consumed) = match event {
            LineEvent::RingOffHook => {
                let outcome = session.on_ring(env.now);
                if self.state(Leg::Real) == Some(CallState::PreRing) {
                    self.set_call_state(Leg::Real, CallState::Ring, env.now);
                }
                self.ringt = self.ringt_base;
                (outcome, true)
            },
            LineEvent::PulseDigit(_) | LineEvent::DtmfDown(_) | LineEvent::DtmfUp(_)
            | LineEvent::RingerOn | LineEvent::RingerOff | LineEvent::PulseStart | LineEvent::EcDisabled => (None, true),
            LineEvent::OnHook | LineEvent::Alarm => (None, false),
            _ => (session.interrupt(env.now), false),
        };
        if let Some(outcome) = outcome {
            self.session_outcome(env, outcome);
        }
        consumed
    }

    /// Times out the inbound session.
    pub fn poll_inbound(&mut self, env: &mut Env) {
        let Some(session) = self.inbound.as_mut() else {
            return
        };
        if let Some(outcome) = session.poll(env.now) {
            self.session_outcome(env, outcome);
        }
    }

    fn session_outcome(&mut self, env: &mut Env, outcome: SessionOutcome) {
        self.inbound = None;
        let Some(call) = self.call(Leg::Real) else {
            return
        };
        match outcome {
            SessionOutcome::Complete { caller, context } => {
                if let Some(active) = caller.as_ref().and_then(|caller| caller.mwi) {
                    env.push(HostAction::Mwi { line: self.number, active });
                }
                if let Some(owner) = self.subs.owner_mut(Leg::Real) {
                    owner.caller = caller.clone();
                }
                info!("Line {}: inbound caller {:?}, context {:?}", self.number, caller, context);
                env.push(HostAction::CallerId { call, caller, context });
            },
            SessionOutcome::Abandon(reason) => {
                info!("Line {}: abandoning inbound call: {}", self.number, reason);
                env.hangup(call, HangupCause::Normal);
            }
        }
    }

    /// Hangs up every call on a line that lost its resource.
    pub fn check_failed(&mut self, env: &mut Env) {
        if !self.failed {
            return
        }
        self.failed = false;
        let calls: Vec<CallId> = self.subs.owned().filter_map(|leg| self.call(leg)).collect();
        for call in calls {
            warn!("Line {}: hanging up {} after resource failure", self.number, call);
            env.hangup(call, HangupCause::Failure);
        }
    }

    /// Whether the line's mailbox has messages waiting.
    pub fn has_messages(&self, env: &Env) -> bool {
        self.config.mwi.mailbox.as_deref()
            .map(|mailbox| env.store.message_count(mailbox) > 0)
            .unwrap_or(false)
    }
}
