//! Visual message waiting indication towards an idle station: an optional
//! ring pulse alert, a short pause, then the FSK spill.

use std::time::{Duration, Instant};
use log::{debug, info, warn};
use crate::callerid::{CidSpill, SpillKind};
use crate::error::ResourceError;
use crate::line::{HookAction, LineEvent, LineResource};

/// Pause between the end of the alert ring and the spill.
pub const ALERT_PAUSE: Duration = Duration::from_millis(500);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MwiSendState {
    Null,
    /// Ring pulse alert requested.
    SendAlert,
    /// Waiting for the alert ring to finish.
    AlertWait,
    Pause,
    SendSpill,
    Cleanup,
    Done,
}

pub struct MwiSender {
    state: MwiSendState,
    /// Indicator being sent.
    active: bool,
    pause_until: Option<Instant>,
    spill: CidSpill,
}

impl MwiSender {
    /// Starts sending `data` to an on-hook station, alerting it first when `rpas` is set.
    pub fn start(active: bool, data: Vec<u8>, rpas: bool, hw: &mut dyn LineResource) -> Self {
        let mut sender = Self {
            state: MwiSendState::Null,
            active,
            pause_until: None,
            spill: CidSpill::new(SpillKind::Vmwi, data),
        };
        if rpas {
            sender.transition(MwiSendState::SendAlert);
            match hw.set_hook(HookAction::Ring) {
                Ok(()) => sender.transition(MwiSendState::AlertWait),
                Err(err) => {
                    warn!("Unable to send ring pulse alert: {}", err);
                    sender.transition(MwiSendState::SendSpill);
                }
            }
        } else {
            sender.transition(MwiSendState::SendSpill);
        }
        sender
    }

    fn transition(&mut self, state: MwiSendState) {
        if self.state != state {
            debug!("MWI {:?} --> {:?}", self.state, state);
            self.state = state;
        }
    }

    pub fn state(&self) -> MwiSendState {
        self.state
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn is_done(&self) -> bool {
        self.state == MwiSendState::Done
    }

    /// Whether the sender paces itself off audio reads.
    pub fn needs_audio(&self) -> bool {
        matches!(self.state, MwiSendState::Pause | MwiSendState::SendSpill | MwiSendState::Cleanup)
    }

    /// Offers an idle line event to the sender. Returns `true` when it was consumed.
    pub fn on_event(&mut self, hw: &mut dyn LineResource, event: LineEvent, now: Instant) -> Result<bool, ResourceError> {
        match event {
            LineEvent::RingOffHook | LineEvent::WinkFlash => {
                if !self.is_done() {
                    info!("MWI send aborted, phone went off hook");
                    self.transition(MwiSendState::Done);
                }
                Ok(false)
            },
            LineEvent::RingerOff if self.state == MwiSendState::AlertWait => {
                hw.set_hook(HookAction::RingOff)?;
                self.pause_until = Some(now + ALERT_PAUSE);
                self.transition(MwiSendState::Pause);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    /// Advances the sender after `count` samples were read from the line.
    pub fn process(&mut self, hw: &mut dyn LineResource, count: usize, now: Instant) -> Result<(), ResourceError> {
        match self.state {
            MwiSendState::Pause => {
                if self.pause_until.map(|until| now >= until).unwrap_or(true) {
                    self.transition(MwiSendState::SendSpill);
                }
            },
            MwiSendState::SendSpill => {
                let remaining = self.spill.remaining();
                let chunk = &remaining[..count.min(remaining.len())];
                if !chunk.is_empty() {
                    let written = hw.write(chunk)?;
                    self.spill.advance(written);
                }
                if self.spill.is_done() {
                    self.transition(MwiSendState::Cleanup);
                }
            },
            MwiSendState::Cleanup => self.transition(MwiSendState::Done),
            _ => {},
        }
        Ok(())
    }
}
