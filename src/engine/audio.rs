use log::{debug, info, trace};
use crate::callerid::SpillKind;
use crate::error::{EngineError, Result};
use crate::host::*;
use crate::line::{restore, Leg, Line};
use super::{Env, MAX_EVENTS_PER_PASS};
use super::feature::{CW_ACK_FRAMES, SPILL_SUPPRESS_FRAMES};

impl Line {
    /// Reads one frame of audio for `call` into `buf`.
    ///
    /// Reading the Real leg is what drives the per-frame timers: ring timeout,
    /// call waiting repeats and acknowledgement windows, spill output and the
    /// inbound caller id session. While digits or a spill go out the caller
    /// gets silence.
    pub fn read(&mut self, env: &mut Env, call: CallId, buf: &mut [u8]) -> Result<usize> {
        let leg = self.subs.find(call).ok_or(EngineError::NotOwner(self.number))?;
        self.deliver_pending(env, leg);
        self.process_events(env, MAX_EVENTS_PER_PASS);

        let silence = self.law.silence();
        let Some(leg) = self.subs.find(call) else {
            buf.fill(silence);
            return Ok(buf.len())
        };
        if leg == Leg::Real {
            self.tick_frame(env);
        }

        let result = match self.subs[leg].resource(self.hw.as_mut()) {
            Some(resource) => resource.read(buf),
            None => return Err(EngineError::InvalidState("leg has no audio path")),
        };
        let count = match result {
            Ok(count) => count,
            Err(err) => {
                self.resource_error("read", err.clone());
                self.check_failed(env);
                return Err(err.into())
            }
        };

        if leg == Leg::Real {
            if let Some(session) = self.inbound.as_mut().filter(|session| session.wants_audio()) {
                let samples = self.law.decode_all(&buf[..count]);
                if let Some(outcome) = session.feed_audio(&samples, env.now) {
                    self.session_outcome(env, outcome);
                }
            }
            self.poll_inbound(env);
            self.send_spill(count);
            if self.dialing || self.spill.is_some() || self.cw.ack_frames > 0 {
                buf[..count].fill(silence);
            }
        }
        self.check_failed(env);
        Ok(count)
    }

    /// Writes audio from `call` to its leg.
    pub fn write(&mut self, call: CallId, data: &[u8]) -> Result<usize> {
        let leg = self.subs.find(call).ok_or(EngineError::NotOwner(self.number))?;
        if leg == Leg::Real && (self.dialing || self.spill.is_some()) {
            trace!("Line {}: dropping {} samples while signalling", self.number, data.len());
            return Ok(0)
        }
        let result = match self.subs[leg].resource(self.hw.as_mut()) {
            Some(resource) => resource.write(data),
            None => return Err(EngineError::InvalidState("leg has no audio path")),
        };
        match result {
            Ok(count) => Ok(count),
            Err(err) => {
                self.resource_error("write", err.clone());
                Err(err.into())
            }
        }
    }

    /// Per-frame countdowns, run once for every Real leg read.
    fn tick_frame(&mut self, env: &mut Env) {
        if self.ringt > 0 {
            self.ringt -= 1;
            if self.ringt == 0 {
                if let Some(call) = self.call(Leg::Real) {
                    info!("Line {}: ring timeout on {}", self.number, call);
                    env.hangup(call, HangupCause::Normal);
                }
            }
        }
        if self.cw.repeat_frames > 0 {
            self.cw.repeat_frames -= 1;
            if self.cw.repeat_frames == 0 && self.subs.has_owner(Leg::CallWait) {
                self.cw.rings += 1;
                self.start_call_waiting();
            }
        }
        if self.cw.ack_frames > 0 {
            self.cw.ack_frames -= 1;
            if self.cw.ack_frames == 0 {
                info!("Line {}: no acknowledgement, CPE does not support call waiting caller id", self.number);
                self.cw.cas_pending = false;
                restore(self, Leg::Real);
            }
        }
        if self.suppress_frames > 0 {
            self.suppress_frames -= 1;
        }
    }

    /// Writes as much of the active spill as was just read, keeping the line in step.
    fn send_spill(&mut self, count: usize) {
        let result = {
            let Some(spill) = self.spill.as_mut() else {
                return
            };
            let remaining = spill.remaining();
            let chunk = &remaining[..count.min(remaining.len())];
            match self.hw.write(chunk) {
                Ok(written) => {
                    spill.advance(written);
                    Ok(spill.is_done())
                },
                Err(err) => Err(err),
            }
        };
        match result {
            Ok(true) => self.finish_spill(),
            Ok(false) => {},
            Err(err) => {
                self.resource_error("write spill", err);
                self.cancel_spill();
            }
        }
    }

    /// A spill went out completely.
    fn finish_spill(&mut self) {
        let Some(spill) = self.spill.take() else {
            return
        };
        debug!("Line {}: {:?} spill complete ({} samples)", self.number, spill.kind(), spill.len());
        match spill.kind() {
            SpillKind::CallerId | SpillKind::Vmwi => {},
            SpillKind::CallWaitingAlert { cas: true } => {
                self.cw.ack_frames = CW_ACK_FRAMES;
            },
            SpillKind::CallWaitingAlert { cas: false } | SpillKind::CallWaitingCallerId => {
                restore(self, Leg::Real);
                self.suppress_frames = SPILL_SUPPRESS_FRAMES;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;
    use super::*;
    use crate::callerid::CidSpill;
    use crate::line::loopback::LoopbackDevice;
    use crate::line::testing::*;
    use crate::line::LineEvent;
    use super::super::feature::CW_REPEAT_FRAMES;

    fn answered(device: &LoopbackDevice) -> (Line, CallId) {
        let mut line = station_line(device, 1);
        let call = CallLeg::new(CallId::next(), CallState::Up);
        let id = call.id;
        line.attach(Leg::Real, call);
        line.owner = Some(Leg::Real);
        (line, id)
    }

    #[test]
    fn spill_plays_out_while_the_caller_hears_silence() {
        let device = LoopbackDevice::new();
        let (mut line, call) = answered(&device);
        let probe = device.probe(1).unwrap();
        line.spill = Some(CidSpill::new(SpillKind::CallerId, vec![0x11; 400]));
        probe.push_audio(&[0x55; 160]);

        let mut env = Env::new(Instant::now(), &device, &NoMessages);
        let mut buf = [0u8; 160];
        assert_eq!(line.read(&mut env, call, &mut buf).unwrap(), 160);
        assert!(buf.iter().all(|b| *b == line.law.silence()));
        assert_eq!(probe.written(), 160);
        assert_eq!(line.write(call, &[0x22; 160]).unwrap(), 0);

        line.read(&mut env, call, &mut buf).unwrap();
        line.read(&mut env, call, &mut buf).unwrap();
        assert!(line.spill.is_none());
        assert_eq!(probe.take_written(), vec![0x11; 400]);
        assert_eq!(line.write(call, &[0x22; 160]).unwrap(), 160);
    }

    #[test]
    fn acknowledged_alert_sends_the_waiting_caller() {
        let device = LoopbackDevice::new();
        let (mut line, call) = answered(&device);
        line.spill = Some(CidSpill::new(SpillKind::CallWaitingAlert { cas: true }, vec![0x11; 100]));
        line.cw.cas_pending = true;

        let mut env = Env::new(Instant::now(), &device, &NoMessages);
        let mut buf = [0u8; 160];
        line.read(&mut env, call, &mut buf).unwrap();
        assert!(line.spill.is_none());
        assert_eq!(line.cw.ack_frames, CW_ACK_FRAMES);

        device.probe(1).unwrap().inject(LineEvent::DtmfUp('A'));
        line.read(&mut env, call, &mut buf).unwrap();
        assert_eq!(line.cw.ack_frames, 0);
        assert!(!line.cw.cas_pending);
        assert_eq!(line.spill.as_ref().map(|spill| spill.kind()), Some(SpillKind::CallWaitingCallerId));
        assert!(env.actions().iter().all(|action| !matches!(action, HostAction::Digit { .. })));
    }

    #[test]
    fn unacknowledged_alert_gives_up() {
        let device = LoopbackDevice::new();
        let (mut line, call) = answered(&device);
        line.cw.ack_frames = CW_ACK_FRAMES;
        line.cw.cas_pending = true;

        let mut env = Env::new(Instant::now(), &device, &NoMessages);
        let mut buf = [0u8; 160];
        for _ in 0..CW_ACK_FRAMES {
            line.read(&mut env, call, &mut buf).unwrap();
        }
        assert_eq!(line.cw.ack_frames, 0);
        assert!(!line.cw.cas_pending);
        assert!(line.spill.is_none());
    }

    #[test]
    fn waiting_call_is_alerted_again() {
        let device = LoopbackDevice::new();
        let (mut line, call) = answered(&device);
        line.subs.allocate(Leg::CallWait, &device).unwrap();
        line.attach(Leg::CallWait, CallLeg::new(CallId::next(), CallState::Ringing));
        line.cw.repeat_frames = 1;

        let mut env = Env::new(Instant::now(), &device, &NoMessages);
        let mut buf = [0u8; 160];
        line.read(&mut env, call, &mut buf).unwrap();
        assert_eq!(line.cw.rings, 1);
        assert_eq!(line.cw.repeat_frames, CW_REPEAT_FRAMES);
        assert!(matches!(line.spill.as_ref().map(|spill| spill.kind()), Some(SpillKind::CallWaitingAlert { cas: false })));
    }
}
