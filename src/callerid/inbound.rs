use std::time::{Duration, Instant};
use log::{debug, info};
use super::{CallerId, CallerIdReceiver, CidSignalling, CidStart, RingPattern, RingSample, RingSampler, select_pattern};

/// Longest time spent decoding caller id.
pub const DECODE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a pre-ring caller id waits for the ring proper.
pub const RING_AFTER_CID_TIMEOUT: Duration = Duration::from_secs(4);
/// Longest pause between pre-ring DTMF digits.
pub const DTMF_DIGIT_TIMEOUT: Duration = Duration::from_secs(4);

/// Inbound caller id settings of a line.
#[derive(Clone, Debug)]
pub struct InboundPolicy {
    pub signalling: CidSignalling,
    pub start: CidStart,
    pub patterns: Vec<RingPattern>,
    pub ring_timeout: Duration,
    /// Capture the ring cadence after caller id instead of during it.
    pub rings_after_cid: bool,
}

impl InboundPolicy {
    /// Whether detection begins before the first ring.
    pub fn is_prering(&self) -> bool {
        !matches!(self.start, CidStart::Ring)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Detection is over; `caller` is `None` when nothing decoded.
    Complete { caller: Option<CallerId>, context: Option<String> },
    /// The call should be hung up.
    Abandon(&'static str),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Decoding,
    AwaitRing,
    SampleRings,
    Done,
}

/// Caller id and distinctive ring detection for one inbound call.
pub struct InboundSession {
    policy: InboundPolicy,
    phase: SessionPhase,
    prering: bool,
    receiver: CallerIdReceiver,
    caller: Option<CallerId>,
    decode_deadline: Instant,
    ring_deadline: Option<Instant>,
    last_digit: Instant,
    sampler: Option<RingSampler>,
    /// The ring sample filled while a caller id was still arriving.
    cadence_captured: bool,
}

impl InboundSession {
    /// Session opened by the first ring.
    pub fn after_ring(policy: InboundPolicy, now: Instant) -> Self {
        let sampler = (!policy.patterns.is_empty() && !policy.rings_after_cid)
            .then(|| RingSampler::new(now, policy.ring_timeout / 2));
        Self::new(policy, now, false, sampler)
    }

    /// Session opened before ringing, by polarity or DTMF energy.
    pub fn before_ring(policy: InboundPolicy, now: Instant) -> Self {
        Self::new(policy, now, true, None)
    }

    fn new(policy: InboundPolicy, now: Instant, prering: bool, sampler: Option<RingSampler>) -> Self {
        Self {
            receiver: CallerIdReceiver::new(policy.signalling),
            policy,
            phase: SessionPhase::Decoding,
            prering,
            caller: None,
            decode_deadline: now + DECODE_TIMEOUT,
            ring_deadline: None,
            last_digit: now,
            sampler,
            cadence_captured: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_prering(&self) -> bool {
        self.prering
    }

    /// Whether audio from the line should still be fed in.
    pub fn wants_audio(&self) -> bool {
        self.phase == SessionPhase::Decoding
    }

    pub fn feed_audio(&mut self, samples: &[i16], now: Instant) -> Option<SessionOutcome> {
        if self.phase != SessionPhase::Decoding {
            return None
        }
        let (digits, caller) = self.receiver.feed(samples);
        if digits > 0 {
            self.last_digit = now;
        }
        if let Some(caller) = caller {
            info!("Caller id received: {:?} {:?}", caller.name, caller.number);
            self.caller = Some(caller);
            return self.decode_finished(now)
        }
        if self.cadence_captured && !self.receiver.in_progress() {
            debug!("Caller id message abandoned after the ring sample");
            return self.decode_finished(now)
        }
        None
    }

    /// A ring arrived on the line.
    pub fn on_ring(&mut self, now: Instant) -> Option<SessionOutcome> {
        match self.phase {
            SessionPhase::Decoding if self.prering => {
                if self.caller.is_none() {
                    self.caller = self.receiver.finish();
                }
                self.ring_arrived(now)
            },
            SessionPhase::Decoding => {
                let full = self.sampler.as_mut().map(|s| s.ring(now)).unwrap_or(false);
                if !full {
                    return None
                }
                if self.receiver.in_progress() {
                    debug!("Ring cadence captured, still receiving caller id");
                    self.cadence_captured = true;
                    return None
                }
                debug!("Ring cadence captured before any caller id");
                self.decode_finished(now)
            },
            SessionPhase::AwaitRing => self.ring_arrived(now),
            SessionPhase::SampleRings => {
                let full = self.sampler.as_mut().map(|s| s.ring(now)).unwrap_or(true);
                full.then(|| self.complete())
            },
            SessionPhase::Done => None,
        }
    }

    /// A non-ring event cuts decoding short.
    pub fn interrupt(&mut self, now: Instant) -> Option<SessionOutcome> {
        match self.phase {
            SessionPhase::Decoding => self.decode_finished(now),
            _ => None,
        }
    }

    /// Timeout handling; call once per frame or housekeeping pass.
    pub fn poll(&mut self, now: Instant) -> Option<SessionOutcome> {
        match self.phase {
            SessionPhase::Decoding => {
                if self.prering && self.policy.signalling == CidSignalling::Dtmf
                    && now.saturating_duration_since(self.last_digit) > DTMF_DIGIT_TIMEOUT {
                    self.phase = SessionPhase::Done;
                    return Some(SessionOutcome::Abandon("timed out waiting for DTMF caller id"))
                }
                if now >= self.decode_deadline {
                    debug!("Caller id decode timed out");
                    return self.decode_finished(now)
                }
                None
            },
            SessionPhase::AwaitRing => {
                if self.ring_deadline.map(|deadline| now >= deadline).unwrap_or(false) {
                    self.phase = SessionPhase::Done;
                    return Some(SessionOutcome::Abandon("no ring after caller id"))
                }
                None
            },
            SessionPhase::SampleRings => {
                let quiet = self.sampler.as_mut().map(|s| s.poll(now)).unwrap_or(true);
                quiet.then(|| self.complete())
            },
            SessionPhase::Done => None,
        }
    }

    fn decode_finished(&mut self, now: Instant) -> Option<SessionOutcome> {
        if self.caller.is_none() {
            self.caller = self.receiver.finish();
        }
        if self.prering {
            self.phase = SessionPhase::AwaitRing;
            self.ring_deadline = Some(now + RING_AFTER_CID_TIMEOUT);
            return None
        }
        if self.policy.rings_after_cid && !self.policy.patterns.is_empty() {
            self.sampler = Some(RingSampler::new(now, self.policy.ring_timeout / 2));
            self.phase = SessionPhase::SampleRings;
            return None
        }
        Some(self.complete())
    }

    fn ring_arrived(&mut self, now: Instant) -> Option<SessionOutcome> {
        if self.policy.patterns.is_empty() {
            return Some(self.complete())
        }
        self.sampler = Some(RingSampler::new(now, self.policy.ring_timeout / 2));
        self.phase = SessionPhase::SampleRings;
        None
    }

    fn complete(&mut self) -> SessionOutcome {
        self.phase = SessionPhase::Done;
        let context = if self.policy.patterns.is_empty() {
            None
        } else {
            let sample = self.sampler.as_ref().map(|s| s.sample().clone()).unwrap_or_else(RingSample::default);
            debug!("Distinctive ring sample {:?}", sample.gaps());
            select_pattern(&self.policy.patterns, &sample).map(|p| p.context.clone())
        };
        SessionOutcome::Complete { caller: self.caller.take(), context }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callerid::{caller_id_spill, Field, RING_WILDCARD};
    use crate::codec::{FskStandard, Law};

    fn policy(start: CidStart, signalling: CidSignalling, patterns: Vec<RingPattern>) -> InboundPolicy {
        InboundPolicy {
            signalling,
            start,
            patterns,
            ring_timeout: Duration::from_millis(8000),
            rings_after_cid: false,
        }
    }

    fn feed_spill(session: &mut InboundSession, spill: &[u8], law: Law, start: Instant) -> Option<SessionOutcome> {
        for (i, frame) in spill.chunks(160).enumerate() {
            let now = start + Duration::from_millis(20 * i as u64);
            if let Some(outcome) = session.feed_audio(&law.decode_all(frame), now) {
                return Some(outcome)
            }
        }
        None
    }

    #[test]
    fn ring_started_fsk() {
        let signalling = CidSignalling::Fsk(FskStandard::Bell202);
        let start = Instant::now();
        let mut session = InboundSession::after_ring(policy(CidStart::Ring, signalling, vec![]), start);
        let caller = CallerId::new(Some("CARRIE"), Some("5550000"));
        let spill = caller_id_spill(&caller, signalling, Law::Ulaw, "01010101", false);
        let outcome = feed_spill(&mut session, &spill, Law::Ulaw, start);
        assert_eq!(outcome, Some(SessionOutcome::Complete { caller: Some(caller), context: None }));
        assert_eq!(session.phase(), SessionPhase::Done);
    }

    #[test]
    fn prering_waits_for_the_ring() {
        let signalling = CidSignalling::Fsk(FskStandard::V23);
        let start = Instant::now();
        let mut session = InboundSession::before_ring(policy(CidStart::Polarity, signalling, vec![]), start);
        let caller = CallerId::new(None, Some("0123456"));
        let spill = caller_id_spill(&caller, signalling, Law::Alaw, "01010101", false);
        assert_eq!(feed_spill(&mut session, &spill, Law::Alaw, start), None);
        assert_eq!(session.phase(), SessionPhase::AwaitRing);
        let outcome = session.on_ring(start + Duration::from_secs(2));
        assert_eq!(outcome, Some(SessionOutcome::Complete { caller: Some(caller), context: None }));
    }

    #[test]
    fn prering_without_ring_is_abandoned() {
        let start = Instant::now();
        let mut session = InboundSession::before_ring(policy(CidStart::Polarity, CidSignalling::Fsk(FskStandard::V23), vec![]), start);
        assert_eq!(session.poll(start + DECODE_TIMEOUT), None);
        assert_eq!(session.phase(), SessionPhase::AwaitRing);
        let outcome = session.poll(start + DECODE_TIMEOUT + RING_AFTER_CID_TIMEOUT);
        assert!(matches!(outcome, Some(SessionOutcome::Abandon(_))));
    }

    #[test]
    fn dtmf_prering_times_out_between_digits() {
        let start = Instant::now();
        let mut session = InboundSession::before_ring(policy(CidStart::DtmfNoAlert, CidSignalling::Dtmf, vec![]), start);
        assert_eq!(session.poll(start + Duration::from_secs(3)), None);
        assert!(matches!(session.poll(start + Duration::from_secs(5)), Some(SessionOutcome::Abandon(_))));
    }

    #[test]
    fn dtmf_prering_completes_on_ring() {
        let start = Instant::now();
        let mut session = InboundSession::before_ring(policy(CidStart::DtmfNoAlert, CidSignalling::Dtmf, vec![]), start);
        let caller = CallerId::new(None, Some("4441"));
        let spill = caller_id_spill(&caller, CidSignalling::Dtmf, Law::Ulaw, "", true);
        // terminated strings finish decoding and then wait for the ring
        assert_eq!(feed_spill(&mut session, &spill, Law::Ulaw, start), None);
        match session.on_ring(start + Duration::from_secs(1)) {
            Some(SessionOutcome::Complete { caller: Some(got), .. }) => assert_eq!(got.number, Field::Present("4441".into())),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn distinctive_ring_after_prering_cid() {
        let patterns = vec![
            RingPattern::new([800, 800, 800], 100, "short"),
            RingPattern::new([2000, RING_WILDCARD, 500], 600, "fax"),
        ];
        let start = Instant::now();
        let mut session = InboundSession::before_ring(policy(CidStart::Polarity, CidSignalling::Fsk(FskStandard::Bell202), patterns), start);
        assert_eq!(session.interrupt(start), None);
        let mut t = start + Duration::from_millis(1000);
        assert_eq!(session.on_ring(t), None);
        for gap in [2500, 2500] {
            t += Duration::from_millis(gap);
            assert_eq!(session.on_ring(t), None);
        }
        t += Duration::from_millis(500);
        assert_eq!(session.on_ring(t), Some(SessionOutcome::Complete { caller: None, context: Some("fax".into()) }));
    }

    #[test]
    fn unmatched_cadence_uses_default_context() {
        let patterns = vec![RingPattern::new([800, 800, 800], 100, "short")];
        let start = Instant::now();
        let mut session = InboundSession::after_ring(policy(CidStart::Ring, CidSignalling::Fsk(FskStandard::Bell202), patterns), start);
        let mut t = start;
        let mut outcome = None;
        for gap in [2000, 2000, 2000] {
            t += Duration::from_millis(gap);
            outcome = session.on_ring(t);
        }
        assert_eq!(outcome, Some(SessionOutcome::Complete { caller: None, context: None }));
    }

    #[test]
    fn caller_id_in_flight_outlasts_the_ring_sample() {
        let signalling = CidSignalling::Fsk(FskStandard::Bell202);
        let patterns = vec![RingPattern::new([2000, RING_WILDCARD, 2000], 300, "fax")];
        let start = Instant::now();
        let mut session = InboundSession::after_ring(policy(CidStart::Ring, signalling, patterns), start);
        let caller = CallerId::new(Some("DORA"), Some("5551111"));
        let spill = caller_id_spill(&caller, signalling, Law::Ulaw, "02020202", false);

        let mut frames = spill.chunks(160);
        for frame in frames.by_ref() {
            assert_eq!(session.feed_audio(&Law::Ulaw.decode_all(frame), start), None);
            if session.receiver.in_progress() {
                break
            }
        }
        assert!(session.receiver.in_progress());

        let mut t = start;
        for _ in 0..3 {
            t += Duration::from_millis(2000);
            assert_eq!(session.on_ring(t), None);
        }
        assert_eq!(session.phase(), SessionPhase::Decoding);

        let mut outcome = None;
        for frame in frames {
            outcome = session.feed_audio(&Law::Ulaw.decode_all(frame), t);
            if outcome.is_some() {
                break
            }
        }
        assert_eq!(outcome, Some(SessionOutcome::Complete { caller: Some(caller), context: Some("fax".into()) }));
    }
}
