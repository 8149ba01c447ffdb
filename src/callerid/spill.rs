use crate::codec::{
    Law, FskModulator, FskStandard, SAMPLES_PER_MS,
    call_waiting_alert, push_dtmf, push_silence,
};
use super::{CallerId, CidSignalling, Field, MwiSpillType, caller_id_message, vmwi_message};

/// Silence ahead of an on-hook spill.
const LEADIN_SILENCE_SAMPLES: usize = 4000;
/// Alternating 0x55 bytes that seize the CPE's receiver.
const SEIZURE_BYTES: usize = 30;
const SEIZURE_BYTE: u8 = 0x55;
const CID_MARK_MS: usize = 150;
const VMWI_MARK_MS: usize = 170;
const TRAILING_MARK_MS: usize = 50;
const DTMF_ON_MS: usize = 60;
const DTMF_OFF_MS: usize = 60;

/// What a spill carries; each kind is followed by different timers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpillKind {
    /// Caller id sent between rings.
    CallerId,
    /// SAS (and CAS when `cas` is set) alert for a waiting call.
    CallWaitingAlert { cas: bool },
    /// Caller id payload for a waiting call.
    CallWaitingCallerId,
    /// Visual message waiting indication.
    Vmwi,
}

/// A generated spill being written out to the line.
#[derive(Clone, Debug)]
pub struct CidSpill {
    kind: SpillKind,
    data: Vec<u8>,
    pos: usize,
}

impl CidSpill {
    pub fn new(kind: SpillKind, data: Vec<u8>) -> Self {
        Self { kind, data, pos: 0 }
    }

    pub fn kind(&self) -> SpillKind {
        self.kind
    }

    /// Bytes not yet written.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn advance(&mut self, written: usize) {
        self.pos = (self.pos + written).min(self.data.len());
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

fn fsk_frame(standard: FskStandard, law: Law, message: &[u8], seize: bool, mark_ms: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEADIN_SILENCE_SAMPLES + 8000);
    let mut modem = FskModulator::new(standard, law);
    if seize {
        push_silence(LEADIN_SILENCE_SAMPLES, law, &mut out);
        for _ in 0..SEIZURE_BYTES {
            modem.byte(SEIZURE_BYTE, &mut out);
        }
    }
    modem.marks_ms(mark_ms, &mut out);
    modem.bytes(message, &mut out);
    modem.marks_ms(TRAILING_MARK_MS, &mut out);
    out
}

/// Digits of a DTMF caller id: `A<number>C`, or the `B` codes when withheld.
pub fn dtmf_caller_id_string(caller: &CallerId) -> String {
    match &caller.number {
        Field::Present(number) => {
            let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
            format!("A{}C", digits)
        },
        Field::Private => "B10C".to_owned(),
        Field::Unavailable => "B00C".to_owned(),
    }
}

fn dtmf_frame(digits: &str, law: Law, leadin: bool) -> Vec<u8> {
    let mut out = vec![];
    if leadin {
        push_silence(LEADIN_SILENCE_SAMPLES, law, &mut out);
    }
    for digit in digits.chars() {
        push_dtmf(digit, DTMF_ON_MS * SAMPLES_PER_MS, DTMF_OFF_MS * SAMPLES_PER_MS, law, &mut out);
    }
    out
}

/// On-hook caller id spill. A call waiting payload omits the lead-in silence and seizure.
pub fn caller_id_spill(caller: &CallerId, signalling: CidSignalling, law: Law, stamp: &str, call_waiting: bool) -> Vec<u8> {
    match signalling {
        CidSignalling::Fsk(standard) => {
            let message = caller_id_message(caller, stamp);
            fsk_frame(standard, law, &message, !call_waiting, CID_MARK_MS)
        },
        CidSignalling::Dtmf => dtmf_frame(&dtmf_caller_id_string(caller), law, !call_waiting),
    }
}

/// Alert followed directly by the caller id payload, for CPE that doesn't acknowledge.
pub fn call_waiting_spill(caller: &CallerId, signalling: CidSignalling, law: Law, stamp: &str) -> Vec<u8> {
    let mut out = call_waiting_alert(true, law);
    out.extend(caller_id_spill(caller, signalling, law, stamp, true));
    out
}

/// Visual message waiting spill.
pub fn vmwi_spill(active: bool, kind: MwiSpillType, identity: &CallerId, standard: FskStandard, law: Law, stamp: &str) -> Vec<u8> {
    let message = vmwi_message(active, kind, identity, stamp);
    fsk_frame(standard, law, &message, true, VMWI_MARK_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtmf_strings() {
        assert_eq!(dtmf_caller_id_string(&CallerId::new(None, Some("555-1234"))), "A5551234C");
        assert_eq!(dtmf_caller_id_string(&CallerId::private()), "B10C");
        assert_eq!(dtmf_caller_id_string(&CallerId::default()), "B00C");
    }

    #[test]
    fn call_waiting_payload_is_shorter() {
        let caller = CallerId::new(Some("BOB"), Some("5550100"));
        let signalling = CidSignalling::Fsk(FskStandard::Bell202);
        let full = caller_id_spill(&caller, signalling, Law::Ulaw, "01010000", false);
        let cw = caller_id_spill(&caller, signalling, Law::Ulaw, "01010000", true);
        assert!(full.len() > cw.len() + LEADIN_SILENCE_SAMPLES);
        assert!(full[..LEADIN_SILENCE_SAMPLES].iter().all(|b| *b == Law::Ulaw.silence()));
    }

    #[test]
    fn spill_progress() {
        let mut spill = CidSpill::new(SpillKind::CallerId, vec![1, 2, 3, 4, 5]);
        spill.advance(2);
        assert_eq!(spill.remaining(), &[3, 4, 5]);
        spill.advance(10);
        assert!(spill.is_done());
        assert!(spill.remaining().is_empty());
    }
}
