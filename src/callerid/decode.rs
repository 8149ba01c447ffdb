use log::{debug, warn};
use crate::codec::{DtmfDetector, FskDemodulator, FskStandard, RxByte};
use super::{CallerId, CidSignalling, Field, MAX_FIELD_RX, MAX_MESSAGE_LEN, is_message_type, parse_message};

/// Idle bit-times required before a message type byte is believed.
const MIN_LEADIN_IDLE_BITS: u32 = 10;
/// A gap this long inside a message abandons it.
const MAX_INTERBYTE_GAP_BITS: u32 = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
enum MessageState {
    Hunting,
    Length { kind: u8 },
    Body { kind: u8, len: usize, body: Vec<u8> },
    Checksum { kind: u8, body: Vec<u8> },
}

/// FSK caller id receiver: demodulates bytes and reassembles one message.
pub struct FskCallerIdDecoder {
    demod: FskDemodulator,
    state: MessageState,
}

impl FskCallerIdDecoder {
    pub fn new(standard: FskStandard) -> Self {
        Self {
            demod: FskDemodulator::new(standard),
            state: MessageState::Hunting,
        }
    }

    /// Whether a message has started arriving.
    pub fn in_message(&self) -> bool {
        self.state != MessageState::Hunting
    }

    /// Feeds linear samples. Returns the caller id once a complete, valid message arrives.
    pub fn feed(&mut self, samples: &[i16]) -> Option<CallerId> {
        for rx in self.demod.feed(samples) {
            if let Some(caller) = self.on_byte(rx) {
                return Some(caller)
            }
        }
        None
    }

    fn on_byte(&mut self, rx: RxByte) -> Option<CallerId> {
        use MessageState::*;
        if self.state != Hunting && rx.idle_bits > MAX_INTERBYTE_GAP_BITS {
            debug!("Caller id message interrupted after {} idle bits", rx.idle_bits);
            self.state = Hunting;
        }

        let state = std::mem::replace(&mut self.state, Hunting);
        self.state = match state {
            Hunting => {
                if is_message_type(rx.value) && rx.idle_bits >= MIN_LEADIN_IDLE_BITS {
                    Length { kind: rx.value }
                } else {
                    Hunting
                }
            },
            Length { kind } => {
                let len = rx.value as usize;
                if len == 0 || len > MAX_MESSAGE_LEN {
                    warn!("Caller id message length {} out of range", len);
                    Hunting
                } else {
                    Body { kind, len, body: Vec::with_capacity(len) }
                }
            },
            Body { kind, len, mut body } => {
                body.push(rx.value);
                if body.len() == len {
                    Checksum { kind, body }
                } else {
                    Body { kind, len, body }
                }
            },
            Checksum { kind, body } => {
                let sum = body.iter()
                    .fold(kind.wrapping_add(body.len() as u8), |acc, b| acc.wrapping_add(*b))
                    .wrapping_add(rx.value);
                if sum != 0 {
                    warn!("Caller id checksum failed");
                    Hunting
                } else {
                    match parse_message(kind, &body) {
                        Ok(caller) => return Some(caller),
                        Err(err) => {
                            warn!("Caller id message rejected: {}", err);
                            Hunting
                        }
                    }
                }
            }
        };
        None
    }
}

/// Parses a collected DTMF caller id string.
pub fn parse_dtmf(digits: &str) -> CallerId {
    let chars: Vec<char> = digits.chars().map(|c| c.to_ascii_uppercase()).collect();
    let mut caller = CallerId::default();
    let Some(first) = chars.first().copied() else {
        return caller
    };

    let take_number = |from: usize| -> String {
        chars[from..].iter()
            .take_while(|c| **c != 'C' && **c != '#')
            .filter(|c| c.is_ascii_digit())
            .take(MAX_FIELD_RX)
            .collect()
    };

    match first {
        'B' => {
            let code: String = chars.iter().skip(1).take(2).collect();
            match code.as_str() {
                "00" => caller.number = Field::Unavailable,
                "10" => caller.number = Field::Private,
                other => debug!("Unknown DTMF caller id code {}", other),
            }
        },
        'D' if chars.get(2) == Some(&'#') => {
            match chars.get(1) {
                Some('1') => caller.number = Field::Private,
                Some('2') | Some('3') => caller.number = Field::Unavailable,
                _ => debug!("Unknown DTMF caller id code {}", digits),
            }
        },
        'A' | 'D' => caller.number = Field::from_received(&take_number(1), MAX_FIELD_RX),
        'C' => {
            debug!("DTMF caller id carries a redirecting number");
            caller.number = Field::from_received(&take_number(1), MAX_FIELD_RX);
        },
        c if c.is_ascii_digit() => {
            warn!("DTMF caller id without start digit, parsing might be unreliable");
            let number: String = chars.iter().take_while(|c| c.is_ascii_digit()).take(MAX_FIELD_RX).collect();
            caller.number = Field::from_received(&number, MAX_FIELD_RX);
        },
        other => {
            debug!("Unknown DTMF caller id start digit '{}'", other);
        }
    }
    caller
}

/// Collects DTMF caller id digits until a terminator.
pub struct DtmfCallerIdDecoder {
    detector: DtmfDetector,
    digits: String,
}

impl DtmfCallerIdDecoder {
    pub fn new() -> Self {
        Self {
            detector: DtmfDetector::new(),
            digits: String::new(),
        }
    }

    pub fn digits(&self) -> &str {
        &self.digits
    }

    /// Feeds linear samples. Returns the new digits and, once terminated, the parsed caller id.
    pub fn feed(&mut self, samples: &[i16]) -> (Vec<char>, Option<CallerId>) {
        let new_digits = self.detector.feed(samples);
        for digit in &new_digits {
            self.digits.push(*digit);
        }
        let done = self.is_terminated();
        (new_digits, done.then(|| parse_dtmf(&self.digits)))
    }

    fn is_terminated(&self) -> bool {
        let mut chars = self.digits.chars();
        let first = chars.next();
        let last = self.digits.chars().last();
        self.digits.len() >= 2
            && matches!(first, Some('A') | Some('B') | Some('C') | Some('D'))
            && matches!(last, Some('C') | Some('#'))
    }

    /// Whatever has been collected, parsed as is.
    pub fn finish(&self) -> CallerId {
        parse_dtmf(&self.digits)
    }
}

impl Default for DtmfCallerIdDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for the configured caller id signalling.
pub enum CallerIdReceiver {
    Fsk(FskCallerIdDecoder),
    Dtmf(DtmfCallerIdDecoder),
}

impl CallerIdReceiver {
    pub fn new(signalling: CidSignalling) -> Self {
        match signalling {
            CidSignalling::Fsk(standard) => CallerIdReceiver::Fsk(FskCallerIdDecoder::new(standard)),
            CidSignalling::Dtmf => CallerIdReceiver::Dtmf(DtmfCallerIdDecoder::new()),
        }
    }

    /// Returns `(digits seen, completed caller id)`; FSK never reports digits.
    pub fn feed(&mut self, samples: &[i16]) -> (usize, Option<CallerId>) {
        match self {
            CallerIdReceiver::Fsk(decoder) => (0, decoder.feed(samples)),
            CallerIdReceiver::Dtmf(decoder) => {
                let (digits, caller) = decoder.feed(samples);
                (digits.len(), caller)
            }
        }
    }

    /// Whether part of a caller id has been received but not completed.
    pub fn in_progress(&self) -> bool {
        match self {
            CallerIdReceiver::Fsk(decoder) => decoder.in_message(),
            CallerIdReceiver::Dtmf(decoder) => !decoder.digits().is_empty(),
        }
    }

    /// Best effort result when detection is cut short.
    pub fn finish(&self) -> Option<CallerId> {
        match self {
            CallerIdReceiver::Fsk(_) => None,
            CallerIdReceiver::Dtmf(decoder) if !decoder.digits().is_empty() => Some(decoder.finish()),
            CallerIdReceiver::Dtmf(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callerid::{caller_id_spill, call_waiting_spill, vmwi_spill, MwiSpillType};
    use crate::codec::{Law, call_waiting_alert};

    fn receive(spill: &[u8], law: Law, signalling: CidSignalling) -> Option<CallerId> {
        let mut receiver = CallerIdReceiver::new(signalling);
        for frame in spill.chunks(160) {
            if let (_, Some(caller)) = receiver.feed(&law.decode_all(frame)) {
                return Some(caller)
            }
        }
        None
    }

    #[test]
    fn fsk_round_trip() {
        let caller = CallerId::new(Some("JOHN Q PUBLIC"), Some("5551234567"));
        for standard in [FskStandard::Bell202, FskStandard::V23] {
            for law in [Law::Ulaw, Law::Alaw] {
                let signalling = CidSignalling::Fsk(standard);
                let spill = caller_id_spill(&caller, signalling, law, "06151230", false);
                assert_eq!(receive(&spill, law, signalling), Some(caller.clone()), "{:?} {:?}", standard, law);
            }
        }
    }

    #[test]
    fn fsk_round_trip_truncates_to_transmit_length() {
        let caller = CallerId::new(Some("ABCDEFGHIJKLMNOPQRST"), Some("12345678901234567890"));
        let signalling = CidSignalling::Fsk(FskStandard::Bell202);
        let got = receive(&caller_id_spill(&caller, signalling, Law::Ulaw, "06151230", false), Law::Ulaw, signalling).unwrap();
        assert_eq!(got.name, Field::Present("ABCDEFGHIJKLMNOP".into()));
        assert_eq!(got.number, Field::Present("1234567890123456".into()));
    }

    #[test]
    fn call_waiting_spill_decodes_after_alert() {
        let caller = CallerId::new(Some("CW"), Some("200"));
        let signalling = CidSignalling::Fsk(FskStandard::Bell202);
        let spill = call_waiting_spill(&caller, signalling, Law::Ulaw, "01010101");
        assert_eq!(receive(&spill, Law::Ulaw, signalling), Some(caller));
    }

    #[test]
    fn alert_alone_decodes_nothing() {
        let signalling = CidSignalling::Fsk(FskStandard::Bell202);
        assert_eq!(receive(&call_waiting_alert(true, Law::Ulaw), Law::Ulaw, signalling), None);
    }

    #[test]
    fn vmwi_round_trip() {
        let me = CallerId::new(Some("DESK"), Some("100"));
        for kind in [MwiSpillType::MdmfFull, MwiSpillType::Mdmf, MwiSpillType::Sdmf] {
            let spill = vmwi_spill(true, kind, &me, FskStandard::Bell202, Law::Ulaw, "01010101");
            let got = receive(&spill, Law::Ulaw, CidSignalling::Fsk(FskStandard::Bell202)).unwrap();
            assert_eq!(got.mwi, Some(true), "{:?}", kind);
        }
    }

    #[test]
    fn dtmf_round_trip() {
        for caller in [CallerId::new(None, Some("5551212")), CallerId::private(), CallerId::default()] {
            let spill = caller_id_spill(&caller, CidSignalling::Dtmf, Law::Alaw, "", false);
            let got = receive(&spill, Law::Alaw, CidSignalling::Dtmf).unwrap();
            assert_eq!(got.number, caller.number);
        }
    }

    #[test]
    fn dtmf_codes() {
        assert_eq!(parse_dtmf("A5551234C").number, Field::Present("5551234".into()));
        assert_eq!(parse_dtmf("D5551234#").number, Field::Present("5551234".into()));
        assert_eq!(parse_dtmf("D1#").number, Field::Private);
        assert_eq!(parse_dtmf("D3#").number, Field::Unavailable);
        assert_eq!(parse_dtmf("B10C").number, Field::Private);
        assert_eq!(parse_dtmf("B00C").number, Field::Unavailable);
        assert_eq!(parse_dtmf("5551234").number, Field::Present("5551234".into()));
        assert_eq!(parse_dtmf("*").number, Field::Unavailable);
        assert_eq!(parse_dtmf("").number, Field::Unavailable);
    }
}
