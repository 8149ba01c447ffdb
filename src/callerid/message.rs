use std::str::FromStr;
use crate::error::{CidError, ConfigError};
use super::{CallerId, Field};

pub const MDMF_CALLERID: u8 = 0x80;
pub const MDMF_MWI: u8 = 0x82;
pub const SDMF_CALLERID: u8 = 0x04;
pub const SDMF_MWI: u8 = 0x06;

/// Longest name or number we transmit.
pub const MAX_FIELD_TX: usize = 16;
/// Longest name or number we keep from a received message.
pub const MAX_FIELD_RX: usize = 32;
/// Longest message body accepted on receive.
pub const MAX_MESSAGE_LEN: usize = 128;

const PARAM_DATE: u8 = 0x01;
const PARAM_NUMBER: u8 = 0x02;
const PARAM_NUMBER_ALT: u8 = 0x03;
const PARAM_NUMBER_ABSENT: u8 = 0x04;
const PARAM_REDIRECTING: u8 = 0x05;
const PARAM_QUALIFIER: u8 = 0x06;
const PARAM_NAME: u8 = 0x07;
const PARAM_NAME_ABSENT: u8 = 0x08;
const PARAM_MWI: u8 = 0x0b;
const PARAM_CALL_TYPE: u8 = 0x11;
const PARAM_MESSAGE_COUNT: u8 = 0x13;
const PARAM_NETWORK: u8 = 0x16;

const SDMF_MWI_ACTIVE: u8 = 0x42;
const SDMF_MWI_INACTIVE: u8 = 0x6f;

/// Visual message waiting spill flavor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MwiSpillType {
    /// MDMF with date, number and name.
    MdmfFull,
    /// MDMF with only the indicator.
    Mdmf,
    /// Single data message format.
    Sdmf,
}

impl FromStr for MwiSpillType {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "mdmf-full" | "mdmf_full" => Ok(MwiSpillType::MdmfFull),
            "mdmf" => Ok(MwiSpillType::Mdmf),
            "sdmf" => Ok(MwiSpillType::Sdmf),
            other => Err(ConfigError::UnknownMwiType(other.to_owned()))
        }
    }
}

/// Two's complement of the byte sum, so a valid message sums to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

/// Wraps a body as `type, length, body, checksum`.
pub fn frame_message(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(body.len() + 3);
    message.push(kind);
    message.push(body.len() as u8);
    message.extend_from_slice(body);
    message.push(checksum(&message));
    message
}

fn push_param(body: &mut Vec<u8>, kind: u8, data: &[u8]) {
    body.push(kind);
    body.push(data.len() as u8);
    body.extend_from_slice(data);
}

fn push_identity(body: &mut Vec<u8>, caller: &CallerId, stamp: &str) {
    push_param(body, PARAM_DATE, stamp.as_bytes());

    match &caller.number {
        Field::Present(number) => {
            let number: String = number.chars().take(MAX_FIELD_TX).collect();
            push_param(body, PARAM_NUMBER, number.as_bytes());
        },
        Field::Private => push_param(body, PARAM_NUMBER_ABSENT, b"P"),
        Field::Unavailable => push_param(body, PARAM_NUMBER_ABSENT, b"O"),
    }

    match &caller.name {
        Field::Present(name) => {
            let name: String = name.chars().take(MAX_FIELD_TX).collect();
            push_param(body, PARAM_NAME, name.as_bytes());
        },
        Field::Private => push_param(body, PARAM_NAME_ABSENT, b"P"),
        Field::Unavailable => push_param(body, PARAM_NAME_ABSENT, b"O"),
    }
}

/// MDMF caller id message.
pub fn caller_id_message(caller: &CallerId, stamp: &str) -> Vec<u8> {
    let mut body = vec![];
    push_identity(&mut body, caller, stamp);
    if caller.qualifier {
        push_param(&mut body, PARAM_QUALIFIER, b"L");
    }
    if let Some(reason) = caller.redirecting {
        push_param(&mut body, PARAM_REDIRECTING, &[reason]);
    }
    frame_message(MDMF_CALLERID, &body)
}

/// Visual message waiting message.
pub fn vmwi_message(active: bool, kind: MwiSpillType, identity: &CallerId, stamp: &str) -> Vec<u8> {
    match kind {
        MwiSpillType::Sdmf => {
            let indicator = if active { SDMF_MWI_ACTIVE } else { SDMF_MWI_INACTIVE };
            frame_message(SDMF_MWI, &[indicator; 3])
        },
        MwiSpillType::Mdmf | MwiSpillType::MdmfFull => {
            let mut body = vec![];
            if kind == MwiSpillType::MdmfFull {
                push_identity(&mut body, identity, stamp);
            }
            push_param(&mut body, PARAM_MWI, &[if active { 0xff } else { 0x00 }]);
            frame_message(MDMF_MWI, &body)
        }
    }
}

/// Whether `byte` opens a message we know how to parse.
pub fn is_message_type(byte: u8) -> bool {
    matches!(byte, MDMF_CALLERID | MDMF_MWI | SDMF_CALLERID | SDMF_MWI)
}

/// Fields go out as UTF-8; anything undecodable is replaced rather than rejected.
fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Parses a checksum-verified message body.
pub fn parse_message(kind: u8, body: &[u8]) -> Result<CallerId, CidError> {
    let mut caller = CallerId::default();
    match kind {
        MDMF_CALLERID | MDMF_MWI => {
            let mut pos = 0;
            while pos < body.len() {
                if pos + 2 > body.len() {
                    return Err(CidError::Truncated)
                }
                let param = body[pos];
                let len = body[pos + 1] as usize;
                let data = body.get(pos + 2..pos + 2 + len).ok_or(CidError::Truncated)?;
                match param {
                    PARAM_DATE => {},
                    PARAM_NUMBER | PARAM_NUMBER_ALT | PARAM_NUMBER_ABSENT => {
                        caller.number = Field::from_received(&text(data), MAX_FIELD_RX);
                    },
                    PARAM_NAME | PARAM_NAME_ABSENT => {
                        caller.name = Field::from_received(&text(data), MAX_FIELD_RX);
                    },
                    PARAM_QUALIFIER => {
                        caller.qualifier = data == b"L";
                    },
                    PARAM_REDIRECTING => {
                        caller.redirecting = data.first().copied();
                    },
                    PARAM_MWI => {
                        caller.mwi = data.first().map(|v| *v != 0);
                    },
                    PARAM_CALL_TYPE | PARAM_MESSAGE_COUNT | PARAM_NETWORK => {},
                    other => log::debug!("Ignoring unknown caller id parameter {:#04x}", other),
                }
                pos += 2 + len;
            }
        },
        SDMF_CALLERID => {
            if body.len() < 8 {
                return Err(CidError::Truncated)
            }
            caller.number = Field::from_received(&text(&body[8..]), MAX_FIELD_RX);
        },
        SDMF_MWI => {
            caller.mwi = match body.first() {
                Some(&SDMF_MWI_ACTIVE) => Some(true),
                Some(&SDMF_MWI_INACTIVE) => Some(false),
                _ => None,
            };
        },
        _ => return Err(CidError::Framing),
    }
    Ok(caller)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(message: &[u8]) -> &[u8] {
        &message[2..message.len() - 1]
    }

    #[test]
    fn messages_sum_to_zero() {
        let caller = CallerId::new(Some("ALICE"), Some("5551234"));
        let message = caller_id_message(&caller, "01020304");
        let sum = message.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        assert_eq!(sum, 0);
        assert_eq!(message[0], MDMF_CALLERID);
        assert_eq!(message[1] as usize, message.len() - 3);
    }

    #[test]
    fn private_and_unavailable_markers() {
        let message = caller_id_message(&CallerId::private(), "01020304");
        let parsed = parse_message(message[0], body(&message)).unwrap();
        assert_eq!(parsed.number, Field::Private);
        assert_eq!(parsed.name, Field::Private);

        let message = caller_id_message(&CallerId::default(), "01020304");
        let parsed = parse_message(message[0], body(&message)).unwrap();
        assert_eq!(parsed.number, Field::Unavailable);
    }

    #[test]
    fn long_fields_are_truncated_on_send() {
        let caller = CallerId::new(Some("A VERY LONG CALLER NAME"), Some("12345678901234567890"));
        let message = caller_id_message(&caller, "01020304");
        let parsed = parse_message(message[0], body(&message)).unwrap();
        assert_eq!(parsed.name, Field::Present("A VERY LONG CALL".into()));
        assert_eq!(parsed.number, Field::Present("1234567890123456".into()));
    }

    #[test]
    fn accented_names_survive() {
        let caller = CallerId::new(Some("Zoë Ångström"), Some("5550199"));
        let message = caller_id_message(&caller, "01020304");
        let parsed = parse_message(message[0], body(&message)).unwrap();
        assert_eq!(parsed.name, Field::Present("Zoë Ångström".into()));
        assert_eq!(parse_message(SDMF_CALLERID, b"01020304\xff12").unwrap().number, Field::Present("\u{fffd}12".into()));
    }

    #[test]
    fn qualifier_and_redirecting() {
        let caller = CallerId { qualifier: true, redirecting: Some(2), ..CallerId::new(None, Some("1")) };
        let message = caller_id_message(&caller, "01020304");
        let parsed = parse_message(message[0], body(&message)).unwrap();
        assert!(parsed.qualifier);
        assert_eq!(parsed.redirecting, Some(2));
    }

    #[test]
    fn vmwi_flavors() {
        let me = CallerId::new(Some("DESK"), Some("100"));
        for kind in [MwiSpillType::MdmfFull, MwiSpillType::Mdmf, MwiSpillType::Sdmf] {
            for active in [true, false] {
                let message = vmwi_message(active, kind, &me, "01020304");
                let parsed = parse_message(message[0], body(&message)).unwrap();
                assert_eq!(parsed.mwi, Some(active), "{:?}", kind);
            }
        }
        assert_eq!(vmwi_message(true, MwiSpillType::Mdmf, &me, ""), vec![0x82, 0x03, 0x0b, 0x01, 0xff, 0x70]);
    }

    #[test]
    fn sdmf_caller_id() {
        let mut body = b"12251030".to_vec();
        body.extend_from_slice(b"8005551212");
        let parsed = parse_message(SDMF_CALLERID, &body).unwrap();
        assert_eq!(parsed.number, Field::Present("8005551212".into()));
        assert_eq!(parse_message(SDMF_CALLERID, b"1225"), Err(CidError::Truncated));
    }

    #[test]
    fn truncated_parameter() {
        assert_eq!(parse_message(MDMF_CALLERID, &[0x02, 0x05, b'1']), Err(CidError::Truncated));
    }
}
