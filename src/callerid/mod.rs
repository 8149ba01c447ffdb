//! Caller ID and visual message waiting: message formats, spill generation,
//! inbound detection and distinctive ring matching.

mod message;
mod spill;
mod decode;
mod ring;
mod inbound;

use std::str::FromStr;
use chrono::{DateTime, Local};
use crate::codec::FskStandard;
use crate::error::ConfigError;

pub use self::message::*;
pub use self::spill::*;
pub use self::decode::*;
pub use self::ring::*;
pub use self::inbound::*;

/// One presentable part of a caller id.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Field {
    Present(String),
    Private,
    #[default]
    Unavailable,
}

impl Field {
    pub fn from_option(value: Option<&str>) -> Self {
        match value {
            Some(text) if !text.is_empty() => Field::Present(text.to_owned()),
            _ => Field::Unavailable,
        }
    }

    /// Normalizes a received field; "P" and "O" are the private and out-of-area markers.
    pub fn from_received(text: &str, max_len: usize) -> Self {
        match text {
            "P" => Field::Private,
            "O" | "" => Field::Unavailable,
            other => Field::Present(other.chars().take(max_len).collect()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Field::Present(text) => Some(text.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CallerId {
    pub name: Field,
    pub number: Field,
    /// Long distance qualifier.
    pub qualifier: bool,
    /// Redirecting reason code.
    pub redirecting: Option<u8>,
    /// Message waiting indication carried by the spill.
    pub mwi: Option<bool>,
}

impl CallerId {
    pub fn new(name: Option<&str>, number: Option<&str>) -> Self {
        Self {
            name: Field::from_option(name),
            number: Field::from_option(number),
            ..Default::default()
        }
    }

    pub fn private() -> Self {
        Self {
            name: Field::Private,
            number: Field::Private,
            ..Default::default()
        }
    }

    /// The same identity with both fields withheld.
    pub fn hidden(&self) -> Self {
        Self {
            name: Field::Private,
            number: Field::Private,
            ..self.clone()
        }
    }
}

/// How caller id is carried on the line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CidSignalling {
    Fsk(FskStandard),
    Dtmf,
}

impl FromStr for CidSignalling {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "bell" => Ok(CidSignalling::Fsk(FskStandard::Bell202)),
            "v23" | "v23_jp" => Ok(CidSignalling::Fsk(FskStandard::V23)),
            "dtmf" => Ok(CidSignalling::Dtmf),
            other => Err(ConfigError::UnknownCidSignalling(other.to_owned()))
        }
    }
}

/// What starts inbound caller id detection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CidStart {
    /// First ring.
    Ring,
    /// Polarity reversal before the ring.
    Polarity,
    /// Polarity reversal, announced to the host as pre-ring.
    PolarityIn,
    /// DTMF energy on an idle line, with no alert at all.
    DtmfNoAlert,
}

impl FromStr for CidStart {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "ring" => Ok(CidStart::Ring),
            "polarity" => Ok(CidStart::Polarity),
            "polarity_in" => Ok(CidStart::PolarityIn),
            "dtmf" => Ok(CidStart::DtmfNoAlert),
            other => Err(ConfigError::UnknownCidStart(other.to_owned()))
        }
    }
}

/// `MMDDHHMM` date stamp carried in caller id messages.
pub fn cid_timestamp(now: DateTime<Local>) -> String {
    now.format("%m%d%H%M").to_string()
}
