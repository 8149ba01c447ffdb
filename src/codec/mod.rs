//! Sample-level signal processing for the line: G.711 companding,
//! tone generation, FSK modulation/demodulation and DTMF.
//!
//! Everything here runs at 8000 samples per second and is free of line state.

mod dtmf;
mod fsk;
mod tone;

use std::str::FromStr;
use crate::error::ConfigError;

pub use self::dtmf::*;
pub use self::fsk::*;
pub use self::tone::*;

/// Line sample rate.
pub const SAMPLE_RATE: u32 = 8000;

/// Samples per millisecond.
pub const SAMPLES_PER_MS: usize = (SAMPLE_RATE / 1000) as usize;

/// Samples in one 20 ms audio frame.
pub const FRAME_SAMPLES: usize = 160;

/// Duration of one audio frame in milliseconds.
pub const FRAME_MS: u64 = 20;

/// Companding law of a line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Law {
    Ulaw,
    Alaw,
}

impl Law {
    #[inline]
    pub fn encode(self, sample: i16) -> u8 {
        match self {
            Law::Ulaw => linear_to_ulaw(sample),
            Law::Alaw => linear_to_alaw(sample),
        }
    }

    #[inline]
    pub fn decode(self, byte: u8) -> i16 {
        match self {
            Law::Ulaw => ulaw_to_linear(byte),
            Law::Alaw => alaw_to_linear(byte),
        }
    }

    /// The encoded byte for a zero sample.
    #[inline]
    pub fn silence(self) -> u8 {
        self.encode(0)
    }

    pub fn encode_all(self, samples: &[i16], out: &mut Vec<u8>) {
        out.extend(samples.iter().map(|s| self.encode(*s)));
    }

    pub fn decode_all(self, bytes: &[u8]) -> Vec<i16> {
        bytes.iter().map(|b| self.decode(*b)).collect()
    }
}

impl FromStr for Law {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "ulaw" | "mulaw" | "mu-law" => Ok(Law::Ulaw),
            "alaw" | "a-law" => Ok(Law::Alaw),
            other => Err(ConfigError::UnknownLaw(other.to_owned()))
        }
    }
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    s = s.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && s & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (s >> (exponent + 3)) & 0x0f;
    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let b = !byte;
    let exponent = (b >> 4) & 0x07;
    let mantissa = (b & 0x0f) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if b & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

const ALAW_SEG_END: [i32; 8] = [0x1f, 0x3f, 0x7f, 0xff, 0x1ff, 0x3ff, 0x7ff, 0xfff];

pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut value = (sample as i32) >> 3;
    let mask = if value >= 0 {
        0xd5
    } else {
        value = -value - 1;
        0x55
    };

    let segment = ALAW_SEG_END.iter().position(|end| value <= *end);
    match segment {
        None => 0x7f ^ mask,
        Some(seg) => {
            let quant = if seg < 2 { (value >> 1) & 0x0f } else { (value >> seg) & 0x0f };
            (((seg as i32) << 4) | quant) as u8 ^ mask
        }
    }
}

pub fn alaw_to_linear(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let mut t = ((a & 0x0f) as i32) << 4;
    let segment = (a & 0x70) >> 4;
    match segment {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= segment - 1;
        }
    }
    if a & 0x80 != 0 {
        t as i16
    } else {
        -t as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_zero_is_silence() {
        assert_eq!(linear_to_ulaw(0), 0xff);
        assert_eq!(ulaw_to_linear(0xff), 0);
        assert_eq!(ulaw_to_linear(0x7f), 0);
        assert_eq!(Law::Ulaw.silence(), 0xff);
    }

    #[test]
    fn alaw_zero_is_silence() {
        assert_eq!(Law::Alaw.silence(), 0xd5);
        assert_eq!(alaw_to_linear(0xd5), 8);
    }

    #[test]
    fn companding_error_is_bounded() {
        for law in [Law::Ulaw, Law::Alaw] {
            for sample in (-32000i32..32000).step_by(37) {
                let sample = sample as i16;
                let back = law.decode(law.encode(sample)) as i32;
                let tolerance = (sample as i32).abs() / 16 + 16;
                assert!((back - sample as i32).abs() <= tolerance, "{:?} {} -> {}", law, sample, back);
            }
        }
    }

    #[test]
    fn extremes_do_not_overflow() {
        for law in [Law::Ulaw, Law::Alaw] {
            assert!(law.decode(law.encode(i16::MAX)) > 30000);
            assert!(law.decode(law.encode(i16::MIN)) < -30000);
        }
    }

    #[test]
    fn law_names() {
        assert_eq!("ulaw".parse::<Law>().unwrap(), Law::Ulaw);
        assert_eq!("ALAW".parse::<Law>().unwrap(), Law::Alaw);
        assert!("slin".parse::<Law>().is_err());
    }
}
