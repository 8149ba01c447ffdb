use std::f32::consts::TAU;
use super::{Law, SAMPLE_RATE, FRAME_SAMPLES};

/// Subscriber alert signal frequency.
pub const SAS_HZ: f32 = 440.0;
/// CPE alerting signal dual-tone frequencies.
pub const CAS_HZ: (f32, f32) = (2130.0, 2750.0);
/// SAS burst length in samples (300 ms).
pub const SAS_SAMPLES: usize = 2400;
/// CAS burst length in samples (85 ms).
pub const CAS_SAMPLES: usize = 680;
/// Silence appended to a call waiting alert.
pub const ALERT_TAIL_SAMPLES: usize = FRAME_SAMPLES * 4;

const TONE_AMPLITUDE: f32 = 8192.0;

/// Phase-continuous sine oscillator.
#[derive(Copy, Clone, Debug)]
pub struct Oscillator {
    phase: f32,
    step: f32,
}

impl Oscillator {
    pub fn new(freq: f32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * freq / SAMPLE_RATE as f32,
        }
    }

    /// Retune without a phase discontinuity.
    #[inline]
    pub fn set_frequency(&mut self, freq: f32) {
        self.step = TAU * freq / SAMPLE_RATE as f32;
    }

    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        let value = self.phase.sin();
        self.phase += self.step;
        if self.phase >= TAU {
            self.phase -= TAU;
        }
        value
    }
}

#[inline]
fn clamp_sample(value: f32) -> i16 {
    value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Appends `count` samples of a single tone.
pub fn push_tone(osc: &mut Oscillator, amplitude: f32, count: usize, law: Law, out: &mut Vec<u8>) {
    out.extend((0..count).map(|_| law.encode(clamp_sample(osc.next_sample() * amplitude))));
}

/// Appends `count` samples of two summed tones.
pub fn push_dual_tone(a: &mut Oscillator, b: &mut Oscillator, amplitude: f32, count: usize, law: Law, out: &mut Vec<u8>) {
    out.extend((0..count).map(|_| {
        let value = (a.next_sample() + b.next_sample()) * amplitude;
        law.encode(clamp_sample(value))
    }));
}

pub fn push_silence(count: usize, law: Law, out: &mut Vec<u8>) {
    let silence = law.silence();
    out.extend(std::iter::repeat(silence).take(count));
}

/// Builds the call waiting alert: SAS, optionally followed by CAS, then a short silence.
pub fn call_waiting_alert(with_cas: bool, law: Law) -> Vec<u8> {
    let mut out = Vec::with_capacity(SAS_SAMPLES + CAS_SAMPLES + ALERT_TAIL_SAMPLES);
    let mut sas = Oscillator::new(SAS_HZ);
    push_tone(&mut sas, TONE_AMPLITUDE, SAS_SAMPLES, law, &mut out);
    if with_cas {
        let mut low = Oscillator::new(CAS_HZ.0);
        let mut high = Oscillator::new(CAS_HZ.1);
        push_dual_tone(&mut low, &mut high, TONE_AMPLITUDE / 2.0, CAS_SAMPLES, law, &mut out);
    }
    push_silence(ALERT_TAIL_SAMPLES, law, &mut out);
    out
}

/// Number of alert samples (excluding the trailing silence).
pub fn alert_len(with_cas: bool) -> usize {
    if with_cas { SAS_SAMPLES + CAS_SAMPLES } else { SAS_SAMPLES }
}
