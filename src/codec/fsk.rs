use std::f32::consts::TAU;
use super::{Law, Oscillator, SAMPLE_RATE, SAMPLES_PER_MS, push_tone};

/// Caller ID modem baud rate.
pub const BAUD: f32 = 1200.0;

/// Samples per bit at 1200 baud (fractional).
pub const SAMPLES_PER_BIT: f32 = SAMPLE_RATE as f32 / BAUD;

const FSK_AMPLITUDE: f32 = 8192.0;

/// Correlation window of the discriminator, in samples.
const WINDOW: usize = 6;

/// Minimum discriminator magnitude counted as a clear mark or space.
const DISC_THRESHOLD: f32 = 0.05;

/// FSK modem variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FskStandard {
    /// Bell 202: mark 1200 Hz, space 2200 Hz.
    Bell202,
    /// ITU-T V.23: mark 1300 Hz, space 2100 Hz.
    V23,
}

impl FskStandard {
    pub fn mark_hz(self) -> f32 {
        match self {
            FskStandard::Bell202 => 1200.0,
            FskStandard::V23 => 1300.0,
        }
    }

    pub fn space_hz(self) -> f32 {
        match self {
            FskStandard::Bell202 => 2200.0,
            FskStandard::V23 => 2100.0,
        }
    }
}

/// Phase-continuous FSK transmitter with async framing
/// (start bit, 8 data bits LSB first, stop bit).
pub struct FskModulator {
    standard: FskStandard,
    law: Law,
    osc: Oscillator,
    /// Fractional sample carry between bits.
    clock: f32,
}

impl FskModulator {
    pub fn new(standard: FskStandard, law: Law) -> Self {
        Self {
            standard,
            law,
            osc: Oscillator::new(standard.mark_hz()),
            clock: 0.0,
        }
    }

    fn bit(&mut self, mark: bool, out: &mut Vec<u8>) {
        self.clock += SAMPLES_PER_BIT;
        let count = self.clock as usize;
        self.clock -= count as f32;
        let freq = if mark { self.standard.mark_hz() } else { self.standard.space_hz() };
        self.osc.set_frequency(freq);
        push_tone(&mut self.osc, FSK_AMPLITUDE, count, self.law, out);
    }

    pub fn byte(&mut self, byte: u8, out: &mut Vec<u8>) {
        self.bit(false, out);
        for i in 0..8 {
            self.bit((byte >> i) & 1 == 1, out);
        }
        self.bit(true, out);
    }

    pub fn bytes(&mut self, bytes: &[u8], out: &mut Vec<u8>) {
        for byte in bytes {
            self.byte(*byte, out);
        }
    }

    /// Continuous mark for `ms` milliseconds.
    pub fn marks_ms(&mut self, ms: usize, out: &mut Vec<u8>) {
        self.osc.set_frequency(self.standard.mark_hz());
        push_tone(&mut self.osc, FSK_AMPLITUDE, ms * SAMPLES_PER_MS, self.law, out);
    }
}

/// A byte recovered by the demodulator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RxByte {
    pub value: u8,
    /// Bit-times of idle line seen before the start bit.
    pub idle_bits: u32,
}

#[derive(Copy, Clone, Debug)]
enum UartState {
    Hunt { saw_mark: bool },
    Byte { start: f32, bit: usize, value: u8 },
}

/// Non-coherent FSK receiver.
///
/// Each sample is classified by comparing the energy of a short window
/// correlated against the mark and space frequencies. A UART state machine
/// finds the falling edge of each start bit and samples the following bits
/// at their centers.
pub struct FskDemodulator {
    mark: [(f32, f32); WINDOW],
    space: [(f32, f32); WINDOW],
    /// Normalized samples, `history[0]` is absolute sample `offset`.
    history: Vec<f32>,
    offset: usize,
    /// Next absolute sample examined while hunting.
    cursor: usize,
    state: UartState,
    /// Where the current idle run began.
    idle_since: Option<f32>,
}

impl FskDemodulator {
    pub fn new(standard: FskStandard) -> Self {
        Self {
            mark: correlation_table(standard.mark_hz()),
            space: correlation_table(standard.space_hz()),
            history: Vec::new(),
            offset: 0,
            cursor: WINDOW - 1,
            state: UartState::Hunt { saw_mark: false },
            idle_since: None,
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.offset = 0;
        self.cursor = WINDOW - 1;
        self.state = UartState::Hunt { saw_mark: false };
        self.idle_since = None;
    }

    #[inline]
    fn end(&self) -> usize {
        self.offset + self.history.len()
    }

    /// Mark energy minus space energy for the window ending at absolute sample `n`.
    fn discriminate(&self, n: usize) -> f32 {
        let base = n + 1 - WINDOW - self.offset;
        let window = &self.history[base..base + WINDOW];
        let power = |table: &[(f32, f32); WINDOW]| {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (x, (c, s)) in window.iter().zip(table.iter()) {
                re += x * c;
                im -= x * s;
            }
            re * re + im * im
        };
        power(&self.mark) - power(&self.space)
    }

    /// Estimates the first sample of a start bit detected at `n`.
    fn locate_edge(&self, n: usize) -> f32 {
        let floor = (self.offset + WINDOW).max(n.saturating_sub(WINDOW));
        let mut k = n;
        while k > floor && self.discriminate(k - 1) < 0.0 {
            k -= 1;
        }
        let crossing = if k > floor {
            let prev = self.discriminate(k - 1);
            let cur = self.discriminate(k);
            (k - 1) as f32 + prev / (prev - cur)
        } else {
            k as f32
        };
        // The discriminator crosses zero once half the window holds space
        (crossing - 2.0).max(0.0)
    }

    pub fn feed(&mut self, samples: &[i16]) -> Vec<RxByte> {
        self.history.extend(samples.iter().map(|s| *s as f32 / 32768.0));
        let mut out = vec![];

        loop {
            match self.state {
                UartState::Hunt { saw_mark } => {
                    if self.cursor >= self.end() {
                        break;
                    }
                    let d = self.discriminate(self.cursor);
                    if d > DISC_THRESHOLD && !saw_mark {
                        self.state = UartState::Hunt { saw_mark: true };
                        if self.idle_since.is_none() {
                            self.idle_since = Some(self.cursor as f32);
                        }
                    } else if d < -DISC_THRESHOLD && saw_mark {
                        let start = self.locate_edge(self.cursor);
                        self.state = UartState::Byte { start, bit: 0, value: 0 };
                        continue;
                    }
                    self.cursor += 1;
                }
                UartState::Byte { start, bit, value } => {
                    let n = bit_sample(start, bit);
                    if n >= self.end() {
                        break;
                    }
                    let mark = self.discriminate(n) > 0.0;
                    match bit {
                        0 if mark => {
                            // Glitch, not a start bit
                            self.state = UartState::Hunt { saw_mark: true };
                            self.cursor = n + 1;
                        },
                        0..=8 => {
                            let value = if bit > 0 && mark { value | 1 << (bit - 1) } else { value };
                            self.state = UartState::Byte { start, bit: bit + 1, value };
                        },
                        _ => {
                            self.cursor = n + 1;
                            if mark {
                                let idle_bits = self.idle_since
                                    .map(|since| ((start - since) / SAMPLES_PER_BIT).max(0.0).round() as u32)
                                    .unwrap_or(0);
                                out.push(RxByte { value, idle_bits });
                                self.idle_since = Some(start + 10.0 * SAMPLES_PER_BIT);
                                self.state = UartState::Hunt { saw_mark: true };
                            } else {
                                self.idle_since = None;
                                self.state = UartState::Hunt { saw_mark: false };
                            }
                        }
                    }
                }
            }
        }

        self.trim();
        out
    }

    fn trim(&mut self) {
        let oldest = match self.state {
            UartState::Byte { start, .. } => (start as usize).min(self.cursor),
            UartState::Hunt { .. } => self.cursor,
        };
        let keep_from = oldest.saturating_sub(2 * WINDOW);
        if keep_from > self.offset {
            self.history.drain(..keep_from - self.offset);
            self.offset = keep_from;
        }
    }
}

fn correlation_table(freq: f32) -> [(f32, f32); WINDOW] {
    let mut table = [(0.0, 0.0); WINDOW];
    for (i, entry) in table.iter_mut().enumerate() {
        let angle = TAU * freq * i as f32 / SAMPLE_RATE as f32;
        *entry = (angle.cos(), angle.sin());
    }
    table
}

/// Window end sample that centers the window on bit `bit` of a byte starting at `start`.
#[inline]
fn bit_sample(start: f32, bit: usize) -> usize {
    (start + (bit as f32 + 0.5) * SAMPLES_PER_BIT + 2.0).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modulate(standard: FskStandard, law: Law, bytes: &[u8]) -> Vec<u8> {
        let mut out = vec![];
        let mut modem = FskModulator::new(standard, law);
        modem.marks_ms(30, &mut out);
        modem.bytes(bytes, &mut out);
        modem.marks_ms(10, &mut out);
        out
    }

    fn demodulate(standard: FskStandard, law: Law, spill: &[u8], chunk: usize) -> Vec<RxByte> {
        let mut demod = FskDemodulator::new(standard);
        let mut bytes = vec![];
        for frame in spill.chunks(chunk) {
            bytes.extend(demod.feed(&law.decode_all(frame)));
        }
        bytes
    }

    #[test]
    fn every_byte_value_survives_both_standards() {
        let payload: Vec<u8> = (0..=255).collect();
        for standard in [FskStandard::Bell202, FskStandard::V23] {
            for law in [Law::Ulaw, Law::Alaw] {
                let spill = modulate(standard, law, &payload);
                let rx: Vec<u8> = demodulate(standard, law, &spill, 160).iter().map(|b| b.value).collect();
                assert_eq!(rx, payload, "{:?} {:?}", standard, law);
            }
        }
    }

    #[test]
    fn odd_chunk_sizes_decode_identically() {
        let payload = b"0123456789 CALLER";
        let spill = modulate(FskStandard::Bell202, Law::Ulaw, payload);
        let a = demodulate(FskStandard::Bell202, Law::Ulaw, &spill, 7);
        let b = demodulate(FskStandard::Bell202, Law::Ulaw, &spill, 1000);
        assert_eq!(a, b);
        assert_eq!(a.iter().map(|b| b.value).collect::<Vec<_>>(), payload.to_vec());
    }

    #[test]
    fn idle_run_is_measured() {
        let spill = modulate(FskStandard::Bell202, Law::Ulaw, &[0x80, 0x01]);
        let rx = demodulate(FskStandard::Bell202, Law::Ulaw, &spill, 160);
        // 30 ms of marks is 36 bit-times
        assert!(rx[0].idle_bits >= 30, "{:?}", rx[0]);
        assert_eq!(rx[1].idle_bits, 0);
    }

    #[test]
    fn silence_yields_nothing() {
        let mut demod = FskDemodulator::new(FskStandard::V23);
        assert!(demod.feed(&[0; 8000]).is_empty());
    }
}
