use std::f32::consts::TAU;
use super::{Law, Oscillator, SAMPLE_RATE, push_dual_tone, push_silence};

const DTMF_ROW_FREQUENCIES: [f32; 4] = [697.0, 770.0, 852.0, 941.0];
const DTMF_COLUMN_FREQUENCIES: [f32; 4] = [1209.0, 1336.0, 1477.0, 1633.0];
const DTMF_KEYS: [[char; 4]; 4] = [
    ['1', '2', '3', 'A'],
    ['4', '5', '6', 'B'],
    ['7', '8', '9', 'C'],
    ['*', '0', '#', 'D'],
];

/// Goertzel block length. 102 samples puts adjacent row tones near a null.
pub const DTMF_BLOCK: usize = 102;

/// Per-component amplitude of generated digits.
const DTMF_AMPLITUDE: f32 = 6000.0;

/// Blocks quieter than this mean square are not analyzed.
const DTMF_MIN_MEAN_SQUARE: f32 = 200.0 * 200.0;

/// Fraction of block energy that must sit in the detected tone pair.
const DTMF_MIN_PAIR_RATIO: f32 = 0.5;

/// Strongest tone in a group must beat the runner-up by this factor.
const DTMF_DOMINANCE: f32 = 4.0;

/// Blocks that must agree before a digit registers.
const DTMF_HITS_TO_REGISTER: u8 = 2;

/// Empty blocks that release a registered digit.
const DTMF_MISSES_TO_RELEASE: u8 = 2;

/// Row and column frequency of a DTMF key.
pub fn dtmf_frequencies(digit: char) -> Option<(f32, f32)> {
    let digit = digit.to_ascii_uppercase();
    for (row, keys) in DTMF_KEYS.iter().enumerate() {
        if let Some(col) = keys.iter().position(|k| *k == digit) {
            return Some((DTMF_ROW_FREQUENCIES[row], DTMF_COLUMN_FREQUENCIES[col]))
        }
    }
    None
}

/// Appends one digit followed by a pause. Returns `false` for non-DTMF characters.
pub fn push_dtmf(digit: char, on_samples: usize, off_samples: usize, law: Law, out: &mut Vec<u8>) -> bool {
    let Some((row, col)) = dtmf_frequencies(digit) else {
        return false
    };
    let mut low = Oscillator::new(row);
    let mut high = Oscillator::new(col);
    push_dual_tone(&mut low, &mut high, DTMF_AMPLITUDE, on_samples, law, out);
    push_silence(off_samples, law, out);
    true
}

fn goertzel(block: &[f32], freq: f32) -> f32 {
    let coeff = 2.0 * (TAU * freq / SAMPLE_RATE as f32).cos();
    let (mut q1, mut q2) = (0.0f32, 0.0f32);
    for x in block {
        let q0 = coeff * q1 - q2 + x;
        q2 = q1;
        q1 = q0;
    }
    q1 * q1 + q2 * q2 - coeff * q1 * q2
}

/// Index of the strongest entry, and whether it dominates the rest.
fn dominant(powers: &[f32; 4]) -> (usize, bool) {
    let mut best = 0;
    for i in 1..4 {
        if powers[i] > powers[best] {
            best = i;
        }
    }
    let runner_up = powers.iter().enumerate()
        .filter(|(i, _)| *i != best)
        .map(|(_, p)| *p)
        .fold(0.0f32, f32::max);
    (best, powers[best] > runner_up * DTMF_DOMINANCE)
}

fn classify(block: &[f32]) -> Option<char> {
    let energy: f32 = block.iter().map(|x| x * x).sum();
    if energy / (block.len() as f32) < DTMF_MIN_MEAN_SQUARE {
        return None
    }

    let rows = DTMF_ROW_FREQUENCIES.map(|f| goertzel(block, f));
    let cols = DTMF_COLUMN_FREQUENCIES.map(|f| goertzel(block, f));
    let (row, row_ok) = dominant(&rows);
    let (col, col_ok) = dominant(&cols);
    if !row_ok || !col_ok {
        return None
    }

    // A pure tone of energy E over N samples has Goertzel power N*E/2
    let scale = energy * block.len() as f32 / 2.0;
    let pair = rows[row] + cols[col];
    if pair < scale * DTMF_MIN_PAIR_RATIO {
        return None
    }

    // Twist: neither tone may be much weaker than the other
    if rows[row] < pair / 10.0 || cols[col] < pair / 10.0 {
        return None
    }

    Some(DTMF_KEYS[row][col])
}

/// Block-based DTMF receiver with hit/miss debouncing.
#[derive(Default)]
pub struct DtmfDetector {
    block: Vec<f32>,
    candidate: Option<char>,
    hits: u8,
    misses: u8,
    current: Option<char>,
}

impl DtmfDetector {
    pub fn new() -> Self {
        Self {
            block: Vec::with_capacity(DTMF_BLOCK),
            ..Default::default()
        }
    }

    /// The digit currently held down, if any.
    pub fn current(&self) -> Option<char> {
        self.current
    }

    /// Feeds linear samples, returning digits that registered during them.
    pub fn feed(&mut self, samples: &[i16]) -> Vec<char> {
        let mut digits = vec![];
        for sample in samples {
            self.block.push(*sample as f32);
            if self.block.len() == DTMF_BLOCK {
                let hit = classify(&self.block);
                self.block.clear();
                self.step(hit, &mut digits);
            }
        }
        digits
    }

    fn step(&mut self, hit: Option<char>, digits: &mut Vec<char>) {
        match hit {
            Some(digit) => {
                self.misses = 0;
                if self.candidate == Some(digit) {
                    self.hits = self.hits.saturating_add(1);
                } else {
                    self.candidate = Some(digit);
                    self.hits = 1;
                }
                if self.hits >= DTMF_HITS_TO_REGISTER && self.current != Some(digit) {
                    self.current = Some(digit);
                    digits.push(digit);
                }
            },
            None => {
                self.candidate = None;
                self.hits = 0;
                self.misses = self.misses.saturating_add(1);
                if self.misses >= DTMF_MISSES_TO_RELEASE {
                    self.current = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SAMPLES_PER_MS;

    fn render(digits: &str, law: Law) -> Vec<i16> {
        let mut out = vec![];
        push_silence(400, law, &mut out);
        for d in digits.chars() {
            assert!(push_dtmf(d, 60 * SAMPLES_PER_MS, 60 * SAMPLES_PER_MS, law, &mut out));
        }
        law.decode_all(&out)
    }

    #[test]
    fn all_keys_are_detected() {
        let keys = "0123456789*#ABCD";
        for law in [Law::Ulaw, Law::Alaw] {
            let mut detector = DtmfDetector::new();
            let got: String = detector.feed(&render(keys, law)).into_iter().collect();
            assert_eq!(got, keys);
        }
    }

    #[test]
    fn repeated_digits_are_separate_presses() {
        let mut detector = DtmfDetector::new();
        let got: String = detector.feed(&render("1100", Law::Ulaw)).into_iter().collect();
        assert_eq!(got, "1100");
    }

    #[test]
    fn single_tone_is_not_a_digit() {
        let mut out = vec![];
        let mut osc = Oscillator::new(1209.0);
        crate::codec::push_tone(&mut osc, 8000.0, 4000, Law::Ulaw, &mut out);
        let mut detector = DtmfDetector::new();
        assert!(detector.feed(&Law::Ulaw.decode_all(&out)).is_empty());
    }

    #[test]
    fn unknown_characters_are_refused() {
        let mut out = vec![];
        assert!(!push_dtmf('x', 10, 10, Law::Ulaw, &mut out));
        assert!(out.is_empty());
        assert_eq!(dtmf_frequencies('a'), Some((697.0, 1633.0)));
    }
}
