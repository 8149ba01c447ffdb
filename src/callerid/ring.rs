use std::time::{Duration, Instant};
use crate::config::{DistinctiveRingConfig, DEFAULT_RING_RANGE_MS};

/// Pattern element that matches any gap.
pub const RING_WILDCARD: i32 = -1;

/// Number of gaps captured for distinctive ring matching.
pub const RING_GAPS: usize = 3;

/// A configured distinctive ring cadence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingPattern {
    /// Target gaps in milliseconds, `RING_WILDCARD` for don't care.
    pub gaps: [i32; RING_GAPS],
    /// Allowed deviation in milliseconds.
    pub range: u32,
    /// Context selected by a match.
    pub context: String,
    /// Ring count before caller id when ringing out with this cadence.
    pub cid_rings: Option<u32>,
}

impl RingPattern {
    pub fn new(gaps: [i32; RING_GAPS], range: u32, context: impl Into<String>) -> Self {
        Self {
            gaps,
            range,
            context: context.into(),
            cid_rings: None,
        }
    }

    /// Every element must match; a missing sample counts as zero.
    pub fn matches(&self, sample: &RingSample) -> bool {
        self.gaps.iter().enumerate().all(|(i, target)| {
            if *target == RING_WILDCARD {
                return true
            }
            let actual = sample.gaps.get(i).copied().unwrap_or(0) as i64;
            (actual - *target as i64).abs() <= self.range as i64
        })
    }
}

impl From<&DistinctiveRingConfig> for RingPattern {
    fn from(config: &DistinctiveRingConfig) -> Self {
        Self {
            gaps: config.pattern,
            range: config.range.unwrap_or(DEFAULT_RING_RANGE_MS),
            context: config.context.clone(),
            cid_rings: config.cid_rings,
        }
    }
}

/// First fully matching pattern, if any.
pub fn select_pattern<'a>(patterns: &'a [RingPattern], sample: &RingSample) -> Option<&'a RingPattern> {
    patterns.iter().find(|pattern| pattern.matches(sample))
}

/// Captured inter-ring gaps of one inbound ring sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RingSample {
    gaps: Vec<u32>,
}

impl RingSample {
    pub fn from_gaps(gaps: &[u32]) -> Self {
        Self {
            gaps: gaps.iter().copied().take(RING_GAPS).collect(),
        }
    }

    pub fn gaps(&self) -> &[u32] {
        &self.gaps
    }

    pub fn is_full(&self) -> bool {
        self.gaps.len() >= RING_GAPS
    }
}

/// Measures gaps between ring events.
#[derive(Clone, Debug)]
pub struct RingSampler {
    sample: RingSample,
    last_ring: Instant,
    /// Gaps longer than this end the capture.
    max_gap: Duration,
    done: bool,
}

impl RingSampler {
    pub fn new(reference: Instant, max_gap: Duration) -> Self {
        Self {
            sample: RingSample::default(),
            last_ring: reference,
            max_gap,
            done: false,
        }
    }

    /// Records a ring. Returns `true` once the capture is complete.
    pub fn ring(&mut self, now: Instant) -> bool {
        if self.done {
            return true
        }
        let gap = now.saturating_duration_since(self.last_ring);
        self.last_ring = now;
        if gap > self.max_gap {
            self.done = true;
            return true
        }
        self.sample.gaps.push(gap.as_millis() as u32);
        self.done = self.sample.is_full();
        self.done
    }

    /// Ends the capture when the line has been quiet for too long.
    pub fn poll(&mut self, now: Instant) -> bool {
        if !self.done && now.saturating_duration_since(self.last_ring) > self.max_gap {
            self.done = true;
        }
        self.done
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn sample(&self) -> &RingSample {
        &self.sample
    }
}
