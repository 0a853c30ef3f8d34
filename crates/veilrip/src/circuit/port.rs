//! Local port selection for circuits.
//!
//! Selection is best-effort: two concurrent circuits may draw the same port.
//! The launcher reports that as [`CircuitError::PortInUse`](super::CircuitError)
//! and the supervisor simply draws again.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::RngExt;

/// Chooses the local port for the next circuit attempt.
pub trait PortSelector: Send + Sync + fmt::Debug {
    fn next_port(&self) -> u16;
}

/// Uniformly random port from a fixed range.
#[derive(Debug, Clone)]
pub struct RandomPortSelector {
    range: Range<u16>,
}

impl RandomPortSelector {
    /// `range` must be non-empty; [`EngineConfig::validate`](crate::EngineConfig::validate)
    /// checks this for configured ranges.
    pub fn new(range: Range<u16>) -> Self {
        debug_assert!(!range.is_empty(), "port range must not be empty");
        Self { range }
    }
}

impl PortSelector for RandomPortSelector {
    fn next_port(&self) -> u16 {
        if self.range.is_empty() {
            return self.range.start;
        }
        rand::rng().random_range(self.range.clone())
    }
}

/// Walks a range in order, wrapping around at the end.
///
/// Deterministic, which makes collisions reproducible.
#[derive(Debug)]
pub struct SequentialPortSelector {
    range: Range<u16>,
    next: AtomicUsize,
}

impl SequentialPortSelector {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            range,
            next: AtomicUsize::new(0),
        }
    }
}

impl PortSelector for SequentialPortSelector {
    fn next_port(&self) -> u16 {
        let len = self.range.len().max(1);
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % len;
        // offset < len <= u16::MAX - start, so the sum fits.
        self.range.start + offset as u16
    }
}
