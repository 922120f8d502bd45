//! Telemetry hygiene: physical-limit validation and handle-state hysteresis.
//!
//! Samples outside the machine's physical envelope are sensor noise. They are
//! dropped (and logged) before any detector or the metrics buffer sees them.

use crate::config::DetectionConfig;
use crate::types::{HandleState, TelemetrySample};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle activity as reported by the machine, stamped on arrival
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct HandleSample {
    pub state: HandleState,
    pub timestamp_ms: u64,
}

/// Why a sample was discarded
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SampleRejection {
    NotFinite,
    LoadOutOfRange { load_a: f32, load_b: f32 },
    PositionOutOfRange { position_a: f32, position_b: f32 },
}

impl fmt::Display for SampleRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleRejection::NotFinite => write!(f, "non-finite field"),
            SampleRejection::LoadOutOfRange { load_a, load_b } => {
                write!(f, "load out of range (a={load_a}, b={load_b})")
            }
            SampleRejection::PositionOutOfRange {
                position_a,
                position_b,
            } => write!(f, "position out of range (a={position_a}, b={position_b})"),
        }
    }
}

/// True when `load` is something the hardware can physically produce
pub fn is_load_in_range(load: f32, max_load_kg: f32) -> bool {
    load.is_finite() && (0.0..=max_load_kg).contains(&load)
}

/// Check a sample against the machine's physical limits
pub fn validate_sample(
    sample: &TelemetrySample,
    config: &DetectionConfig,
) -> Result<(), SampleRejection> {
    let fields = [
        sample.position_a,
        sample.position_b,
        sample.velocity_a,
        sample.velocity_b,
        sample.load_a,
        sample.load_b,
    ];
    if fields.iter().any(|v| !v.is_finite()) {
        return Err(SampleRejection::NotFinite);
    }

    if !is_load_in_range(sample.load_a, config.max_load_kg)
        || !is_load_in_range(sample.load_b, config.max_load_kg)
    {
        return Err(SampleRejection::LoadOutOfRange {
            load_a: sample.load_a,
            load_b: sample.load_b,
        });
    }

    let max_pos = config.max_position_mm;
    if sample.position_a.abs() > max_pos || sample.position_b.abs() > max_pos {
        return Err(SampleRejection::PositionOutOfRange {
            position_a: sample.position_a,
            position_b: sample.position_b,
        });
    }

    Ok(())
}

/// Confirms handle-state changes only after they persist for a dwell time.
///
/// Raw classification flaps near threshold boundaries; callers act on the
/// confirmed transitions this filter returns, never on raw states.
#[derive(Clone, Debug)]
pub struct HandleStateFilter {
    dwell_ms: u64,
    confirmed: HandleState,
    candidate: Option<(HandleState, u64)>,
}

impl HandleStateFilter {
    pub fn new(dwell_ms: u64) -> Self {
        Self {
            dwell_ms,
            confirmed: HandleState::Released,
            candidate: None,
        }
    }

    pub fn confirmed(&self) -> HandleState {
        self.confirmed
    }

    /// Feed a raw observation; returns the newly confirmed state, if any
    pub fn observe(&mut self, raw: HandleState, now_ms: u64) -> Option<HandleState> {
        if raw == self.confirmed {
            self.candidate = None;
            return None;
        }

        match self.candidate {
            Some((state, _)) if state == raw => {}
            _ => self.candidate = Some((raw, now_ms)),
        }
        self.poll(now_ms)
    }

    /// Confirm a pending candidate once its dwell time has passed
    pub fn poll(&mut self, now_ms: u64) -> Option<HandleState> {
        let (state, since) = self.candidate?;
        if now_ms.saturating_sub(since) < self.dwell_ms {
            return None;
        }
        tracing::debug!("Handle state confirmed: {:?} -> {:?}", self.confirmed, state);
        self.confirmed = state;
        self.candidate = None;
        Some(state)
    }

    pub fn reset(&mut self) {
        self.confirmed = HandleState::Released;
        self.candidate = None;
    }
}
