//! Rep counting and online range-of-motion calibration.
//!
//! The counter consumes two inputs:
//! - discrete rep notifications from the machine (current format with ROM
//!   counters, or the legacy edge-only format), and
//! - continuous handle positions, used to learn the range when the machine
//!   gives no authoritative one and to infer the movement phase.
//!
//! Counts are monotone within a set: a notification that would lower a count
//! (counter reset, reordering) is ignored rather than applied.

use crate::config::DetectionConfig;
use crate::protocol::RepNotification;
use crate::types::{MovementPhase, RepCount, RepRanges, WorkoutParameters};

/// Rep milestones, in the order they happened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepEvent {
    WarmupRep(u32),
    WarmupComplete,
    WorkingRep(u32),
    TargetReached,
}

#[derive(Clone, Debug)]
pub struct RepCounter {
    min_range_mm: f32,
    danger_zone_fraction: f32,
    phase_hysteresis_mm: f32,

    warmup_target: u32,
    working_target: u32,
    is_just_lift: bool,
    stop_at_top: bool,
    is_amrap: bool,
    is_timed: bool,

    count: RepCount,
    last_up: u32,
    last_down: u32,
    counted_at_top: bool,

    extremes: Option<RepRanges>,
    seeded: bool,

    phase: MovementPhase,
    phase_anchor: Option<f32>,
}

impl RepCounter {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            min_range_mm: config.min_range_mm,
            danger_zone_fraction: config.danger_zone_fraction,
            phase_hysteresis_mm: config.phase_hysteresis_mm,
            warmup_target: 0,
            working_target: 0,
            is_just_lift: false,
            stop_at_top: false,
            is_amrap: false,
            is_timed: false,
            count: RepCount {
                is_warmup_complete: true,
                ..RepCount::default()
            },
            last_up: 0,
            last_down: 0,
            counted_at_top: false,
            extremes: None,
            seeded: false,
            phase: MovementPhase::Idle,
            phase_anchor: None,
        }
    }

    /// Reset all per-set state for a new set
    pub fn configure(
        &mut self,
        warmup_target: u32,
        working_target: u32,
        is_just_lift: bool,
        stop_at_top: bool,
        is_amrap: bool,
    ) {
        self.warmup_target = warmup_target;
        self.working_target = working_target;
        self.is_just_lift = is_just_lift;
        self.stop_at_top = stop_at_top;
        self.is_amrap = is_amrap;
        self.is_timed = false;

        self.count = RepCount {
            warmup_reps: 0,
            working_reps: 0,
            is_warmup_complete: warmup_target == 0,
        };
        self.last_up = 0;
        self.last_down = 0;
        self.counted_at_top = false;
        self.extremes = None;
        self.seeded = false;
        self.phase = MovementPhase::Idle;
        self.phase_anchor = None;

        tracing::debug!(
            "Rep counter configured: warmup={} working={} just_lift={} amrap={}",
            warmup_target,
            working_target,
            is_just_lift,
            is_amrap
        );
    }

    /// Configure from a set's parameters
    pub fn configure_for(&mut self, params: &WorkoutParameters) {
        self.configure(
            params.warmup_reps as u32,
            params.target_reps as u32,
            params.just_lift,
            params.stop_at_top,
            params.is_amrap,
        );
        self.is_timed = params.is_timed();
    }

    pub fn count(&self) -> RepCount {
        self.count
    }

    pub fn phase(&self) -> MovementPhase {
        self.phase
    }

    /// Accept the machine's range hint; only the first call per set counts
    pub fn seed_rom_boundaries(&mut self, top: f32, bottom: f32) {
        if self.seeded {
            return;
        }
        if !top.is_finite() || !bottom.is_finite() {
            tracing::warn!("Ignoring non-finite ROM seed top={} bottom={}", top, bottom);
            return;
        }
        let (lo, hi) = if top >= bottom { (bottom, top) } else { (top, bottom) };
        self.extremes = Some(RepRanges {
            min_pos_a: lo,
            max_pos_a: hi,
            min_pos_b: lo,
            max_pos_b: hi,
        });
        self.seeded = true;
        tracing::debug!("ROM seeded from machine: bottom={} top={}", lo, hi);
    }

    /// Ingest one rep notification and return the milestones it produced
    pub fn process(
        &mut self,
        notification: &RepNotification,
        pos_a: f32,
        pos_b: f32,
    ) -> Vec<RepEvent> {
        let mut events = Vec::new();

        match notification.rom {
            Some(rom) => {
                self.seed_rom_boundaries(rom.range_top, rom.range_bottom);
                self.apply_device_counters(
                    rom.rom_count as u32,
                    rom.rom_total as u32,
                    rom.set_count as u32,
                    &mut events,
                );
                self.last_up = self.last_up.max(notification.up_counter);
                self.last_down = self.last_down.max(notification.down_counter);
            }
            None => {
                self.apply_edges(notification.up_counter, notification.down_counter, &mut events);
            }
        }

        // Positions at the notification are real extremes of the movement
        self.update_position_ranges_continuously(pos_a, pos_b);
        events
    }

    /// Current format: convert the device's counters into our target frame
    fn apply_device_counters(
        &mut self,
        rom_count: u32,
        rom_total: u32,
        set_count: u32,
        events: &mut Vec<RepEvent>,
    ) {
        if !self.count.is_warmup_complete {
            let scaled = if rom_total == 0 {
                rom_count
            } else {
                rom_count * self.warmup_target / rom_total
            };
            let device_done = rom_total > 0 && rom_count >= rom_total;
            let target = if device_done {
                self.warmup_target
            } else {
                scaled.min(self.warmup_target)
            };
            while self.count.warmup_reps < target {
                self.record_warmup_rep(events);
            }
            if device_done && !self.count.is_warmup_complete {
                self.count.is_warmup_complete = true;
                events.push(RepEvent::WarmupComplete);
            }
        }

        if self.count.is_warmup_complete {
            while self.count.working_reps < set_count {
                self.record_working_rep(events);
            }
        }
    }

    /// Legacy format: count completed reps from edge counter deltas
    fn apply_edges(&mut self, up: u32, down: u32, events: &mut Vec<RepEvent>) {
        if up < self.last_up || down < self.last_down {
            tracing::warn!(
                "Rep counters went backwards (up {}->{}, down {}->{}); rebasing",
                self.last_up,
                up,
                self.last_down,
                down
            );
            self.last_up = up;
            self.last_down = down;
            return;
        }

        for _ in self.last_up..up {
            // Top of the final rep counts immediately when stopping at the top
            if self.stop_at_top && !self.counted_at_top && self.next_rep_completes_target() {
                self.record_rep(events);
                self.counted_at_top = true;
                break;
            }
        }
        for _ in self.last_down..down {
            if self.counted_at_top {
                self.counted_at_top = false;
                continue;
            }
            self.record_rep(events);
        }

        self.last_up = up;
        self.last_down = down;
    }

    fn next_rep_completes_target(&self) -> bool {
        self.count.is_warmup_complete
            && self.has_fixed_target()
            && self.count.working_reps + 1 == self.working_target
    }

    fn record_rep(&mut self, events: &mut Vec<RepEvent>) {
        if self.count.is_warmup_complete {
            self.record_working_rep(events);
        } else {
            self.record_warmup_rep(events);
        }
    }

    fn record_warmup_rep(&mut self, events: &mut Vec<RepEvent>) {
        self.count.warmup_reps += 1;
        events.push(RepEvent::WarmupRep(self.count.warmup_reps));
        if self.count.warmup_reps >= self.warmup_target {
            self.count.is_warmup_complete = true;
            events.push(RepEvent::WarmupComplete);
        }
    }

    fn record_working_rep(&mut self, events: &mut Vec<RepEvent>) {
        self.count.working_reps += 1;
        events.push(RepEvent::WorkingRep(self.count.working_reps));
        if self.has_fixed_target() && self.count.working_reps == self.working_target {
            events.push(RepEvent::TargetReached);
        }
    }

    fn has_fixed_target(&self) -> bool {
        !self.is_amrap && !self.is_just_lift && self.working_target > 0
    }

    /// Working target reached in a mode that ends on rep count
    pub fn should_stop_workout(&self) -> bool {
        self.has_fixed_target() && self.count.working_reps >= self.working_target
    }

    /// Infer concentric/eccentric phase from the position trend
    pub fn update_phase_from_position(&mut self, pos_a: f32, pos_b: f32) -> MovementPhase {
        let pos = pos_a.max(pos_b);
        let anchor = match self.phase_anchor {
            Some(anchor) => anchor,
            None => {
                self.phase_anchor = Some(pos);
                return self.phase;
            }
        };

        let delta = pos - anchor;
        if delta > self.phase_hysteresis_mm {
            self.phase = MovementPhase::Concentric;
            self.phase_anchor = Some(pos);
        } else if delta < -self.phase_hysteresis_mm {
            self.phase = MovementPhase::Eccentric;
            self.phase_anchor = Some(pos);
        }
        self.phase
    }

    /// Widen the learned range while the machine has not given an authoritative one
    pub fn update_position_ranges_continuously(&mut self, pos_a: f32, pos_b: f32) {
        if !pos_a.is_finite() || !pos_b.is_finite() {
            return;
        }
        let continuous_mode = self.is_just_lift || self.is_amrap || self.is_timed;
        if self.seeded && !continuous_mode {
            return;
        }

        match self.extremes.as_mut() {
            Some(r) => {
                r.min_pos_a = r.min_pos_a.min(pos_a);
                r.max_pos_a = r.max_pos_a.max(pos_a);
                r.min_pos_b = r.min_pos_b.min(pos_b);
                r.max_pos_b = r.max_pos_b.max(pos_b);
            }
            None => {
                self.extremes = Some(RepRanges {
                    min_pos_a: pos_a,
                    max_pos_a: pos_a,
                    min_pos_b: pos_b,
                    max_pos_b: pos_b,
                });
            }
        }
    }

    /// Carry a range learned outside the set (e.g. while waiting for a grab)
    pub fn restore_ranges(&mut self, ranges: RepRanges) {
        self.extremes = Some(ranges);
    }

    /// Either cable has travelled more than the minimum range
    pub fn has_meaningful_range(&self) -> bool {
        self.extremes.is_some_and(|r| {
            r.span_a() > self.min_range_mm || r.span_b() > self.min_range_mm
        })
    }

    /// Calibrated ranges, or `None` until the span is meaningful
    pub fn ranges(&self) -> Option<RepRanges> {
        if self.has_meaningful_range() {
            self.extremes
        } else {
            None
        }
    }

    /// Handles within the bottom slice of a calibrated range, on either cable
    pub fn is_in_danger_zone(&self, pos_a: f32, pos_b: f32, threshold: f32) -> bool {
        let Some(r) = self.extremes else {
            return false;
        };
        let near_floor = |pos: f32, min: f32, max: f32| {
            let span = max - min;
            span > threshold && pos <= min + span * self.danger_zone_fraction
        };
        near_floor(pos_a, r.min_pos_a, r.max_pos_a) || near_floor(pos_b, r.min_pos_b, r.max_pos_b)
    }

    pub fn min_range_mm(&self) -> f32 {
        self.min_range_mm
    }
}
