//! Automatic set termination for modes without a fixed rep target.
//!
//! Two independent paths feed one one-shot trigger:
//! - a velocity stall: peak cable speed stays below the low threshold while the
//!   user is actively using the machine, cleared by any burst above the high
//!   threshold;
//! - a position stall: handles rest below the rest threshold, or sit in the danger
//!   zone near the calibrated floor, for the position-stop duration.
//!
//! Whichever path completes first requests the stop. After that the detector is
//! latched until the next `reset`.

use crate::config::DetectionConfig;
use crate::rep_counter::RepCounter;
use crate::types::{AutoStopState, TelemetrySample, WorkoutParameters};

/// Which detector asked for the stop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopTrigger {
    VelocityStall,
    PositionStall,
}

/// Result of one tick: UI feedback plus an optional one-shot request
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AutoStopDecision {
    pub state: AutoStopState,
    pub request: Option<StopTrigger>,
}

#[derive(Clone, Debug)]
pub struct AutoStopDetector {
    velocity_low: f32,
    velocity_high: f32,
    stall_duration_ms: u64,
    position_duration_ms: u64,
    grace_ms: u64,
    rest_threshold_mm: f32,
    min_range_mm: f32,

    enabled: bool,
    stall_detection: bool,
    started_at: Option<u64>,
    stall_started: Option<u64>,
    position_started: Option<u64>,
    triggered: bool,
    state: AutoStopState,
}

impl AutoStopDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            velocity_low: config.stall_velocity_low,
            velocity_high: config.stall_velocity_high,
            stall_duration_ms: config.stall_duration_ms().max(1),
            position_duration_ms: config.position_stop_duration_ms().max(1),
            grace_ms: config.startup_grace_ms(),
            rest_threshold_mm: config.rest_threshold_mm,
            min_range_mm: config.min_range_mm,
            enabled: false,
            stall_detection: false,
            started_at: None,
            stall_started: None,
            position_started: None,
            triggered: false,
            state: AutoStopState::default(),
        }
    }

    /// Arm (or disarm) the detector for a new set
    pub fn reset(&mut self, params: &WorkoutParameters) {
        self.enabled = params.is_auto_stop_eligible();
        self.stall_detection = params.stall_detection;
        self.started_at = None;
        self.stall_started = None;
        self.position_started = None;
        self.triggered = false;
        self.state = AutoStopState::default();
    }

    pub fn state(&self) -> AutoStopState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_triggered(&self) -> bool {
        self.triggered
    }

    /// Drop running timers without un-latching, e.g. after a pause
    pub fn clear_timers(&mut self) {
        self.stall_started = None;
        self.position_started = None;
        self.state = AutoStopState::default();
    }

    /// A machine-reported deload counts as the start of a stall
    pub fn note_deload(&mut self, timestamp_ms: u64) {
        if self.enabled && self.stall_detection && !self.triggered {
            self.stall_started.get_or_insert(timestamp_ms);
            tracing::debug!("Deload at {} ms seeded the stall timer", timestamp_ms);
        }
    }

    /// Evaluate one validated sample
    pub fn update(&mut self, sample: &TelemetrySample, reps: &RepCounter) -> AutoStopDecision {
        if !self.enabled || self.triggered {
            return self.decision(None);
        }

        let now = sample.timestamp_ms;
        let started = *self.started_at.get_or_insert(now);
        let meaningful = reps.has_meaningful_range();

        if !meaningful && now.saturating_sub(started) < self.grace_ms {
            self.stall_started = None;
            self.position_started = None;
            self.state = AutoStopState::default();
            return self.decision(None);
        }

        let velocity = if self.stall_detection {
            self.track_velocity(sample, meaningful, now)
        } else {
            None
        };
        let position = self.track_position(sample, reps, meaningful, now);

        let leading = match (velocity, position) {
            (Some(v), Some(p)) => Some(if p.0 > v.0 { p } else { v }),
            (v, p) => v.or(p),
        };

        let Some((progress, remaining_ms, trigger)) = leading else {
            self.state = AutoStopState::default();
            return self.decision(None);
        };

        self.state = AutoStopState {
            is_active: true,
            progress,
            seconds_remaining: remaining_ms as f32 / 1000.0,
        };

        if progress >= 1.0 {
            self.triggered = true;
            tracing::info!("Auto-stop requested by {:?} at {} ms", trigger, now);
            return self.decision(Some(trigger));
        }
        self.decision(None)
    }

    fn track_velocity(
        &mut self,
        sample: &TelemetrySample,
        meaningful: bool,
        now: u64,
    ) -> Option<(f32, u64, StopTrigger)> {
        let speed = sample.peak_velocity();
        let actively_using = meaningful || sample.max_position() > self.rest_threshold_mm;

        if speed > self.velocity_high || !actively_using {
            self.stall_started = None;
        } else if speed < self.velocity_low {
            self.stall_started.get_or_insert(now);
        }

        let since = self.stall_started?;
        let (progress, remaining) = progress_of(now, since, self.stall_duration_ms);
        Some((progress, remaining, StopTrigger::VelocityStall))
    }

    fn track_position(
        &mut self,
        sample: &TelemetrySample,
        reps: &RepCounter,
        meaningful: bool,
        now: u64,
    ) -> Option<(f32, u64, StopTrigger)> {
        let at_rest = sample.max_position() < self.rest_threshold_mm;
        let in_danger =
            reps.is_in_danger_zone(sample.position_a, sample.position_b, self.min_range_mm);

        // Resting counts once past the grace window; the danger zone needs a floor
        if at_rest || (meaningful && in_danger) {
            self.position_started.get_or_insert(now);
        } else {
            self.position_started = None;
        }

        let since = self.position_started?;
        let (progress, remaining) = progress_of(now, since, self.position_duration_ms);
        Some((progress, remaining, StopTrigger::PositionStall))
    }

    fn decision(&self, request: Option<StopTrigger>) -> AutoStopDecision {
        AutoStopDecision {
            state: self.state,
            request,
        }
    }
}

fn progress_of(now: u64, since: u64, duration_ms: u64) -> (f32, u64) {
    let elapsed = now.saturating_sub(since).min(duration_ms);
    let progress = elapsed as f32 / duration_ms as f32;
    (progress, duration_ms - elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(stall_secs: f32) -> DetectionConfig {
        DetectionConfig {
            stall_duration_secs: stall_secs,
            ..DetectionConfig::default()
        }
    }

    fn sample(t: u64, pos: f32, vel: f32) -> TelemetrySample {
        TelemetrySample {
            timestamp_ms: t,
            position_a: pos,
            position_b: pos,
            velocity_a: vel,
            velocity_b: vel,
            load_a: 20.0,
            load_b: 20.0,
        }
    }

    /// Just-lift counter with a 0..400mm range already learned
    fn calibrated_reps(cfg: &DetectionConfig) -> RepCounter {
        let mut reps = RepCounter::new(cfg);
        reps.configure(0, 0, true, false, false);
        reps.update_position_ranges_continuously(0.0, 0.0);
        reps.update_position_ranges_continuously(400.0, 400.0);
        reps
    }

    fn armed(cfg: &DetectionConfig) -> AutoStopDetector {
        let mut detector = AutoStopDetector::new(cfg);
        detector.reset(&WorkoutParameters::just_lift(20.0));
        detector
    }

    #[test]
    fn test_velocity_stall_fires_exactly_once() {
        let cfg = config(3.0);
        let reps = calibrated_reps(&cfg);
        let mut detector = armed(&cfg);

        let mut requests = Vec::new();
        let mut progress_at_request = None;
        for t in (0..=4000).step_by(500) {
            let decision = detector.update(&sample(t, 200.0, 0.5), &reps);
            if let Some(trigger) = decision.request {
                requests.push(trigger);
                progress_at_request = Some(decision.state.progress);
            }
        }
        for t in (4500..=10_000).step_by(500) {
            assert!(detector.update(&sample(t, 200.0, 0.0), &reps).request.is_none());
        }

        assert_eq!(requests, vec![StopTrigger::VelocityStall]);
        assert_eq!(progress_at_request, Some(1.0));
        assert!(detector.has_triggered());
    }

    #[test]
    fn test_fast_movement_clears_stall() {
        let cfg = config(3.0);
        let reps = calibrated_reps(&cfg);
        let mut detector = armed(&cfg);

        detector.update(&sample(0, 200.0, 0.0), &reps);
        let d = detector.update(&sample(2000, 200.0, 0.0), &reps);
        assert!(d.state.progress > 0.6);

        let d = detector.update(&sample(2500, 220.0, 300.0), &reps);
        assert_eq!(d.state, AutoStopState::default());

        // Timer restarts from scratch
        detector.update(&sample(3000, 220.0, 0.0), &reps);
        let d = detector.update(&sample(5500, 220.0, 0.0), &reps);
        assert!(d.request.is_none());
        assert!((d.state.seconds_remaining - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_between_thresholds_holds_timer() {
        let cfg = config(3.0);
        let reps = calibrated_reps(&cfg);
        let mut detector = armed(&cfg);

        detector.update(&sample(0, 200.0, 0.0), &reps);
        // 5 mm/s is between low (2.5) and high (10): timer keeps running
        let d = detector.update(&sample(3000, 200.0, 5.0), &reps);
        assert_eq!(d.request, Some(StopTrigger::VelocityStall));
    }

    #[test]
    fn test_grace_period_suppresses_without_range() {
        let cfg = config(1.0);
        let mut reps = RepCounter::new(&cfg);
        reps.configure(0, 0, true, false, false);
        let mut detector = armed(&cfg);

        // Handles held out but motionless before any range is learned
        for t in (0..4500).step_by(500) {
            let d = detector.update(&sample(t, 100.0, 0.0), &reps);
            assert!(d.request.is_none(), "fired inside grace at {t}");
            assert!(!d.state.is_active);
        }

        // After the 5 s grace the handle-held stall counts
        detector.update(&sample(5000, 100.0, 0.0), &reps);
        let d = detector.update(&sample(6000, 100.0, 0.0), &reps);
        assert_eq!(d.request, Some(StopTrigger::VelocityStall));
    }

    #[test]
    fn test_position_rest_triggers_with_stall_detection_off() {
        let cfg = DetectionConfig::default();
        let reps = calibrated_reps(&cfg);
        let mut detector = AutoStopDetector::new(&cfg);
        let mut params = WorkoutParameters::just_lift(20.0);
        params.stall_detection = false;
        detector.reset(&params);

        detector.update(&sample(0, 2.0, 0.0), &reps);
        let d = detector.update(&sample(1500, 2.0, 0.0), &reps);
        assert!((d.state.progress - 0.5).abs() < 1e-3);

        let d = detector.update(&sample(3000, 2.0, 0.0), &reps);
        assert_eq!(d.request, Some(StopTrigger::PositionStall));
    }

    #[test]
    fn test_rest_without_range_stops_after_grace() {
        let cfg = DetectionConfig::default();
        let mut reps = RepCounter::new(&cfg);
        reps.configure(0, 0, true, false, false);
        let mut detector = armed(&cfg);

        // Handles never lifted: no meaningful range is ever learned
        let mut fired = Vec::new();
        for t in (0..=60_000).step_by(500) {
            let mut s = sample(t, 2.0, 0.0);
            s.load_a = 0.0;
            s.load_b = 0.0;
            let d = detector.update(&s, &reps);
            if t < cfg.startup_grace_ms() {
                assert!(!d.state.is_active, "active inside grace at {t}");
            }
            if let Some(trigger) = d.request {
                fired.push((t, trigger));
            }
        }

        assert!(!reps.has_meaningful_range());
        assert_eq!(fired.len(), 1);
        let (at, trigger) = fired[0];
        assert_eq!(trigger, StopTrigger::PositionStall);
        assert_eq!(at, cfg.startup_grace_ms() + cfg.position_stop_duration_ms());
    }

    #[test]
    fn test_fixed_rep_sets_are_not_monitored() {
        let cfg = DetectionConfig::default();
        let reps = calibrated_reps(&cfg);
        let mut detector = AutoStopDetector::new(&cfg);
        detector.reset(&WorkoutParameters::default());

        for t in (0..20_000).step_by(500) {
            assert!(detector.update(&sample(t, 0.0, 0.0), &reps).request.is_none());
        }
        assert!(!detector.is_enabled());
    }

    #[test]
    fn test_deload_seeds_stall_timer() {
        let cfg = config(3.0);
        let reps = calibrated_reps(&cfg);
        let mut detector = armed(&cfg);

        detector.note_deload(1000);
        let d = detector.update(&sample(4000, 200.0, 0.0), &reps);
        assert_eq!(d.request, Some(StopTrigger::VelocityStall));
    }
}
