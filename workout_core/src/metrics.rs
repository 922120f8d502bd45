//! Set summary computation from the buffered telemetry of one set.

use crate::telemetry::is_load_in_range;
use crate::types::{
    ForceStats, PhaseAverages, RepCount, SetSummary, TelemetrySample, WorkoutParameters,
};

/// Standard gravity, m/s²
const GRAVITY: f32 = 9.81;

const JOULES_PER_KCAL: f32 = 4184.0;

/// Mechanical work is roughly a quarter of metabolic cost
const METABOLIC_MULTIPLIER: f32 = 4.0;

/// Cable travel assumed per rep when there is no telemetry to integrate (m)
const FALLBACK_ROM_M: f32 = 0.5;

/// Peak ratio between cables above which the set is treated as single-cable
const SINGLE_CABLE_RATIO: f32 = 5.0;

/// Samples below this fraction of a cable's peak load are noise
const FORCE_NOISE_FRACTION: f32 = 0.10;

/// Fraction of peak weight that marks the working phase of an adaptive set
const WORKING_PHASE_FRACTION: f32 = 0.90;

/// Stateless summarizer; holds only the machine's physical load limit
#[derive(Clone, Copy, Debug)]
pub struct MetricsAggregator {
    max_load_kg: f32,
}

impl MetricsAggregator {
    pub fn new(max_load_kg: f32) -> Self {
        Self { max_load_kg }
    }

    pub fn summarize(
        &self,
        samples: &[TelemetrySample],
        params: &WorkoutParameters,
        reps: RepCount,
    ) -> SetSummary {
        let valid: Vec<&TelemetrySample> = samples
            .iter()
            .filter(|s| {
                is_load_in_range(s.load_a, self.max_load_kg)
                    && is_load_in_range(s.load_b, self.max_load_kg)
            })
            .collect();
        let dropped = samples.len() - valid.len();
        if dropped > 0 {
            tracing::warn!("Excluded {} out-of-range samples from set metrics", dropped);
        }

        let peak_a = valid.iter().map(|s| s.load_a).fold(0.0, f32::max);
        let peak_b = valid.iter().map(|s| s.load_b).fold(0.0, f32::max);
        let is_single_cable = is_single_cable(peak_a, peak_b);
        let a_is_active = peak_a >= peak_b;

        let effective = |s: &TelemetrySample| -> f32 {
            if is_single_cable {
                if a_is_active {
                    s.load_a
                } else {
                    s.load_b
                }
            } else {
                s.total_load() / 2.0
            }
        };
        let weights: Vec<f32> = valid.iter().map(|s| effective(s)).collect();
        let heaviest_lift_kg = weights.iter().copied().fold(0.0, f32::max);

        let phase_averages = if params.mode.is_adaptive() {
            segment_phases(&weights)
        } else {
            None
        };

        let volume_weight = match phase_averages {
            Some(phases) => phases.working_kg,
            None => params.weight_per_cable_kg,
        };
        let cable_count = if is_single_cable { 1.0 } else { 2.0 };
        let total_volume_kg = volume_weight * cable_count * reps.working_reps as f32;

        let estimated_calories = if valid.len() >= 2 {
            integrate_calories(&valid)
        } else {
            total_volume_kg * GRAVITY * FALLBACK_ROM_M / JOULES_PER_KCAL * METABOLIC_MULTIPLIER
        };

        let duration_ms = match (valid.first(), valid.last()) {
            (Some(first), Some(last)) => last.timestamp_ms.saturating_sub(first.timestamp_ms),
            _ => 0,
        };

        SetSummary {
            warmup_reps: reps.warmup_reps,
            working_reps: reps.working_reps,
            duration_ms,
            is_single_cable,
            cable_a: force_stats(&valid, peak_a, |s| (s.load_a, s.velocity_a)),
            cable_b: force_stats(&valid, peak_b, |s| (s.load_b, s.velocity_b)),
            heaviest_lift_kg,
            total_volume_kg,
            estimated_calories,
            phase_averages,
            samples_used: valid.len(),
        }
    }
}

fn is_single_cable(peak_a: f32, peak_b: f32) -> bool {
    let (hi, lo) = if peak_a >= peak_b {
        (peak_a, peak_b)
    } else {
        (peak_b, peak_a)
    };
    hi > 0.0 && (lo <= 0.0 || hi / lo > SINGLE_CABLE_RATIO)
}

fn force_stats<F>(samples: &[&TelemetrySample], peak: f32, cable: F) -> ForceStats
where
    F: Fn(&TelemetrySample) -> (f32, f32),
{
    let floor = peak * FORCE_NOISE_FRACTION;
    let mut concentric = Vec::new();
    let mut eccentric = Vec::new();

    for s in samples {
        let (load, velocity) = cable(s);
        if load <= floor {
            continue;
        }
        if velocity > 0.0 {
            concentric.push(load);
        } else if velocity < 0.0 {
            eccentric.push(load);
        }
    }

    ForceStats {
        peak_concentric: concentric.iter().copied().fold(0.0, f32::max),
        avg_concentric: mean(&concentric),
        peak_eccentric: eccentric.iter().copied().fold(0.0, f32::max),
        avg_eccentric: mean(&eccentric),
    }
}

/// Trapezoidal work integral over both cables, converted to kcal
fn integrate_calories(samples: &[&TelemetrySample]) -> f32 {
    let joules: f32 = samples
        .windows(2)
        .map(|pair| {
            let (prev, next) = (pair[0], pair[1]);
            let work_a = (prev.load_a + next.load_a) / 2.0
                * GRAVITY
                * (next.position_a - prev.position_a).abs()
                / 1000.0;
            let work_b = (prev.load_b + next.load_b) / 2.0
                * GRAVITY
                * (next.position_b - prev.position_b).abs()
                / 1000.0;
            work_a + work_b
        })
        .sum();
    joules / JOULES_PER_KCAL * METABOLIC_MULTIPLIER
}

/// Split an adaptive set at the first and last samples near peak weight
fn segment_phases(weights: &[f32]) -> Option<PhaseAverages> {
    let peak = weights.iter().copied().fold(0.0, f32::max);
    if peak <= 0.0 {
        return None;
    }
    let cutoff = peak * WORKING_PHASE_FRACTION;
    let first = weights.iter().position(|w| *w >= cutoff)?;
    let last = weights.iter().rposition(|w| *w >= cutoff)?;

    Some(PhaseAverages {
        warmup_kg: mean(&weights[..first]),
        working_kg: mean(&weights[first..=last]),
        burnout_kg: mean(&weights[last + 1..]),
    })
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkoutMode;

    fn s(t: u64, pos: (f32, f32), vel: (f32, f32), load: (f32, f32)) -> TelemetrySample {
        TelemetrySample {
            timestamp_ms: t,
            position_a: pos.0,
            position_b: pos.1,
            velocity_a: vel.0,
            velocity_b: vel.1,
            load_a: load.0,
            load_b: load.1,
        }
    }

    fn reps(working: u32) -> RepCount {
        RepCount {
            warmup_reps: 0,
            working_reps: working,
            is_warmup_complete: true,
        }
    }

    fn agg() -> MetricsAggregator {
        MetricsAggregator::new(220.0)
    }

    #[test]
    fn test_single_cable_heaviest_not_halved() {
        let samples = vec![
            s(0, (0.0, 0.0), (100.0, 0.0), (10.0, 1.0)),
            s(100, (200.0, 0.0), (100.0, 0.0), (40.0, 2.0)),
            s(200, (100.0, 0.0), (-100.0, 0.0), (30.0, 2.0)),
        ];
        let params = WorkoutParameters {
            weight_per_cable_kg: 40.0,
            ..WorkoutParameters::default()
        };
        let summary = agg().summarize(&samples, &params, reps(5));

        assert!(summary.is_single_cable);
        assert_eq!(summary.heaviest_lift_kg, 40.0);
        assert_eq!(summary.total_volume_kg, 40.0 * 1.0 * 5.0);
    }

    #[test]
    fn test_dual_cable_uses_half_of_combined() {
        let samples = vec![
            s(0, (0.0, 0.0), (50.0, 50.0), (18.0, 22.0)),
            s(100, (100.0, 100.0), (50.0, 50.0), (20.0, 24.0)),
        ];
        let params = WorkoutParameters {
            weight_per_cable_kg: 20.0,
            ..WorkoutParameters::default()
        };
        let summary = agg().summarize(&samples, &params, reps(10));

        assert!(!summary.is_single_cable);
        assert_eq!(summary.heaviest_lift_kg, 22.0);
        assert_eq!(summary.total_volume_kg, 400.0);
    }

    #[test]
    fn test_out_of_range_loads_excluded() {
        let samples = vec![
            s(0, (0.0, 0.0), (50.0, 50.0), (20.0, 20.0)),
            s(100, (100.0, 100.0), (50.0, 50.0), (500.0, 20.0)),
            s(200, (150.0, 150.0), (50.0, 50.0), (-3.0, 20.0)),
            s(300, (200.0, 200.0), (50.0, 50.0), (25.0, 25.0)),
        ];
        let summary = agg().summarize(&samples, &WorkoutParameters::default(), reps(1));

        assert_eq!(summary.samples_used, 2);
        assert_eq!(summary.cable_a.peak_concentric, 25.0);
        assert_eq!(summary.heaviest_lift_kg, 25.0);
    }

    #[test]
    fn test_force_phases_split_by_velocity_sign_and_noise_floor() {
        let samples = vec![
            s(0, (0.0, 0.0), (80.0, 80.0), (30.0, 30.0)),
            s(100, (80.0, 80.0), (80.0, 80.0), (40.0, 40.0)),
            s(200, (40.0, 40.0), (-80.0, -80.0), (20.0, 20.0)),
            // Below 10% of the 40kg peak: ignored
            s(300, (0.0, 0.0), (-80.0, -80.0), (3.0, 3.0)),
        ];
        let summary = agg().summarize(&samples, &WorkoutParameters::default(), reps(1));

        assert_eq!(summary.cable_a.peak_concentric, 40.0);
        assert_eq!(summary.cable_a.avg_concentric, 35.0);
        assert_eq!(summary.cable_a.peak_eccentric, 20.0);
        assert_eq!(summary.cable_a.avg_eccentric, 20.0);
    }

    #[test]
    fn test_calories_integrate_force_times_displacement() {
        // 20kg per cable over 1m on each cable: 2 * 20 * 9.81 J
        let samples = vec![
            s(0, (0.0, 0.0), (1.0, 1.0), (20.0, 20.0)),
            s(1000, (1000.0, 1000.0), (1.0, 1.0), (20.0, 20.0)),
        ];
        let summary = agg().summarize(&samples, &WorkoutParameters::default(), reps(1));

        let expected = 2.0 * 20.0 * 9.81 / 4184.0 * 4.0;
        assert!((summary.estimated_calories - expected).abs() < 1e-4);
        assert_eq!(summary.duration_ms, 1000);
    }

    #[test]
    fn test_calorie_fallback_without_samples() {
        let params = WorkoutParameters {
            weight_per_cable_kg: 20.0,
            ..WorkoutParameters::default()
        };
        let summary = agg().summarize(&[], &params, reps(10));

        assert_eq!(summary.samples_used, 0);
        assert!(summary.estimated_calories > 0.0);
        // No load seen: treated as a dual-cable set at the programmed weight
        assert!(!summary.is_single_cable);
        assert_eq!(summary.total_volume_kg, 400.0);
    }

    #[test]
    fn test_echo_phase_segmentation() {
        let loads = [10.0, 15.0, 19.0, 20.0, 19.5, 20.0, 14.0, 12.0];
        let samples: Vec<_> = loads
            .iter()
            .enumerate()
            .map(|(i, l)| s(i as u64 * 100, (0.0, 0.0), (10.0, 10.0), (*l, *l)))
            .collect();
        let params = WorkoutParameters {
            mode: WorkoutMode::Echo,
            ..WorkoutParameters::default()
        };
        let summary = agg().summarize(&samples, &params, reps(4));

        let phases = summary.phase_averages.unwrap();
        assert_eq!(phases.warmup_kg, 12.5);
        assert_eq!(phases.working_kg, (19.0 + 20.0 + 19.5 + 20.0) / 4.0);
        assert_eq!(phases.burnout_kg, 13.0);
        assert_eq!(summary.total_volume_kg, phases.working_kg * 2.0 * 4.0);
    }

    #[test]
    fn test_fixed_mode_has_no_phases() {
        let samples = vec![s(0, (0.0, 0.0), (1.0, 1.0), (20.0, 20.0))];
        let summary = agg().summarize(&samples, &WorkoutParameters::default(), reps(1));
        assert!(summary.phase_averages.is_none());
    }
}
