//! Core domain types for the workout session engine.
//!
//! This module defines the fundamental types used throughout the system:
//! - Telemetry samples and rep/range state
//! - Workout parameters and modes
//! - Exercises, routines and supersets
//! - The session state machine's observable states and set summaries
//! - Events published to the UI

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Telemetry
// ============================================================================

/// One snapshot of both cables as reported by the machine.
///
/// Positions are millimetres of cable extension, velocities mm/s (positive while
/// the cable is being pulled out) and loads kg per cable.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct TelemetrySample {
    pub timestamp_ms: u64,
    pub position_a: f32,
    pub position_b: f32,
    pub velocity_a: f32,
    pub velocity_b: f32,
    pub load_a: f32,
    pub load_b: f32,
}

impl TelemetrySample {
    /// Fastest cable speed regardless of direction
    pub fn peak_velocity(&self) -> f32 {
        self.velocity_a.abs().max(self.velocity_b.abs())
    }

    /// Furthest-extended handle
    pub fn max_position(&self) -> f32 {
        self.position_a.max(self.position_b)
    }

    pub fn total_load(&self) -> f32 {
        self.load_a + self.load_b
    }
}

/// Raw activity classification of the handles reported by the machine
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Released,
    Grabbed,
    Moving,
    WaitingForRest,
}

impl HandleState {
    /// Whether the user is holding the handles
    pub fn is_engaged(self) -> bool {
        matches!(self, HandleState::Grabbed | HandleState::Moving)
    }
}

/// Cable-release event reported by the machine
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeloadEvent {
    pub timestamp_ms: u64,
}

/// Direction of travel inferred from position trend
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MovementPhase {
    #[default]
    Idle,
    Concentric,
    Eccentric,
}

// ============================================================================
// Rep State
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RepCount {
    pub warmup_reps: u32,
    pub working_reps: u32,
    pub is_warmup_complete: bool,
}

/// Calibrated range of motion for both cables
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct RepRanges {
    pub min_pos_a: f32,
    pub max_pos_a: f32,
    pub min_pos_b: f32,
    pub max_pos_b: f32,
}

impl RepRanges {
    pub fn span_a(&self) -> f32 {
        self.max_pos_a - self.min_pos_a
    }

    pub fn span_b(&self) -> f32 {
        self.max_pos_b - self.min_pos_b
    }
}

/// Auto-stop feedback for the UI; mirrors the detector's timers
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct AutoStopState {
    pub is_active: bool,
    pub progress: f32,
    pub seconds_remaining: f32,
}

// ============================================================================
// Workout Parameters
// ============================================================================

/// Resistance profile the machine applies
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkoutMode {
    #[default]
    OldSchool,
    Pump,
    Tut,
    TutBeast,
    EccentricOnly,
    /// Adaptive resistance; the machine picks the load in real time
    Echo,
}

impl WorkoutMode {
    pub fn code(self) -> u8 {
        match self {
            WorkoutMode::OldSchool => 0,
            WorkoutMode::Pump => 1,
            WorkoutMode::Tut => 2,
            WorkoutMode::TutBeast => 3,
            WorkoutMode::EccentricOnly => 4,
            WorkoutMode::Echo => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(WorkoutMode::OldSchool),
            1 => Some(WorkoutMode::Pump),
            2 => Some(WorkoutMode::Tut),
            3 => Some(WorkoutMode::TutBeast),
            4 => Some(WorkoutMode::EccentricOnly),
            5 => Some(WorkoutMode::Echo),
            _ => None,
        }
    }

    pub fn is_adaptive(self) -> bool {
        self == WorkoutMode::Echo
    }
}

/// Echo-mode difficulty
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EchoLevel {
    #[default]
    Hard,
    Harder,
    Hardest,
    Epic,
}

impl EchoLevel {
    pub fn code(self) -> u8 {
        match self {
            EchoLevel::Hard => 0,
            EchoLevel::Harder => 1,
            EchoLevel::Hardest => 2,
            EchoLevel::Epic => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EchoLevel::Hard),
            1 => Some(EchoLevel::Harder),
            2 => Some(EchoLevel::Hardest),
            3 => Some(EchoLevel::Epic),
            _ => None,
        }
    }
}

/// Configuration of one set. Replaced wholesale between sets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkoutParameters {
    pub mode: WorkoutMode,
    pub target_reps: u8,
    pub is_amrap: bool,
    pub warmup_reps: u8,
    pub weight_per_cable_kg: f32,
    /// Load change applied per rep; negative values regress
    pub progression_kg: f32,
    pub echo_level: EchoLevel,
    pub eccentric_load_pct: u16,
    pub stall_detection: bool,
    pub auto_start: bool,
    pub auto_stop: bool,
    pub just_lift: bool,
    pub stop_at_top: bool,
    /// Set length for timed sets; zero means untimed
    pub duration_secs: u16,
}

impl Default for WorkoutParameters {
    fn default() -> Self {
        Self {
            mode: WorkoutMode::OldSchool,
            target_reps: 10,
            is_amrap: false,
            warmup_reps: 3,
            weight_per_cable_kg: 10.0,
            progression_kg: 0.0,
            echo_level: EchoLevel::Hard,
            eccentric_load_pct: 100,
            stall_detection: true,
            auto_start: false,
            auto_stop: true,
            just_lift: false,
            stop_at_top: false,
            duration_secs: 0,
        }
    }
}

impl WorkoutParameters {
    /// Defaults for a just-lift session: no target, starts on grab, ends on stall
    pub fn just_lift(weight_per_cable_kg: f32) -> Self {
        Self {
            target_reps: 0,
            warmup_reps: 0,
            weight_per_cable_kg,
            auto_start: true,
            auto_stop: true,
            just_lift: true,
            ..Self::default()
        }
    }

    pub fn is_timed(&self) -> bool {
        self.duration_secs > 0
    }

    /// Modes without a fixed rep target end through the auto-stop detector
    pub fn has_open_target(&self) -> bool {
        self.just_lift || self.is_amrap || self.is_timed()
    }

    pub fn is_auto_stop_eligible(&self) -> bool {
        self.auto_stop && self.has_open_target()
    }
}

// ============================================================================
// Exercises and Routines
// ============================================================================

/// Equipment an exercise is performed with
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseKind {
    #[default]
    Cable,
    Bodyweight,
    Dumbbell,
    Barbell,
    Trx,
    Machine,
}

impl ExerciseKind {
    /// Only cable exercises are driven through the connected machine
    pub fn uses_machine(self) -> bool {
        self == ExerciseKind::Cable
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Exercise {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: ExerciseKind,
}

impl Exercise {
    pub fn cable(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: ExerciseKind::Cable,
        }
    }

    pub fn bodyweight(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: ExerciseKind::Bodyweight,
        }
    }

    /// Pseudo-exercise used for just-lift sessions
    pub fn just_lift() -> Self {
        Self::cable("just_lift", "Just Lift")
    }
}

/// Template for one planned set
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SetTemplate {
    /// `None` plans an AMRAP set
    pub reps: Option<u8>,
    pub weight_per_cable_kg: f32,
    #[serde(default)]
    pub duration_secs: Option<u16>,
}

/// Exercises sharing a group id alternate set by set with a shorter rest
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SupersetGroup {
    pub id: String,
    pub rest_secs: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RoutineExercise {
    pub exercise: Exercise,
    /// Mode, warmup and detection flags shared by every set of this exercise
    pub base: WorkoutParameters,
    pub sets: Vec<SetTemplate>,
    pub rest_secs: u32,
    #[serde(default)]
    pub superset: Option<SupersetGroup>,
}

impl RoutineExercise {
    /// Build the parameters for one of this exercise's sets
    pub fn params_for_set(&self, set_index: usize) -> Option<WorkoutParameters> {
        let template = self.sets.get(set_index)?;
        Some(WorkoutParameters {
            target_reps: template.reps.unwrap_or(0),
            is_amrap: template.reps.is_none(),
            weight_per_cable_kg: template.weight_per_cable_kg,
            duration_secs: template.duration_secs.unwrap_or(0),
            just_lift: false,
            ..self.base.clone()
        })
    }

    pub fn superset_id(&self) -> Option<&str> {
        self.superset.as_ref().map(|g| g.id.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Routine {
    pub id: String,
    pub name: String,
    pub exercises: Vec<RoutineExercise>,
    /// Training-cycle day this routine completes, if it belongs to a cycle
    #[serde(default)]
    pub cycle_day: Option<u32>,
}

/// Position of the upcoming exercise within its superset
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupersetInfo {
    pub group_id: String,
    /// 1-based position within the group
    pub position: usize,
    pub size: usize,
}

/// What the user asked the engine to run
#[derive(Clone, Debug, PartialEq)]
pub enum WorkoutSetup {
    /// Open-ended sets that start on grab and end on stall
    JustLift(WorkoutParameters),
    /// One set of one exercise
    Single {
        exercise: Exercise,
        params: WorkoutParameters,
    },
    Routine(Routine),
}

// ============================================================================
// Session State
// ============================================================================

/// The single live state of the session state machine
#[derive(Clone, Debug, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Countdown(u32),
    Initializing,
    Active,
    Resting {
        remaining_secs: u32,
        next_label: String,
        is_last_exercise: bool,
        superset: Option<SupersetInfo>,
    },
    Paused,
    SetSummary(Box<SetSummary>),
    Completed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Countdown(_) => "countdown",
            SessionState::Initializing => "initializing",
            SessionState::Active => "active",
            SessionState::Resting { .. } => "resting",
            SessionState::Paused => "paused",
            SessionState::SetSummary(_) => "set_summary",
            SessionState::Completed => "completed",
        }
    }
}

/// Independent timers the engine may run; one live timer per purpose
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    Countdown,
    Rest,
    SetDuration,
    AutoStart,
    Summary,
}

/// What ended a set
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    TargetReached,
    DeviceReported,
    VelocityStall,
    PositionStall,
    DurationElapsed,
    UserStopped,
}

// ============================================================================
// Summaries and Records
// ============================================================================

/// Concentric/eccentric force statistics for one cable (kg)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct ForceStats {
    pub peak_concentric: f32,
    pub avg_concentric: f32,
    pub peak_eccentric: f32,
    pub avg_eccentric: f32,
}

/// Average per-cable weight in each phase of an adaptive set
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct PhaseAverages {
    pub warmup_kg: f32,
    pub working_kg: f32,
    pub burnout_kg: f32,
}

/// Immutable statistics computed once when a set ends
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct SetSummary {
    pub warmup_reps: u32,
    pub working_reps: u32,
    pub duration_ms: u64,
    pub is_single_cable: bool,
    pub cable_a: ForceStats,
    pub cable_b: ForceStats,
    pub heaviest_lift_kg: f32,
    pub total_volume_kg: f32,
    pub estimated_calories: f32,
    pub phase_averages: Option<PhaseAverages>,
    pub samples_used: usize,
}

/// Persisted record of one completed set
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkoutSessionRecord {
    pub id: Uuid,
    pub exercise_id: String,
    pub exercise_name: String,
    pub mode: WorkoutMode,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub weight_per_cable_kg: f32,
    pub reason: CompletionReason,
    pub summary: SetSummary,
}

// ============================================================================
// Events
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HapticCue {
    RepCompleted,
    WarmupComplete,
    WorkoutStart,
    WorkoutEnd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RomDirection {
    High,
    Low,
}

/// One-shot notifications for the UI
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    Haptic(HapticCue),
    RomViolation(RomDirection),
    SetCompleted {
        session_id: Uuid,
        reason: CompletionReason,
    },
    CycleDayCompleted {
        routine_id: String,
        day: u32,
    },
    /// Transport failure; the session has been returned to a safe state
    Error(String),
}
