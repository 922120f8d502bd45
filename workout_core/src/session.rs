//! Session lifecycle coordinator.
//!
//! `SessionStateMachine` owns all per-session state: the live `SessionState`, the
//! current set's parameters, and the detectors. It is synchronous. The runtime feeds
//! it inputs (samples, notifications, timer ticks, command acknowledgements, user
//! commands) and carries out the `Effect`s it returns. Detectors only return
//! decisions; every state change happens here.
//!
//! Set completion goes through one guarded handler. Whichever trigger arrives first
//! (rep target, machine-reported completion, auto-stop, duration expiry, user stop)
//! moves the gate from `Armed` to `Completing`; later triggers see a closed gate and
//! are ignored. The gate is re-armed only when the next set starts.

use crate::auto_stop::{AutoStopDetector, StopTrigger};
use crate::config::{DetectionConfig, TimingConfig};
use crate::metrics::MetricsAggregator;
use crate::preferences::UserPreferences;
use crate::protocol::{Command, EchoControl, Notification, RepNotification, StatusFlags};
use crate::rep_counter::{RepCounter, RepEvent};
use crate::rest_timer::{RestTick, RestTimerController, SetPosition};
use crate::telemetry::{validate_sample, HandleSample, HandleStateFilter};
use crate::types::*;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Something that happened outside the state machine
#[derive(Clone, Debug, PartialEq)]
pub enum EngineInput {
    Sample(TelemetrySample),
    Notification(Notification),
    Handle(HandleSample),
    Deload(DeloadEvent),
    Tick(TimerPurpose),
    /// A queued command reached the machine
    CommandSent(&'static str),
    CommandFailed {
        command: &'static str,
        error: String,
    },
}

/// Operations exposed to the UI
#[derive(Clone, Debug, PartialEq)]
pub enum UserCommand {
    Load(WorkoutSetup),
    Start,
    Stop,
    Pause,
    Resume,
    SkipRest,
    StartNextSet,
    AdjustWeight(f32),
    SkipCountdown,
    DismissSummary,
}

impl UserCommand {
    pub fn name(&self) -> &'static str {
        match self {
            UserCommand::Load(_) => "load",
            UserCommand::Start => "start",
            UserCommand::Stop => "stop",
            UserCommand::Pause => "pause",
            UserCommand::Resume => "resume",
            UserCommand::SkipRest => "skip rest",
            UserCommand::StartNextSet => "start next set",
            UserCommand::AdjustWeight(_) => "adjust weight",
            UserCommand::SkipCountdown => "skip countdown",
            UserCommand::DismissSummary => "dismiss summary",
        }
    }
}

/// Work the runtime performs on the machine's behalf
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Send(Command),
    /// Start (or restart) the 1 Hz timer for a purpose
    StartTimer(TimerPurpose),
    CancelTimer(TimerPurpose),
    /// Stop consuming telemetry and notifications (pause)
    SuspendStreams,
    ResumeStreams,
    SaveSession(Box<WorkoutSessionRecord>),
    SaveMetrics {
        session_id: Uuid,
        samples: Vec<TelemetrySample>,
    },
    SaveDefaults {
        exercise_id: Option<String>,
        params: WorkoutParameters,
    },
    Emit(EngineEvent),
}

/// Steps of set completion, run once per set in this order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionHook {
    StopMachine,
    BuildSummary,
    PersistSession,
    PersistMetrics,
    SaveDefaults,
    AnnounceEnd,
    Branch,
}

pub const COMPLETION_HOOKS: [CompletionHook; 7] = [
    CompletionHook::StopMachine,
    CompletionHook::BuildSummary,
    CompletionHook::PersistSession,
    CompletionHook::PersistMetrics,
    CompletionHook::SaveDefaults,
    CompletionHook::AnnounceEnd,
    CompletionHook::Branch,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompletionGate {
    Armed,
    Completing,
    Done,
}

struct CompletionContext {
    session_id: Uuid,
    reason: CompletionReason,
    summary: SetSummary,
}

/// Timing knobs: config defaults overlaid with user preferences
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSettings {
    pub countdown_secs: u32,
    pub summary_hold_secs: u32,
    pub auto_start_secs: u32,
    pub skip_summary_in_routine: bool,
    pub autoplay: bool,
    pub default_bodyweight_secs: u32,
}

impl SessionSettings {
    pub fn resolve(timing: &TimingConfig, prefs: &UserPreferences) -> Self {
        Self {
            countdown_secs: prefs.countdown_secs.unwrap_or(timing.countdown_secs),
            summary_hold_secs: prefs.summary_hold_secs.unwrap_or(timing.summary_hold_secs),
            auto_start_secs: timing.auto_start_secs,
            skip_summary_in_routine: prefs
                .skip_summary_in_routine
                .unwrap_or(timing.skip_summary_in_routine),
            autoplay: prefs.autoplay.unwrap_or(timing.autoplay),
            default_bodyweight_secs: timing.default_bodyweight_secs,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::resolve(&TimingConfig::default(), &UserPreferences::default())
    }
}

pub struct SessionStateMachine {
    detection: DetectionConfig,
    settings: SessionSettings,
    state: SessionState,

    setup: Option<WorkoutSetup>,
    exercise: Exercise,
    params: WorkoutParameters,
    position: SetPosition,

    reps: RepCounter,
    auto_stop: AutoStopDetector,
    handle: HandleStateFilter,
    rest: RestTimerController,
    aggregator: MetricsAggregator,

    gate: CompletionGate,
    samples: Vec<TelemetrySample>,
    last_position: (f32, f32),
    last_timestamp_ms: u64,
    last_status: StatusFlags,
    set_started_at: Option<DateTime<Utc>>,

    awaiting_ack: Option<&'static str>,
    countdown_after_ack: bool,
    countdown_remaining: u32,
    duration_remaining: u32,
    auto_start_pending: bool,
    auto_start_remaining: u32,
    summary_remaining: u32,
    completed_sets: u32,
}

impl SessionStateMachine {
    pub fn new(detection: DetectionConfig, settings: SessionSettings) -> Self {
        Self {
            reps: RepCounter::new(&detection),
            auto_stop: AutoStopDetector::new(&detection),
            handle: HandleStateFilter::new(detection.handle_dwell_ms),
            aggregator: MetricsAggregator::new(detection.max_load_kg),
            rest: RestTimerController::new(),
            detection,
            settings,
            state: SessionState::Idle,
            setup: None,
            exercise: Exercise::just_lift(),
            params: WorkoutParameters::default(),
            position: SetPosition::default(),
            gate: CompletionGate::Done,
            samples: Vec::new(),
            last_position: (0.0, 0.0),
            last_timestamp_ms: 0,
            last_status: StatusFlags::default(),
            set_started_at: None,
            awaiting_ack: None,
            countdown_after_ack: false,
            countdown_remaining: 0,
            duration_remaining: 0,
            auto_start_pending: false,
            auto_start_remaining: 0,
            summary_remaining: 0,
            completed_sets: 0,
        }
    }

    pub fn set_settings(&mut self, settings: SessionSettings) {
        self.settings = settings;
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn rep_count(&self) -> RepCount {
        self.reps.count()
    }

    pub fn rep_ranges(&self) -> Option<RepRanges> {
        self.reps.ranges()
    }

    pub fn auto_stop_state(&self) -> AutoStopState {
        self.auto_stop.state()
    }

    pub fn params(&self) -> &WorkoutParameters {
        &self.params
    }

    pub fn exercise(&self) -> &Exercise {
        &self.exercise
    }

    pub fn position(&self) -> SetPosition {
        self.position
    }

    /// Sets finished since the engine was created
    pub fn completed_sets(&self) -> u32 {
        self.completed_sets
    }

    /// Whether telemetry and notifications should be consumed
    pub fn wants_streams(&self) -> bool {
        self.state != SessionState::Paused
    }

    // ------------------------------------------------------------------
    // User commands
    // ------------------------------------------------------------------

    /// Apply a user command; illegal commands leave the state untouched
    pub fn command(&mut self, command: UserCommand) -> Result<Vec<Effect>> {
        let mut fx = Vec::new();
        match command {
            UserCommand::Load(setup) => self.load(setup, &mut fx)?,
            UserCommand::Start => self.start_workout(&mut fx)?,
            UserCommand::Stop => self.stop_workout(&mut fx),
            UserCommand::Pause => self.pause(&mut fx)?,
            UserCommand::Resume => self.resume(&mut fx)?,
            UserCommand::SkipRest => self.skip_rest(&mut fx)?,
            UserCommand::StartNextSet => self.start_next_set(&mut fx)?,
            UserCommand::AdjustWeight(delta) => self.adjust_weight(delta, &mut fx),
            UserCommand::SkipCountdown => self.skip_countdown(&mut fx)?,
            UserCommand::DismissSummary => self.dismiss_summary(&mut fx)?,
        }
        Ok(fx)
    }

    fn illegal(&self, action: &str) -> Error {
        Error::State(format!("cannot {} while {}", action, self.state.name()))
    }

    fn load(&mut self, setup: WorkoutSetup, fx: &mut Vec<Effect>) -> Result<()> {
        if !matches!(self.state, SessionState::Idle | SessionState::Completed) {
            return Err(self.illegal("load a workout"));
        }

        let (exercise, params, position) = match &setup {
            WorkoutSetup::JustLift(params) => {
                let params = WorkoutParameters {
                    just_lift: true,
                    ..params.clone()
                };
                (Exercise::just_lift(), params, SetPosition::default())
            }
            WorkoutSetup::Single { exercise, params } => {
                (exercise.clone(), params.clone(), SetPosition::default())
            }
            WorkoutSetup::Routine(routine) => {
                let first = RestTimerController::first_position(routine)
                    .ok_or_else(|| Error::Config(format!("routine '{}' has no sets", routine.name)))?;
                let entry = &routine.exercises[first.exercise];
                let params = entry
                    .params_for_set(first.set)
                    .ok_or_else(|| Error::Config(format!("routine '{}' has no sets", routine.name)))?;
                (entry.exercise.clone(), params, first)
            }
        };

        self.cancel_all_timers(fx);
        self.rest.cancel();
        self.reps.configure_for(&params);
        self.auto_stop.reset(&params);
        self.handle.reset();
        self.gate = CompletionGate::Done;
        self.auto_start_pending = false;

        tracing::info!("Loaded {} ({:?})", exercise.name, params.mode);
        self.exercise = exercise;
        self.params = params;
        self.position = position;
        self.setup = Some(setup);
        self.set_state(SessionState::Idle);
        Ok(())
    }

    fn start_workout(&mut self, fx: &mut Vec<Effect>) -> Result<()> {
        if self.state != SessionState::Idle || self.setup.is_none() {
            return Err(self.illegal("start a workout"));
        }
        self.start_set(true, fx);
        Ok(())
    }

    fn stop_workout(&mut self, fx: &mut Vec<Effect>) {
        match self.state {
            SessionState::Initializing | SessionState::Countdown(_) => {
                self.cancel_all_timers(fx);
                self.awaiting_ack = None;
                self.gate = CompletionGate::Done;
                if self.exercise.kind.uses_machine() {
                    fx.push(Effect::Send(Command::Stop));
                }
                self.set_state(SessionState::Idle);
            }
            SessionState::Active => self.complete(CompletionReason::UserStopped, fx),
            SessionState::Paused => {
                fx.push(Effect::ResumeStreams);
                self.complete(CompletionReason::UserStopped, fx);
            }
            SessionState::Resting { .. } | SessionState::SetSummary(_) => {
                self.cancel_all_timers(fx);
                self.rest.cancel();
                if matches!(self.setup, Some(WorkoutSetup::Routine(_))) {
                    self.set_state(SessionState::Completed);
                } else {
                    self.set_state(SessionState::Idle);
                }
            }
            SessionState::Idle => {
                if self.auto_start_pending {
                    self.auto_start_pending = false;
                    fx.push(Effect::CancelTimer(TimerPurpose::AutoStart));
                }
            }
            SessionState::Completed => {}
        }
    }

    fn pause(&mut self, fx: &mut Vec<Effect>) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(self.illegal("pause"));
        }
        fx.push(Effect::SuspendStreams);
        if self.is_duration_bound() {
            fx.push(Effect::CancelTimer(TimerPurpose::SetDuration));
        }
        self.set_state(SessionState::Paused);
        Ok(())
    }

    fn resume(&mut self, fx: &mut Vec<Effect>) -> Result<()> {
        if self.state != SessionState::Paused {
            return Err(self.illegal("resume"));
        }
        // Time spent paused must not count as a stall
        self.auto_stop.clear_timers();
        fx.push(Effect::ResumeStreams);
        if self.is_duration_bound() && self.duration_remaining > 0 {
            fx.push(Effect::StartTimer(TimerPurpose::SetDuration));
        }
        self.set_state(SessionState::Active);
        Ok(())
    }

    fn skip_rest(&mut self, fx: &mut Vec<Effect>) -> Result<()> {
        if !matches!(self.state, SessionState::Resting { .. }) {
            return Err(self.illegal("skip rest"));
        }
        fx.push(Effect::CancelTimer(TimerPurpose::Rest));
        self.advance(fx);
        Ok(())
    }

    fn start_next_set(&mut self, fx: &mut Vec<Effect>) -> Result<()> {
        match self.state {
            SessionState::Resting { .. } => {
                fx.push(Effect::CancelTimer(TimerPurpose::Rest));
            }
            SessionState::SetSummary(_) if self.rest.plan().is_some() => {
                fx.push(Effect::CancelTimer(TimerPurpose::Summary));
            }
            _ => return Err(self.illegal("start the next set")),
        }
        self.advance(fx);
        Ok(())
    }

    fn skip_countdown(&mut self, fx: &mut Vec<Effect>) -> Result<()> {
        if !matches!(self.state, SessionState::Countdown(_)) {
            return Err(self.illegal("skip the countdown"));
        }
        fx.push(Effect::CancelTimer(TimerPurpose::Countdown));
        self.begin_active(fx);
        Ok(())
    }

    fn dismiss_summary(&mut self, fx: &mut Vec<Effect>) -> Result<()> {
        if !matches!(self.state, SessionState::SetSummary(_)) {
            return Err(self.illegal("dismiss the summary"));
        }
        fx.push(Effect::CancelTimer(TimerPurpose::Summary));
        self.leave_summary(fx);
        Ok(())
    }

    /// Change the per-cable weight. During rest (or a summary that leads to rest)
    /// the edit is attached to the upcoming set and wins over its template.
    fn adjust_weight(&mut self, delta_kg: f32, fx: &mut Vec<Effect>) {
        let max = self.detection.max_load_kg;
        let adjust = |w: f32| (w + delta_kg).clamp(0.0, max);

        let before_next_set = matches!(
            self.state,
            SessionState::Resting { .. } | SessionState::SetSummary(_)
        );
        if before_next_set {
            if let Some(pending) = self.rest.pending_params() {
                let mut edited = pending.clone();
                edited.weight_per_cable_kg = adjust(edited.weight_per_cable_kg);
                tracing::info!("Next set weight set to {:.1} kg", edited.weight_per_cable_kg);
                self.rest.apply_edit(edited);
                return;
            }
        }

        self.params.weight_per_cable_kg = adjust(self.params.weight_per_cable_kg);
        tracing::info!("Weight set to {:.1} kg", self.params.weight_per_cable_kg);
        let live = matches!(
            self.state,
            SessionState::Initializing | SessionState::Active | SessionState::Countdown(_)
        );
        if live && self.exercise.kind.uses_machine() {
            fx.push(Effect::Send(Command::Configure(self.params.clone())));
        }
    }

    // ------------------------------------------------------------------
    // External inputs
    // ------------------------------------------------------------------

    /// Process one input. Never fails: bad data is logged and dropped.
    pub fn handle(&mut self, input: EngineInput) -> Vec<Effect> {
        let mut fx = Vec::new();
        match input {
            EngineInput::Sample(sample) => self.on_sample(sample, &mut fx),
            EngineInput::Notification(Notification::Rep(rep)) => self.on_rep(rep, &mut fx),
            EngineInput::Notification(Notification::Status(flags)) => {
                self.on_status(flags, &mut fx)
            }
            EngineInput::Handle(h) => {
                if let Some(confirmed) = self.handle.observe(h.state, h.timestamp_ms) {
                    self.on_handle_confirmed(confirmed, &mut fx);
                }
            }
            EngineInput::Deload(event) => {
                if self.state == SessionState::Active {
                    self.auto_stop.note_deload(event.timestamp_ms);
                }
            }
            EngineInput::Tick(purpose) => self.on_tick(purpose, &mut fx),
            EngineInput::CommandSent(name) => self.on_command_sent(name, &mut fx),
            EngineInput::CommandFailed { command, error } => {
                self.on_command_failed(command, &error, &mut fx)
            }
        }
        fx
    }

    fn on_sample(&mut self, sample: TelemetrySample, fx: &mut Vec<Effect>) {
        if let Some(confirmed) = self.handle.poll(sample.timestamp_ms) {
            self.on_handle_confirmed(confirmed, fx);
        }

        if let Err(reason) = validate_sample(&sample, &self.detection) {
            tracing::warn!("Dropped sample at {} ms: {}", sample.timestamp_ms, reason);
            return;
        }
        self.last_position = (sample.position_a, sample.position_b);
        self.last_timestamp_ms = sample.timestamp_ms;

        match self.state {
            SessionState::Active => {
                self.reps
                    .update_position_ranges_continuously(sample.position_a, sample.position_b);
                self.reps
                    .update_phase_from_position(sample.position_a, sample.position_b);
                self.samples.push(sample);

                let decision = self.auto_stop.update(&sample, &self.reps);
                if let Some(trigger) = decision.request {
                    self.complete(reason_for(trigger), fx);
                }
            }
            SessionState::Idle | SessionState::SetSummary(_) if self.auto_start_armed() => {
                self.reps
                    .update_position_ranges_continuously(sample.position_a, sample.position_b);
            }
            _ => {}
        }
    }

    fn on_rep(&mut self, rep: RepNotification, fx: &mut Vec<Effect>) {
        if self.state != SessionState::Active {
            tracing::debug!("Rep notification ignored while {}", self.state.name());
            return;
        }

        let (pos_a, pos_b) = self.last_position;
        for event in self.reps.process(&rep, pos_a, pos_b) {
            match event {
                RepEvent::WarmupRep(_) | RepEvent::WorkingRep(_) => {
                    fx.push(Effect::Emit(EngineEvent::Haptic(HapticCue::RepCompleted)))
                }
                RepEvent::WarmupComplete => {
                    fx.push(Effect::Emit(EngineEvent::Haptic(HapticCue::WarmupComplete)))
                }
                RepEvent::TargetReached => {}
            }
        }

        let device_done =
            rep.rom.is_some_and(|r| r.is_set_complete()) && !self.params.has_open_target();
        if self.reps.should_stop_workout() || device_done {
            let reason = if rep.is_legacy() {
                CompletionReason::TargetReached
            } else {
                CompletionReason::DeviceReported
            };
            self.complete(reason, fx);
        }
    }

    fn on_status(&mut self, flags: StatusFlags, fx: &mut Vec<Effect>) {
        let previous = std::mem::replace(&mut self.last_status, flags);
        if self.state != SessionState::Active {
            return;
        }

        if flags.rom_outside_high && !previous.rom_outside_high {
            tracing::warn!("Range of motion exceeded at the top");
            fx.push(Effect::Emit(EngineEvent::RomViolation(RomDirection::High)));
        }
        if flags.rom_outside_low && !previous.rom_outside_low {
            tracing::warn!("Range of motion exceeded at the bottom");
            fx.push(Effect::Emit(EngineEvent::RomViolation(RomDirection::Low)));
        }
        if flags.deload_occurred && !previous.deload_occurred {
            self.auto_stop.note_deload(self.last_timestamp_ms);
        }
    }

    fn on_handle_confirmed(&mut self, confirmed: HandleState, fx: &mut Vec<Effect>) {
        if !self.auto_start_armed() {
            return;
        }

        if confirmed.is_engaged() {
            if self.auto_start_pending {
                return;
            }
            if self.settings.auto_start_secs == 0 {
                self.auto_start(fx);
            } else {
                tracing::debug!("Handles grabbed; starting in {}s", self.settings.auto_start_secs);
                self.auto_start_pending = true;
                self.auto_start_remaining = self.settings.auto_start_secs;
                fx.push(Effect::StartTimer(TimerPurpose::AutoStart));
            }
        } else if confirmed == HandleState::Released && self.auto_start_pending {
            tracing::debug!("Handles released; auto-start cancelled");
            self.auto_start_pending = false;
            fx.push(Effect::CancelTimer(TimerPurpose::AutoStart));
        }
    }

    fn on_tick(&mut self, purpose: TimerPurpose, fx: &mut Vec<Effect>) {
        match purpose {
            TimerPurpose::Countdown => {
                let SessionState::Countdown(n) = self.state else {
                    return;
                };
                self.countdown_remaining = n.saturating_sub(1);
                if self.countdown_remaining == 0 {
                    fx.push(Effect::CancelTimer(TimerPurpose::Countdown));
                    self.begin_active(fx);
                } else {
                    self.set_state(SessionState::Countdown(self.countdown_remaining));
                }
            }
            TimerPurpose::Rest => {
                if !matches!(self.state, SessionState::Resting { .. }) {
                    return;
                }
                match self.rest.tick() {
                    RestTick::Counting(_) => self.set_state(self.resting_state()),
                    RestTick::Finished { auto_advance } => {
                        fx.push(Effect::CancelTimer(TimerPurpose::Rest));
                        if auto_advance {
                            self.advance(fx);
                        } else {
                            self.set_state(self.resting_state());
                        }
                    }
                    RestTick::Holding => fx.push(Effect::CancelTimer(TimerPurpose::Rest)),
                }
            }
            TimerPurpose::SetDuration => {
                if self.state != SessionState::Active {
                    return;
                }
                self.duration_remaining = self.duration_remaining.saturating_sub(1);
                if self.duration_remaining == 0 {
                    self.complete(CompletionReason::DurationElapsed, fx);
                }
            }
            TimerPurpose::AutoStart => {
                if !self.auto_start_pending {
                    return;
                }
                self.auto_start_remaining = self.auto_start_remaining.saturating_sub(1);
                if self.auto_start_remaining == 0 {
                    self.auto_start(fx);
                }
            }
            TimerPurpose::Summary => {
                // A zero count means the summary waits for the user
                if !matches!(self.state, SessionState::SetSummary(_)) || self.summary_remaining == 0 {
                    return;
                }
                self.summary_remaining -= 1;
                if self.summary_remaining == 0 {
                    fx.push(Effect::CancelTimer(TimerPurpose::Summary));
                    self.leave_summary(fx);
                }
            }
        }
    }

    fn on_command_sent(&mut self, name: &'static str, fx: &mut Vec<Effect>) {
        if self.state == SessionState::Initializing && self.awaiting_ack == Some(name) {
            self.awaiting_ack = None;
            self.after_initialized(fx);
        } else {
            tracing::trace!("{} command delivered", name);
        }
    }

    /// A failed delivery abandons a set that is still running and returns to Idle
    /// with the counters intact. A set that is already recorded keeps its summary,
    /// rest and routine position.
    fn on_command_failed(&mut self, command: &'static str, error: &str, fx: &mut Vec<Effect>) {
        tracing::error!("{} command failed: {}", command, error);
        let error_event = EngineEvent::Error(format!("{} command failed: {}", command, error));

        let in_flight = self.gate == CompletionGate::Armed
            && matches!(
                self.state,
                SessionState::Initializing
                    | SessionState::Countdown(_)
                    | SessionState::Active
                    | SessionState::Paused
            );
        if !in_flight {
            tracing::warn!("Set already finalised; staying in {:?}", self.state);
            fx.push(Effect::Emit(error_event));
            return;
        }

        self.cancel_all_timers(fx);
        self.rest.cancel();
        self.awaiting_ack = None;
        self.auto_start_pending = false;
        self.gate = CompletionGate::Done;
        if self.state == SessionState::Paused {
            fx.push(Effect::ResumeStreams);
        }
        self.set_state(SessionState::Idle);
        fx.push(Effect::Emit(error_event));
    }

    // ------------------------------------------------------------------
    // Set lifecycle
    // ------------------------------------------------------------------

    fn start_set(&mut self, with_countdown: bool, fx: &mut Vec<Effect>) {
        self.cancel_all_timers(fx);
        self.auto_start_pending = false;
        self.gate = CompletionGate::Armed;
        self.reps.configure_for(&self.params);
        self.auto_stop.reset(&self.params);
        self.samples.clear();
        self.last_status = StatusFlags::default();
        self.set_started_at = None;
        self.countdown_after_ack = with_countdown;
        self.duration_remaining = match (self.exercise.kind.uses_machine(), self.params.duration_secs) {
            (_, secs) if secs > 0 => secs as u32,
            (true, _) => 0,
            (false, _) => self.settings.default_bodyweight_secs,
        };

        tracing::info!(
            "Starting {} set {} at {:.1} kg",
            self.exercise.name,
            self.position.set + 1,
            self.params.weight_per_cable_kg
        );

        if self.exercise.kind.uses_machine() {
            fx.push(Effect::Send(Command::Configure(self.params.clone())));
            self.awaiting_ack = Some("configure");
            if self.params.mode.is_adaptive() {
                fx.push(Effect::Send(Command::Echo(EchoControl::from_params(&self.params))));
                self.awaiting_ack = Some("echo");
            }
            self.set_state(SessionState::Initializing);
        } else {
            self.awaiting_ack = None;
            self.after_initialized(fx);
        }
    }

    fn after_initialized(&mut self, fx: &mut Vec<Effect>) {
        let countdown = self.settings.countdown_secs;
        if self.countdown_after_ack && countdown > 0 {
            self.countdown_remaining = countdown;
            self.set_state(SessionState::Countdown(countdown));
            fx.push(Effect::StartTimer(TimerPurpose::Countdown));
        } else {
            self.begin_active(fx);
        }
    }

    fn begin_active(&mut self, fx: &mut Vec<Effect>) {
        self.set_started_at = Some(Utc::now());
        if self.exercise.kind.uses_machine() {
            fx.push(Effect::Send(Command::Start));
        }
        self.set_state(SessionState::Active);
        fx.push(Effect::Emit(EngineEvent::Haptic(HapticCue::WorkoutStart)));
        if self.is_duration_bound() {
            fx.push(Effect::StartTimer(TimerPurpose::SetDuration));
        }
    }

    /// Start a just-lift set on grab, keeping the range learned while waiting
    fn auto_start(&mut self, fx: &mut Vec<Effect>) {
        let learned = self.reps.ranges();
        self.start_set(false, fx);
        if let Some(ranges) = learned {
            self.reps.restore_ranges(ranges);
        }
    }

    /// The guarded completion handler
    fn complete(&mut self, reason: CompletionReason, fx: &mut Vec<Effect>) {
        let live = matches!(self.state, SessionState::Active | SessionState::Paused);
        if self.gate != CompletionGate::Armed || !live {
            tracing::debug!("Completion via {:?} ignored; set already ending", reason);
            return;
        }
        self.gate = CompletionGate::Completing;
        tracing::info!("Set complete: {:?}", reason);

        let mut ctx = CompletionContext {
            session_id: Uuid::new_v4(),
            reason,
            summary: SetSummary::default(),
        };
        for hook in COMPLETION_HOOKS {
            self.run_hook(hook, &mut ctx, fx);
        }
        self.gate = CompletionGate::Done;
    }

    fn run_hook(&mut self, hook: CompletionHook, ctx: &mut CompletionContext, fx: &mut Vec<Effect>) {
        match hook {
            CompletionHook::StopMachine => {
                fx.push(Effect::CancelTimer(TimerPurpose::SetDuration));
                fx.push(Effect::CancelTimer(TimerPurpose::AutoStart));
                if self.exercise.kind.uses_machine() {
                    fx.push(Effect::Send(Command::Stop));
                }
            }
            CompletionHook::BuildSummary => {
                let mut summary =
                    self.aggregator
                        .summarize(&self.samples, &self.params, self.reps.count());
                if summary.duration_ms == 0 {
                    if let Some(started) = self.set_started_at {
                        let elapsed = Utc::now() - started;
                        summary.duration_ms = elapsed.num_milliseconds().max(0) as u64;
                    }
                }
                ctx.summary = summary;
            }
            CompletionHook::PersistSession => {
                let now = Utc::now();
                let record = WorkoutSessionRecord {
                    id: ctx.session_id,
                    exercise_id: self.exercise.id.clone(),
                    exercise_name: self.exercise.name.clone(),
                    mode: self.params.mode,
                    started_at: self.set_started_at.unwrap_or(now),
                    completed_at: now,
                    weight_per_cable_kg: self.params.weight_per_cable_kg,
                    reason: ctx.reason,
                    summary: ctx.summary.clone(),
                };
                fx.push(Effect::SaveSession(Box::new(record)));
            }
            CompletionHook::PersistMetrics => {
                if !self.samples.is_empty() {
                    fx.push(Effect::SaveMetrics {
                        session_id: ctx.session_id,
                        samples: std::mem::take(&mut self.samples),
                    });
                }
            }
            CompletionHook::SaveDefaults => {
                let exercise_id = (!self.params.just_lift).then(|| self.exercise.id.clone());
                fx.push(Effect::SaveDefaults {
                    exercise_id,
                    params: self.params.clone(),
                });
            }
            CompletionHook::AnnounceEnd => {
                self.completed_sets += 1;
                fx.push(Effect::Emit(EngineEvent::Haptic(HapticCue::WorkoutEnd)));
                fx.push(Effect::Emit(EngineEvent::SetCompleted {
                    session_id: ctx.session_id,
                    reason: ctx.reason,
                }));
            }
            CompletionHook::Branch => {
                let summary = std::mem::take(&mut ctx.summary);
                self.branch(summary, fx);
            }
        }
    }

    /// Decide what follows a finished set
    fn branch(&mut self, summary: SetSummary, fx: &mut Vec<Effect>) {
        let open_target = self.params.has_open_target();
        let hold = self.settings.summary_hold_secs;

        let next = match &self.setup {
            Some(WorkoutSetup::Routine(routine)) => {
                Some(RestTimerController::plan_next(routine, self.position))
            }
            _ => None,
        };

        match next {
            Some(None) => self.finish_routine(fx),
            Some(Some(plan)) => {
                self.rest.begin(plan, self.settings.autoplay);
                if open_target && hold > 0 {
                    self.hold_summary(summary, hold, fx);
                } else if open_target || self.settings.skip_summary_in_routine {
                    self.begin_rest(fx);
                } else {
                    self.wait_on_summary(summary);
                }
            }
            None if open_target => {
                // Re-arm for the next cycle of this exercise
                self.reps.configure_for(&self.params);
                self.auto_stop.reset(&self.params);
                if hold > 0 {
                    self.hold_summary(summary, hold, fx);
                } else {
                    self.set_state(SessionState::Idle);
                }
            }
            None => self.wait_on_summary(summary),
        }
    }

    fn hold_summary(&mut self, summary: SetSummary, hold_secs: u32, fx: &mut Vec<Effect>) {
        self.summary_remaining = hold_secs;
        self.set_state(SessionState::SetSummary(Box::new(summary)));
        fx.push(Effect::StartTimer(TimerPurpose::Summary));
    }

    fn wait_on_summary(&mut self, summary: SetSummary) {
        self.summary_remaining = 0;
        self.set_state(SessionState::SetSummary(Box::new(summary)));
    }

    fn leave_summary(&mut self, fx: &mut Vec<Effect>) {
        if self.rest.plan().is_some() {
            self.begin_rest(fx);
        } else {
            self.set_state(SessionState::Idle);
        }
    }

    fn begin_rest(&mut self, fx: &mut Vec<Effect>) {
        if self.rest.plan().is_none() {
            self.set_state(SessionState::Idle);
            return;
        }
        if self.rest.remaining_secs() == 0 && self.settings.autoplay {
            self.advance(fx);
            return;
        }
        self.set_state(self.resting_state());
        if self.rest.remaining_secs() > 0 {
            fx.push(Effect::StartTimer(TimerPurpose::Rest));
        }
    }

    /// Move to the planned next set, honouring edits made during rest
    fn advance(&mut self, fx: &mut Vec<Effect>) {
        let Some(plan) = self.rest.take_next() else {
            self.set_state(SessionState::Idle);
            return;
        };
        self.position = plan.position;
        self.exercise = plan.exercise;
        self.params = plan.params;
        self.start_set(true, fx);
    }

    fn finish_routine(&mut self, fx: &mut Vec<Effect>) {
        self.rest.cancel();
        self.set_state(SessionState::Completed);
        if let Some(WorkoutSetup::Routine(routine)) = &self.setup {
            tracing::info!("Routine '{}' complete", routine.name);
            if let Some(day) = routine.cycle_day {
                fx.push(Effect::Emit(EngineEvent::CycleDayCompleted {
                    routine_id: routine.id.clone(),
                    day,
                }));
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn resting_state(&self) -> SessionState {
        match self.rest.plan() {
            Some(plan) => SessionState::Resting {
                remaining_secs: self.rest.remaining_secs(),
                next_label: plan.label.clone(),
                is_last_exercise: plan.is_last_exercise,
                superset: plan.superset.clone(),
            },
            None => SessionState::Idle,
        }
    }

    fn is_duration_bound(&self) -> bool {
        !self.exercise.kind.uses_machine() || self.params.is_timed()
    }

    fn auto_start_armed(&self) -> bool {
        if self.setup.is_none() || !self.params.auto_start || !self.exercise.kind.uses_machine() {
            return false;
        }
        match self.state {
            SessionState::Idle => true,
            SessionState::SetSummary(_) => self.params.just_lift,
            _ => false,
        }
    }

    fn cancel_all_timers(&self, fx: &mut Vec<Effect>) {
        for purpose in [
            TimerPurpose::Countdown,
            TimerPurpose::Rest,
            TimerPurpose::SetDuration,
            TimerPurpose::AutoStart,
            TimerPurpose::Summary,
        ] {
            fx.push(Effect::CancelTimer(purpose));
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state.name() != next.name() {
            tracing::info!("Session {} -> {}", self.state.name(), next.name());
        }
        self.state = next;
    }
}

fn reason_for(trigger: StopTrigger) -> CompletionReason {
    match trigger {
        StopTrigger::VelocityStall => CompletionReason::VelocityStall,
        StopTrigger::PositionStall => CompletionReason::PositionStall,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RomReport;
    use crate::types::{RoutineExercise, SetTemplate};

    fn settings() -> SessionSettings {
        SessionSettings {
            countdown_secs: 3,
            summary_hold_secs: 2,
            auto_start_secs: 3,
            skip_summary_in_routine: false,
            autoplay: true,
            default_bodyweight_secs: 30,
        }
    }

    fn machine() -> SessionStateMachine {
        SessionStateMachine::new(DetectionConfig::default(), settings())
    }

    fn sends(fx: &[Effect]) -> Vec<&'static str> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Send(c) => Some(c.name()),
                _ => None,
            })
            .collect()
    }

    fn saves(fx: &[Effect]) -> usize {
        fx.iter()
            .filter(|e| matches!(e, Effect::SaveSession(_)))
            .count()
    }

    fn completions(fx: &[Effect]) -> Vec<CompletionReason> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Emit(EngineEvent::SetCompleted { reason, .. }) => Some(*reason),
                _ => None,
            })
            .collect()
    }

    fn rep(n: u32) -> EngineInput {
        EngineInput::Notification(Notification::Rep(RepNotification {
            up_counter: n,
            down_counter: n,
            rom: None,
        }))
    }

    fn sample(t: u64, pos: f32, vel: f32) -> EngineInput {
        EngineInput::Sample(TelemetrySample {
            timestamp_ms: t,
            position_a: pos,
            position_b: pos,
            velocity_a: vel,
            velocity_b: vel,
            load_a: 20.0,
            load_b: 20.0,
        })
    }

    fn single(params: WorkoutParameters) -> WorkoutSetup {
        WorkoutSetup::Single {
            exercise: Exercise::cable("row", "Seated Row"),
            params,
        }
    }

    fn routine(sets: usize, cycle_day: Option<u32>) -> Routine {
        Routine {
            id: "push".into(),
            name: "Push Day".into(),
            exercises: vec![RoutineExercise {
                exercise: Exercise::cable("press", "Chest Press"),
                base: WorkoutParameters {
                    warmup_reps: 0,
                    ..WorkoutParameters::default()
                },
                sets: (0..sets)
                    .map(|_| SetTemplate {
                        reps: Some(2),
                        weight_per_cable_kg: 20.0,
                        duration_secs: None,
                    })
                    .collect(),
                rest_secs: 60,
                superset: None,
            }],
            cycle_day,
        }
    }

    /// Drive a freshly loaded cable set through configure, countdown and start
    fn run_to_active(m: &mut SessionStateMachine) -> Vec<Effect> {
        let mut fx = m.command(UserCommand::Start).unwrap();
        assert_eq!(m.state(), &SessionState::Initializing);
        fx.extend(m.handle(EngineInput::CommandSent("configure")));
        assert_eq!(m.state(), &SessionState::Countdown(3));
        for _ in 0..3 {
            fx.extend(m.handle(EngineInput::Tick(TimerPurpose::Countdown)));
        }
        assert_eq!(m.state(), &SessionState::Active);
        fx
    }

    #[test]
    fn test_fixed_rep_set_completes_on_target() {
        let mut m = machine();
        m.command(UserCommand::Load(single(WorkoutParameters::default())))
            .unwrap();
        let fx = run_to_active(&mut m);
        assert_eq!(sends(&fx), vec!["configure", "start"]);

        let mut fx = Vec::new();
        for n in 1..=13 {
            fx.extend(m.handle(rep(n)));
        }

        assert_eq!(
            m.rep_count(),
            RepCount {
                warmup_reps: 3,
                working_reps: 10,
                is_warmup_complete: true
            },
            "finished count stays visible behind the summary"
        );
        assert_eq!(completions(&fx), vec![CompletionReason::TargetReached]);
        assert_eq!(saves(&fx), 1);
        assert!(sends(&fx).contains(&"stop"));
        match m.state() {
            SessionState::SetSummary(summary) => {
                assert_eq!(summary.warmup_reps, 3);
                assert_eq!(summary.working_reps, 10);
            }
            other => panic!("expected summary, got {:?}", other),
        }

        m.command(UserCommand::DismissSummary).unwrap();
        assert_eq!(m.state(), &SessionState::Idle);
    }

    #[test]
    fn test_simultaneous_triggers_complete_once() {
        let mut m = machine();
        let params = WorkoutParameters {
            warmup_reps: 0,
            target_reps: 1,
            duration_secs: 1,
            ..WorkoutParameters::default()
        };
        m.command(UserCommand::Load(single(params))).unwrap();
        run_to_active(&mut m);

        let mut fx = m.handle(rep(1));
        fx.extend(m.handle(EngineInput::Tick(TimerPurpose::SetDuration)));
        fx.extend(m.command(UserCommand::Stop).unwrap());

        assert_eq!(saves(&fx), 1);
        assert_eq!(completions(&fx).len(), 1);
        assert_eq!(m.completed_sets(), 1);
    }

    #[test]
    fn test_device_reported_completion() {
        let mut m = machine();
        let params = WorkoutParameters {
            warmup_reps: 0,
            target_reps: 5,
            ..WorkoutParameters::default()
        };
        m.command(UserCommand::Load(single(params))).unwrap();
        run_to_active(&mut m);

        let fx = m.handle(EngineInput::Notification(Notification::Rep(RepNotification {
            up_counter: 5,
            down_counter: 5,
            rom: Some(RomReport {
                range_top: 600.0,
                range_bottom: 50.0,
                rom_count: 0,
                rom_total: 0,
                set_count: 5,
                set_total: 5,
            }),
        })));
        assert_eq!(completions(&fx), vec![CompletionReason::DeviceReported]);
    }

    #[test]
    fn test_bodyweight_never_touches_transport() {
        let mut m = machine();
        m.command(UserCommand::Load(WorkoutSetup::Single {
            exercise: Exercise::bodyweight("pushup", "Push-up"),
            params: WorkoutParameters::default(),
        }))
        .unwrap();

        let mut fx = m.command(UserCommand::Start).unwrap();
        assert_eq!(m.state(), &SessionState::Countdown(3));
        for _ in 0..3 {
            fx.extend(m.handle(EngineInput::Tick(TimerPurpose::Countdown)));
        }
        assert_eq!(m.state(), &SessionState::Active);
        assert!(fx.contains(&Effect::StartTimer(TimerPurpose::SetDuration)));

        for _ in 0..30 {
            fx.extend(m.handle(EngineInput::Tick(TimerPurpose::SetDuration)));
        }
        fx.extend(m.command(UserCommand::Stop).unwrap());

        assert!(sends(&fx).is_empty());
        assert_eq!(completions(&fx), vec![CompletionReason::DurationElapsed]);
    }

    #[test]
    fn test_pause_resume_preserves_counts_and_ranges() {
        let mut m = machine();
        m.command(UserCommand::Load(single(WorkoutParameters::default())))
            .unwrap();
        run_to_active(&mut m);

        m.handle(sample(0, 10.0, 50.0));
        m.handle(sample(500, 400.0, 50.0));
        for n in 1..=5 {
            m.handle(rep(n));
        }
        let reps = m.rep_count();
        let ranges = m.rep_ranges();
        assert!(ranges.is_some());

        let fx = m.command(UserCommand::Pause).unwrap();
        assert!(fx.contains(&Effect::SuspendStreams));
        assert!(!m.wants_streams());

        let fx = m.command(UserCommand::Resume).unwrap();
        assert!(fx.contains(&Effect::ResumeStreams));
        assert_eq!(m.state(), &SessionState::Active);
        assert_eq!(m.rep_count(), reps);
        assert_eq!(m.rep_ranges(), ranges);

        m.handle(rep(6));
        assert_eq!(m.rep_count().working_reps, reps.working_reps + 1);
    }

    #[test]
    fn test_command_failure_returns_to_idle() {
        let mut m = machine();
        m.command(UserCommand::Load(single(WorkoutParameters::default())))
            .unwrap();
        m.command(UserCommand::Start).unwrap();

        let fx = m.handle(EngineInput::CommandFailed {
            command: "configure",
            error: "timed out".into(),
        });
        assert_eq!(m.state(), &SessionState::Idle);
        assert!(fx
            .iter()
            .any(|e| matches!(e, Effect::Emit(EngineEvent::Error(msg)) if msg.contains("configure"))));

        // A late ack for the failed set is ignored
        m.handle(EngineInput::CommandSent("configure"));
        assert_eq!(m.state(), &SessionState::Idle);
    }

    #[test]
    fn test_failed_stop_after_recorded_set_keeps_routine_position() {
        let mut m = SessionStateMachine::new(
            DetectionConfig::default(),
            SessionSettings {
                skip_summary_in_routine: true,
                ..settings()
            },
        );
        m.command(UserCommand::Load(WorkoutSetup::Routine(routine(3, None))))
            .unwrap();
        run_to_active(&mut m);
        m.handle(rep(1));
        let fx = m.handle(rep(2));
        assert_eq!(saves(&fx), 1);
        assert!(sends(&fx).contains(&"stop"));
        assert!(matches!(m.state(), SessionState::Resting { .. }));

        let fx = m.handle(EngineInput::CommandFailed {
            command: "stop",
            error: "timed out".into(),
        });
        assert!(fx
            .iter()
            .any(|e| matches!(e, Effect::Emit(EngineEvent::Error(msg)) if msg.contains("stop"))));
        assert!(!fx.contains(&Effect::CancelTimer(TimerPurpose::Rest)));
        assert!(matches!(m.state(), SessionState::Resting { .. }));
        assert_eq!(m.position().set, 0);
        assert_eq!(m.completed_sets(), 1);

        // Rest still leads into the second set
        m.command(UserCommand::SkipRest).unwrap();
        assert_eq!(m.position().set, 1);
        assert_eq!(m.state(), &SessionState::Initializing);
    }

    #[test]
    fn test_weight_change_while_initializing_reconfigures() {
        let mut m = machine();
        m.command(UserCommand::Load(single(WorkoutParameters::default())))
            .unwrap();
        m.command(UserCommand::Start).unwrap();
        assert_eq!(m.state(), &SessionState::Initializing);

        let start_weight = m.params().weight_per_cable_kg;
        let fx = m.command(UserCommand::AdjustWeight(2.5)).unwrap();
        let configured = fx.iter().find_map(|e| match e {
            Effect::Send(Command::Configure(p)) => Some(p.weight_per_cable_kg),
            _ => None,
        });
        assert_eq!(configured, Some(start_weight + 2.5));
    }

    #[test]
    fn test_illegal_commands_are_rejected() {
        let mut m = machine();
        assert!(matches!(m.command(UserCommand::Pause), Err(Error::State(_))));
        assert!(matches!(m.command(UserCommand::Start), Err(Error::State(_))));
        assert!(matches!(m.command(UserCommand::SkipRest), Err(Error::State(_))));
        assert_eq!(m.state(), &SessionState::Idle);
    }

    #[test]
    fn test_just_lift_auto_starts_on_confirmed_grab() {
        let mut m = machine();
        m.command(UserCommand::Load(WorkoutSetup::JustLift(
            WorkoutParameters::just_lift(20.0),
        )))
        .unwrap();

        // Grab flaps back to released before the dwell time: nothing happens
        let fx = m.handle(EngineInput::Handle(HandleSample {
            state: HandleState::Grabbed,
            timestamp_ms: 0,
        }));
        assert!(fx.is_empty());
        m.handle(EngineInput::Handle(HandleSample {
            state: HandleState::Released,
            timestamp_ms: 100,
        }));

        m.handle(EngineInput::Handle(HandleSample {
            state: HandleState::Grabbed,
            timestamp_ms: 1000,
        }));
        let fx = m.handle(sample(1300, 100.0, 0.0));
        assert!(fx.contains(&Effect::StartTimer(TimerPurpose::AutoStart)));

        let mut fx = Vec::new();
        for _ in 0..3 {
            fx.extend(m.handle(EngineInput::Tick(TimerPurpose::AutoStart)));
        }
        assert_eq!(m.state(), &SessionState::Initializing);
        fx.extend(m.handle(EngineInput::CommandSent("configure")));

        // No countdown for auto-started sets
        assert_eq!(m.state(), &SessionState::Active);
        assert_eq!(sends(&fx), vec!["configure", "start"]);
    }

    #[test]
    fn test_just_lift_stall_holds_summary_then_rearms() {
        let mut m = SessionStateMachine::new(
            DetectionConfig {
                stall_duration_secs: 1.0,
                ..DetectionConfig::default()
            },
            settings(),
        );
        m.command(UserCommand::Load(WorkoutSetup::JustLift(
            WorkoutParameters::just_lift(20.0),
        )))
        .unwrap();
        m.command(UserCommand::Start).unwrap();
        m.handle(EngineInput::CommandSent("configure"));
        for _ in 0..3 {
            m.handle(EngineInput::Tick(TimerPurpose::Countdown));
        }

        m.handle(sample(0, 0.0, 200.0));
        m.handle(sample(500, 400.0, 200.0));
        let mut fx = Vec::new();
        for t in (1000..=3000).step_by(250) {
            fx.extend(m.handle(sample(t, 200.0, 0.0)));
        }
        assert_eq!(completions(&fx), vec![CompletionReason::VelocityStall]);
        assert!(fx.contains(&Effect::SaveDefaults {
            exercise_id: None,
            params: m.params().clone()
        }));
        assert!(matches!(m.state(), SessionState::SetSummary(_)));

        m.handle(EngineInput::Tick(TimerPurpose::Summary));
        m.handle(EngineInput::Tick(TimerPurpose::Summary));
        assert_eq!(m.state(), &SessionState::Idle);
    }

    #[test]
    fn test_routine_rest_edit_wins_and_cycle_day_completes() {
        let mut m = SessionStateMachine::new(
            DetectionConfig::default(),
            SessionSettings {
                skip_summary_in_routine: true,
                ..settings()
            },
        );
        m.command(UserCommand::Load(WorkoutSetup::Routine(routine(2, Some(4)))))
            .unwrap();
        run_to_active(&mut m);
        m.handle(rep(1));
        m.handle(rep(2));

        match m.state() {
            SessionState::Resting {
                remaining_secs,
                is_last_exercise,
                ..
            } => {
                assert_eq!(*remaining_secs, 60);
                assert!(*is_last_exercise);
            }
            other => panic!("expected rest, got {:?}", other),
        }
        m.handle(EngineInput::Tick(TimerPurpose::Rest));
        assert!(matches!(
            m.state(),
            SessionState::Resting {
                remaining_secs: 59,
                ..
            }
        ));

        m.command(UserCommand::AdjustWeight(5.0)).unwrap();
        let fx = m.command(UserCommand::SkipRest).unwrap();
        let configured = fx.iter().find_map(|e| match e {
            Effect::Send(Command::Configure(p)) => Some(p.weight_per_cable_kg),
            _ => None,
        });
        assert_eq!(configured, Some(25.0));
        assert_eq!(m.position().set, 1);

        m.handle(EngineInput::CommandSent("configure"));
        m.command(UserCommand::SkipCountdown).unwrap();
        let mut fx = m.handle(rep(1));
        fx.extend(m.handle(rep(2)));

        assert_eq!(m.state(), &SessionState::Completed);
        assert!(fx.contains(&Effect::Emit(EngineEvent::CycleDayCompleted {
            routine_id: "push".into(),
            day: 4
        })));
    }

    #[test]
    fn test_rest_autoplay_starts_next_set() {
        let mut m = SessionStateMachine::new(
            DetectionConfig::default(),
            SessionSettings {
                skip_summary_in_routine: true,
                ..settings()
            },
        );
        let mut r = routine(2, None);
        r.exercises[0].rest_secs = 2;
        m.command(UserCommand::Load(WorkoutSetup::Routine(r))).unwrap();
        run_to_active(&mut m);
        m.handle(rep(1));
        m.handle(rep(2));

        m.handle(EngineInput::Tick(TimerPurpose::Rest));
        let fx = m.handle(EngineInput::Tick(TimerPurpose::Rest));
        assert_eq!(m.state(), &SessionState::Initializing);
        assert_eq!(sends(&fx), vec!["configure"]);
    }

    #[test]
    fn test_summary_waits_for_user_in_routine() {
        let mut m = machine();
        m.command(UserCommand::Load(WorkoutSetup::Routine(routine(2, None))))
            .unwrap();
        run_to_active(&mut m);
        m.handle(rep(1));
        m.handle(rep(2));
        assert!(matches!(m.state(), SessionState::SetSummary(_)));

        // A stray summary tick must not advance a summary that waits for the user
        m.handle(EngineInput::Tick(TimerPurpose::Summary));
        assert!(matches!(m.state(), SessionState::SetSummary(_)));

        m.command(UserCommand::DismissSummary).unwrap();
        assert!(matches!(m.state(), SessionState::Resting { .. }));
    }

    #[test]
    fn test_adjust_weight_clamps_and_reconfigures_when_active() {
        let mut m = machine();
        m.command(UserCommand::Load(single(WorkoutParameters::default())))
            .unwrap();
        m.command(UserCommand::AdjustWeight(-50.0)).unwrap();
        assert_eq!(m.params().weight_per_cable_kg, 0.0);

        run_to_active(&mut m);
        let fx = m.command(UserCommand::AdjustWeight(1000.0)).unwrap();
        assert_eq!(m.params().weight_per_cable_kg, 220.0);
        assert_eq!(sends(&fx), vec!["configure"]);
    }

    #[test]
    fn test_echo_mode_sends_echo_control_before_countdown() {
        let mut m = machine();
        let params = WorkoutParameters {
            mode: WorkoutMode::Echo,
            ..WorkoutParameters::default()
        };
        m.command(UserCommand::Load(single(params))).unwrap();
        let fx = m.command(UserCommand::Start).unwrap();
        assert_eq!(sends(&fx), vec!["configure", "echo"]);

        m.handle(EngineInput::CommandSent("configure"));
        assert_eq!(m.state(), &SessionState::Initializing);
        m.handle(EngineInput::CommandSent("echo"));
        assert_eq!(m.state(), &SessionState::Countdown(3));
    }

    #[test]
    fn test_rom_violation_events_on_rising_edge() {
        let mut m = machine();
        m.command(UserCommand::Load(single(WorkoutParameters::default())))
            .unwrap();
        run_to_active(&mut m);

        let status = |raw| EngineInput::Notification(Notification::Status(StatusFlags::from_bits(raw)));
        let fx = m.handle(status(0b01));
        assert_eq!(fx, vec![Effect::Emit(EngineEvent::RomViolation(RomDirection::High))]);
        assert!(m.handle(status(0b01)).is_empty());
        let fx = m.handle(status(0b10));
        assert_eq!(fx, vec![Effect::Emit(EngineEvent::RomViolation(RomDirection::Low))]);
    }

    #[test]
    fn test_settings_overlay_preferences() {
        let prefs = UserPreferences {
            countdown_secs: Some(0),
            autoplay: Some(false),
            ..UserPreferences::default()
        };
        let s = SessionSettings::resolve(&TimingConfig::default(), &prefs);
        assert_eq!(s.countdown_secs, 0);
        assert!(!s.autoplay);
        assert_eq!(s.summary_hold_secs, 5);
    }
}
