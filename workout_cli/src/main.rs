use clap::{Args, Parser, Subcommand, ValueEnum};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use workout_core::preferences::Preferences;
use workout_core::protocol::{self, Command, EchoControl, InboundFrame, RepNotification};
use workout_core::repository::{self, SessionRepository};
use workout_core::session::{EngineInput, Effect, SessionSettings};
use workout_core::*;

#[derive(Parser)]
#[command(name = "workout")]
#[command(about = "Active workout session engine for cable machines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed recorded telemetry (CSV) through the session state machine
    Replay {
        /// Sample CSV as written to metrics/<session-id>.csv
        samples: PathBuf,

        /// Working rep target; omit for an AMRAP set ended by auto-stop
        #[arg(long)]
        reps: Option<u8>,

        /// Weight per cable in kg, unless the exercise has a last-used weight
        #[arg(long, default_value_t = 20.0)]
        weight: f32,

        /// Replay as a just-lift set
        #[arg(long, conflicts_with = "reps")]
        just_lift: bool,

        /// Exercise id recorded with the session
        #[arg(long, default_value = "replay")]
        exercise: String,
    },

    /// Run one simulated cable set through the async engine
    Simulate {
        /// Working reps to perform
        #[arg(long, default_value_t = 10)]
        reps: u8,

        /// Warmup reps before the working set
        #[arg(long, default_value_t = 3)]
        warmup: u8,

        /// Weight per cable in kg, unless the exercise has a last-used weight
        #[arg(long, default_value_t = 20.0)]
        weight: f32,

        #[arg(long, default_value = "simulated")]
        exercise: String,
    },

    /// Print the wire frame of a command as hex
    Encode {
        #[command(subcommand)]
        command: EncodeCommand,
    },

    /// Decode a hex wire frame
    Decode {
        #[arg(value_enum)]
        kind: FrameKind,

        /// Frame bytes as hex (whitespace allowed)
        hex: String,

        /// Decode a rep notification in the legacy format
        #[arg(long)]
        legacy: bool,
    },

    /// Show recently completed sets (default)
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum EncodeCommand {
    Configure(ParamArgs),
    Start,
    Stop,
    Echo(ParamArgs),
}

#[derive(Args)]
struct ParamArgs {
    /// Mode code (0 old school, 1 pump, 2 TUT, 3 TUT beast, 4 eccentric only, 5 echo)
    #[arg(long, default_value_t = 0)]
    mode: u8,

    #[arg(long, default_value_t = 20.0)]
    weight: f32,

    #[arg(long, default_value_t = 10)]
    reps: u8,

    #[arg(long, default_value_t = 3)]
    warmup: u8,

    #[arg(long)]
    amrap: bool,

    #[arg(long)]
    just_lift: bool,

    /// Echo level code (0 hard .. 3 epic)
    #[arg(long, default_value_t = 0)]
    echo_level: u8,

    /// Eccentric load in percent of the concentric load
    #[arg(long, default_value_t = 100)]
    eccentric: u16,

    /// Per-rep load change in kg
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    progression: f32,
}

impl ParamArgs {
    fn to_params(&self) -> Result<WorkoutParameters> {
        let mode = WorkoutMode::from_code(self.mode)
            .ok_or_else(|| Error::Config(format!("unknown mode code {}", self.mode)))?;
        let echo_level = EchoLevel::from_code(self.echo_level)
            .ok_or_else(|| Error::Config(format!("unknown echo level {}", self.echo_level)))?;
        Ok(WorkoutParameters {
            mode,
            target_reps: self.reps,
            is_amrap: self.amrap,
            warmup_reps: self.warmup,
            weight_per_cable_kg: self.weight,
            progression_kg: self.progression,
            echo_level,
            eccentric_load_pct: self.eccentric,
            just_lift: self.just_lift,
            ..WorkoutParameters::default()
        })
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FrameKind {
    Command,
    Rep,
    Status,
    Monitor,
}

#[tokio::main]
async fn main() -> Result<()> {
    workout_core::logging::init();

    let cli = Cli::parse();

    let config = Config::load()?;
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());

    match cli.command {
        Some(Commands::Replay {
            samples,
            reps,
            weight,
            just_lift,
            exercise,
        }) => cmd_replay(&data_dir, &config, &samples, reps, weight, just_lift, exercise),
        Some(Commands::Simulate {
            reps,
            warmup,
            weight,
            exercise,
        }) => cmd_simulate(&data_dir, &config, reps, warmup, weight, exercise).await,
        Some(Commands::Encode { command }) => cmd_encode(command),
        Some(Commands::Decode { kind, hex, legacy }) => cmd_decode(kind, &hex, legacy),
        Some(Commands::History { limit }) => cmd_history(&data_dir, limit),
        None => cmd_history(&data_dir, 10),
    }
}

// ============================================================================
// replay
// ============================================================================

/// Carries out state machine effects synchronously; timers tick on sample time
struct Replay<'a> {
    machine: SessionStateMachine,
    repository: &'a repository::FileRepository,
    preferences: &'a PreferencesStore,
    timers: HashSet<TimerPurpose>,
    sent: Vec<&'static str>,
    record: Option<WorkoutSessionRecord>,
}

impl Replay<'_> {
    fn apply(&mut self, effects: Vec<Effect>) -> Result<()> {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Send(command) => {
                    // Encode anyway so bad parameters fail the replay like they would live
                    protocol::encode(&command)?;
                    self.sent.push(command.name());
                    queue.extend(self.machine.handle(EngineInput::CommandSent(command.name())));
                }
                Effect::StartTimer(purpose) => {
                    self.timers.insert(purpose);
                }
                Effect::CancelTimer(purpose) => {
                    self.timers.remove(&purpose);
                }
                Effect::SuspendStreams | Effect::ResumeStreams => {}
                Effect::SaveSession(record) => {
                    self.repository.save_session(&record)?;
                    self.record = Some(*record);
                }
                Effect::SaveMetrics {
                    session_id,
                    samples,
                } => self.repository.save_metrics(session_id, &samples)?,
                Effect::SaveDefaults {
                    exercise_id,
                    params,
                } => self
                    .preferences
                    .save_defaults(exercise_id.as_deref(), &params)?,
                Effect::Emit(EngineEvent::RomViolation(direction)) => {
                    println!("  ! Range of motion exceeded ({:?})", direction);
                }
                Effect::Emit(EngineEvent::Error(message)) => eprintln!("Error: {}", message),
                Effect::Emit(event) => tracing::debug!("Event: {:?}", event),
            }
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        let running: Vec<_> = self.timers.iter().copied().collect();
        for purpose in running {
            let effects = self.machine.handle(EngineInput::Tick(purpose));
            self.apply(effects)?;
        }
        Ok(())
    }
}

fn cmd_replay(
    data_dir: &Path,
    config: &Config,
    samples_path: &Path,
    reps: Option<u8>,
    weight: f32,
    just_lift: bool,
    exercise_id: String,
) -> Result<()> {
    let samples = repository::read_samples(samples_path)?;
    if samples.is_empty() {
        println!("No samples in {}", samples_path.display());
        return Ok(());
    }

    let repository = repository::FileRepository::new(data_dir);
    let preferences = PreferencesStore::in_dir(data_dir);
    let prefs = preferences.load()?;

    // Replay has no wall clock to count down against
    let settings = SessionSettings {
        countdown_secs: 0,
        ..SessionSettings::resolve(&config.timing, &prefs)
    };

    let setup = if just_lift {
        WorkoutSetup::JustLift(prefs.just_lift_params(weight))
    } else {
        let params = WorkoutParameters {
            target_reps: reps.unwrap_or(0),
            is_amrap: reps.is_none(),
            warmup_reps: 0,
            weight_per_cable_kg: weight,
            ..WorkoutParameters::default()
        };
        prefs.apply_saved_defaults(WorkoutSetup::Single {
            exercise: Exercise::cable(exercise_id.clone(), exercise_id),
            params,
        })
    };

    let mut replay = Replay {
        machine: SessionStateMachine::new(config.detection.clone(), settings),
        repository: &repository,
        preferences: &preferences,
        timers: HashSet::new(),
        sent: Vec::new(),
        record: None,
    };

    let effects = replay.machine.command(UserCommand::Load(setup))?;
    replay.apply(effects)?;
    let effects = replay.machine.command(UserCommand::Start)?;
    replay.apply(effects)?;

    let mut next_tick_ms = samples[0].timestamp_ms + 1000;
    let mut consumed = 0;
    for sample in &samples {
        if *replay.machine.state() != SessionState::Active {
            break;
        }
        while sample.timestamp_ms >= next_tick_ms {
            next_tick_ms += 1000;
            replay.tick()?;
        }
        let effects = replay.machine.handle(EngineInput::Sample(*sample));
        replay.apply(effects)?;
        consumed += 1;
    }

    if *replay.machine.state() == SessionState::Active {
        let effects = replay.machine.command(UserCommand::Stop)?;
        replay.apply(effects)?;
    }

    println!("Replayed {} of {} samples", consumed, samples.len());
    match &replay.record {
        Some(record) => print_record(record),
        None => println!("No set was completed."),
    }
    println!("  Commands: {}", replay.sent.join(", "));
    Ok(())
}

// ============================================================================
// simulate
// ============================================================================

async fn cmd_simulate(
    data_dir: &Path,
    config: &Config,
    reps: u8,
    warmup: u8,
    weight: f32,
    exercise_id: String,
) -> Result<()> {
    let transport = Arc::new(LoopbackTransport::new());
    let repository = Arc::new(repository::FileRepository::new(data_dir));
    let preferences = Arc::new(PreferencesStore::in_dir(data_dir));
    let engine = SessionEngine::spawn(config, transport.clone(), repository.clone(), preferences);
    let mut events = engine.subscribe_events();

    let params = WorkoutParameters {
        target_reps: reps,
        warmup_reps: warmup,
        weight_per_cable_kg: weight,
        ..WorkoutParameters::default()
    };
    engine
        .load(WorkoutSetup::Single {
            exercise: Exercise::cable(exercise_id.clone(), exercise_id),
            params,
        })
        .await?;
    engine.start_workout().await?;

    let state = wait_for(&engine, |s| {
        matches!(
            s,
            SessionState::Countdown(_) | SessionState::Active | SessionState::Idle
        )
    })
    .await?;
    if matches!(state, SessionState::Countdown(_)) {
        engine.skip_countdown().await?;
    } else if state == SessionState::Idle {
        engine.shutdown().await;
        return Err(Error::Transport("machine did not accept the set".into()));
    }

    let total = warmup as u32 + reps as u32;
    for n in 1..=total {
        transport.push_frame(InboundFrame::Rep {
            payload: protocol::encode_rep_notification(&RepNotification {
                up_counter: n,
                down_counter: n,
                rom: None,
            }),
            legacy: true,
        });
    }

    let outcome = wait_for(&engine, |s| {
        matches!(s, SessionState::SetSummary(_) | SessionState::Idle)
    })
    .await;
    engine.shutdown().await;

    match outcome? {
        SessionState::SetSummary(summary) => {
            println!(
                "Set complete: {} working reps ({} warmup)",
                summary.working_reps, summary.warmup_reps
            );
            println!("  Saved to {}", repository.sessions_path().display());
        }
        other => println!("Set ended in state {}", other.name()),
    }

    let mut reps_felt = 0;
    while let Ok(event) = events.try_recv() {
        if event == EngineEvent::Haptic(HapticCue::RepCompleted) {
            reps_felt += 1;
        }
    }
    tracing::debug!("{} rep haptics emitted", reps_felt);

    let frames: Vec<String> = transport.sent_frames().iter().map(|f| to_hex(f)).collect();
    println!("  Frames sent: {}", frames.join(" "));
    Ok(())
}

async fn wait_for<F>(engine: &EngineHandle, pred: F) -> Result<SessionState>
where
    F: Fn(&SessionState) -> bool,
{
    let mut rx = engine.state();
    let limit = Duration::from_secs(10);
    let state = tokio::time::timeout(limit, rx.wait_for(|s| pred(s)))
        .await
        .map_err(|_| Error::Timeout(limit.as_millis() as u64))?
        .map_err(|_| Error::State("engine stopped".into()))?;
    let snapshot = state.clone();
    Ok(snapshot)
}

// ============================================================================
// encode / decode
// ============================================================================

fn cmd_encode(command: EncodeCommand) -> Result<()> {
    let command = match command {
        EncodeCommand::Configure(args) => Command::Configure(args.to_params()?),
        EncodeCommand::Start => Command::Start,
        EncodeCommand::Stop => Command::Stop,
        EncodeCommand::Echo(args) => Command::Echo(EchoControl::from_params(&args.to_params()?)),
    };
    let frame = protocol::encode(&command)?;
    println!("{}", to_hex(&frame));
    Ok(())
}

fn cmd_decode(kind: FrameKind, hex: &str, legacy: bool) -> Result<()> {
    let bytes = from_hex(hex)?;
    match kind {
        FrameKind::Command => println!("{:#?}", protocol::decode(&bytes)?),
        FrameKind::Rep => println!("{:#?}", protocol::decode_rep_notification(&bytes, legacy)?),
        FrameKind::Status => println!("{:#?}", protocol::decode_status(&bytes)?),
        FrameKind::Monitor => println!("{:#?}", protocol::decode_monitor(&bytes)?),
    }
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

fn from_hex(input: &str) -> Result<Vec<u8>> {
    let clean: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&clean).map_err(|e| Error::Protocol(format!("invalid hex {:?}: {}", input, e)))
}

// ============================================================================
// history
// ============================================================================

fn cmd_history(data_dir: &Path, limit: usize) -> Result<()> {
    let repository = repository::FileRepository::new(data_dir);
    let sessions = repository::read_sessions(repository.sessions_path())?;

    if sessions.is_empty() {
        println!("No sessions recorded yet.");
        return Ok(());
    }

    let skip = sessions.len().saturating_sub(limit);
    for record in sessions.iter().skip(skip).rev() {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &WorkoutSessionRecord) {
    let summary = &record.summary;
    println!(
        "{}  {} @ {:.1} kg: {} reps ({} warmup), {:.1} s, {:?}",
        record
            .completed_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M"),
        record.exercise_name,
        record.weight_per_cable_kg,
        summary.working_reps,
        summary.warmup_reps,
        summary.duration_ms as f64 / 1000.0,
        record.reason
    );
}
