//! Async engine: the coordinator task and the small tasks around it.
//!
//! Task layout:
//! - the coordinator owns the `SessionStateMachine` and is its only writer;
//! - a telemetry task and a notification task forward the machine's streams while a
//!   set is not paused; handle-state and deload forwarders run for the whole engine;
//! - a command writer delivers frames one at a time, each bounded by the command
//!   timeout, and reports delivery or failure back to the coordinator;
//! - at most one 1 Hz timer task per `TimerPurpose`; starting one replaces the last.
//!
//! Observable state is published on `watch` channels after every input, and
//! one-shot events go out on a `broadcast` channel.

use crate::config::{Config, TimingConfig};
use crate::preferences::{Preferences, UserPreferences};
use crate::protocol::{self, Command};
use crate::repository::SessionRepository;
use crate::session::{EngineInput, Effect, SessionSettings, SessionStateMachine, UserCommand};
use crate::transport::Transport;
use crate::types::*;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const TICK: Duration = Duration::from_secs(1);
const INBOX_CAPACITY: usize = 256;
const REQUEST_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

enum Request {
    Command(UserCommand, oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<()>),
}

enum Message {
    Input(EngineInput),
    Tick(TimerPurpose, u64),
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<SessionState>,
    reps: watch::Receiver<RepCount>,
    ranges: watch::Receiver<Option<RepRanges>>,
    auto_stop: watch::Receiver<AutoStopState>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    pub async fn load(&self, setup: WorkoutSetup) -> Result<()> {
        self.request(UserCommand::Load(setup)).await
    }

    pub async fn start_workout(&self) -> Result<()> {
        self.request(UserCommand::Start).await
    }

    pub async fn stop_workout(&self) -> Result<()> {
        self.request(UserCommand::Stop).await
    }

    pub async fn pause_workout(&self) -> Result<()> {
        self.request(UserCommand::Pause).await
    }

    pub async fn resume_workout(&self) -> Result<()> {
        self.request(UserCommand::Resume).await
    }

    pub async fn skip_rest(&self) -> Result<()> {
        self.request(UserCommand::SkipRest).await
    }

    pub async fn start_next_set(&self) -> Result<()> {
        self.request(UserCommand::StartNextSet).await
    }

    pub async fn adjust_weight(&self, delta_kg: f32) -> Result<()> {
        self.request(UserCommand::AdjustWeight(delta_kg)).await
    }

    pub async fn skip_countdown(&self) -> Result<()> {
        self.request(UserCommand::SkipCountdown).await
    }

    pub async fn dismiss_summary(&self) -> Result<()> {
        self.request(UserCommand::DismissSummary).await
    }

    async fn request(&self, command: UserCommand) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Command(command, reply))
            .await
            .map_err(|_| Error::State("engine has shut down".into()))?;
        response
            .await
            .map_err(|_| Error::State("engine has shut down".into()))?
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn rep_count(&self) -> watch::Receiver<RepCount> {
        self.reps.clone()
    }

    pub fn rep_ranges(&self) -> watch::Receiver<Option<RepRanges>> {
        self.ranges.clone()
    }

    pub fn auto_stop(&self) -> watch::Receiver<AutoStopState> {
        self.auto_stop.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Stop every task, let queued commands and pending saves finish, then return
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.requests.send(Request::Shutdown(done)).await.is_ok() {
            let _ = finished.await;
        }
    }
}

/// Entry point for spawning the engine
pub struct SessionEngine;

impl SessionEngine {
    /// Spawn the engine on the current tokio runtime
    pub fn spawn<T: Transport>(
        config: &Config,
        transport: Arc<T>,
        repository: Arc<dyn SessionRepository>,
        preferences: Arc<dyn Preferences>,
    ) -> EngineHandle {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let machine = SessionStateMachine::new(
            config.detection.clone(),
            initial_settings(&config.timing, preferences.as_ref()),
        );
        let (state_tx, state_rx) = watch::channel(machine.state().clone());
        let (reps_tx, reps_rx) = watch::channel(machine.rep_count());
        let (ranges_tx, ranges_rx) = watch::channel(machine.rep_ranges());
        let (auto_stop_tx, auto_stop_rx) = watch::channel(machine.auto_stop_state());

        let writer = tokio::spawn(write_commands(
            transport.clone(),
            outbound_rx,
            inbox_tx.clone(),
            config.timing.command_timeout(),
        ));

        let mut coordinator = Coordinator {
            machine,
            transport,
            repository,
            preferences,
            timing: config.timing.clone(),
            inbox: inbox_tx,
            outbound: Some(outbound_tx),
            writer: Some(writer),
            timers: HashMap::new(),
            timer_generation: 0,
            streams: Vec::new(),
            passive: Vec::new(),
            persistence: Vec::new(),
            state_tx,
            reps_tx,
            ranges_tx,
            auto_stop_tx,
            events: events.clone(),
        };
        // Subscribe before returning so nothing pushed after spawn is missed
        coordinator.start_passive_streams();
        coordinator.resume_streams();
        tokio::spawn(coordinator.run(requests_rx, inbox_rx));

        tracing::info!("Session engine started");
        EngineHandle {
            requests: requests_tx,
            state: state_rx,
            reps: reps_rx,
            ranges: ranges_rx,
            auto_stop: auto_stop_rx,
            events,
        }
    }
}

fn initial_settings(timing: &TimingConfig, preferences: &dyn Preferences) -> SessionSettings {
    match preferences.load() {
        Ok(prefs) => SessionSettings::resolve(timing, &prefs),
        Err(e) => {
            tracing::warn!("Failed to load preferences: {}. Using config defaults.", e);
            SessionSettings::resolve(timing, &Default::default())
        }
    }
}

struct Coordinator<T: Transport> {
    machine: SessionStateMachine,
    transport: Arc<T>,
    repository: Arc<dyn SessionRepository>,
    preferences: Arc<dyn Preferences>,
    timing: TimingConfig,

    inbox: mpsc::Sender<Message>,
    outbound: Option<mpsc::UnboundedSender<Command>>,
    writer: Option<JoinHandle<()>>,
    timers: HashMap<TimerPurpose, (u64, JoinHandle<()>)>,
    timer_generation: u64,
    /// Telemetry and notification forwarders; dropped while paused
    streams: Vec<JoinHandle<()>>,
    /// Handle-state and deload forwarders
    passive: Vec<JoinHandle<()>>,
    persistence: Vec<JoinHandle<()>>,

    state_tx: watch::Sender<SessionState>,
    reps_tx: watch::Sender<RepCount>,
    ranges_tx: watch::Sender<Option<RepRanges>>,
    auto_stop_tx: watch::Sender<AutoStopState>,
    events: broadcast::Sender<EngineEvent>,
}

impl<T: Transport> Coordinator<T> {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut inbox: mpsc::Receiver<Message>,
    ) {
        loop {
            tokio::select! {
                biased;
                request = requests.recv() => match request {
                    Some(Request::Command(command, reply)) => {
                        let result = self.on_command(command).await;
                        let _ = reply.send(result);
                    }
                    Some(Request::Shutdown(done)) => {
                        self.shutdown(&mut inbox).await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.shutdown(&mut inbox).await;
                        return;
                    }
                },
                Some(message) = inbox.recv() => self.on_message(message),
            }
        }
    }

    async fn on_command(&mut self, mut command: UserCommand) -> Result<()> {
        let name = command.name();
        if matches!(
            command,
            UserCommand::Load(_) | UserCommand::Start | UserCommand::StartNextSet | UserCommand::SkipRest
        ) {
            let prefs = self.refresh_settings().await;
            command = match (command, prefs) {
                (UserCommand::Load(setup), Some(prefs)) => {
                    UserCommand::Load(prefs.apply_saved_defaults(setup))
                }
                (command, _) => command,
            };
        }

        match self.machine.command(command) {
            Ok(effects) => {
                self.apply(effects);
                self.publish();
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Rejected {}: {}", name, e);
                Err(e)
            }
        }
    }

    /// Preferences are re-read whenever the user starts something
    async fn refresh_settings(&mut self) -> Option<UserPreferences> {
        let preferences = self.preferences.clone();
        match tokio::task::spawn_blocking(move || preferences.load()).await {
            Ok(Ok(prefs)) => {
                self.machine
                    .set_settings(SessionSettings::resolve(&self.timing, &prefs));
                Some(prefs)
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to load preferences: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!("Preferences task failed: {}", e);
                None
            }
        }
    }

    fn on_message(&mut self, message: Message) {
        let input = match message {
            Message::Input(input) => input,
            Message::Tick(purpose, generation) => {
                let current = self.timers.get(&purpose).map(|(g, _)| *g);
                if current != Some(generation) {
                    tracing::trace!("Dropped stale {:?} tick", purpose);
                    return;
                }
                EngineInput::Tick(purpose)
            }
        };
        let effects = self.machine.handle(input);
        self.apply(effects);
        self.publish();
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(command) => self.queue_command(command),
                Effect::StartTimer(purpose) => self.start_timer(purpose),
                Effect::CancelTimer(purpose) => self.cancel_timer(purpose),
                Effect::SuspendStreams => self.suspend_streams(),
                Effect::ResumeStreams => self.resume_streams(),
                Effect::SaveSession(record) => {
                    let repository = self.repository.clone();
                    self.persist("save session", move || repository.save_session(&record));
                }
                Effect::SaveMetrics {
                    session_id,
                    samples,
                } => {
                    let repository = self.repository.clone();
                    self.persist("save metrics", move || {
                        repository.save_metrics(session_id, &samples)
                    });
                }
                Effect::SaveDefaults {
                    exercise_id,
                    params,
                } => {
                    let preferences = self.preferences.clone();
                    self.persist("save defaults", move || {
                        preferences.save_defaults(exercise_id.as_deref(), &params)
                    });
                }
                Effect::Emit(event) => {
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
            }
        }
    }

    fn publish(&self) {
        publish_if_changed(&self.state_tx, self.machine.state());
        publish_if_changed(&self.reps_tx, &self.machine.rep_count());
        publish_if_changed(&self.ranges_tx, &self.machine.rep_ranges());
        publish_if_changed(&self.auto_stop_tx, &self.machine.auto_stop_state());
    }

    fn queue_command(&mut self, command: Command) {
        let Some(outbound) = &self.outbound else {
            tracing::warn!("Dropped {} command during shutdown", command.name());
            return;
        };
        if outbound.send(command).is_err() {
            tracing::error!("Command writer has stopped");
        }
    }

    /// Fire-and-forget blocking write; failures are logged, never retried
    fn persist<F>(&mut self, what: &'static str, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.persistence.retain(|task| !task.is_finished());
        self.persistence.push(tokio::task::spawn_blocking(move || {
            if let Err(e) = job() {
                tracing::error!("Failed to {}: {}", what, e);
            }
        }));
    }

    fn start_timer(&mut self, purpose: TimerPurpose) {
        self.cancel_timer(purpose);
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let inbox = self.inbox.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + TICK, TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if inbox.send(Message::Tick(purpose, generation)).await.is_err() {
                    break;
                }
            }
        });
        tracing::trace!("Started {:?} timer", purpose);
        self.timers.insert(purpose, (generation, task));
    }

    fn cancel_timer(&mut self, purpose: TimerPurpose) {
        if let Some((_, task)) = self.timers.remove(&purpose) {
            task.abort();
            tracing::trace!("Cancelled {:?} timer", purpose);
        }
    }

    fn start_passive_streams(&mut self) {
        self.passive.push(forward(
            self.transport.subscribe_handle_state(),
            self.inbox.clone(),
            "handle",
            |h| Some(EngineInput::Handle(h)),
        ));
        self.passive.push(forward(
            self.transport.subscribe_deload(),
            self.inbox.clone(),
            "deload",
            |d| Some(EngineInput::Deload(d)),
        ));
    }

    fn resume_streams(&mut self) {
        if !self.streams.is_empty() {
            return;
        }
        self.streams.push(forward(
            self.transport.subscribe_telemetry(),
            self.inbox.clone(),
            "telemetry",
            |s| Some(EngineInput::Sample(s)),
        ));
        self.streams.push(forward(
            self.transport.subscribe_notifications(),
            self.inbox.clone(),
            "notification",
            |frame| match protocol::decode_inbound(&frame) {
                Ok(notification) => Some(EngineInput::Notification(notification)),
                Err(e) => {
                    tracing::warn!("Dropped notification: {}", e);
                    None
                }
            },
        ));
        tracing::debug!("Telemetry and notification streams subscribed");
    }

    fn suspend_streams(&mut self) {
        for task in self.streams.drain(..) {
            task.abort();
        }
        tracing::debug!("Telemetry and notification streams suspended");
    }

    async fn shutdown(&mut self, inbox: &mut mpsc::Receiver<Message>) {
        for (_, (_, task)) in self.timers.drain() {
            task.abort();
        }
        self.suspend_streams();
        for task in self.passive.drain(..) {
            task.abort();
        }

        // Let the writer drain queued commands; keep the inbox moving meanwhile
        self.outbound = None;
        if let Some(mut writer) = self.writer.take() {
            let limit = self.timing.command_timeout() * 4;
            let drained = tokio::time::timeout(limit, async {
                loop {
                    tokio::select! {
                        _ = &mut writer => break,
                        Some(_) = inbox.recv() => {}
                    }
                }
            })
            .await;
            if drained.is_err() {
                tracing::warn!("Command writer did not drain in time");
                writer.abort();
            }
        }

        for task in self.persistence.drain(..) {
            if let Err(e) = task.await {
                tracing::error!("Persistence task failed: {}", e);
            }
        }
        tracing::info!(
            "Session engine stopped after {} completed sets",
            self.machine.completed_sets()
        );
    }
}

fn publish_if_changed<V: PartialEq + Clone>(tx: &watch::Sender<V>, value: &V) {
    tx.send_if_modified(|current| {
        if current != value {
            *current = value.clone();
            true
        } else {
            false
        }
    });
}

/// Forward a broadcast stream into the coordinator inbox
fn forward<M, F>(
    mut rx: broadcast::Receiver<M>,
    inbox: mpsc::Sender<Message>,
    name: &'static str,
    wrap: F,
) -> JoinHandle<()>
where
    M: Clone + Send + 'static,
    F: Fn(M) -> Option<EngineInput> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    let Some(input) = wrap(item) else {
                        continue;
                    };
                    if inbox.send(Message::Input(input)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("{} stream lagged; skipped {} messages", name, skipped);
                }
                Err(RecvError::Closed) => {
                    tracing::debug!("{} stream closed", name);
                    break;
                }
            }
        }
    })
}

/// Deliver commands in order, each bounded by `limit`
async fn write_commands<T: Transport>(
    transport: Arc<T>,
    mut outbound: mpsc::UnboundedReceiver<Command>,
    inbox: mpsc::Sender<Message>,
    limit: Duration,
) {
    while let Some(command) = outbound.recv().await {
        let name = command.name();
        let input = match deliver(transport.as_ref(), &command, limit).await {
            Ok(()) => EngineInput::CommandSent(name),
            Err(e) => {
                tracing::warn!("Failed to send {}: {}", name, e);
                EngineInput::CommandFailed {
                    command: name,
                    error: e.to_string(),
                }
            }
        };
        if inbox.send(Message::Input(input)).await.is_err() {
            break;
        }
    }
}

async fn deliver<T: Transport>(transport: &T, command: &Command, limit: Duration) -> Result<()> {
    let frame = protocol::encode(command)?;
    tracing::debug!("Sending {} ({} bytes)", command.name(), frame.len());
    tokio::time::timeout(limit, transport.send_command(frame))
        .await
        .map_err(|_| Error::Timeout(limit.as_millis() as u64))?
}
