//! The connected machine, as the engine sees it.
//!
//! Connection management (scanning, pairing, reconnects) lives outside the engine.
//! A `Transport` hands out subscriptions to the machine's streams and delivers
//! encoded command frames.

use crate::protocol::{self, Command, InboundFrame};
use crate::telemetry::HandleSample;
use crate::types::{DeloadEvent, TelemetrySample};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Capacity of each loopback stream
const STREAM_CAPACITY: usize = 1024;

pub trait Transport: Send + Sync + 'static {
    /// Continuous position/velocity/load samples
    fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetrySample>;

    /// Raw rep and status notification frames
    fn subscribe_notifications(&self) -> broadcast::Receiver<InboundFrame>;

    /// Raw handle activity classification
    fn subscribe_handle_state(&self) -> broadcast::Receiver<HandleSample>;

    fn subscribe_deload(&self) -> broadcast::Receiver<DeloadEvent>;

    /// Deliver one encoded command frame
    fn send_command(&self, frame: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
}

/// How the loopback should misbehave when a command is sent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendFailure {
    /// Fail immediately with a transport error
    Reject,
    /// Never complete, so the caller's timeout fires
    Hang,
}

/// In-process transport: callers push machine output in, sent frames are recorded.
///
/// Used by the CLI replay tool and by tests.
pub struct LoopbackTransport {
    telemetry: broadcast::Sender<TelemetrySample>,
    notifications: broadcast::Sender<InboundFrame>,
    handle: broadcast::Sender<HandleSample>,
    deload: broadcast::Sender<DeloadEvent>,
    sent: Mutex<Vec<Vec<u8>>>,
    failure: Mutex<Option<SendFailure>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            telemetry: broadcast::channel(STREAM_CAPACITY).0,
            notifications: broadcast::channel(STREAM_CAPACITY).0,
            handle: broadcast::channel(STREAM_CAPACITY).0,
            deload: broadcast::channel(STREAM_CAPACITY).0,
            sent: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    // Sends to a broadcast channel without subscribers are dropped on purpose: a
    // paused engine is not listening.

    pub fn push_sample(&self, sample: TelemetrySample) {
        let _ = self.telemetry.send(sample);
    }

    pub fn push_frame(&self, frame: InboundFrame) {
        let _ = self.notifications.send(frame);
    }

    pub fn push_handle(&self, sample: HandleSample) {
        let _ = self.handle.send(sample);
    }

    pub fn push_deload(&self, event: DeloadEvent) {
        let _ = self.deload.send(event);
    }

    /// Make subsequent sends fail (or succeed again with `None`)
    pub fn set_failure(&self, failure: Option<SendFailure>) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = failure;
        }
    }

    /// Every frame delivered so far, in order
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Delivered frames decoded back into commands; undecodable frames are skipped
    pub fn sent_commands(&self) -> Vec<Command> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| match protocol::decode(frame) {
                Ok(command) => Some(command),
                Err(e) => {
                    tracing::warn!("Loopback recorded an undecodable frame: {}", e);
                    None
                }
            })
            .collect()
    }
}

impl Transport for LoopbackTransport {
    fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetrySample> {
        self.telemetry.subscribe()
    }

    fn subscribe_notifications(&self) -> broadcast::Receiver<InboundFrame> {
        self.notifications.subscribe()
    }

    fn subscribe_handle_state(&self) -> broadcast::Receiver<HandleSample> {
        self.handle.subscribe()
    }

    fn subscribe_deload(&self) -> broadcast::Receiver<DeloadEvent> {
        self.deload.subscribe()
    }

    async fn send_command(&self, frame: Vec<u8>) -> Result<()> {
        let failure = *self
            .failure
            .lock()
            .map_err(|_| Error::Transport("loopback lock poisoned".into()))?;

        match failure {
            Some(SendFailure::Reject) => {
                Err(Error::Transport("machine rejected the command".into()))
            }
            Some(SendFailure::Hang) => std::future::pending::<Result<()>>().await,
            None => {
                self.sent
                    .lock()
                    .map_err(|_| Error::Transport("loopback lock poisoned".into()))?
                    .push(frame);
                Ok(())
            }
        }
    }
}
