#![forbid(unsafe_code)]

//! Active workout session engine for a connected cable-resistance machine.
//!
//! This crate provides:
//! - Domain types (parameters, routines, session state, summaries)
//! - The machine's binary wire protocol
//! - Rep counting, auto-stop and handle-state detection
//! - The session state machine and its async runtime
//! - Rest timing between routine sets
//! - Persistence (session log, per-set metrics, user preferences)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod telemetry;
pub mod protocol;
pub mod rep_counter;
pub mod auto_stop;
pub mod metrics;
pub mod rest_timer;
pub mod session;
pub mod transport;
pub mod runtime;
pub mod repository;
pub mod preferences;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use session::{SessionStateMachine, UserCommand};
pub use runtime::{EngineHandle, SessionEngine};
pub use transport::{LoopbackTransport, Transport};
pub use repository::{FileRepository, SessionRepository};
pub use preferences::{Preferences, PreferencesStore, UserPreferences};
