//! Turn orchestration for the voice agent
//!
//! Features:
//! - Turn lifecycle state machine
//! - Barge-in arbitration with an echo settle window
//! - Pipelined generation and synthesis per turn
//! - Voice session wiring with broadcast session events
//! - Tracing initialisation

pub mod events;
pub mod interruption;
pub mod orchestrator;
pub mod session;
pub mod telemetry;
pub mod turn;

pub use events::SessionEvent;
pub use interruption::{IgnoreReason, InterruptDecision, InterruptionController, TurnSnapshot};
pub use orchestrator::TurnOrchestrator;
pub use session::{SessionProviders, VoiceSession, VoiceSessionState};
pub use telemetry::init_tracing;
pub use turn::{SynthesisStatus, Turn, TurnId, TurnState};

use thiserror::Error;
use voice_turn_config::ConfigError;

/// Agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] voice_turn_core::Error),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Session already started")]
    AlreadyStarted,
}
