//! Pipeline configuration

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Audio framing and queue sizes
    #[serde(default)]
    pub audio: AudioConfig,

    /// Turn detection configuration
    #[serde(default)]
    pub turn_detection: TurnDetectionConfig,

    /// Recognition configuration
    #[serde(default)]
    pub transcription: TranscriptionConfig,

    /// Dialogue / language model configuration
    #[serde(default)]
    pub dialogue: DialogueConfig,

    /// Synthesis providers and failover
    #[serde(default)]
    pub synthesis: SynthesisConfig,

    /// Barge-in configuration
    #[serde(default)]
    pub barge_in: BargeInConfig,
}

impl PipelineConfig {
    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(ConfigError::invalid("pipeline.audio.sample_rate", "must be positive"));
        }
        if audio.inbound_queue_frames == 0 || audio.outbound_queue_frames == 0 {
            return Err(ConfigError::invalid(
                "pipeline.audio",
                "queue capacities must be at least 1 frame",
            ));
        }

        let td = &self.turn_detection;
        if td.window_ms == 0 {
            return Err(ConfigError::invalid(
                "pipeline.turn_detection.window_ms",
                "must be at least 1ms",
            ));
        }
        if td.end_of_turn_ms <= td.hangover_ms {
            return Err(ConfigError::invalid(
                "pipeline.turn_detection.end_of_turn_ms",
                format!(
                    "end-of-turn timeout ({}ms) must exceed the hangover ({}ms)",
                    td.end_of_turn_ms, td.hangover_ms
                ),
            ));
        }
        if td.max_utterance_ms <= td.end_of_turn_ms {
            return Err(ConfigError::invalid(
                "pipeline.turn_detection.max_utterance_ms",
                "must exceed the end-of-turn timeout",
            ));
        }

        if self.dialogue.max_context_turns == 0 {
            return Err(ConfigError::invalid(
                "pipeline.dialogue.max_context_turns",
                "must keep at least one turn",
            ));
        }
        if self.dialogue.channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "pipeline.dialogue.channel_capacity",
                "must be at least 1",
            ));
        }

        let synthesis = &self.synthesis;
        if synthesis.providers.is_empty() {
            return Err(ConfigError::invalid(
                "pipeline.synthesis.providers",
                "at least one synthesis provider is required",
            ));
        }
        let mut seen = HashSet::new();
        for id in &synthesis.providers {
            if !seen.insert(id.as_str()) {
                return Err(ConfigError::invalid(
                    "pipeline.synthesis.providers",
                    format!("duplicate provider id '{}'", id),
                ));
            }
        }
        if synthesis.circuit.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "pipeline.synthesis.circuit.failure_threshold",
                "must be at least 1",
            ));
        }

        Ok(())
    }
}

/// Audio framing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate of inbound and outbound PCM
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Nominal frame duration (ms)
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,

    /// Inbound queue capacity in frames
    #[serde(default = "default_queue_frames")]
    pub inbound_queue_frames: usize,

    /// Outbound queue capacity in frames
    #[serde(default = "default_queue_frames")]
    pub outbound_queue_frames: usize,
}

fn default_sample_rate() -> u32 {
    16000
}
fn default_frame_ms() -> u32 {
    20
}
fn default_queue_frames() -> usize {
    256
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            frame_ms: default_frame_ms(),
            inbound_queue_frames: default_queue_frames(),
            outbound_queue_frames: default_queue_frames(),
        }
    }
}

/// Turn detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    /// Energy above which a window counts as speech (dBFS)
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold_db: f32,

    /// Classification window (ms); shorter frames are buffered
    #[serde(default = "default_window_ms")]
    pub window_ms: u32,

    /// Speech persists this long after energy drops (ms)
    #[serde(default = "default_hangover_ms")]
    pub hangover_ms: u64,

    /// Silence after the last speech that ends the utterance (ms)
    #[serde(default = "default_end_of_turn_ms")]
    pub end_of_turn_ms: u64,

    /// Barge-in suppression after agent audio starts (ms)
    #[serde(default = "default_settle_window_ms")]
    pub settle_window_ms: u64,

    /// Force-end utterances longer than this (ms)
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,
}

fn default_energy_threshold() -> f32 {
    -40.0
}
fn default_window_ms() -> u32 {
    20
}
fn default_hangover_ms() -> u64 {
    300
}
fn default_end_of_turn_ms() -> u64 {
    700
}
fn default_settle_window_ms() -> u64 {
    300
}
fn default_max_utterance_ms() -> u64 {
    30000
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            energy_threshold_db: default_energy_threshold(),
            window_ms: default_window_ms(),
            hangover_ms: default_hangover_ms(),
            end_of_turn_ms: default_end_of_turn_ms(),
            settle_window_ms: default_settle_window_ms(),
            max_utterance_ms: default_max_utterance_ms(),
        }
    }
}

/// Recognition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Deadline for opening a stream and for the final transcript (ms)
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,

    /// Language hint
    #[serde(default = "default_language")]
    pub language: String,

    /// Domain words boosted by the recognizer
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Publish interim transcripts
    #[serde(default = "default_true")]
    pub emit_partials: bool,
}

fn default_provider_timeout_ms() -> u64 {
    5000
}
fn default_language() -> String {
    "en".to_string()
}
fn default_true() -> bool {
    true
}

impl TranscriptionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_provider_timeout_ms(),
            language: default_language(),
            keywords: Vec::new(),
            emit_partials: true,
        }
    }
}

/// Dialogue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// Deadline for the first model token (ms)
    #[serde(default = "default_first_token_timeout_ms")]
    pub first_token_timeout_ms: u64,

    /// Maximum completed exchanges kept in context
    #[serde(default = "default_max_context_turns")]
    pub max_context_turns: usize,

    /// Approximate token budget for history
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// System instruction sent first on every request
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Model calls allowed per session; None means unlimited
    #[serde(default)]
    pub max_model_calls: Option<u32>,

    /// Spoken when the call budget is exhausted
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,

    /// Minimum characters before a chunk is cut on a word boundary
    #[serde(default = "default_chunk_min_chars")]
    pub chunk_min_chars: usize,

    /// Capacity of the generation -> synthesis channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_first_token_timeout_ms() -> u64 {
    8000
}
fn default_max_context_turns() -> usize {
    10
}
fn default_max_context_tokens() -> usize {
    2000
}
fn default_system_prompt() -> String {
    "You are a professional, friendly voice assistant. Keep answers short and \
     conversational, ask one question at a time, and avoid reading out lists."
        .to_string()
}
fn default_fallback_reply() -> String {
    "I'm here to help. Could you tell me a little more about what you need?".to_string()
}
fn default_chunk_min_chars() -> usize {
    24
}
fn default_channel_capacity() -> usize {
    16
}

impl DialogueConfig {
    pub fn first_token_timeout(&self) -> Duration {
        Duration::from_millis(self.first_token_timeout_ms)
    }
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            first_token_timeout_ms: default_first_token_timeout_ms(),
            max_context_turns: default_max_context_turns(),
            max_context_tokens: default_max_context_tokens(),
            system_prompt: default_system_prompt(),
            max_model_calls: None,
            fallback_reply: default_fallback_reply(),
            chunk_min_chars: default_chunk_min_chars(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Synthesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Provider ids in priority order
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,

    /// Deadline for the first audio block of each call (ms)
    #[serde(default = "default_provider_timeout_ms")]
    pub first_byte_timeout_ms: u64,

    /// Stock phrase spoken when a turn's audio breaks off
    #[serde(default = "default_apology_phrase")]
    pub apology_phrase: String,

    /// How long cancelled in-flight calls may drain (ms)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Circuit breaker settings, shared by all providers
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
}

fn default_providers() -> Vec<String> {
    vec!["primary".to_string(), "fallback".to_string()]
}
fn default_apology_phrase() -> String {
    "Sorry, I'm having trouble speaking right now. Could you say that again?".to_string()
}
fn default_drain_timeout_ms() -> u64 {
    2000
}

impl SynthesisConfig {
    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.first_byte_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            first_byte_timeout_ms: default_provider_timeout_ms(),
            apology_phrase: default_apology_phrase(),
            drain_timeout_ms: default_drain_timeout_ms(),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open circuit waits before a half-open trial (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    30
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Barge-in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BargeInConfig {
    /// Allow the caller to interrupt agent speech
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
