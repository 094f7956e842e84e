//! Dialogue generation for the turn pipeline
//!
//! Features:
//! - Conversation context bounded by turns and an approximate token budget
//! - Streaming generation with first-token deadline and cooperative cancellation
//! - Sentence chunking of model output for early synthesis
//! - Optional per-session model call budget with a fallback reply

pub mod chunker;
pub mod context;
pub mod dialogue;

pub use chunker::SentenceChunker;
pub use context::{estimate_tokens, ConversationContext, Exchange};
pub use dialogue::{DialogueManager, GenerationOutcome, GenerationStatus};
