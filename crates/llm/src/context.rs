//! Conversation context
//!
//! Completed exchanges, bounded by turn count and an approximate token
//! budget. The caller's current utterance is held as a pending exchange: it
//! is part of every model request, but only enters history once the agent
//! actually spoke a response to it.

use std::collections::VecDeque;

use unicode_segmentation::UnicodeSegmentation;
use voice_turn_config::DialogueConfig;
use voice_turn_core::ChatMessage;

/// One completed caller/agent exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    pub agent: String,
}

impl Exchange {
    fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.user) + estimate_tokens(&self.agent)
    }
}

#[derive(Debug, Clone)]
pub struct ConversationContext {
    system_prompt: String,
    exchanges: VecDeque<Exchange>,
    pending: Option<String>,
    max_turns: usize,
    max_tokens: usize,
}

impl ConversationContext {
    pub fn new(system_prompt: impl Into<String>, max_turns: usize, max_tokens: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            exchanges: VecDeque::new(),
            pending: None,
            max_turns: max_turns.max(1),
            max_tokens,
        }
    }

    pub fn from_config(config: &DialogueConfig) -> Self {
        Self::new(
            config.system_prompt.clone(),
            config.max_context_turns,
            config.max_context_tokens,
        )
    }

    /// Hold the caller's transcript as the exchange in progress
    pub fn begin_exchange(&mut self, user: impl Into<String>) {
        if let Some(stale) = self.pending.replace(user.into()) {
            tracing::warn!(chars = stale.len(), "Replacing uncommitted exchange");
        }
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Record the agent's response to the pending exchange
    pub fn commit(&mut self, agent: impl Into<String>) -> Option<&Exchange> {
        let user = self.pending.take()?;
        self.exchanges.push_back(Exchange {
            user,
            agent: agent.into(),
        });
        self.trim();
        self.exchanges.back()
    }

    /// Drop the pending exchange without recording it
    pub fn discard(&mut self) -> Option<String> {
        self.pending.take()
    }

    fn trim(&mut self) {
        while self.exchanges.len() > self.max_turns {
            self.exchanges.pop_front();
        }
        while self.exchanges.len() > 1 && self.history_tokens() > self.max_tokens {
            self.exchanges.pop_front();
        }
    }

    /// System prompt followed by history, oldest first. Excludes the pending exchange.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(1 + self.exchanges.len() * 2);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        for exchange in &self.exchanges {
            messages.push(ChatMessage::user(exchange.user.clone()));
            messages.push(ChatMessage::assistant(exchange.agent.clone()));
        }
        messages
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges.iter()
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn history_tokens(&self) -> usize {
        self.exchanges.iter().map(Exchange::estimated_tokens).sum()
    }
}

/// Approximate token count from grapheme clusters
pub fn estimate_tokens(text: &str) -> usize {
    let graphemes = text.graphemes(true).count();
    let devanagari = text
        .chars()
        .filter(|c| ('\u{0900}'..='\u{097F}').contains(c))
        .count();

    if devanagari > graphemes / 3 {
        graphemes.max(1) / 2
    } else {
        graphemes.max(1) / 4
    }
}
