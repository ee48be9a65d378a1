//! The generation state machine: splits one round's token stream into visible text,
//! a reasoning channel and a single final answer.

pub mod abort;
pub mod reasoning;
pub mod stop;
pub mod summarize;

pub use abort::AbortRegistry;
pub use reasoning::ReasoningConfig;
pub use summarize::{EndpointSummarizer, Summarizer};

use crate::agents::types::{ReasoningUpdate, TurnEvent};
use crate::providers::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Streaming,
    Reasoning,
    Visible,
    Finalizing,
    Done,
}

/// The final answer of one round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundAnswer {
    pub text: String,
    pub interrupted: bool,
}

#[derive(Debug)]
pub struct GenerationState {
    mode: ReasoningConfig,
    stops: Vec<String>,
    phase: Phase,
    /// Text not yet classified because it may be the start of a marker.
    pending: String,
    reasoning: String,
    visible: String,
}

impl GenerationState {
    pub fn new(mode: ReasoningConfig, stops: Vec<String>) -> Self {
        GenerationState {
            mode,
            stops,
            phase: Phase::Idle,
            pending: String::new(),
            reasoning: String::new(),
            visible: String::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Everything routed to the reasoning channel so far, markers included.
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn visible(&self) -> &str {
        &self.visible
    }

    fn markers(&self) -> (String, String) {
        match &self.mode {
            ReasoningConfig::Tokens { begin, end } => (begin.clone(), end.clone()),
            _ => (String::new(), String::new()),
        }
    }

    pub fn on_token(&mut self, token: &Token) -> Vec<TurnEvent> {
        if self.phase == Phase::Idle {
            self.phase = Phase::Streaming;
        }
        if self.phase == Phase::Streaming {
            self.phase = if self.mode.starts_in_reasoning() {
                Phase::Reasoning
            } else {
                Phase::Visible
            };
        }
        if token.special || matches!(self.phase, Phase::Finalizing | Phase::Done) {
            return Vec::new();
        }

        self.pending.push_str(&token.text);
        let mut events = Vec::new();
        self.scan(&mut events, false);
        events
    }

    fn emit_visible(&mut self, text: &str, events: &mut Vec<TurnEvent>) {
        if !text.is_empty() {
            self.visible.push_str(text);
            events.push(TurnEvent::Stream {
                token: text.to_string(),
            });
        }
    }

    fn emit_reasoning(&mut self, text: &str, events: &mut Vec<TurnEvent>) {
        if !text.is_empty() {
            self.reasoning.push_str(text);
            events.push(TurnEvent::Reasoning(ReasoningUpdate::Stream {
                token: text.to_string(),
            }));
        }
    }

    fn scan(&mut self, events: &mut Vec<TurnEvent>, flush: bool) {
        let (begin, end) = self.markers();
        loop {
            let pending = std::mem::take(&mut self.pending);
            match self.phase {
                Phase::Reasoning => {
                    if !end.is_empty() {
                        if let Some(idx) = pending.find(&end) {
                            self.emit_reasoning(&pending[..idx], events);
                            self.reasoning.push_str(&end);
                            events.push(TurnEvent::Reasoning(ReasoningUpdate::Done));
                            self.phase = Phase::Visible;
                            self.pending = pending[idx + end.len()..].to_string();
                            continue;
                        }
                    }
                    let keep = if flush { 0 } else { partial_suffix(&pending, &end) };
                    let split = pending.len() - keep;
                    self.emit_reasoning(&pending[..split], events);
                    self.pending = pending[split..].to_string();
                }
                Phase::Visible => {
                    if !begin.is_empty() {
                        if let Some(idx) = pending.find(&begin) {
                            self.emit_visible(&pending[..idx], events);
                            self.reasoning.push_str(&begin);
                            self.phase = Phase::Reasoning;
                            self.pending = pending[idx + begin.len()..].to_string();
                            continue;
                        }
                    }
                    let keep = if flush { 0 } else { partial_suffix(&pending, &begin) };
                    let split = pending.len() - keep;
                    self.emit_visible(&pending[..split], events);
                    self.pending = pending[split..].to_string();
                }
                _ => self.pending = pending,
            }
            break;
        }
    }

    /// Handle the terminating event and produce the round's answer. `summarizer`
    /// is only consulted in summarize mode.
    pub async fn finalize(
        &mut self,
        final_token: Option<&Token>,
        generated_text: &str,
        summarizer: Option<&dyn Summarizer>,
    ) -> (Vec<TurnEvent>, RoundAnswer) {
        let mut events = Vec::new();
        self.scan(&mut events, true);
        if self.phase == Phase::Reasoning && matches!(self.mode, ReasoningConfig::Tokens { .. }) {
            events.push(TurnEvent::Reasoning(ReasoningUpdate::Done));
        }
        self.phase = Phase::Finalizing;

        let (raw, matched_stop) = stop::trim_stop_sequences(generated_text, &self.stops);
        let interrupted = !(final_token.is_some_and(|t| t.special) || matched_stop);

        let text = match &self.mode {
            ReasoningConfig::Tokens { begin, end } => {
                reasoning::strip_token_span(&raw, begin, end)
            }
            ReasoningConfig::Regex { pattern } => {
                let (source, _) = stop::trim_stop_sequences(&self.reasoning, &self.stops);
                reasoning::extract_with_pattern(pattern, &source).unwrap_or_else(|| raw.clone())
            }
            ReasoningConfig::Summarize => match summarizer {
                Some(summarizer) => {
                    events.push(TurnEvent::Reasoning(ReasoningUpdate::Status {
                        status: "Summarizing reasoning".to_string(),
                    }));
                    match summarizer.summarize(&self.reasoning).await {
                        Ok(summary) => summary,
                        Err(e) => {
                            tracing::warn!("reasoning summary failed, using raw text: {}", e);
                            raw.clone()
                        }
                    }
                }
                None => raw.clone(),
            },
        };

        self.phase = Phase::Done;
        (
            events,
            RoundAnswer {
                text: text.trim().to_string(),
                interrupted,
            },
        )
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`.
fn partial_suffix(text: &str, marker: &str) -> usize {
    if marker.is_empty() {
        return 0;
    }
    let max = text.len().min(marker.len() - 1);
    (1..=max)
        .rev()
        .find(|&n| text.is_char_boundary(text.len() - n) && marker.starts_with(&text[text.len() - n..]))
        .unwrap_or(0)
}
