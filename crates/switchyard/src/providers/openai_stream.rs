use super::base::{GenerationEvent, Token};
use super::formats::openai::OAIStreamChunk;

/// Turns OpenAI-compatible stream chunks into generation events.
///
/// Reasoning deltas and content deltas are merged into one token channel. A
/// reasoning span is opened with the `begin` marker and closed with the `end`
/// marker, so the generation state machine can detect it the same way it detects
/// models that emit the markers inline.
#[derive(Debug)]
pub struct StreamTranslator {
    begin: String,
    end: String,
    reasoning_open: bool,
    next_id: u32,
    generated: String,
    finish_reason: Option<String>,
}

impl StreamTranslator {
    pub fn new<B: Into<String>, E: Into<String>>(begin: B, end: E) -> Self {
        StreamTranslator {
            begin: begin.into(),
            end: end.into(),
            reasoning_open: false,
            next_id: 0,
            generated: String::new(),
            finish_reason: None,
        }
    }

    fn token(&mut self, text: &str) -> GenerationEvent {
        let id = self.next_id;
        self.next_id += 1;
        self.generated.push_str(text);
        GenerationEvent::Token(Token::text(id, text))
    }

    fn close_reasoning(&mut self, events: &mut Vec<GenerationEvent>) {
        if self.reasoning_open {
            self.reasoning_open = false;
            let end = self.end.clone();
            events.push(self.token(&end));
        }
    }

    pub fn on_chunk(&mut self, chunk: OAIStreamChunk) -> Vec<GenerationEvent> {
        let mut events = Vec::new();
        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(reasoning) = choice.delta.reasoning_content.filter(|r| !r.is_empty()) {
            if !self.reasoning_open {
                self.reasoning_open = true;
                let begin = self.begin.clone();
                events.push(self.token(&begin));
            }
            events.push(self.token(&reasoning));
        }

        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            self.close_reasoning(&mut events);
            events.push(self.token(&content));
        }

        if !choice.delta.tool_calls.is_empty() {
            self.close_reasoning(&mut events);
            events.extend(
                choice
                    .delta
                    .tool_calls
                    .iter()
                    .map(|call| GenerationEvent::ToolCallDelta(call.to_delta())),
            );
        }

        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }

        events
    }

    /// Close any open reasoning span and produce the terminating event. The final
    /// token is special unless the backend stopped on its length limit or the
    /// stream ended before the backend reported a reason.
    pub fn finish(mut self, saw_done: bool) -> Vec<GenerationEvent> {
        let mut events = Vec::new();
        self.close_reasoning(&mut events);

        let special = match self.finish_reason.as_deref() {
            Some("length") => false,
            Some(_) => true,
            None => saw_done,
        };
        let mut token = Token::text(self.next_id, "");
        token.special = special;

        events.push(GenerationEvent::Final {
            token: Some(token),
            generated_text: self.generated,
        });
        events
    }
}
