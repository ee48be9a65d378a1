use std::collections::BTreeMap;

use super::base::PartialToolCall;

/// One streamed fragment of a tool call, keyed by its index within the round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Assembles tool calls from deltas. Fields that arrive later overwrite missing
/// ones; argument fragments are appended in arrival order.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn add(&mut self, delta: &ToolCallDelta) {
        let entry = self
            .calls
            .entry(delta.index)
            .or_insert_with(|| PartialToolCall {
                index: delta.index,
                ..Default::default()
            });

        if let Some(id) = delta.id.as_ref().filter(|s| !s.is_empty()) {
            entry.id = Some(id.clone());
        }
        if let Some(name) = delta.name.as_ref().filter(|s| !s.is_empty()) {
            entry.name = Some(name.clone());
        }
        if let Some(fragment) = delta.arguments.as_ref().filter(|s| !s.is_empty()) {
            entry.arguments.push_str(fragment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Calls in index order.
    pub fn finish(self) -> Vec<PartialToolCall> {
        self.calls.into_values().collect()
    }
}
