//! Streaming response collection.
//!
//! Accumulates text and tool-call fragments from the provider stream while
//! forwarding incremental outputs. Providers differ in how they deliver tool
//! arguments: some send deltas, some send the accumulated value in every
//! chunk; both are handled, and the stream-end capture is the source of
//! truth when present.

use std::collections::HashMap;

use genai::chat::{ChatStreamEvent, Usage};
use serde_json::Value;

use appforge_contract::ToolCall;

#[derive(Debug, Clone)]
struct PartialToolCall {
    index: usize,
    name: String,
    arguments: String,
}

/// Incremental output surfaced while collecting.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutput {
    TextDelta(String),
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallDelta {
        index: usize,
        id: String,
        args_delta: String,
    },
}

/// Final result of one model turn.
#[derive(Debug, Clone, Default)]
pub struct StreamResult {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl StreamResult {
    pub fn needs_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct StreamCollector {
    text: String,
    tool_calls: HashMap<String, PartialToolCall>,
    tool_call_order: Vec<String>,
    usage: Option<Usage>,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one stream event; returns an output when something surfaced.
    pub fn process(&mut self, event: ChatStreamEvent) -> Option<StreamOutput> {
        match event {
            ChatStreamEvent::Chunk(chunk) => {
                if chunk.content.is_empty() {
                    return None;
                }
                self.text.push_str(&chunk.content);
                Some(StreamOutput::TextDelta(chunk.content))
            }
            ChatStreamEvent::ToolCallChunk(tool_chunk) => {
                let call_id = tool_chunk.tool_call.call_id.clone();
                let next_index = self.tool_call_order.len();
                let partial = match self.tool_calls.entry(call_id.clone()) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        self.tool_call_order.push(call_id.clone());
                        e.insert(PartialToolCall {
                            index: next_index,
                            name: String::new(),
                            arguments: String::new(),
                        })
                    }
                };

                let mut output = None;
                if !tool_chunk.tool_call.fn_name.is_empty() && partial.name.is_empty() {
                    partial.name = tool_chunk.tool_call.fn_name.clone();
                    output = Some(StreamOutput::ToolCallStart {
                        index: partial.index,
                        id: call_id.clone(),
                        name: partial.name.clone(),
                    });
                }

                // fn_arguments may be a raw JSON-fragment string (possibly
                // accumulated rather than a delta) or an already-parsed value.
                let args_str = match &tool_chunk.tool_call.fn_arguments {
                    Value::String(s) if !s.is_empty() => s.clone(),
                    Value::Null | Value::String(_) => String::new(),
                    other => other.to_string(),
                };
                if !args_str.is_empty() {
                    let delta = if args_str.len() > partial.arguments.len()
                        && args_str.starts_with(&partial.arguments)
                    {
                        args_str[partial.arguments.len()..].to_string()
                    } else {
                        args_str.clone()
                    };
                    partial.arguments = args_str;
                    // Keep the start output when name and args arrive together.
                    if !delta.is_empty() && output.is_none() {
                        output = Some(StreamOutput::ToolCallDelta {
                            index: partial.index,
                            id: call_id,
                            args_delta: delta,
                        });
                    }
                }
                output
            }
            ChatStreamEvent::End(end) => {
                if let Some(tool_calls) = end.captured_tool_calls() {
                    for tc in tool_calls {
                        let end_args = match &tc.fn_arguments {
                            Value::String(s) if !s.is_empty() => s.clone(),
                            Value::Null | Value::String(_) => String::new(),
                            other => other.to_string(),
                        };
                        let next_index = self.tool_call_order.len();
                        match self.tool_calls.entry(tc.call_id.clone()) {
                            std::collections::hash_map::Entry::Occupied(mut e) => {
                                let partial = e.get_mut();
                                if partial.name.is_empty() {
                                    partial.name = tc.fn_name.clone();
                                }
                                if !end_args.is_empty() {
                                    partial.arguments = end_args;
                                }
                            }
                            std::collections::hash_map::Entry::Vacant(e) => {
                                self.tool_call_order.push(tc.call_id.clone());
                                e.insert(PartialToolCall {
                                    index: next_index,
                                    name: tc.fn_name.clone(),
                                    arguments: end_args,
                                });
                            }
                        }
                    }
                }
                self.usage = end.captured_usage;
                None
            }
            _ => None,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Consolidate into the final result, dropping ghost calls (empty name)
    /// and parsing argument JSON (unparseable arguments become `null`).
    pub fn finish(self) -> StreamResult {
        let mut remaining = self.tool_calls;
        let mut tool_calls = Vec::with_capacity(self.tool_call_order.len());
        for call_id in self.tool_call_order {
            let Some(p) = remaining.remove(&call_id) else {
                continue;
            };
            if p.name.is_empty() {
                continue;
            }
            let arguments = serde_json::from_str(&p.arguments).unwrap_or(Value::Null);
            tool_calls.push(ToolCall::new(call_id, p.name, arguments));
        }
        StreamResult {
            text: self.text,
            tool_calls,
            usage: self.usage,
        }
    }
}
