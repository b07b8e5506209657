//! Test doubles shared by the unit tests in this crate.

use async_trait::async_trait;
use futures_util::StreamExt;
use gate_llm::{
    ChunkStream, LanguageModel, LlmError, Message, ModelRequest, StreamChunk, ToolCallId, Usage,
};
use gate_tools::{Approval, Tool, ToolContext, ToolError, ToolSpec};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Tool that records every call and answers with a fixed output.
pub struct CountingTool {
    name: String,
    approval: Approval,
    output: Value,
    failure: Option<String>,
    calls: AtomicUsize,
    last_context: Mutex<Option<ToolContext>>,
}

impl CountingTool {
    pub fn new(name: &str, approval: Approval, output: Value) -> Self {
        Self {
            name: name.to_string(),
            approval,
            output,
            failure: None,
            calls: AtomicUsize::new(0),
            last_context: Mutex::new(None),
        }
    }

    /// Autonomous tool whose executor always fails.
    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new(name, Approval::Autonomous, Value::Null)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_context(&self) -> Option<ToolContext> {
        self.last_context.lock().expect("context lock").clone()
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: format!("Test double for {}.", self.name),
            parameters_schema: json!({ "type": "object" }),
            approval: self.approval,
        }
    }

    async fn execute(&self, ctx: &ToolContext, _arguments: Value) -> gate_tools::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_context.lock().expect("context lock") = Some(ctx.clone());
        match &self.failure {
            Some(message) => Err(ToolError::ExecutionFailed(message.clone())),
            None => Ok(self.output.clone()),
        }
    }
}

pub enum Reply {
    Chunks(Vec<StreamChunk>),
    /// The request itself fails.
    Unreachable,
    /// Some chunks arrive, then the connection drops.
    BrokenStream(Vec<StreamChunk>),
    /// Some chunks arrive, then the stream hangs until dropped.
    Stalled(Vec<StreamChunk>),
}

type Generator = Box<dyn Fn(usize) -> Reply + Send + Sync>;

/// Language model that plays back scripted replies and records what it saw.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    generator: Option<Generator>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            generator: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Produces a reply for every call from the zero-based call index.
    pub fn generated(f: impl Fn(usize) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            generator: Some(Box::new(f)),
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// History passed to the model on call `index`.
    pub fn seen(&self, index: usize) -> Vec<Message> {
        self.seen.lock().expect("seen lock")[index].clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: ModelRequest<'_>) -> gate_llm::Result<ChunkStream> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .expect("seen lock")
            .push(request.messages.to_vec());

        let reply = match &self.generator {
            Some(f) => f(index),
            None => self
                .replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .unwrap_or_else(|| Reply::Chunks(text_reply("(no more replies)"))),
        };
        match reply {
            Reply::Chunks(chunks) => {
                Ok(Box::pin(futures_util::stream::iter(chunks.into_iter().map(Ok))))
            }
            Reply::Unreachable => Err(LlmError::Unreachable("connection refused".to_string())),
            Reply::BrokenStream(chunks) => {
                let items = chunks
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(LlmError::Truncated)));
                Ok(Box::pin(futures_util::stream::iter(items)))
            }
            Reply::Stalled(chunks) => {
                let items = futures_util::stream::iter(chunks.into_iter().map(Ok))
                    .chain(futures_util::stream::pending());
                Ok(Box::pin(items))
            }
        }
    }
}

fn done() -> StreamChunk {
    StreamChunk::Done {
        usage: Usage::default(),
    }
}

pub fn text_reply(text: &str) -> Vec<StreamChunk> {
    vec![
        StreamChunk::Delta {
            content: text.to_string(),
        },
        done(),
    ]
}

pub fn tool_call_chunks(id: &str, name: &str, arguments: &str) -> Vec<StreamChunk> {
    vec![
        StreamChunk::ToolCallStart {
            id: ToolCallId::from(id),
            name: name.to_string(),
        },
        StreamChunk::ToolCallDelta {
            id: ToolCallId::from(id),
            arguments: arguments.to_string(),
        },
    ]
}

/// One reply proposing each `(id, name, arguments)` call in order.
pub fn tool_reply(calls: &[(&str, &str, &str)]) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    for (id, name, arguments) in calls {
        chunks.extend(tool_call_chunks(id, name, arguments));
    }
    chunks.push(done());
    chunks
}
