use crate::client::{ChunkStream, ModelRequest};
use crate::error::{LlmError, Result};
use crate::types::{Message, Role, StreamChunk, ToolCallId, ToolDefinition, Usage};
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http,
            url: format!("{base_url}/chat/completions"),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat_stream(&self, request: ModelRequest<'_>) -> Result<ChunkStream> {
        let req = OpenAiChatRequest::new(&self.model, request);
        tracing::debug!(
            url = %self.url,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "openai stream request prepared"
        );

        let mut builder = self.http.post(&self.url).json(&req);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let state = OpenAiStreamState::new();
        let sse = Box::pin(decode_sse(response.bytes_stream()));

        let stream =
            futures_util::stream::unfold((sse, state), |(mut sse, mut state)| async move {
                loop {
                    if let Some(chunk) = state.pending.pop_front() {
                        return Some((Ok(chunk), (sse, state)));
                    }
                    if state.finished {
                        return None;
                    }
                    let Some(next) = sse.as_mut().next().await else {
                        // Provider hung up without the [DONE] sentinel.
                        state.finished = true;
                        return Some((Err(LlmError::Truncated), (sse, state)));
                    };
                    match next {
                        Ok(SseEvent::Data(data)) => {
                            if let Err(e) = state.ingest(&data) {
                                state.finished = true;
                                return Some((Err(e), (sse, state)));
                            }
                        }
                        Ok(SseEvent::Other) => continue,
                        Err(e) => {
                            state.finished = true;
                            return Some((Err(e), (sse, state)));
                        }
                    }
                }
            });

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    stream: bool,
    stream_options: OpenAiStreamOptions,
}

#[derive(Debug, Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

impl OpenAiChatRequest {
    fn new(model: &str, request: ModelRequest<'_>) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.trim().is_empty() {
            messages.push(OpenAiMessage::text("system", request.system_prompt));
        }
        for m in request.messages {
            append_openai_messages(&mut messages, m);
        }
        let tools: Vec<OpenAiTool> = request.tools.iter().map(to_openai_tool).collect();
        let tool_choice = if tools.is_empty() {
            None
        } else {
            Some("auto".to_string())
        };
        Self {
            model: model.to_string(),
            messages,
            tools,
            tool_choice,
            stream: true,
            stream_options: OpenAiStreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_openai_tool(t: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        r#type: "function".to_string(),
        function: OpenAiToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiToolFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunctionCall {
    name: String,
    arguments: String,
}

/// Resolved invocations become an assistant `tool_calls` entry followed by a
/// `tool` message each. Unresolved invocations are never sent: providers
/// reject a call without its result.
fn append_openai_messages(out: &mut Vec<OpenAiMessage>, m: &Message) {
    let text = m.text();
    match m.role {
        Role::System => out.push(OpenAiMessage::text("system", &text)),
        Role::User => out.push(OpenAiMessage::text("user", &text)),
        Role::Assistant => {
            let resolved: Vec<_> = m.tool_invocations().filter(|inv| inv.is_terminal()).collect();
            if text.trim().is_empty() && resolved.is_empty() {
                return;
            }
            out.push(OpenAiMessage {
                role: "assistant".to_string(),
                content: Some(text).filter(|s| !s.trim().is_empty()),
                tool_calls: resolved
                    .iter()
                    .map(|inv| OpenAiToolCall {
                        id: inv.tool_call_id().to_string(),
                        r#type: "function".to_string(),
                        function: OpenAiToolFunctionCall {
                            name: inv.tool_name().to_string(),
                            arguments: inv.input().to_string(),
                        },
                    })
                    .collect(),
                tool_call_id: None,
            });
            for inv in resolved {
                let content = match inv.output() {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                out.push(OpenAiMessage {
                    role: "tool".to_string(),
                    content: Some(content),
                    tool_calls: Vec::new(),
                    tool_call_id: Some(inv.tool_call_id().to_string()),
                });
            }
        }
    }
}

#[derive(Debug)]
enum SseEvent {
    Data(String),
    Other,
}

fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    // Raw bytes until a frame is complete: a chunk may end mid-character.
    futures_util::stream::unfold(
        (bytes_stream, BytesMut::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some((idx, sep)) = frame_boundary(&buffer) {
                    let frame = buffer.split_to(idx + sep);
                    let decoded = std::str::from_utf8(&frame[..idx])
                        .map(parse_sse_frame)
                        .map_err(|e| {
                            LlmError::StreamParse(format!("invalid utf-8 in frame: {e}"))
                        });
                    return Some((decoded, (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        continue;
                    }
                    Some(Err(e)) => return Some((Err(LlmError::from(e)), (stream, buffer))),
                    None => return None,
                }
            }
        },
    )
}

/// Start and length of the first blank-line separator.
fn frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let find = |needle: &[u8]| {
        buffer
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|idx| (idx, needle.len()))
    };
    match (find(b"\n\n"), find(b"\r\n\r\n")) {
        (Some(lf), Some(crlf)) => Some(if crlf.0 < lf.0 { crlf } else { lf }),
        (lf, crlf) => lf.or(crlf),
    }
}

fn parse_sse_frame(raw: &str) -> SseEvent {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    if data_lines.is_empty() {
        return SseEvent::Other;
    }
    SseEvent::Data(data_lines.join("\n"))
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponseChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiStreamUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiStreamDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamDeltaToolFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct OpenAiStreamToolCallState {
    id: Option<ToolCallId>,
    name: Option<String>,
    started: bool,
    /// Argument text received before the call could be announced.
    buffered: String,
}

#[derive(Debug)]
struct OpenAiStreamState {
    tool_calls: HashMap<u32, OpenAiStreamToolCallState>,
    usage: Option<Usage>,
    pending: VecDeque<StreamChunk>,
    finished: bool,
}

impl OpenAiStreamState {
    fn new() -> Self {
        Self {
            tool_calls: HashMap::new(),
            usage: None,
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Turns one SSE data payload into zero or more chunks on `pending`.
    fn ingest(&mut self, data: &str) -> Result<()> {
        if data.trim() == "[DONE]" {
            self.pending.push_back(StreamChunk::Done {
                usage: self.usage.unwrap_or_default(),
            });
            self.finished = true;
            return Ok(());
        }

        let chunk: OpenAiStreamResponseChunk = serde_json::from_str(data).map_err(|e| {
            LlmError::StreamParse(format!("openai chunk json error={e} data={data}"))
        })?;

        if let Some(u) = chunk.usage.as_ref() {
            self.usage = Some(Usage {
                prompt_tokens: u.prompt_tokens.unwrap_or(0) as u32,
                completion_tokens: u.completion_tokens.unwrap_or(0) as u32,
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                self.pending.push_back(StreamChunk::Delta { content });
            }
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let idx = tc.index.unwrap_or(0);
            let entry = self.tool_calls.entry(idx).or_default();
            if entry.id.is_none() {
                entry.id = tc.id.map(ToolCallId::from);
            }
            let function = tc.function.unwrap_or(OpenAiStreamDeltaToolFunction {
                name: None,
                arguments: None,
            });
            if entry.name.is_none() {
                entry.name = function.name;
            }
            if let Some(arguments) = function.arguments {
                entry.buffered.push_str(&arguments);
            }

            if !entry.started {
                let Some(name) = entry.name.clone() else {
                    continue;
                };
                let id = entry.id.get_or_insert_with(ToolCallId::generate).clone();
                entry.started = true;
                self.pending
                    .push_back(StreamChunk::ToolCallStart { id, name });
            }
            if !entry.buffered.is_empty() {
                let Some(id) = entry.id.clone() else {
                    continue;
                };
                let arguments = std::mem::take(&mut entry.buffered);
                self.pending
                    .push_back(StreamChunk::ToolCallDelta { id, arguments });
            }
        }
        Ok(())
    }
}
