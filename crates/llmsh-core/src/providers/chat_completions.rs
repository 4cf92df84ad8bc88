//! OpenAI-compatible Chat Completions client for the local server.
//!
//! Sends `{messages, temperature, max_tokens, stream}` to
//! `/v1/chat/completions` and either reads one JSON body or decodes the
//! `data: ` event stream incrementally, handing each content delta to the
//! caller as it arrives.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use eventsource_stream::{EventStream, EventStreamError, Eventsource};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;

use crate::config::RequestConfig;
use crate::providers::shared::{
    ChatMessage, ClientError, ClientErrorKind, ClientResult, StreamChunk, USER_AGENT,
};

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Payload that marks the end of a streamed completion.
const DONE_SENTINEL: &str = "[DONE]";

/// Bound on a whole request, from connect until the body is drained.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Boxed stream of decoded completion chunks.
pub type ChunkStream = BoxStream<'static, ClientResult<StreamChunk>>;

/// Chat completions client bound to one server base URL.
#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl ChatCompletionsClient {
    /// Creates a client using [`DEFAULT_REQUEST_TIMEOUT`].
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str) -> ClientResult<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ClientError::new(
                    ClientErrorKind::Request,
                    format!("Failed to build HTTP client: {e}"),
                )
            })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, CHAT_COMPLETIONS_PATH)
    }

    /// Sends `messages` and returns the complete reply text.
    ///
    /// With `config.stream` set, `on_delta` receives every content fragment
    /// as soon as it is decoded; otherwise it is not called.
    ///
    /// # Errors
    /// `ConnectionLost` when the connection fails or drops, `Timeout` when the
    /// request deadline passes, `HttpStatus`/`InvalidResponse` for bad replies.
    pub async fn send<F>(
        &self,
        messages: &[ChatMessage],
        config: &RequestConfig,
        mut on_delta: F,
    ) -> ClientResult<String>
    where
        F: FnMut(&str),
    {
        if !config.stream {
            return self.send_batch(messages, config).await;
        }

        let mut stream = self.send_stream(messages, config).await?;
        let mut reply = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.delta.as_deref() {
                on_delta(delta);
                reply.push_str(delta);
            }
            if chunk.done {
                break;
            }
        }
        Ok(reply)
    }

    /// Issues a streaming request and returns the decoded chunk stream.
    ///
    /// # Errors
    /// Returns an error if the request fails or the status is not a success.
    pub async fn send_stream(
        &self,
        messages: &[ChatMessage],
        config: &RequestConfig,
    ) -> ClientResult<ChunkStream> {
        let request = ChatCompletionRequest::new(messages, config, true);
        let response = self.post(&request).await?;

        let timeout = self.timeout;
        let byte_stream = response
            .bytes_stream()
            .map_err(move |e| classify_reqwest_error(&e, timeout));
        Ok(ChatCompletionsSseParser::new(byte_stream).boxed())
    }

    async fn send_batch(
        &self,
        messages: &[ChatMessage],
        config: &RequestConfig,
    ) -> ClientResult<String> {
        let request = ChatCompletionRequest::new(messages, config, false);
        let response = self.post(&request).await?;

        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&e, self.timeout))?;
        extract_message_content(&body)
    }

    async fn post(&self, request: &ChatCompletionRequest<'_>) -> ClientResult<reqwest::Response> {
        let response = self
            .http
            .post(self.endpoint())
            .headers(build_headers(request.stream))
            .json(request)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ClientError::http_status(status.as_u16(), &error_body));
        }
        Ok(response)
    }
}

fn build_headers(stream: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let accept = if stream {
        "text/event-stream"
    } else {
        "application/json"
    };
    headers.insert("accept", HeaderValue::from_static(accept));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers
}

fn classify_reqwest_error(e: &reqwest::Error, timeout: Duration) -> ClientError {
    if e.is_timeout() {
        ClientError::timeout(format!("Request timed out after {timeout:?}: {e}"))
    } else if e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        ClientError::connection_lost(format!("Connection to LLM server lost: {e}"))
    } else {
        ClientError::new(ClientErrorKind::Request, format!("Request error: {e}"))
    }
}

/// Pulls `choices[0].message.content` out of a non-streaming reply.
fn extract_message_content(body: &str) -> ClientResult<String> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ClientError::invalid_response(format!("Reply is not valid JSON: {e}")))?;

    value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::invalid_response("Reply has no choices[0].message.content"))
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

impl<'a> ChatCompletionRequest<'a> {
    fn new(messages: &'a [ChatMessage], config: &RequestConfig, stream: bool) -> Self {
        Self {
            messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream,
        }
    }
}

/// Appends a blank line once the body ends so a final unterminated event
/// still gets dispatched.
struct SseTerminatedStream<S> {
    inner: S,
    emitted_terminator: bool,
}

impl<S> SseTerminatedStream<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            emitted_terminator: false,
        }
    }
}

impl<S, E> Stream for SseTerminatedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.emitted_terminator {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(item)),
            Poll::Ready(None) => {
                self.emitted_terminator = true;
                Poll::Ready(Some(Ok(Bytes::from_static(b"\n\n"))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// SSE decoder for chat completion streams.
///
/// Frames that are not JSON or lack `choices[0].delta.content` are skipped;
/// only transport failures end the stream with an error.
pub struct ChatCompletionsSseParser<S> {
    inner: EventStream<SseTerminatedStream<S>>,
    pending: VecDeque<StreamChunk>,
    finished: bool,
}

impl<S> ChatCompletionsSseParser<S>
where
    S: Stream<Item = ClientResult<Bytes>> + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            inner: SseTerminatedStream::new(stream).eventsource(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    fn handle_event_data(&mut self, data: &str) {
        // Consecutive `data:` lines without a blank separator arrive joined
        // by newlines; each one is its own frame.
        for line in data.lines() {
            if self.finished {
                return;
            }
            self.handle_frame(line.trim());
        }
    }

    fn handle_frame(&mut self, payload: &str) {
        if payload.is_empty() {
            return;
        }
        if payload == DONE_SENTINEL {
            self.finished = true;
            self.pending.push_back(StreamChunk::done());
            return;
        }

        let value = match serde_json::from_str::<Value>(payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(%err, "skipping malformed stream frame");
                return;
            }
        };

        let content = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("delta"))
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str);

        if let Some(text) = content
            && !text.is_empty()
        {
            self.pending.push_back(StreamChunk::text(text));
        }
    }
}

impl<S> Stream for ChatCompletionsSseParser<S>
where
    S: Stream<Item = ClientResult<Bytes>> + Unpin,
{
    type Item = ClientResult<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(chunk)));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => self.handle_event_data(&event.data),
                Poll::Ready(Some(Err(EventStreamError::Transport(err)))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(Some(Err(err))) => {
                    tracing::debug!(%err, "skipping undecodable stream bytes");
                }
                // Body ended without the sentinel; whatever arrived is the reply.
                Poll::Ready(None) => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
