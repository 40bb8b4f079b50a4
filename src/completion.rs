use crate::chat::TranscriptEntry;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

/// Lazy, finite sequence of reply fragments. Concatenated in order they form
/// the full assistant reply.
pub type FragmentStream = BoxStream<'static, Result<String, CompletionError>>;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("network error: {0}")]
    Network(String),
    #[error("completion service returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed completion stream: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for CompletionError {
    fn from(e: reqwest::Error) -> Self {
        CompletionError::Network(e.to_string())
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Submit the transcript, ending with the newest user turn, and return
    /// the reply as a stream of fragments.
    async fn open(&self, transcript: &[TranscriptEntry]) -> Result<FragmentStream, CompletionError>;
}

/// Streaming client for an OpenAI-compatible `chat/completions` endpoint.
pub struct OpenAiCompletion {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    system_prompt: Option<String>,
}

impl OpenAiCompletion {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            system_prompt,
        }
    }

    fn request_body(&self, transcript: &[TranscriptEntry]) -> Value {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        if let Some(system) = &self.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(
            transcript
                .iter()
                .map(|e| json!({ "role": e.role.role(), "content": e.content })),
        );

        json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompletion {
    async fn open(&self, transcript: &[TranscriptEntry]) -> Result<FragmentStream, CompletionError> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&self.request_body(transcript));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Api { status, body });
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(CompletionError::from(e));
                        return;
                    }
                };
                for line in decoder.push(&chunk) {
                    match line.and_then(|l| parse_line(&l)) {
                        Ok(SseItem::Fragment(text)) => yield Ok(text),
                        Ok(SseItem::Skip) => {}
                        Ok(SseItem::Done) => {
                            debug!("Completion stream finished");
                            return;
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if let Some(line) = decoder.finish() {
                match line.and_then(|l| parse_line(&l)) {
                    Ok(SseItem::Fragment(text)) => yield Ok(text),
                    Ok(SseItem::Skip) => {}
                    Ok(SseItem::Done) => {
                        debug!("Completion stream finished");
                        return;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            yield Err(CompletionError::Protocol("stream ended before [DONE]".into()));
        };

        Ok(stream.boxed())
    }
}

/// Splits a byte stream into complete lines, carrying partial lines (and
/// partial UTF-8 sequences) over to the next chunk.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, CompletionError>> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(
                String::from_utf8(raw)
                    .map(|l| l.trim_end_matches(['\r', '\n']).to_string())
                    .map_err(|e| CompletionError::Protocol(e.to_string())),
            );
        }
        lines
    }

    /// Take whatever is left once the body is exhausted. The last event may
    /// arrive without a trailing newline.
    fn finish(&mut self) -> Option<Result<String, CompletionError>> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8(raw)
            .map(|l| l.trim_end_matches(['\r', '\n']).to_string())
            .map_err(|e| CompletionError::Protocol(e.to_string()));
        match line {
            Ok(l) if l.is_empty() => None,
            other => Some(other),
        }
    }
}

#[derive(Debug, PartialEq)]
enum SseItem {
    Fragment(String),
    Skip,
    Done,
}

fn parse_line(line: &str) -> Result<SseItem, CompletionError> {
    let Some(data) = line.strip_prefix("data:") else {
        // blank separators, comments, and other SSE fields
        return Ok(SseItem::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseItem::Done);
    }

    let event: Value =
        serde_json::from_str(data).map_err(|e| CompletionError::Protocol(e.to_string()))?;
    if let Some(err) = event.get("error") {
        return Err(CompletionError::Api {
            status: 200,
            body: err.to_string(),
        });
    }

    match event["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => Ok(SseItem::Fragment(text.to_string())),
        _ => Ok(SseItem::Skip),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Sender;

    #[test]
    fn decoder_joins_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let lines: Vec<String> = decoder
            .push(b":1}\r\n\ndata: [DONE]\n")
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(lines, vec!["data: {\"a\":1}", "", "data: [DONE]"]);
    }

    #[test]
    fn decoder_keeps_split_utf8_sequences() {
        let bytes = "data: é\n".as_bytes();
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&bytes[..7]).is_empty());
        let lines = decoder.push(&bytes[7..]);
        assert_eq!(lines[0].as_ref().unwrap(), "data: é");
    }

    #[test]
    fn decoder_flushes_unterminated_last_line() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish().unwrap().unwrap(), "data: [DONE]");
        assert!(decoder.finish().is_none());

        decoder.push(b"data: x\r\n");
        assert!(decoder.finish().is_none());
    }

    /// Serve a single canned `text/event-stream` response and return its base URL.
    async fn serve_once(body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    async fn collect_reply(base_url: String) -> Vec<Result<String, CompletionError>> {
        let completion = OpenAiCompletion {
            client: Client::builder().no_proxy().build().unwrap(),
            ..OpenAiCompletion::new(base_url, "gpt-4o-mini", None, None)
        };
        let transcript = vec![TranscriptEntry {
            index: 0,
            role: Sender::User,
            content: "Hello".into(),
        }];
        completion.open(&transcript).await.unwrap().collect().await
    }

    #[tokio::test]
    async fn done_without_trailing_newline_ends_the_reply() {
        let url = serve_once("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]").await;
        let items = collect_reply(url).await;
        assert_eq!(items.len(), 1, "{items:?}");
        assert_eq!(items[0].as_ref().unwrap(), "Hi");
    }

    #[tokio::test]
    async fn body_without_done_is_a_protocol_failure() {
        let url = serve_once("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n").await;
        let items = collect_reply(url).await;
        assert_eq!(items.len(), 2, "{items:?}");
        assert_eq!(items[0].as_ref().unwrap(), "Hi");
        assert!(matches!(items[1], Err(CompletionError::Protocol(_))));
    }

    #[test]
    fn parses_delta_content() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_line(line).unwrap(), SseItem::Fragment("Hel".into()));

        let role_only = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_line(role_only).unwrap(), SseItem::Skip);

        assert_eq!(parse_line("data: [DONE]").unwrap(), SseItem::Done);
        assert_eq!(parse_line(": keep-alive").unwrap(), SseItem::Skip);
        assert_eq!(parse_line("").unwrap(), SseItem::Skip);
    }

    #[test]
    fn rejects_garbage_and_error_events() {
        assert!(matches!(
            parse_line("data: {oops"),
            Err(CompletionError::Protocol(_))
        ));
        assert!(matches!(
            parse_line(r#"data: {"error":{"message":"overloaded"}}"#),
            Err(CompletionError::Api { .. })
        ));
    }

    #[test]
    fn request_body_maps_roles_and_prepends_system_prompt() {
        let client = OpenAiCompletion::new(
            "http://localhost:8000/v1/",
            "gpt-4o-mini",
            None,
            Some("You are a finance analyst.".into()),
        );
        assert_eq!(client.base_url, "http://localhost:8000/v1");

        let transcript = vec![
            TranscriptEntry {
                index: 0,
                role: Sender::User,
                content: "COGS?".into(),
            },
            TranscriptEntry {
                index: 1,
                role: Sender::Assistant,
                content: "Sure".into(),
            },
        ];
        let body = client.request_body(&transcript);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["messages"][2]["content"], "Sure");
    }
}
