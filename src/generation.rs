//! Text generation provider abstraction.
//!
//! The [`Generator`] trait turns a rendered prompt into an answer, either
//! all at once or as an incremental stream of text fragments. Implementations:
//!
//! - **[`DisabledGenerator`]**: always fails; used when generation is not configured.
//! - **[`OllamaGenerator`]**: `POST /api/generate`, newline-delimited JSON when streaming.
//! - **[`OpenAIGenerator`]**: `POST /v1/chat/completions`, server-sent events when streaming.
//!
//! Only the initial request is retried (see [`crate::embedding`] for the
//! backoff policy). A failure after the first fragment surfaces as an `Err`
//! item in the stream.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::embedding::post_json_with_retry;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Ordered fragments of generated text.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// A text generation service.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    /// Produce the full completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Produce the completion for `prompt` as ordered fragments.
    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream>;
}

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        bail!("Generation provider is disabled")
    }

    async fn generate_stream(&self, _prompt: &str) -> Result<TokenStream> {
        bail!("Generation provider is disabled")
    }
}

/// Generation responses can stream for far longer than any fixed budget, so
/// `timeout_secs` bounds connecting and each silence between reads, not the
/// whole request.
fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    let timeout = Duration::from_secs(timeout_secs);
    Ok(reqwest::Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()?)
}

// ============ Ollama ============

pub struct OllamaGenerator {
    model: String,
    url: String,
    temperature: Option<f32>,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        let client = http_client(config.timeout_secs)?;

        Ok(Self {
            model,
            url,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client,
        })
    }

    fn body(&self, prompt: &str, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": stream,
        });
        if let Some(t) = self.temperature {
            body["options"] = serde_json::json!({ "temperature": t });
        }
        body
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let response = post_json_with_retry(
            &self.client,
            &self.endpoint(),
            None,
            &self.body(prompt, false),
            self.max_retries,
            "Ollama",
        )
        .await?;
        let json: serde_json::Value = response.json().await?;
        if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
            bail!("Ollama error: {}", err);
        }
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing response field"))
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        let response = post_json_with_retry(
            &self.client,
            &self.endpoint(),
            None,
            &self.body(prompt, true),
            self.max_retries,
            "Ollama",
        )
        .await?;
        Ok(fragments(response, parse_ollama_line))
    }
}

/// One NDJSON line: `{"response": "...", "done": false}`.
fn parse_ollama_line(line: &str) -> Result<Option<String>> {
    let json: serde_json::Value = serde_json::from_str(line)?;
    if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
        bail!("Ollama error: {}", err);
    }
    Ok(json
        .get("response")
        .and_then(|r| r.as_str())
        .filter(|r| !r.is_empty())
        .map(str::to_string))
}

// ============ OpenAI ============

pub struct OpenAIGenerator {
    model: String,
    api_key: String,
    temperature: Option<f32>,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    /// # Errors
    ///
    /// Fails if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = http_client(config.timeout_secs)?;

        Ok(Self {
            model,
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client,
        })
    }

    fn body(&self, prompt: &str, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": stream,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        body
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let response = post_json_with_retry(
            &self.client,
            OPENAI_CHAT_URL,
            Some(&self.api_key),
            &self.body(prompt, false),
            self.max_retries,
            "OpenAI",
        )
        .await?;
        let json: serde_json::Value = response.json().await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing message content"))
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        let response = post_json_with_retry(
            &self.client,
            OPENAI_CHAT_URL,
            Some(&self.api_key),
            &self.body(prompt, true),
            self.max_retries,
            "OpenAI",
        )
        .await?;
        Ok(fragments(response, parse_openai_line))
    }
}

/// One SSE line: `data: {"choices":[{"delta":{"content":"..."}}]}` or `data: [DONE]`.
fn parse_openai_line(line: &str) -> Result<Option<String>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }
    let json: serde_json::Value = serde_json::from_str(data)?;
    if let Some(err) = json.pointer("/error/message").and_then(|e| e.as_str()) {
        bail!("OpenAI error: {}", err);
    }
    Ok(json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_string))
}

// ============ Streaming plumbing ============

struct LineReader {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: Vec<u8>,
    done: bool,
}

/// Split a streaming response body into trimmed text lines.
fn lines(response: reqwest::Response) -> BoxStream<'static, Result<String>> {
    let reader = LineReader {
        body: response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed(),
        buf: Vec::new(),
        done: false,
    };

    stream::unfold(reader, |mut st| async move {
        loop {
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line).trim().to_string();
                return Some((Ok(text), st));
            }
            if st.done {
                if st.buf.is_empty() {
                    return None;
                }
                let text = String::from_utf8_lossy(&st.buf).trim().to_string();
                st.buf.clear();
                return Some((Ok(text), st));
            }
            match st.body.next().await {
                Some(Ok(bytes)) => st.buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    st.done = true;
                    st.buf.clear();
                    return Some((Err(anyhow!("stream interrupted: {}", e)), st));
                }
                None => st.done = true,
            }
        }
    })
    .boxed()
}

/// Parse each non-empty body line into an optional text fragment.
fn fragments(
    response: reqwest::Response,
    parse: fn(&str) -> Result<Option<String>>,
) -> TokenStream {
    lines(response)
        .filter_map(move |line| async move {
            match line {
                Ok(line) if line.is_empty() => None,
                Ok(line) => parse(&line).transpose(),
                Err(e) => Some(Err(e)),
            }
        })
        .boxed()
}

/// Create the [`Generator`] named by `config.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ollama_line() {
        assert_eq!(
            parse_ollama_line(r#"{"response":"Paris","done":false}"#).unwrap(),
            Some("Paris".to_string())
        );
        assert_eq!(
            parse_ollama_line(r#"{"response":"","done":true}"#).unwrap(),
            None
        );
        assert!(parse_ollama_line(r#"{"error":"model not found"}"#).is_err());
        assert!(parse_ollama_line("not json").is_err());
    }

    #[test]
    fn test_parse_openai_line() {
        let line = r#"data: {"choices":[{"delta":{"content":" is"}}]}"#;
        assert_eq!(parse_openai_line(line).unwrap(), Some(" is".to_string()));
        assert_eq!(parse_openai_line("data: [DONE]").unwrap(), None);
        assert_eq!(parse_openai_line(": keep-alive").unwrap(), None);
        let role_only = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_openai_line(role_only).unwrap(), None);
    }

    /// Serves one chunked NDJSON response, pausing `gap` between lines.
    async fn slow_ndjson_server(lines: Vec<&'static str>, gap: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ntransfer-encoding: chunked\r\n\r\n")
                .await
                .unwrap();
            for line in lines {
                tokio::time::sleep(gap).await;
                let data = format!("{}\n", line);
                socket
                    .write_all(format!("{:x}\r\n{}\r\n", data.len(), data).as_bytes())
                    .await
                    .unwrap();
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_stream_may_outlast_timeout_while_tokens_flow() {
        use futures::TryStreamExt;

        let url = slow_ndjson_server(
            vec![
                r#"{"response":"Paris","done":false}"#,
                r#"{"response":" is","done":false}"#,
                r#"{"response":" the capital","done":false}"#,
                r#"{"response":"","done":true}"#,
            ],
            Duration::from_millis(400),
        )
        .await;
        let config = GenerationConfig {
            provider: "ollama".to_string(),
            model: Some("test".to_string()),
            url: Some(url),
            max_retries: 0,
            timeout_secs: 1,
            ..GenerationConfig::default()
        };

        let generator = OllamaGenerator::new(&config).unwrap();
        let tokens: Vec<String> = generator
            .generate_stream("q")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(tokens.concat(), "Paris is the capital");
    }

    #[tokio::test]
    async fn test_disabled_generator_fails() {
        assert!(DisabledGenerator.generate("q").await.is_err());
        assert!(DisabledGenerator.generate_stream("q").await.is_err());
    }

    #[test]
    fn test_create_generator_rejects_unknown() {
        let config = GenerationConfig {
            provider: "mystery".to_string(),
            ..GenerationConfig::default()
        };
        assert!(create_generator(&config).is_err());
    }
}
