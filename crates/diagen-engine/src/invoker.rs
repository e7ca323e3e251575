use std::io::{Cursor, Read};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde_json::{json, Value};

use crate::eventstream::{encode_message, Header, MessageReader};
use crate::extract::DEFAULT_DIAGRAM_CODE;
use crate::sigv4::{sign_request, uri_encode, AwsCredentials};
use crate::truncate_text;

pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
pub const MAX_TOKENS: u64 = 1024;
pub const DEFAULT_BEDROCK_REGION: &str = "us-east-1";
/// Returned instead of generated text when the model call fails.
pub const FALLBACK_RESPONSE: &str = "Response not available due to API error.";

const PROMPT_PREAMBLE: &str = "Please generate python code using the diagrams module according to this prompt. \
You should start with 'from diagrams'.\n\nPrompt: ";

pub fn wrap_prompt(user_prompt: &str) -> String {
    format!("{PROMPT_PREAMBLE}{user_prompt}")
}

pub fn build_request_body(prompt: &str) -> Value {
    json!({
        "anthropic_version": ANTHROPIC_VERSION,
        "max_tokens": MAX_TOKENS,
        "messages": [
            {
                "role": "user",
                "content": prompt,
            }
        ],
    })
}

#[derive(Debug, Clone, Copy)]
pub struct InvokeRequest<'a> {
    pub model_id: &'a str,
    pub body: &'a Value,
    pub access_key: &'a str,
    pub secret_key: &'a str,
}

/// A streaming text-generation backend. Implementations hand back the raw
/// event-stream bytes; framing and accumulation happen in [`collect_stream`].
pub trait ModelRuntime: Send + Sync {
    fn name(&self) -> &str;
    fn open_stream(&self, request: &InvokeRequest<'_>) -> Result<Box<dyn Read + Send>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub text: String,
    pub chunks: usize,
    pub stopped: bool,
}

/// Concatenates `content_block_delta` text until `message_stop` or end of
/// stream. Events of any other type are skipped.
pub fn collect_stream<R: Read>(reader: R) -> Result<StreamSummary> {
    let mut summary = StreamSummary::default();
    for message in MessageReader::new(reader) {
        let message = message?;
        if message.is_exception() {
            let kind = message
                .header_str(":exception-type")
                .or_else(|| message.header_str(":error-code"))
                .unwrap_or("exception")
                .to_string();
            let detail = serde_json::from_slice::<Value>(&message.payload)
                .ok()
                .and_then(|value| value.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&message.payload).to_string());
            bail!("{kind}: {}", truncate_text(&detail, 512));
        }
        if message.event_type() != Some("chunk") {
            continue;
        }
        summary.chunks += 1;

        let envelope: Value =
            serde_json::from_slice(&message.payload).context("chunk payload is not JSON")?;
        let encoded = envelope
            .get("bytes")
            .and_then(Value::as_str)
            .context("chunk payload has no bytes field")?;
        let decoded = BASE64
            .decode(encoded)
            .context("chunk bytes are not valid base64")?;
        let event: Value =
            serde_json::from_slice(&decoded).context("chunk bytes are not a JSON document")?;

        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
        if event_type.contains("content_block_delta") {
            if let Some(text) = event
                .get("delta")
                .and_then(|delta| delta.get("text"))
                .and_then(Value::as_str)
            {
                summary.text.push_str(text);
            }
        } else if event_type.contains("message_stop") {
            summary.stopped = true;
            break;
        }
    }
    Ok(summary)
}

pub struct BedrockRuntime {
    endpoint: String,
    region: String,
    http: HttpClient,
}

impl BedrockRuntime {
    /// `endpoint` overrides the regional `bedrock-runtime` URL.
    pub fn new(
        region: Option<String>,
        endpoint: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let region = region
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BEDROCK_REGION.to_string());
        let endpoint = endpoint
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("https://bedrock-runtime.{region}.amazonaws.com"));
        let mut builder = HttpClient::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            endpoint,
            region,
            http: builder.build().context("failed to build Bedrock HTTP client")?,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn stream_url(&self, model_id: &str) -> Result<Url> {
        let raw = format!(
            "{}/model/{}/invoke-with-response-stream",
            self.endpoint,
            uri_encode(model_id)
        );
        Url::parse(&raw).with_context(|| format!("invalid Bedrock endpoint {raw}"))
    }
}

impl ModelRuntime for BedrockRuntime {
    fn name(&self) -> &str {
        "bedrock"
    }

    fn open_stream(&self, request: &InvokeRequest<'_>) -> Result<Box<dyn Read + Send>> {
        let url = self.stream_url(request.model_id)?;
        let body = serde_json::to_vec(request.body)?;
        let credentials = AwsCredentials::new(request.access_key, request.secret_key);
        let signed = sign_request(
            "POST",
            &url,
            &[
                (CONTENT_TYPE.as_str(), "application/json"),
                (ACCEPT.as_str(), "application/vnd.amazon.eventstream"),
            ],
            &body,
            &credentials,
            &self.region,
            "bedrock",
            chrono::Utc::now(),
        )?;

        let mut builder = self.http.post(url).body(body);
        for (name, value) in signed {
            builder = builder.header(name, value);
        }
        let response = builder.send().context("Bedrock request failed")?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let text = response.text().unwrap_or_default();
            bail!(
                "Bedrock request failed ({code}): {}",
                truncate_text(&text, 512)
            );
        }
        Ok(Box::new(response))
    }
}

/// Offline runtime: streams a canned diagram through the same framing as
/// Bedrock, one delta per line.
pub struct DryrunRuntime;

impl DryrunRuntime {
    pub fn canned_reply(prompt: &str) -> String {
        let topic = prompt
            .rsplit("Prompt: ")
            .next()
            .unwrap_or(prompt)
            .lines()
            .next()
            .unwrap_or_default()
            .trim();
        format!("Here is a diagram for: {topic}\n\n```python\n{DEFAULT_DIAGRAM_CODE}```\n")
    }
}

impl ModelRuntime for DryrunRuntime {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn open_stream(&self, request: &InvokeRequest<'_>) -> Result<Box<dyn Read + Send>> {
        let prompt = request.body["messages"][0]["content"]
            .as_str()
            .unwrap_or_default();
        let reply = Self::canned_reply(prompt);

        let mut bytes = chunk_frame(&json!({"type": "message_start"}));
        bytes.extend(chunk_frame(&json!({"type": "content_block_start", "index": 0})));
        for piece in reply.split_inclusive('\n') {
            bytes.extend(chunk_frame(&json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": piece},
            })));
        }
        bytes.extend(chunk_frame(&json!({"type": "content_block_stop", "index": 0})));
        bytes.extend(chunk_frame(&json!({"type": "message_stop"})));
        Ok(Box::new(Cursor::new(bytes)))
    }
}

/// Wraps a model event as a Bedrock `chunk` frame.
pub fn chunk_frame(event: &Value) -> Vec<u8> {
    let inner = serde_json::to_vec(event).unwrap_or_default();
    let payload = json!({ "bytes": BASE64.encode(inner) });
    encode_message(
        &[
            Header::string(":event-type", "chunk"),
            Header::string(":content-type", "application/json"),
            Header::string(":message-type", "event"),
        ],
        payload.to_string().as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn delta(text: &str) -> Vec<u8> {
        chunk_frame(&json!({
            "type": "content_block_delta",
            "delta": {"type": "text_delta", "text": text},
        }))
    }

    #[test]
    fn request_body_has_fixed_shape() {
        let body = build_request_body("draw it");
        assert_eq!(body["anthropic_version"], json!("bedrock-2023-05-31"));
        assert_eq!(body["max_tokens"], json!(1024));
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["messages"][0]["role"], json!("user"));
        assert_eq!(body["messages"][0]["content"], json!("draw it"));
    }

    #[test]
    fn wrapped_prompt_asks_for_diagrams_code() {
        assert_eq!(
            wrap_prompt("ELB to EC2"),
            "Please generate python code using the diagrams module according to this prompt. \
             You should start with 'from diagrams'.\n\nPrompt: ELB to EC2"
        );
    }

    #[test]
    fn deltas_are_concatenated_until_message_stop() -> Result<()> {
        let mut bytes = chunk_frame(&json!({"type": "message_start"}));
        bytes.extend(delta("from diagrams "));
        bytes.extend(delta("import Diagram"));
        bytes.extend(chunk_frame(&json!({"type": "message_delta"})));
        bytes.extend(chunk_frame(&json!({"type": "message_stop"})));
        bytes.extend(delta(" ignored"));

        let summary = collect_stream(Cursor::new(bytes))?;
        assert_eq!(summary.text, "from diagrams import Diagram");
        assert!(summary.stopped);
        assert_eq!(summary.chunks, 5);
        Ok(())
    }

    #[test]
    fn stream_without_stop_returns_what_arrived() -> Result<()> {
        let summary = collect_stream(Cursor::new(delta("partial")))?;
        assert_eq!(summary.text, "partial");
        assert!(!summary.stopped);
        Ok(())
    }

    #[test]
    fn non_chunk_events_are_ignored() -> Result<()> {
        let mut bytes = encode_message(&[Header::string(":event-type", "metadata")], b"{}");
        bytes.extend(delta("x"));
        assert_eq!(collect_stream(Cursor::new(bytes))?.text, "x");
        Ok(())
    }

    #[test]
    fn exception_frame_becomes_an_error() {
        let bytes = encode_message(
            &[
                Header::string(":message-type", "exception"),
                Header::string(":exception-type", "validationException"),
            ],
            br#"{"message":"bad model"}"#,
        );
        let err = collect_stream(Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.to_string(), "validationException: bad model");
    }

    #[test]
    fn dryrun_runtime_streams_a_fenced_diagram() -> Result<()> {
        let body = build_request_body(&wrap_prompt("web service with ELB, EC2, and RDS"));
        let request = InvokeRequest {
            model_id: "anthropic.claude-v2",
            body: &body,
            access_key: "a",
            secret_key: "b",
        };
        let summary = collect_stream(DryrunRuntime.open_stream(&request)?)?;
        assert!(summary.stopped);
        assert!(summary
            .text
            .starts_with("Here is a diagram for: web service with ELB, EC2, and RDS"));
        assert!(summary.text.contains("```python\nfrom diagrams import Diagram"));
        Ok(())
    }

    #[test]
    fn bedrock_url_encodes_model_id() -> Result<()> {
        let runtime = BedrockRuntime::new(Some("us-west-2".to_string()), None, None)?;
        let url = runtime.stream_url("anthropic.claude-v2:1")?;
        assert_eq!(
            url.as_str(),
            "https://bedrock-runtime.us-west-2.amazonaws.com/model/anthropic.claude-v2%3A1/invoke-with-response-stream"
        );
        assert_eq!(runtime.region(), "us-west-2");
        Ok(())
    }

    #[test]
    fn bedrock_endpoint_override_replaces_regional_host() -> Result<()> {
        let runtime = BedrockRuntime::new(
            None,
            Some("http://127.0.0.1:4566/ ".to_string()),
            None,
        )?;
        let url = runtime.stream_url("anthropic.claude-v2")?;
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:4566/model/anthropic.claude-v2/invoke-with-response-stream"
        );
        assert_eq!(runtime.region(), "us-east-1");
        Ok(())
    }
}
