pub mod eventstream;
pub mod extract;
pub mod invoker;
pub mod notices;
pub mod render;
pub mod secrets;
pub mod sigv4;

use std::env;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use diagen_contracts::credentials::CredentialBundle;
use diagen_contracts::events::{self, EventPayload, EventWriter};
use diagen_contracts::models::{list_available_models, ModelDescriptor, ModelSelector};
use reqwest::blocking::Response as HttpResponse;
use serde_json::{json, Map, Value};

use crate::extract::{extract_diagram_code, rewrite_diagram_title};
use crate::invoker::{
    build_request_body, collect_stream, wrap_prompt, BedrockRuntime, DryrunRuntime,
    InvokeRequest, ModelRuntime, FALLBACK_RESPONSE,
};
use crate::notices::Notices;
use crate::render::{RenderConfig, RenderFailure, RenderRun, RenderedImage, Renderer};
use crate::secrets::{
    fetch_credentials, DryrunSecretStore, SecretStore, SecretsManagerStore, DEFAULT_SECRET_ID,
};
use crate::sigv4::AwsCredentials;

pub const CODE_GENERATED: &str = "Diagram code generated successfully!";
pub const CODE_GENERATION_FAILED: &str = "Failed to generate diagram code.";
pub const DIAGRAM_GENERATED: &str = "Diagram generated successfully!";
pub const GRAPHVIZ_NOT_FOUND: &str =
    "Graphviz not found. Please install Graphviz and ensure 'dot' is in your PATH.";
pub const IMAGE_NOT_PRODUCED: &str = "Failed to generate the diagram image.";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub secret_id: String,
    pub secrets_region: Option<String>,
    /// Keys used to call Secrets Manager; falls back to the process environment.
    pub bootstrap_credentials: Option<AwsCredentials>,
    pub bedrock_region: Option<String>,
    pub secrets_endpoint: Option<String>,
    pub bedrock_endpoint: Option<String>,
    pub http_timeout: Option<Duration>,
    pub render: RenderConfig,
    /// Swap the secret store and model runtime for offline stand-ins.
    pub dryrun: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            secret_id: DEFAULT_SECRET_ID.to_string(),
            secrets_region: None,
            bootstrap_credentials: None,
            bedrock_region: None,
            secrets_endpoint: None,
            bedrock_endpoint: None,
            http_timeout: None,
            render: RenderConfig::default(),
            dryrun: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReviewRequest {
    pub prompt: String,
    pub model_id: Option<String>,
}

/// Result of "Review Diagram Code". `code` is `None` when nothing usable came
/// back; the caller then keeps whatever code it already had.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub code: Option<String>,
    pub model: Option<ModelDescriptor>,
    pub notices: Notices,
}

/// Result of "Generate Diagram".
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    /// The code as executed, after the title rewrite.
    pub executed_code: String,
    pub run: Option<RenderRun>,
    pub notices: Notices,
}

impl GenerateOutcome {
    pub fn image(&self) -> Option<&RenderedImage> {
        self.run.as_ref().and_then(|run| run.image.as_ref())
    }
}

pub struct DiagramEngine {
    events: EventWriter,
    secrets: Box<dyn SecretStore>,
    runtime: Box<dyn ModelRuntime>,
    renderer: Renderer,
    selector: ModelSelector,
    secret_id: String,
}

impl DiagramEngine {
    pub fn new(config: EngineConfig, events: EventWriter) -> Result<Self> {
        let (secrets, runtime): (Box<dyn SecretStore>, Box<dyn ModelRuntime>) = if config.dryrun {
            (Box::new(DryrunSecretStore), Box::new(DryrunRuntime))
        } else {
            (
                Box::new(SecretsManagerStore::new(
                    config.secrets_region.clone(),
                    config.secrets_endpoint.clone(),
                    config
                        .bootstrap_credentials
                        .clone()
                        .or_else(SecretsManagerStore::env_credentials),
                    config.http_timeout,
                )?),
                Box::new(BedrockRuntime::new(
                    config.bedrock_region.clone(),
                    config.bedrock_endpoint.clone(),
                    config.http_timeout,
                )?),
            )
        };
        let engine = Self::with_backends(
            secrets,
            runtime,
            Renderer::new(config.render),
            config.secret_id,
            events,
        );
        engine.events.emit(
            events::SESSION_STARTED,
            map_object(json!({
                "secret_store": engine.secrets.name(),
                "runtime": engine.runtime.name(),
                "interpreter": engine.renderer.config().interpreter,
            })),
        )?;
        Ok(engine)
    }

    pub fn with_backends(
        secrets: Box<dyn SecretStore>,
        runtime: Box<dyn ModelRuntime>,
        renderer: Renderer,
        secret_id: impl Into<String>,
        events: EventWriter,
    ) -> Self {
        Self {
            events,
            secrets,
            runtime,
            renderer,
            selector: ModelSelector::default(),
            secret_id: secret_id.into(),
        }
    }

    pub fn models(&self) -> Vec<ModelDescriptor> {
        list_available_models()
    }

    /// Fetches the credential bundle. Failures become an error notice and `None`.
    pub fn load_credentials(&self, notices: &mut Notices) -> Option<CredentialBundle> {
        match fetch_credentials(self.secrets.as_ref(), &self.secret_id) {
            Ok(bundle) => {
                self.events.record(
                    events::CREDENTIALS_LOADED,
                    map_object(json!({
                        "secret_id": self.secret_id,
                        "fields": bundle.present_fields(),
                    })),
                );
                Some(bundle)
            }
            Err(err) => {
                let message = error_chain_text(&err, 1024);
                self.events.record(
                    events::CREDENTIALS_FAILED,
                    map_object(json!({
                        "secret_id": self.secret_id,
                        "error": message,
                    })),
                );
                notices.error(format!("Error retrieving Bedrock credentials: {message}"));
                None
            }
        }
    }

    /// Streams a completion for `prompt`. Any failure becomes an error notice
    /// and [`FALLBACK_RESPONSE`].
    pub fn invoke_model(
        &self,
        prompt: &str,
        access_key: &str,
        secret_key: &str,
        model_id: &str,
        notices: &mut Notices,
    ) -> String {
        match self.try_invoke(prompt, access_key, secret_key, model_id) {
            Ok(text) => text,
            Err(err) => {
                let message = error_chain_text(&err, 1024);
                self.events.record(
                    events::INVOKE_FAILED,
                    map_object(json!({
                        "model_id": model_id,
                        "error": message,
                    })),
                );
                notices.error(format!("Error in invoking model: {message}"));
                FALLBACK_RESPONSE.to_string()
            }
        }
    }

    fn try_invoke(
        &self,
        prompt: &str,
        access_key: &str,
        secret_key: &str,
        model_id: &str,
    ) -> Result<String> {
        let body = build_request_body(prompt);
        self.events.record(
            events::INVOKE_STARTED,
            map_object(json!({
                "model_id": model_id,
                "runtime": self.runtime.name(),
                "prompt_chars": prompt.chars().count(),
            })),
        );
        let started = Instant::now();
        let stream = self.runtime.open_stream(&InvokeRequest {
            model_id,
            body: &body,
            access_key,
            secret_key,
        })?;
        let summary = collect_stream(stream)?;
        self.events.record(
            events::INVOKE_FINISHED,
            map_object(json!({
                "model_id": model_id,
                "chunks": summary.chunks,
                "stopped": summary.stopped,
                "response_chars": summary.text.chars().count(),
                "elapsed_ms": started.elapsed().as_millis() as u64,
            })),
        );
        Ok(summary.text)
    }

    /// "Review Diagram Code": credentials, model call, extraction, corrections.
    pub fn review(&self, request: &ReviewRequest) -> ReviewOutcome {
        let mut notices = Notices::default();
        let outcome = |code: Option<String>, model: Option<ModelDescriptor>, notices: Notices| {
            ReviewOutcome {
                code,
                model,
                notices,
            }
        };

        let selection = match self.selector.select(request.model_id.as_deref()) {
            Ok(selection) => selection,
            Err(reason) => {
                notices.error(reason);
                return outcome(None, None, notices);
            }
        };
        if let (Some(_), Some(reason)) = (&selection.requested, &selection.fallback_reason) {
            notices.info(reason.clone());
        }
        let model = selection.model;

        let Some(credentials) = self.load_credentials(&mut notices) else {
            return outcome(None, Some(model), notices);
        };
        let Some((access_key, secret_key)) = credentials.access_keys() else {
            notices.error(
                "Error in invoking model: the Bedrock secret has no AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY pair",
            );
            notices.error(CODE_GENERATION_FAILED);
            return outcome(None, Some(model), notices);
        };

        let response = self.invoke_model(
            &wrap_prompt(&request.prompt),
            access_key,
            secret_key,
            &model.id,
            &mut notices,
        );
        if response.is_empty() || response == FALLBACK_RESPONSE {
            notices.error(CODE_GENERATION_FAILED);
            return outcome(None, Some(model), notices);
        }

        let code = extract_diagram_code(&response);
        self.events.record(
            events::CODE_EXTRACTED,
            map_object(json!({
                "model_id": model.id,
                "code_chars": code.chars().count(),
                "fenced": response.contains("```"),
            })),
        );
        if code.is_empty() {
            notices.error(CODE_GENERATION_FAILED);
            return outcome(None, Some(model), notices);
        }
        notices.success(CODE_GENERATED);
        outcome(Some(code), Some(model), notices)
    }

    /// Runs `code` as-is and returns the image it produced, if any.
    pub fn generate_diagram_image(
        &self,
        code: &str,
        notices: &mut Notices,
    ) -> Option<RenderedImage> {
        self.render_reporting(code, notices)
            .and_then(|run| run.image)
    }

    /// "Generate Diagram": pins the diagram title to the expected output name,
    /// then renders.
    pub fn generate(&self, code: &str) -> GenerateOutcome {
        let mut notices = Notices::default();
        let executed_code = rewrite_diagram_title(code, &self.renderer.config().output_stem);
        let run = self.render_reporting(&executed_code, &mut notices);
        if run.as_ref().is_some_and(|run| run.image.is_some()) {
            notices.success(DIAGRAM_GENERATED);
        }
        GenerateOutcome {
            executed_code,
            run,
            notices,
        }
    }

    fn render_reporting(&self, code: &str, notices: &mut Notices) -> Option<RenderRun> {
        self.events.record(
            events::RENDER_STARTED,
            map_object(json!({
                "code_chars": code.chars().count(),
                "interpreter": self.renderer.config().interpreter,
            })),
        );
        let run = match self.renderer.run(code) {
            Ok(run) => run,
            Err(err) => {
                let message = error_chain_text(&err, 2048);
                self.events.record(
                    events::RENDER_FAILED,
                    map_object(json!({ "error": message })),
                );
                notices.error(format!("Error executing code:\n{message}"));
                return None;
            }
        };

        notices.text(format!("STDOUT: {}", run.stdout));
        notices.text(format!("STDERR: {}", run.stderr));
        match run.failure {
            Some(RenderFailure::GraphvizMissing) => notices.error(GRAPHVIZ_NOT_FOUND),
            Some(RenderFailure::NonZeroExit) => {
                notices.error(format!("Error executing code:\n{}", run.stderr))
            }
            Some(RenderFailure::TimedOut) => notices.error(format!(
                "Diagram code did not finish within {} seconds.",
                self.renderer
                    .config()
                    .timeout
                    .map(|limit| limit.as_secs_f64())
                    .unwrap_or_default()
            )),
            Some(RenderFailure::MissingImage | RenderFailure::UnreadableImage) => {
                notices.error(IMAGE_NOT_PRODUCED)
            }
            None => {}
        }

        let event_type = if run.image.is_some() {
            events::RENDER_FINISHED
        } else {
            events::RENDER_FAILED
        };
        self.events.record(
            event_type,
            map_object(json!({
                "exit_code": run.exit_code,
                "failure": run.failure.map(|failure| format!("{failure:?}")),
                "code_sha256": run.code_sha256,
                "elapsed_ms": run.elapsed.as_millis() as u64,
                "image": run.image.as_ref().map(|image| json!({
                    "file_name": image.file_name,
                    "width": image.width,
                    "height": image.height,
                    "bytes": image.bytes.len(),
                })),
            })),
        );
        Some(run)
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing: &String| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_else(Map::new)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{Cursor, Read};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::anyhow;

    use super::invoker::chunk_frame;
    use super::notices::NoticeLevel;
    use super::*;

    struct StaticSecrets(Result<String, String>);

    impl SecretStore for StaticSecrets {
        fn name(&self) -> &str {
            "static"
        }

        fn get_secret_string(&self, _secret_id: &str) -> Result<String> {
            self.0.clone().map_err(|err| anyhow!(err))
        }
    }

    struct ScriptedRuntime {
        reply: Option<String>,
        calls: Arc<AtomicUsize>,
    }

    impl ModelRuntime for ScriptedRuntime {
        fn name(&self) -> &str {
            "scripted"
        }

        fn open_stream(&self, _request: &InvokeRequest<'_>) -> Result<Box<dyn Read + Send>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Some(reply) = self.reply.as_ref() else {
                bail!("ExpiredTokenException: the security token included in the request is expired");
            };
            let mut bytes = Vec::new();
            for piece in reply.split_inclusive(' ') {
                bytes.extend(chunk_frame(&json!({
                    "type": "content_block_delta",
                    "delta": {"type": "text_delta", "text": piece},
                })));
            }
            bytes.extend(chunk_frame(&json!({"type": "message_stop"})));
            Ok(Box::new(Cursor::new(bytes)))
        }
    }

    const GOOD_SECRET: &str =
        r#"{"AWS_REGION":"us-east-1","AWS_ACCESS_KEY_ID":"AKID","AWS_SECRET_ACCESS_KEY":"wJalrXUtnFEMI"}"#;

    fn engine_with(
        secrets: Result<String, String>,
        reply: Option<&str>,
        events: EventWriter,
    ) -> (DiagramEngine, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = DiagramEngine::with_backends(
            Box::new(StaticSecrets(secrets)),
            Box::new(ScriptedRuntime {
                reply: reply.map(str::to_string),
                calls: calls.clone(),
            }),
            Renderer::default(),
            DEFAULT_SECRET_ID,
            events,
        );
        (engine, calls)
    }

    fn texts(notices: &Notices, level: NoticeLevel) -> Vec<String> {
        notices
            .iter()
            .filter(|notice| notice.level == level)
            .map(|notice| notice.text.clone())
            .collect()
    }

    fn request(prompt: &str) -> ReviewRequest {
        ReviewRequest {
            prompt: prompt.to_string(),
            model_id: Some("anthropic.claude-3-haiku-20240307-v1:0".to_string()),
        }
    }

    const WEB_SERVICE_REPLY: &str = "Here is the code:\n\n```python\nfrom diagrams import Diagram\nfrom diagrams.aws.compute import EC2\nfrom diagrams.aws.database import RDS\nfrom diagrams.aws.network import ELB\n\nwith Diagram(\"Web Service\", show=False):\n    ELB(\"lb\") >> EC2(\"web\") >> RDS(\"userdb\")\n```\n";

    #[test]
    fn secret_failure_aborts_before_model_call() {
        let (engine, calls) = engine_with(
            Err("ResourceNotFoundException".to_string()),
            Some(WEB_SERVICE_REPLY),
            EventWriter::disabled("t"),
        );
        let outcome = engine.review(&request("anything"));

        assert_eq!(outcome.code, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let errors = texts(&outcome.notices, NoticeLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Error retrieving Bedrock credentials: "));
        assert!(errors[0].contains("ResourceNotFoundException"));
    }

    #[test]
    fn load_credentials_returns_none_on_bad_secret_json() {
        let (engine, _) = engine_with(
            Ok("not json".to_string()),
            None,
            EventWriter::disabled("t"),
        );
        let mut notices = Notices::default();
        assert!(engine.load_credentials(&mut notices).is_none());
        assert!(notices.has_errors());
    }

    #[test]
    fn web_service_reply_is_extracted_verbatim() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let (engine, calls) = engine_with(
            Ok(GOOD_SECRET.to_string()),
            Some(WEB_SERVICE_REPLY),
            EventWriter::new(&events_path, "t"),
        );
        let outcome =
            engine.review(&request("Generate diagram code for a web service with ELB, EC2, and RDS"));

        let code = outcome.code.expect("code");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(code.starts_with("from diagrams import Diagram"));
        assert!(code.ends_with("RDS(\"userdb\")"));
        assert!(code.contains("ELB") && code.contains("EC2") && code.contains("RDS"));
        assert_eq!(
            texts(&outcome.notices, NoticeLevel::Success),
            vec![CODE_GENERATED.to_string()]
        );
        assert_eq!(
            outcome.model.map(|model| model.label),
            Some("Claude 3 Haiku 1.0".to_string())
        );

        let raw = fs::read_to_string(events_path)?;
        assert!(!raw.contains("wJalrXUtnFEMI"));
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(
            types,
            vec![
                events::CREDENTIALS_LOADED,
                events::INVOKE_STARTED,
                events::INVOKE_FINISHED,
                events::CODE_EXTRACTED,
            ]
        );
        Ok(())
    }

    #[test]
    fn dynamodb_in_reply_is_corrected() {
        let reply = "```python\nfrom diagrams.aws.database import DynamoDB\nDynamoDB(\"orders\")\n```";
        let (engine, _) = engine_with(Ok(GOOD_SECRET.to_string()), Some(reply), EventWriter::disabled("t"));
        let outcome = engine.review(&request("table"));
        assert_eq!(
            outcome.code.as_deref(),
            Some("from diagrams.aws.database import Dynamodb\nDynamodb(\"orders\")")
        );
    }

    #[test]
    fn model_failure_yields_fallback_and_no_code() {
        let (engine, calls) = engine_with(Ok(GOOD_SECRET.to_string()), None, EventWriter::disabled("t"));
        let mut notices = Notices::default();
        let text = engine.invoke_model("p", "AKID", "secret", "anthropic.claude-v2", &mut notices);
        assert_eq!(text, FALLBACK_RESPONSE);
        assert!(texts(&notices, NoticeLevel::Error)[0].starts_with("Error in invoking model: "));

        let outcome = engine.review(&request("p"));
        assert_eq!(outcome.code, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            texts(&outcome.notices, NoticeLevel::Error).last().map(String::as_str),
            Some(CODE_GENERATION_FAILED)
        );
    }

    #[test]
    fn reply_without_code_is_a_failure() {
        let (engine, _) = engine_with(
            Ok(GOOD_SECRET.to_string()),
            Some("I would rather not."),
            EventWriter::disabled("t"),
        );
        let outcome = engine.review(&request("p"));
        assert_eq!(outcome.code, None);
        assert_eq!(
            texts(&outcome.notices, NoticeLevel::Error),
            vec![CODE_GENERATION_FAILED.to_string()]
        );
    }

    #[test]
    fn secret_without_access_keys_skips_model_call() {
        let (engine, calls) = engine_with(
            Ok(r#"{"AWS_REGION":"us-east-1"}"#.to_string()),
            Some(WEB_SERVICE_REPLY),
            EventWriter::disabled("t"),
        );
        let outcome = engine.review(&request("p"));
        assert_eq!(outcome.code, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_model_falls_back_with_info_notice() {
        let (engine, _) = engine_with(
            Ok(GOOD_SECRET.to_string()),
            Some(WEB_SERVICE_REPLY),
            EventWriter::disabled("t"),
        );
        let outcome = engine.review(&ReviewRequest {
            prompt: "p".to_string(),
            model_id: Some("anthropic.claude-9".to_string()),
        });
        assert!(outcome.code.is_some());
        assert_eq!(
            texts(&outcome.notices, NoticeLevel::Info),
            vec!["Requested model 'anthropic.claude-9' is not in the catalog.".to_string()]
        );
    }

    #[test]
    fn error_chain_text_joins_causes() {
        let err = anyhow!("root cause").context("outer");
        assert_eq!(error_chain_text(&err, 100), "outer | caused by: root cause");
        assert_eq!(error_chain_text(&err, 5), "outer…");
    }

    #[test]
    fn dryrun_engine_reviews_without_network() -> Result<()> {
        let engine = DiagramEngine::new(
            EngineConfig {
                dryrun: true,
                ..EngineConfig::default()
            },
            EventWriter::disabled("t"),
        )?;
        let outcome = engine.review(&request("web service with ELB, EC2, and RDS"));
        assert_eq!(
            outcome.code.as_deref(),
            Some(extract::DEFAULT_DIAGRAM_CODE.trim())
        );
        Ok(())
    }

    #[cfg(unix)]
    mod rendering {
        use std::path::Path;

        use image::{Rgb, RgbImage};

        use super::*;

        // Stands in for the diagrams package: writes `<title>.png` using the
        // title of the first `with Diagram(...)` comment line.
        fn title_driven_script(fixture: &Path) -> String {
            format!(
                r#"# with Diagram("Grouped Workers", show=False):
name=$(sed -n 's/^# with Diagram[(]"\([^"]*\)".*/\1/p' "$0")
cp '{}' "$name.png"
"#,
                fixture.display()
            )
        }

        fn sh_engine(temp_root: &Path) -> DiagramEngine {
            DiagramEngine::with_backends(
                Box::new(DryrunSecretStore),
                Box::new(DryrunRuntime),
                Renderer::new(RenderConfig {
                    interpreter: vec!["sh".to_string()],
                    temp_root: Some(temp_root.to_path_buf()),
                    ..RenderConfig::default()
                }),
                DEFAULT_SECRET_ID,
                EventWriter::disabled("t"),
            )
        }

        fn fixture(dir: &Path) -> Result<std::path::PathBuf> {
            let path = dir.join("fixture.png");
            RgbImage::from_pixel(4, 4, Rgb([10, 20, 30])).save(&path)?;
            Ok(path)
        }

        #[test]
        fn generate_pins_title_and_returns_image() -> Result<()> {
            let fixtures = tempfile::tempdir()?;
            let temp_root = tempfile::tempdir()?;
            let engine = sh_engine(temp_root.path());

            let outcome = engine.generate(&title_driven_script(&fixture(fixtures.path())?));

            assert!(outcome
                .executed_code
                .starts_with("# with Diagram(\"example_diagram\", show=False):"));
            let image = outcome.image().expect("image");
            assert_eq!(image.file_name, "example_diagram.png");
            assert_eq!((image.width, image.height), (4, 4));
            assert_eq!(
                texts(&outcome.notices, NoticeLevel::Success),
                vec![DIAGRAM_GENERATED.to_string()]
            );
            assert_eq!(texts(&outcome.notices, NoticeLevel::Text).len(), 2);
            assert_eq!(fs::read_dir(temp_root.path())?.count(), 0);
            Ok(())
        }

        #[test]
        fn unrewritten_title_means_no_image() -> Result<()> {
            let fixtures = tempfile::tempdir()?;
            let temp_root = tempfile::tempdir()?;
            let engine = sh_engine(temp_root.path());
            let mut notices = Notices::default();

            let image = engine
                .generate_diagram_image(&title_driven_script(&fixture(fixtures.path())?), &mut notices);

            assert!(image.is_none());
            assert_eq!(
                texts(&notices, NoticeLevel::Error),
                vec![IMAGE_NOT_PRODUCED.to_string()]
            );
            Ok(())
        }

        #[test]
        fn missing_graphviz_gets_its_own_message() -> Result<()> {
            let temp_root = tempfile::tempdir()?;
            let engine = sh_engine(temp_root.path());
            let outcome = engine.generate("echo 'ExecutableNotFound: dot' >&2\nexit 1\n");
            assert!(outcome.image().is_none());
            assert_eq!(
                texts(&outcome.notices, NoticeLevel::Error),
                vec![GRAPHVIZ_NOT_FOUND.to_string()]
            );
            Ok(())
        }

        #[test]
        fn unreadable_image_still_reports_output() -> Result<()> {
            let temp_root = tempfile::tempdir()?;
            let engine = sh_engine(temp_root.path());
            let outcome = engine.generate("echo drawing\necho junk > example_diagram.png\n");
            assert!(outcome.image().is_none());
            assert_eq!(
                texts(&outcome.notices, NoticeLevel::Error),
                vec![IMAGE_NOT_PRODUCED.to_string()]
            );
            assert!(texts(&outcome.notices, NoticeLevel::Text)
                .contains(&"STDOUT: drawing\n".to_string()));
            Ok(())
        }

        #[test]
        fn failing_code_reports_stderr() -> Result<()> {
            let temp_root = tempfile::tempdir()?;
            let engine = sh_engine(temp_root.path());
            let outcome = engine.generate("echo 'NameError: EC3' >&2\nexit 1\n");
            let errors = texts(&outcome.notices, NoticeLevel::Error);
            assert_eq!(errors, vec!["Error executing code:\nNameError: EC3\n".to_string()]);
            assert!(texts(&outcome.notices, NoticeLevel::Text)
                .contains(&"STDERR: NameError: EC3\n".to_string()));
            Ok(())
        }
    }
}
