use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use diagen_engine::render::{RenderConfig, DEFAULT_INTERPRETER};
use diagen_engine::secrets::DEFAULT_SECRET_ID;
use diagen_engine::sigv4::AwsCredentials;
use diagen_engine::EngineConfig;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8501";
pub const DOTENV_FILE: &str = ".env";

/// Flags shared by every subcommand. Unset flags fall back to the
/// environment, then `.env`, then defaults.
#[derive(Debug, Clone, Default, Args)]
pub struct SettingsArgs {
    /// Secrets Manager secret holding the Bedrock credential bundle.
    #[arg(long, global = true)]
    pub secret_id: Option<String>,
    #[arg(long, global = true)]
    pub secrets_region: Option<String>,
    #[arg(long, global = true)]
    pub bedrock_region: Option<String>,
    /// Interpreter command line used to run diagram code, e.g. "uv run python".
    #[arg(long, global = true)]
    pub python: Option<String>,
    /// Append JSONL events to this file.
    #[arg(long, global = true)]
    pub events: Option<PathBuf>,
    #[arg(long, global = true)]
    pub http_timeout_secs: Option<u64>,
    #[arg(long, global = true)]
    pub render_timeout_secs: Option<u64>,
    /// Use the offline secret store and model runtime.
    #[arg(long, global = true)]
    pub dryrun: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub engine: EngineConfig,
    pub events_path: Option<PathBuf>,
    pub listen: String,
}

/// Process environment first, then values read from a dotenv file.
#[derive(Debug, Clone, Default)]
pub struct EnvLayers {
    dotenv: HashMap<String, String>,
    use_process_env: bool,
}

impl EnvLayers {
    pub fn from_process(dotenv_path: &Path) -> Self {
        Self {
            dotenv: parse_dotenv(dotenv_path),
            use_process_env: true,
        }
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self {
            dotenv: values,
            use_process_env: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let from_process = if self.use_process_env {
            env::var(key).ok()
        } else {
            None
        };
        from_process
            .or_else(|| self.dotenv.get(key).cloned())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.get(key))
    }
}

pub fn resolve(args: &SettingsArgs, listen: Option<&str>, layers: &EnvLayers) -> Result<Settings> {
    let secret_id = non_empty(args.secret_id.as_deref())
        .or_else(|| layers.get("DIAGEN_SECRET_ID"))
        .unwrap_or_else(|| DEFAULT_SECRET_ID.to_string());
    let secrets_region = non_empty(args.secrets_region.as_deref())
        .or_else(|| layers.first(&["AWS_REGION", "AWS_DEFAULT_REGION"]));
    let bedrock_region =
        non_empty(args.bedrock_region.as_deref()).or_else(|| layers.get("DIAGEN_BEDROCK_REGION"));

    let python = non_empty(args.python.as_deref())
        .or_else(|| layers.get("DIAGEN_PYTHON"))
        .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string());
    let interpreter = shell_words::split(&python)
        .with_context(|| format!("could not parse interpreter command line: {python}"))?;
    if interpreter.is_empty() {
        bail!("interpreter command line is empty");
    }

    let bootstrap_credentials = match (
        layers.get("AWS_ACCESS_KEY_ID"),
        layers.get("AWS_SECRET_ACCESS_KEY"),
    ) {
        (Some(access), Some(secret)) => Some(
            AwsCredentials::new(access, secret)
                .with_session_token(layers.get("AWS_SESSION_TOKEN")),
        ),
        _ => None,
    };

    let events_path = args
        .events
        .clone()
        .or_else(|| layers.get("DIAGEN_EVENTS").map(PathBuf::from));
    let listen = non_empty(listen)
        .or_else(|| layers.get("DIAGEN_LISTEN"))
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

    Ok(Settings {
        engine: EngineConfig {
            secret_id,
            secrets_region,
            bootstrap_credentials,
            bedrock_region,
            secrets_endpoint: layers.get("DIAGEN_SECRETS_ENDPOINT"),
            bedrock_endpoint: layers.get("DIAGEN_BEDROCK_ENDPOINT"),
            http_timeout: args.http_timeout_secs.map(Duration::from_secs),
            render: RenderConfig {
                interpreter,
                timeout: args.render_timeout_secs.map(Duration::from_secs),
                ..RenderConfig::default()
            },
            dryrun: args.dryrun,
        },
        events_path,
        listen,
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    let mut vars = HashMap::new();
    for raw_line in content.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix("export ") {
            line = stripped.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim().to_string();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
                || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
            {
                value = value[1..value.len() - 1].to_string();
            }
        }
        vars.insert(key.to_string(), value);
    }
    vars
}
