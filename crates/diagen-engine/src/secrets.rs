use std::time::Duration;

use anyhow::{bail, Context, Result};
use diagen_contracts::credentials::CredentialBundle;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde_json::{json, Value};

use crate::sigv4::{sign_request, AwsCredentials};
use crate::{non_empty_env, response_json_or_error};

pub const DEFAULT_SECRET_ID: &str = "bedrocksecrets";
pub const DEFAULT_SECRETS_REGION: &str = "us-east-1";

pub trait SecretStore: Send + Sync {
    fn name(&self) -> &str;
    /// Returns the `SecretString` stored under `secret_id`.
    fn get_secret_string(&self, secret_id: &str) -> Result<String>;
}

/// Fetches the named secret and pulls the credential fields out of it.
pub fn fetch_credentials(store: &dyn SecretStore, secret_id: &str) -> Result<CredentialBundle> {
    let raw = store
        .get_secret_string(secret_id)
        .with_context(|| format!("{} lookup of '{secret_id}' failed", store.name()))?;
    CredentialBundle::from_secret_string(&raw)
}

/// AWS Secrets Manager over its JSON 1.1 protocol.
pub struct SecretsManagerStore {
    endpoint: String,
    region: String,
    credentials: Option<AwsCredentials>,
    http: HttpClient,
}

impl SecretsManagerStore {
    /// `endpoint` overrides the regional `secretsmanager` URL.
    pub fn new(
        region: Option<String>,
        endpoint: Option<String>,
        credentials: Option<AwsCredentials>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let region = region
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| non_empty_env("AWS_REGION"))
            .or_else(|| non_empty_env("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|| DEFAULT_SECRETS_REGION.to_string());
        let endpoint = endpoint
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("https://secretsmanager.{region}.amazonaws.com"));
        let mut builder = HttpClient::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            endpoint,
            region,
            credentials,
            http: builder
                .build()
                .context("failed to build Secrets Manager HTTP client")?,
        })
    }

    /// Bootstrap credentials from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
    /// (plus `AWS_SESSION_TOKEN` when set).
    pub fn env_credentials() -> Option<AwsCredentials> {
        let access = non_empty_env("AWS_ACCESS_KEY_ID")?;
        let secret = non_empty_env("AWS_SECRET_ACCESS_KEY")?;
        Some(AwsCredentials::new(access, secret).with_session_token(non_empty_env("AWS_SESSION_TOKEN")))
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl SecretStore for SecretsManagerStore {
    fn name(&self) -> &str {
        "secretsmanager"
    }

    fn get_secret_string(&self, secret_id: &str) -> Result<String> {
        let Some(credentials) = self.credentials.as_ref() else {
            bail!("no AWS credentials available (set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY)");
        };
        let url = Url::parse(&format!("{}/", self.endpoint))
            .with_context(|| format!("invalid Secrets Manager endpoint {}", self.endpoint))?;
        let body = serde_json::to_vec(&json!({ "SecretId": secret_id }))?;
        let signed = sign_request(
            "POST",
            &url,
            &[
                (CONTENT_TYPE.as_str(), "application/x-amz-json-1.1"),
                ("x-amz-target", "secretsmanager.GetSecretValue"),
            ],
            &body,
            credentials,
            &self.region,
            "secretsmanager",
            chrono::Utc::now(),
        )?;

        let mut builder = self.http.post(url).body(body);
        for (name, value) in signed {
            builder = builder.header(name, value);
        }
        let response = builder.send().context("Secrets Manager request failed")?;
        let payload = response_json_or_error("Secrets Manager", response)?;
        secret_string_from_response(&payload)
    }
}

fn secret_string_from_response(payload: &Value) -> Result<String> {
    payload
        .get("SecretString")
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("secret has no SecretString")
}

/// Offline store handing out placeholder keys.
pub struct DryrunSecretStore;

impl SecretStore for DryrunSecretStore {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn get_secret_string(&self, _secret_id: &str) -> Result<String> {
        Ok(json!({
            "AWS_REGION": DEFAULT_SECRETS_REGION,
            "AWS_ACCESS_KEY_ID": "AKIDDRYRUN",
            "AWS_SECRET_ACCESS_KEY": "dryrun-secret",
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    impl SecretStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }

        fn get_secret_string(&self, _secret_id: &str) -> Result<String> {
            bail!("AccessDeniedException")
        }
    }

    #[test]
    fn dryrun_store_yields_access_keys() -> Result<()> {
        let bundle = fetch_credentials(&DryrunSecretStore, DEFAULT_SECRET_ID)?;
        assert_eq!(bundle.access_keys(), Some(("AKIDDRYRUN", "dryrun-secret")));
        assert_eq!(bundle.region_name.as_deref(), Some("us-east-1"));
        Ok(())
    }

    #[test]
    fn store_failure_names_the_store_and_secret() {
        let err = fetch_credentials(&FailingStore, "bedrocksecrets").unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("failing lookup of 'bedrocksecrets' failed"));
        assert!(text.contains("AccessDeniedException"));
    }

    #[test]
    fn secret_string_is_read_from_response() -> Result<()> {
        let payload = json!({"Name": "bedrocksecrets", "SecretString": "{\"AWS_REGION\":\"eu-west-1\"}"});
        assert_eq!(
            secret_string_from_response(&payload)?,
            "{\"AWS_REGION\":\"eu-west-1\"}"
        );
        assert!(secret_string_from_response(&json!({"SecretBinary": "AA=="})).is_err());
        Ok(())
    }

    #[test]
    fn missing_bootstrap_credentials_fail_before_any_request() -> Result<()> {
        let store = SecretsManagerStore::new(Some("us-east-1".to_string()), None, None, None)?;
        let err = store.get_secret_string("bedrocksecrets").unwrap_err();
        assert!(err.to_string().contains("no AWS credentials"));
        assert_eq!(store.region(), "us-east-1");
        assert_eq!(store.endpoint(), "https://secretsmanager.us-east-1.amazonaws.com");
        Ok(())
    }

    #[test]
    fn endpoint_override_is_trimmed() -> Result<()> {
        let store = SecretsManagerStore::new(
            Some("eu-west-1".to_string()),
            Some(" http://localhost:4566/ ".to_string()),
            None,
            None,
        )?;
        assert_eq!(store.endpoint(), "http://localhost:4566");
        assert_eq!(store.region(), "eu-west-1");
        Ok(())
    }
}
