use std::fmt;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

/// Named fields pulled out of the Bedrock secret.
///
/// Every field is optional; a key missing from the secret leaves it `None`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialBundle {
    pub region_name: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub kendra_index_id: Option<String>,
    pub session_secret: Option<String>,
    pub session_secret_bdm1: Option<String>,
    pub session_secret_bmd2: Option<String>,
    pub session_secret_instructor1: Option<String>,
    pub session_secret_instructor2: Option<String>,
}

impl CredentialBundle {
    /// Parses the `SecretString` of the secret. It must be a JSON object.
    pub fn from_secret_string(raw: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).context("secret string is not valid JSON")?;
        let Some(object) = value.as_object() else {
            anyhow::bail!("secret string is not a JSON object");
        };
        Ok(Self::from_map(object))
    }

    pub fn from_map(secrets: &Map<String, Value>) -> Self {
        let field = |key: &str| {
            secrets
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            region_name: field("AWS_REGION"),
            aws_access_key_id: field("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: field("AWS_SECRET_ACCESS_KEY"),
            kendra_index_id: field("AWS_KENDRA_INDEX_ID"),
            session_secret: field("SESSION_SECRET"),
            session_secret_bdm1: field("SESSION_SECRET_BDM1"),
            session_secret_bmd2: field("SESSION_SECRET_BMD2"),
            session_secret_instructor1: field("SESSION_SECRET_INSTRUCTOR1"),
            session_secret_instructor2: field("SESSION_SECRET_INSTRUCTOR2"),
        }
    }

    /// Access key pair used to call the model runtime.
    pub fn access_keys(&self) -> Option<(&str, &str)> {
        let access = self.aws_access_key_id.as_deref().filter(|v| !v.is_empty())?;
        let secret = self
            .aws_secret_access_key
            .as_deref()
            .filter(|v| !v.is_empty())?;
        Some((access, secret))
    }

    /// Names of the fields present, for logging without leaking values.
    pub fn present_fields(&self) -> Vec<&'static str> {
        [
            ("region_name", &self.region_name),
            ("aws_access_key_id", &self.aws_access_key_id),
            ("aws_secret_access_key", &self.aws_secret_access_key),
            ("kendra_index_id", &self.kendra_index_id),
            ("session_secret", &self.session_secret),
            ("session_secret_bdm1", &self.session_secret_bdm1),
            ("session_secret_bmd2", &self.session_secret_bmd2),
            ("session_secret_instructor1", &self.session_secret_instructor1),
            ("session_secret_instructor2", &self.session_secret_instructor2),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_some())
        .map(|(name, _)| name)
        .collect()
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("region_name", &self.region_name)
            .field("kendra_index_id", &self.kendra_index_id)
            .field("fields", &self.present_fields())
            .finish_non_exhaustive()
    }
}
