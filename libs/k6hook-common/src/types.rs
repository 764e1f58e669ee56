use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const EMOJI_SUCCESS: &str = ":large_green_circle:";
pub const EMOJI_WARNING: &str = ":warning:";
pub const EMOJI_FAILURE: &str = ":red_circle:";

/// Applied when `min_failure_delay` is absent from the webhook metadata
pub const DEFAULT_MIN_FAILURE_DELAY: Duration = Duration::from_secs(2 * 60);

/// Validation errors for an incoming launch webhook.
///
/// All of these are raised before any side effect happens, so the
/// handler can reject the request without touching processes or
/// notification channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("no request body")]
    NoBody,

    #[error("{0}")]
    Json(String),

    #[error("error while validating base webhook: {0}")]
    Base(&'static str),

    #[error("missing script")]
    MissingScript,

    #[error("error parsing value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Flagger sends `null` for unset strings in some versions
fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Fields every Flagger webhook carries
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WebhookBase {
    #[serde(default, deserialize_with = "nullable_string")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub namespace: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub phase: String,
}

impl WebhookBase {
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.name.is_empty() {
            return Err(PayloadError::Base("missing name"));
        }
        if self.namespace.is_empty() {
            return Err(PayloadError::Base("missing namespace"));
        }
        if self.phase.is_empty() {
            return Err(PayloadError::Base("missing phase"));
        }
        Ok(())
    }
}

/// Identity of a canary analysis step, used to correlate retries
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.namespace, self.name, self.phase)
    }
}

/// Reference to a single key of a Kubernetes secret.
///
/// Written as `[namespace/]secretName/secretKey`. Without a namespace the
/// secret is looked up in the namespace of the webhook target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub namespace: Option<String>,
    pub name: String,
    pub key: String,
}

impl SecretRef {
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

impl FromStr for SecretRef {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.splitn(3, '/').collect();
        let (namespace, name, key) = match parts.as_slice() {
            [namespace, name, key] => (Some(namespace.to_string()), *name, *key),
            [name, key] => (None, *name, *key),
            _ => return Err(format!("{raw:?} is not of the form [namespace/]name/key")),
        };
        if name.is_empty() || key.is_empty() || namespace.as_deref() == Some("") {
            return Err(format!("{raw:?} is not of the form [namespace/]name/key"));
        }
        Ok(Self {
            namespace,
            name: name.to_string(),
            key: key.to_string(),
        })
    }
}

/// Validated `metadata` block of a launch webhook
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchMetadata {
    pub script: String,
    /// Stream results to k6 cloud (`k6 run --out cloud`)
    pub upload_to_cloud: bool,
    /// Keep the HTTP request open until the run finishes
    pub wait_for_results: bool,
    pub slack_channels: Vec<String>,
    /// Appended below every notification
    pub notification_context: String,
    /// Minimum time between a failure and the next accepted run of the same key
    pub min_failure_delay: Duration,
    pub env_vars: BTreeMap<String, String>,
    /// Environment variable name -> secret reference
    pub kubernetes_secrets: BTreeMap<String, SecretRef>,
}

/// Flagger passes metadata as a flat string map, so every option arrives
/// as text and is parsed here.
#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    #[serde(default, deserialize_with = "nullable_string")]
    script: String,
    #[serde(default, deserialize_with = "nullable_string")]
    upload_to_cloud: String,
    #[serde(default, deserialize_with = "nullable_string")]
    wait_for_results: String,
    #[serde(default, deserialize_with = "nullable_string")]
    slack_channels: String,
    #[serde(default, deserialize_with = "nullable_string")]
    notification_context: String,
    #[serde(default, deserialize_with = "nullable_string")]
    min_failure_delay: String,
    #[serde(default, deserialize_with = "nullable_string")]
    env_vars: String,
    #[serde(default, deserialize_with = "nullable_string")]
    kubernetes_secrets: String,
}

#[derive(Debug, Deserialize)]
struct RawLaunchPayload {
    #[serde(flatten)]
    base: WebhookBase,
    #[serde(default)]
    metadata: Option<RawMetadata>,
}

impl RawMetadata {
    fn validate(self) -> Result<LaunchMetadata, PayloadError> {
        if self.script.is_empty() {
            return Err(PayloadError::MissingScript);
        }

        let upload_to_cloud =
            parse_field("upload_to_cloud", &self.upload_to_cloud, false, parse_bool)?;
        let wait_for_results =
            parse_field("wait_for_results", &self.wait_for_results, true, parse_bool)?;
        let min_failure_delay = parse_field(
            "min_failure_delay",
            &self.min_failure_delay,
            DEFAULT_MIN_FAILURE_DELAY,
            parse_duration,
        )?;

        let slack_channels = self
            .slack_channels
            .split(',')
            .map(str::trim)
            .filter(|channel| !channel.is_empty())
            .map(str::to_string)
            .collect();

        let env_vars = parse_field("env_vars", &self.env_vars, BTreeMap::new(), |raw| {
            serde_json::from_str::<BTreeMap<String, String>>(raw).map_err(|e| e.to_string())
        })?;

        let kubernetes_secrets = parse_field(
            "kubernetes_secrets",
            &self.kubernetes_secrets,
            BTreeMap::new(),
            |raw| {
                let refs = serde_json::from_str::<BTreeMap<String, String>>(raw)
                    .map_err(|e| e.to_string())?;
                refs.into_iter()
                    .map(|(env, reference)| Ok((env, reference.parse::<SecretRef>()?)))
                    .collect()
            },
        )?;

        Ok(LaunchMetadata {
            script: self.script,
            upload_to_cloud,
            wait_for_results,
            slack_channels,
            notification_context: self.notification_context,
            min_failure_delay,
            env_vars,
            kubernetes_secrets,
        })
    }
}

/// Empty strings fall back to the default; anything else must parse
fn parse_field<T>(
    field: &'static str,
    raw: &str,
    default: T,
    parse: impl FnOnce(&str) -> Result<T, String>,
) -> Result<T, PayloadError> {
    if raw.is_empty() {
        return Ok(default);
    }
    parse(raw).map_err(|reason| PayloadError::InvalidField { field, reason })
}

/// Accepts `1`, `t`, `true` and friends in the casings Flagger users
/// already write in their canary metadata.
pub fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        other => Err(format!("invalid boolean {other:?}")),
    }
}

/// Durations such as `2m`, `90s`, `1h30m` or `500ms`. A signed value is
/// accepted; a negative delay means no delay at all.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let trimmed = raw.trim();
    let (negative, magnitude) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if magnitude == "0" {
        return Ok(Duration::ZERO);
    }

    let duration = humantime::parse_duration(magnitude)
        .map_err(|e| format!("invalid duration {raw:?}: {e}"))?;
    Ok(if negative { Duration::ZERO } else { duration })
}

/// A validated `/launch-test` webhook
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPayload {
    pub base: WebhookBase,
    pub metadata: LaunchMetadata,
}

impl LaunchPayload {
    /// Parse and validate a request body.
    ///
    /// Every textual option is parsed here so that a malformed request is
    /// rejected before the handler starts anything.
    pub fn from_json(body: &[u8]) -> Result<Self, PayloadError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(PayloadError::NoBody);
        }

        let raw: RawLaunchPayload =
            serde_json::from_slice(body).map_err(|e| PayloadError::Json(e.to_string()))?;
        raw.base.validate()?;
        let metadata = raw.metadata.unwrap_or_default().validate()?;

        Ok(Self {
            base: raw.base,
            metadata,
        })
    }

    pub fn name(&self) -> &str {
        &self.base.name
    }

    pub fn namespace(&self) -> &str {
        &self.base.namespace
    }

    pub fn key(&self) -> RunKey {
        RunKey {
            namespace: self.base.namespace.clone(),
            name: self.base.name.clone(),
            phase: self.base.phase.clone(),
        }
    }

    pub fn status_message(&self, emoji: &str, status: &str) -> String {
        format!(
            "{} Load testing of `{}` in namespace `{}` {}",
            emoji, self.base.name, self.base.namespace, status
        )
    }
}
