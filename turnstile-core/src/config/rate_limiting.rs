//! Rate limiting layer configuration.
//!
//! ```toml
//! [[rate_limiting.layers]]
//! name = "client_hourly"
//! key_by = "identity"
//! failure_mode = "fail_closed"
//! default_class = "general"
//!
//! [[rate_limiting.layers.classes]]
//! name = "seance"
//! prefixes = ["/api/v1/seance"]
//! limit = 30
//! window_seconds = 3600
//! ```
//!
//! Class names are unique across all layers, since they name the counter keys
//! (`rate_limit:<class>:<identity>`) and the `TURNSTILE_RATE_LIMIT_<CLASS>` overrides.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::FailureMode;
use crate::error::{Error, ErrorDetails};

pub const RATE_LIMIT_ENV_PREFIX: &str = "TURNSTILE_RATE_LIMIT_";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitingConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_layers")]
    pub layers: Vec<RateLimitLayerConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            layers: default_layers(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Which part of the caller identity a layer keys its windows on
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LayerKey {
    /// The caller's network address, regardless of any credential
    Ip,
    /// The full resolved `ClientIdentity`
    Identity,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitLayerConfig {
    pub name: String,
    pub key_by: LayerKey,
    #[serde(default = "default_layer_failure_mode")]
    pub failure_mode: FailureMode,
    /// Class used for paths that match none of `classes`. When unset, such paths skip this layer.
    #[serde(default)]
    pub default_class: Option<String>,
    pub classes: Vec<EndpointClassConfig>,
}

fn default_layer_failure_mode() -> FailureMode {
    FailureMode::FailClosed
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EndpointClassConfig {
    pub name: String,
    #[serde(default)]
    pub prefixes: Vec<String>,
    pub limit: u64,
    pub window_seconds: u64,
}

impl EndpointClassConfig {
    fn new(name: &str, prefixes: &[&str], limit: u64, window_seconds: u64) -> Self {
        Self {
            name: name.to_string(),
            prefixes: prefixes.iter().map(|p| (*p).to_string()).collect(),
            limit,
            window_seconds,
        }
    }
}

/// The coarse IP-keyed burst layer and the fine identity-keyed hourly layer.
///
/// Both layers intentionally overlap: the IP layer still protects the service when
/// identity resolution degrades to IP-only, so the two must not be merged.
fn default_layers() -> Vec<RateLimitLayerConfig> {
    vec![
        RateLimitLayerConfig {
            name: "ip_burst".to_string(),
            key_by: LayerKey::Ip,
            failure_mode: FailureMode::FailClosed,
            default_class: Some("api_general".to_string()),
            classes: vec![EndpointClassConfig::new("api_general", &[], 300, 300)],
        },
        RateLimitLayerConfig {
            name: "client_hourly".to_string(),
            key_by: LayerKey::Identity,
            failure_mode: FailureMode::FailClosed,
            default_class: Some("general".to_string()),
            classes: vec![
                EndpointClassConfig::new("seance", &["/api/v1/seance"], 30, 3600),
                EndpointClassConfig::new(
                    "reading_sessions",
                    &["/api/v1/reading_sessions"],
                    60,
                    3600,
                ),
                EndpointClassConfig::new("readings", &["/api/v1/readings"], 100, 3600),
                EndpointClassConfig::new("general", &[], 1000, 3600),
            ],
        },
    ]
}

fn config_error(message: String) -> Error {
    Error::new(ErrorDetails::Config { message })
}

impl RateLimitingConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let mut layer_names = HashSet::new();
        let mut class_names = HashSet::new();
        for layer in &self.layers {
            if layer.name.is_empty() {
                return Err(config_error(
                    "`rate_limiting.layers[].name` must not be empty".to_string(),
                ));
            }
            if !layer_names.insert(layer.name.as_str()) {
                return Err(config_error(format!(
                    "Duplicate rate limiting layer name `{}`",
                    layer.name
                )));
            }
            if layer.classes.is_empty() {
                return Err(config_error(format!(
                    "Rate limiting layer `{}` must define at least one endpoint class",
                    layer.name
                )));
            }
            for class in &layer.classes {
                if class.name.is_empty() {
                    return Err(config_error(format!(
                        "Rate limiting layer `{}` has an endpoint class with an empty name",
                        layer.name
                    )));
                }
                if !class_names.insert(class.name.as_str()) {
                    return Err(config_error(format!(
                        "Endpoint class `{}` is defined more than once. Class names must be unique across all rate limiting layers.",
                        class.name
                    )));
                }
                if class.limit == 0 {
                    return Err(config_error(format!(
                        "Endpoint class `{}` must have a `limit` greater than zero",
                        class.name
                    )));
                }
                if class.window_seconds == 0 {
                    return Err(config_error(format!(
                        "Endpoint class `{}` must have a `window_seconds` greater than zero",
                        class.name
                    )));
                }
                if let Some(prefix) = class.prefixes.iter().find(|p| !p.starts_with('/')) {
                    return Err(config_error(format!(
                        "Endpoint class `{}` has prefix `{prefix}`, which does not start with `/`",
                        class.name
                    )));
                }
            }
            if let Some(default_class) = &layer.default_class
                && !layer.classes.iter().any(|c| &c.name == default_class)
            {
                return Err(config_error(format!(
                    "Rate limiting layer `{}` names default class `{default_class}`, which it does not define",
                    layer.name
                )));
            }
        }
        if self.enabled && self.layers.len() < 2 {
            tracing::warn!(
                "Only {} rate limiting layer(s) configured. Running a coarse IP-keyed layer in front of an identity-keyed layer is recommended.",
                self.layers.len()
            );
        }
        Ok(())
    }

    /// Applies `TURNSTILE_RATE_LIMIT_<CLASS>=<limit>[/<window_seconds>]` overrides.
    ///
    /// An override that names an unknown class or has a malformed value is a fatal
    /// configuration error rather than being silently ignored.
    pub fn apply_env_overrides(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), Error> {
        for (name, value) in vars {
            let Some(suffix) = name.strip_prefix(RATE_LIMIT_ENV_PREFIX) else {
                continue;
            };
            let class_name = suffix.to_ascii_lowercase();
            let (limit, window_seconds) = parse_override_value(&name, &value)?;
            let class = self
                .layers
                .iter_mut()
                .flat_map(|layer| layer.classes.iter_mut())
                .find(|class| class.name == class_name)
                .ok_or_else(|| {
                    config_error(format!(
                        "Environment variable `{name}` refers to unknown endpoint class `{class_name}`"
                    ))
                })?;
            class.limit = limit;
            if let Some(window_seconds) = window_seconds {
                class.window_seconds = window_seconds;
            }
            tracing::info!(
                "Endpoint class `{class_name}` overridden from `{name}`: {} requests per {}s",
                class.limit,
                class.window_seconds
            );
        }
        Ok(())
    }
}

fn parse_override_value(name: &str, value: &str) -> Result<(u64, Option<u64>), Error> {
    let malformed = || {
        config_error(format!(
            "Environment variable `{name}` must look like `<limit>` or `<limit>/<window_seconds>`, got `{value}`"
        ))
    };
    let mut parts = value.trim().splitn(2, '/');
    let limit = parts
        .next()
        .and_then(|l| l.trim().parse::<u64>().ok())
        .ok_or_else(malformed)?;
    let window_seconds = match parts.next() {
        Some(w) => Some(w.trim().parse::<u64>().map_err(|_| malformed())?),
        None => None,
    };
    Ok((limit, window_seconds))
}
