use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub mod telemetry;
pub mod validate;

pub use telemetry::init_tracing;
pub use validate::{ValidationIssue, validate_settings};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "REQUEST_COALESCE_";

const ENV_MAX_KEY_DEPTH: &str = "REQUEST_COALESCE_MAX_KEY_DEPTH";
const ENV_DRAIN_CAPACITY: &str = "REQUEST_COALESCE_DRAIN_CAPACITY";
const ENV_LOG: &str = "REQUEST_COALESCE_LOG";
const ENV_LOG_FORMAT: &str = "REQUEST_COALESCE_LOG_FORMAT";
const ENV_TELEMETRY: &str = "REQUEST_COALESCE_TELEMETRY";

/// Fully resolved settings for a host embedding request coalescing.
/// Keeps the core crate free from config-loader concerns.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub coalesce: CoalesceSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoalesceSettings {
    /// Deepest argument nesting accepted during key derivation.
    pub max_key_depth: usize,
    /// Undelivered drain events buffered per subscriber.
    pub drain_capacity: usize,
}

impl Default for CoalesceSettings {
    fn default() -> Self {
        Self {
            max_key_depth: 64,
            drain_capacity: 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySettings {
    pub enabled: bool,
    /// `EnvFilter` directive, e.g. `info,request_coalesce=debug`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: "info".into(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("unknown log format {other:?}; expected text or json")),
        }
    }
}

/// Partial settings contributed by one source. Unset fields fall through to lower layers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsLayer {
    pub coalesce: Option<CoalesceLayer>,
    pub telemetry: Option<TelemetryLayer>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoalesceLayer {
    pub max_key_depth: Option<usize>,
    pub drain_capacity: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryLayer {
    pub enabled: Option<bool>,
    pub filter: Option<String>,
    pub format: Option<LogFormat>,
}

/// Where a resolved field's value came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Default,
    File(PathBuf),
    Environment,
    Cli,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File(path) => write!(f, "file {}", path.display()),
            ConfigSource::Environment => write!(f, "environment"),
            ConfigSource::Cli => write!(f, "cli"),
        }
    }
}

/// Settings plus per-field provenance.
#[derive(Clone, Debug)]
pub struct ResolvedSettings {
    pub settings: RuntimeSettings,
    pub provenance: BTreeMap<String, ConfigSource>,
}

impl ResolvedSettings {
    pub fn source_of(&self, field: &str) -> Option<&ConfigSource> {
        self.provenance.get(field)
    }

    /// Human and machine readable provenance report.
    pub fn explain(&self) -> ExplainReport {
        let values = field_values(&self.settings);
        let mut text = String::new();
        let mut fields = serde_json::Map::new();
        for (field, value) in &values {
            let source = self
                .provenance
                .get(*field)
                .cloned()
                .unwrap_or(ConfigSource::Default);
            text.push_str(&format!("{field} = {value} ({source})\n"));
            fields.insert(
                (*field).to_string(),
                json!({ "value": value, "source": source }),
            );
        }
        ExplainReport {
            text,
            json: serde_json::Value::Object(fields),
        }
    }
}

pub struct ExplainReport {
    pub text: String,
    pub json: serde_json::Value,
}

/// Resolves settings from defaults, an optional file, the environment and CLI overrides,
/// in increasing order of precedence.
#[derive(Clone, Debug, Default)]
pub struct SettingsResolver {
    config_file: Option<PathBuf>,
    env: Option<HashMap<String, String>>,
    cli: SettingsLayer,
}

impl SettingsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Reads overrides from `vars` instead of the process environment.
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn with_cli_overrides(mut self, layer: SettingsLayer) -> Self {
        self.cli = layer;
        self
    }

    pub fn load(self) -> Result<ResolvedSettings> {
        let mut settings = RuntimeSettings::default();
        let mut provenance = BTreeMap::new();
        for (field, _) in field_values(&settings) {
            provenance.insert(field.to_string(), ConfigSource::Default);
        }

        if let Some(path) = &self.config_file {
            let layer = parse_settings_layer(path)?;
            apply_layer(
                &mut settings,
                &mut provenance,
                &layer,
                ConfigSource::File(path.clone()),
            );
        }

        let env = match self.env {
            Some(vars) => vars,
            None => std::env::vars()
                .filter(|(key, _)| key.starts_with(ENV_PREFIX))
                .collect(),
        };
        let env_layer = layer_from_env(&env)?;
        apply_layer(
            &mut settings,
            &mut provenance,
            &env_layer,
            ConfigSource::Environment,
        );

        apply_layer(&mut settings, &mut provenance, &self.cli, ConfigSource::Cli);

        validate_settings(&settings).context("invalid request-coalesce settings")?;
        Ok(ResolvedSettings {
            settings,
            provenance,
        })
    }
}

/// Parse a TOML or JSON settings file, chosen by extension.
pub fn parse_settings_layer(path: &Path) -> Result<SettingsLayer> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read settings from {}", path.display()))?;
    let layer = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents)
            .with_context(|| format!("{} is not valid settings json", path.display()))?,
        _ => toml::from_str(&contents)
            .with_context(|| format!("{} is not valid settings toml", path.display()))?,
    };
    Ok(layer)
}

fn layer_from_env(env: &HashMap<String, String>) -> Result<SettingsLayer> {
    let mut layer = SettingsLayer::default();

    if let Some(raw) = env.get(ENV_MAX_KEY_DEPTH) {
        let depth = raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("{ENV_MAX_KEY_DEPTH}={raw:?} is not a number"))?;
        layer
            .coalesce
            .get_or_insert_with(Default::default)
            .max_key_depth = Some(depth);
    }
    if let Some(raw) = env.get(ENV_DRAIN_CAPACITY) {
        let capacity = raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("{ENV_DRAIN_CAPACITY}={raw:?} is not a number"))?;
        layer
            .coalesce
            .get_or_insert_with(Default::default)
            .drain_capacity = Some(capacity);
    }
    if let Some(raw) = env.get(ENV_LOG) {
        layer.telemetry.get_or_insert_with(Default::default).filter = Some(raw.clone());
    }
    if let Some(raw) = env.get(ENV_LOG_FORMAT) {
        let format = raw
            .parse::<LogFormat>()
            .with_context(|| format!("{ENV_LOG_FORMAT}={raw:?}"))?;
        layer.telemetry.get_or_insert_with(Default::default).format = Some(format);
    }
    if let Some(raw) = env.get(ENV_TELEMETRY) {
        layer.telemetry.get_or_insert_with(Default::default).enabled = Some(parse_flag(raw)?);
    }

    Ok(layer)
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{ENV_TELEMETRY}={other:?} is not a boolean")),
    }
}

fn apply_layer(
    settings: &mut RuntimeSettings,
    provenance: &mut BTreeMap<String, ConfigSource>,
    layer: &SettingsLayer,
    source: ConfigSource,
) {
    let mut mark = |field: &str| {
        provenance.insert(field.to_string(), source.clone());
    };

    if let Some(coalesce) = &layer.coalesce {
        if let Some(depth) = coalesce.max_key_depth {
            settings.coalesce.max_key_depth = depth;
            mark("coalesce.max_key_depth");
        }
        if let Some(capacity) = coalesce.drain_capacity {
            settings.coalesce.drain_capacity = capacity;
            mark("coalesce.drain_capacity");
        }
    }

    if let Some(telemetry) = &layer.telemetry {
        if let Some(enabled) = telemetry.enabled {
            settings.telemetry.enabled = enabled;
            mark("telemetry.enabled");
        }
        if let Some(filter) = &telemetry.filter {
            settings.telemetry.filter = filter.clone();
            mark("telemetry.filter");
        }
        if let Some(format) = telemetry.format {
            settings.telemetry.format = format;
            mark("telemetry.format");
        }
    }
}

fn field_values(settings: &RuntimeSettings) -> Vec<(&'static str, serde_json::Value)> {
    vec![
        (
            "coalesce.max_key_depth",
            json!(settings.coalesce.max_key_depth),
        ),
        (
            "coalesce.drain_capacity",
            json!(settings.coalesce.drain_capacity),
        ),
        ("telemetry.enabled", json!(settings.telemetry.enabled)),
        ("telemetry.filter", json!(settings.telemetry.filter)),
        ("telemetry.format", json!(settings.telemetry.format)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_layer_parses_every_variable() {
        let env: HashMap<String, String> = [
            (ENV_MAX_KEY_DEPTH, "12"),
            (ENV_DRAIN_CAPACITY, "4"),
            (ENV_LOG, "debug"),
            (ENV_LOG_FORMAT, "JSON"),
            (ENV_TELEMETRY, "off"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let layer = layer_from_env(&env).unwrap();
        let coalesce = layer.coalesce.unwrap();
        let telemetry = layer.telemetry.unwrap();
        assert_eq!(coalesce.max_key_depth, Some(12));
        assert_eq!(coalesce.drain_capacity, Some(4));
        assert_eq!(telemetry.filter.as_deref(), Some("debug"));
        assert_eq!(telemetry.format, Some(LogFormat::Json));
        assert_eq!(telemetry.enabled, Some(false));
    }

    #[test]
    fn bad_env_number_is_reported() {
        let mut env = HashMap::new();
        env.insert(ENV_DRAIN_CAPACITY.to_string(), "lots".to_string());
        let err = layer_from_env(&env).unwrap_err();
        assert!(err.to_string().contains(ENV_DRAIN_CAPACITY));
    }

    #[test]
    fn explain_lists_every_field() {
        let resolved = SettingsResolver::new()
            .with_env(Vec::<(String, String)>::new())
            .load()
            .unwrap();
        let report = resolved.explain();
        assert!(report.text.contains("coalesce.max_key_depth = 64 (default)"));
        assert_eq!(report.json["telemetry.format"]["value"], "text");
        assert_eq!(report.json["telemetry.format"]["source"], "default");
    }
}
