//! Controller descriptors and lab configuration loading.
//!
//! A lab configuration names a set of controllers. Each entry is a
//! [`ControllerSpec`]: the namespace and type name selecting a controller
//! archetype, plus a flat key/value `configuration` map.
//!
//! ```yaml
//! logging:
//!   level: debug
//! controllers:
//!   counter:
//!     namespace: qt3utils.datagenerators
//!     type_name: NiDaqDigitalInputRateCounter
//!     configuration:
//!       daq_name: Dev1
//!       signal_terminal: PFI0
//!       signal_counter: ctr2
//!       clock_rate: 100000
//!       num_data_samples_per_batch: 1000
//!       read_write_timeout: 10
//! ```
//!
//! Files are loaded with figment from YAML or TOML (chosen by extension) and
//! merged with `QT3_DAQ_`-prefixed environment variables, using `__` as the
//! nesting separator, e.g. `QT3_DAQ_LOGGING__LEVEL=trace`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{DaqError, Result};
use crate::logging::LoggingConfig;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "QT3_DAQ_";

/// A single configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Boolean flag
    Bool(bool),
    /// Any number; integers are widened
    Number(f64),
    /// Text
    String(String),
    /// Homogeneous list (numbers or strings)
    List(Vec<ConfigValue>),
}

impl ConfigValue {
    /// Type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "a boolean",
            Self::Number(_) => "a number",
            Self::String(_) => "a string",
            Self::List(_) => "a list",
        }
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<f64>> for ConfigValue {
    fn from(v: Vec<f64>) -> Self {
        Self::List(v.into_iter().map(Self::Number).collect())
    }
}

impl From<Vec<&str>> for ConfigValue {
    fn from(v: Vec<&str>) -> Self {
        Self::List(v.into_iter().map(Self::from).collect())
    }
}

/// Declarative reference to a controller archetype and its configuration.
///
/// The `import_path`/`class_name`/`configure` spellings of older lab files
/// are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSpec {
    /// Archetype namespace
    #[serde(alias = "import_path")]
    pub namespace: String,
    /// Archetype type name
    #[serde(alias = "class_name")]
    pub type_name: String,
    /// Key/value configuration
    #[serde(default, alias = "configure")]
    pub configuration: BTreeMap<String, ConfigValue>,
}

impl ControllerSpec {
    /// Spec with an empty configuration.
    pub fn new(namespace: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            type_name: type_name.into(),
            configuration: BTreeMap::new(),
        }
    }

    /// Builder-style setter for one configuration key.
    pub fn with(mut self, key: &str, value: impl Into<ConfigValue>) -> Self {
        self.configuration.insert(key.to_string(), value.into());
        self
    }

    /// Typed accessor over this spec's configuration.
    pub fn reader(&self, controller: &'static str) -> ConfigReader<'_> {
        ConfigReader {
            controller,
            values: &self.configuration,
        }
    }
}

/// Typed, error-reporting view of a configuration map.
pub struct ConfigReader<'a> {
    controller: &'static str,
    values: &'a BTreeMap<String, ConfigValue>,
}

impl<'a> ConfigReader<'a> {
    fn required(&self, key: &str) -> Result<&'a ConfigValue> {
        self.values
            .get(key)
            .ok_or_else(|| DaqError::MissingRequiredKey {
                controller: self.controller,
                key: key.to_string(),
            })
    }

    fn wrong_type(key: &str, expected: &'static str, found: &ConfigValue) -> DaqError {
        DaqError::InvalidValueType {
            key: key.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Required non-empty string.
    pub fn string(&self, key: &str) -> Result<String> {
        match self.required(key)? {
            ConfigValue::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            ConfigValue::String(_) => Err(DaqError::invalid_value(key, "must not be empty")),
            other => Err(Self::wrong_type(key, "a string", other)),
        }
    }

    /// Optional string; absent or blank yields `None`.
    pub fn optional_string(&self, key: &str) -> Result<Option<String>> {
        if !self.contains(key) {
            return Ok(None);
        }
        match self.required(key)? {
            ConfigValue::String(s) if s.trim().is_empty() => Ok(None),
            ConfigValue::String(s) => Ok(Some(s.trim().to_string())),
            other => Err(Self::wrong_type(key, "a string", other)),
        }
    }

    /// Required strictly positive integer.
    pub fn positive_integer(&self, key: &str) -> Result<u64> {
        match self.required(key)? {
            ConfigValue::Number(n) => {
                if !n.is_finite() || *n <= 0.0 || n.fract() != 0.0 || *n > u32::MAX as f64 {
                    Err(DaqError::invalid_value(
                        key,
                        format!("{} is not a positive integer", n),
                    ))
                } else {
                    Ok(*n as u64)
                }
            }
            other => Err(Self::wrong_type(key, "a number", other)),
        }
    }

    /// Optional strictly positive duration in seconds.
    pub fn seconds_or(&self, key: &str, default: Duration) -> Result<Duration> {
        if !self.contains(key) {
            return Ok(default);
        }
        match self.required(key)? {
            ConfigValue::Number(n) if n.is_finite() && *n > 0.0 => Ok(Duration::from_secs_f64(*n)),
            ConfigValue::Number(n) => Err(DaqError::invalid_value(
                key,
                format!("{} is not a positive number of seconds", n),
            )),
            other => Err(Self::wrong_type(key, "a number", other)),
        }
    }

    /// Required scalar number or non-empty list of numbers.
    pub fn number_or_list(&self, key: &str) -> Result<Vec<f64>> {
        match self.required(key)? {
            ConfigValue::Number(n) => Ok(vec![*n]),
            ConfigValue::List(items) if items.is_empty() => {
                Err(DaqError::invalid_value(key, "list must not be empty"))
            }
            ConfigValue::List(items) => items
                .iter()
                .map(|item| match item {
                    ConfigValue::Number(n) => Ok(*n),
                    other => Err(Self::wrong_type(key, "a list of numbers", other)),
                })
                .collect(),
            other => Err(Self::wrong_type(key, "a number or list of numbers", other)),
        }
    }

    /// Required channel list: a list of strings or one comma-separated string.
    pub fn string_or_list(&self, key: &str) -> Result<Vec<String>> {
        match self.required(key)? {
            ConfigValue::String(s) => Ok(s
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()),
            ConfigValue::List(items) => items
                .iter()
                .map(|item| match item {
                    ConfigValue::String(s) => Ok(s.trim().to_string()),
                    other => Err(Self::wrong_type(key, "a list of strings", other)),
                })
                .collect(),
            other => Err(Self::wrong_type(key, "a string or list of strings", other)),
        }
    }

    /// Optional channel list.
    pub fn optional_string_or_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        if self.contains(key) {
            self.string_or_list(key).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Top-level lab configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabConfig {
    /// Logging setup
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Controllers by name
    #[serde(default)]
    pub controllers: BTreeMap<String, ControllerSpec>,
}

impl LabConfig {
    /// Load from a YAML (`.yaml`/`.yml`) or TOML (`.toml`) file plus
    /// `QT3_DAQ_` environment overrides, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(figment::Error::from(format!(
                "configuration file '{}' not found",
                path.display()
            ))
            .into());
        }
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Figment::new().merge(Toml::file(path)),
            Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
            other => {
                return Err(DaqError::invalid_value(
                    "path",
                    format!(
                        "unsupported configuration format {:?}; use .yaml, .yml or .toml",
                        other.unwrap_or("")
                    ),
                ))
            }
        };
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse an in-memory YAML document (no environment overrides).
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = Figment::new().merge(Yaml::string(yaml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not depend on the controller archetype.
    pub fn validate(&self) -> Result<()> {
        self.logging
            .parsed_level()
            .map_err(|e| DaqError::invalid_value("logging.level", e))?;
        for (name, spec) in &self.controllers {
            if spec.namespace.trim().is_empty() || spec.type_name.trim().is_empty() {
                return Err(DaqError::in_controller(
                    name,
                    DaqError::invalid_value("namespace/type_name", "must not be empty"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ControllerSpec {
        ControllerSpec::new("ns", "Type")
            .with("name", "Dev1")
            .with("rate", 1000.0)
            .with("channels", vec!["ao0", "ao1"])
            .with("scale", vec![1.0, 2.0])
    }

    #[test]
    fn test_reader_types() {
        let spec = spec();
        let r = spec.reader("test");
        assert_eq!(r.string("name").unwrap(), "Dev1");
        assert_eq!(r.positive_integer("rate").unwrap(), 1000);
        assert_eq!(r.string_or_list("channels").unwrap(), vec!["ao0", "ao1"]);
        assert_eq!(r.number_or_list("scale").unwrap(), vec![1.0, 2.0]);
        assert_eq!(r.number_or_list("rate").unwrap(), vec![1000.0]);
        assert_eq!(
            r.seconds_or("missing", Duration::from_secs(10)).unwrap(),
            Duration::from_secs(10)
        );
        assert!(r.optional_string("missing").unwrap().is_none());
    }

    #[test]
    fn test_reader_errors() {
        let spec = spec().with("zero", 0.0).with("half", 0.5);
        let r = spec.reader("test");
        assert!(matches!(
            r.string("absent"),
            Err(DaqError::MissingRequiredKey { .. })
        ));
        assert!(matches!(
            r.string("rate"),
            Err(DaqError::InvalidValueType {
                expected: "a string",
                found: "a number",
                ..
            })
        ));
        assert!(matches!(
            r.positive_integer("zero"),
            Err(DaqError::InvalidValue { .. })
        ));
        assert!(r.positive_integer("half").is_err());
        assert!(r.seconds_or("zero", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_comma_separated_channels() {
        let spec = ControllerSpec::new("ns", "T").with("write_channels", "ao0, ao1,ao2");
        assert_eq!(
            spec.reader("t").string_or_list("write_channels").unwrap(),
            vec!["ao0", "ao1", "ao2"]
        );
    }

    #[test]
    fn test_lab_config_from_yaml_with_aliases() {
        let yaml = r#"
controllers:
  piezo:
    import_path: qt3utils.nidaq.customcontrollers
    class_name: VControl
    configure:
      daq_name: Dev1
      write_channels: ao0
      min_position: -10
      max_position: [10]
"#;
        let config = LabConfig::from_yaml_str(yaml).unwrap();
        let piezo = &config.controllers["piezo"];
        assert_eq!(piezo.type_name, "VControl");
        assert_eq!(
            piezo.configuration["min_position"],
            ConfigValue::Number(-10.0)
        );
        assert_eq!(
            piezo.configuration["max_position"],
            ConfigValue::List(vec![ConfigValue::Number(10.0)])
        );
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let yaml = "logging:\n  level: loud\n";
        assert!(matches!(
            LabConfig::from_yaml_str(yaml),
            Err(DaqError::InvalidValue { .. })
        ));
    }
}
