use crate::error::{AppError, Result};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub stations: Vec<StationConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    #[serde(default = "default_request_delay_ms", deserialize_with = "deserialize_u64")]
    pub request_delay_ms: u64,
    #[serde(default = "default_timeout_seconds", deserialize_with = "deserialize_u64")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries", deserialize_with = "deserialize_u64")]
    pub max_retries: u64,
}

fn default_request_delay_ms() -> u64 {
    500 // be nice to the free API when fetching multiple batches
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_retries() -> u64 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_minutes", deserialize_with = "deserialize_u64")]
    pub interval_minutes: u64,
    #[serde(default = "default_initial_delay", deserialize_with = "deserialize_u64")]
    pub initial_delay_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            initial_delay_seconds: default_initial_delay(),
        }
    }
}

fn default_interval_minutes() -> u64 {
    5
}

fn default_initial_delay() -> u64 {
    5
}

/// A monitored station. Hidden (private) stations need their read key.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StationConfig {
    #[serde(deserialize_with = "deserialize_station_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub read_key: Option<String>,
}

/// Custom deserializer that handles numbers as both number and string
///
/// Accepts:
/// - `interval_minutes: 5` (number)
/// - `interval_minutes: "5"` (string that parses to number)
/// - `interval_minutes: ${POLL_MINUTES}` (env var substituted to either)
fn deserialize_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberValue {
        Number(u64),
        String(String),
    }

    match NumberValue::deserialize(deserializer)? {
        NumberValue::Number(n) => Ok(n),
        NumberValue::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid number: '{}'", s))),
    }
}

fn deserialize_station_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdValue {
        Number(u64),
        String(String),
    }

    Ok(match IdValue::deserialize(deserializer)? {
        IdValue::Number(n) => n.to_string(),
        IdValue::String(s) => s.trim().to_string(),
    })
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Valid HTTPS source URL
    /// - Positive poll interval
    /// - Non-empty, unique station list
    /// - Read keys for hidden stations
    fn validate(&self) -> Result<()> {
        match url::Url::parse(&self.source.base_url) {
            Err(e) => {
                return Err(AppError::Config(format!(
                    "Invalid source base_url '{}': {}",
                    self.source.base_url, e
                )));
            }
            Ok(parsed) if parsed.scheme() != "https" => {
                return Err(AppError::Config(format!(
                    "Source base_url must use HTTPS, got: {}",
                    parsed.scheme()
                )));
            }
            Ok(_) => {}
        }

        if self.scheduler.interval_minutes == 0 {
            return Err(AppError::Config(
                "Scheduler interval_minutes must be greater than 0".to_string(),
            ));
        }

        // The rolling EPA window assumes roughly one sample every 5 minutes
        if self.scheduler.interval_minutes < 2 {
            tracing::warn!(
                "Scheduler interval of {} minutes is very short, upstream data only refreshes every few minutes",
                self.scheduler.interval_minutes
            );
        }

        if self.stations.is_empty() {
            return Err(AppError::Config(
                "At least one station must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for station in &self.stations {
            if station.id.is_empty() {
                return Err(AppError::Config("Station id cannot be empty".to_string()));
            }

            if !seen.insert(station.id.as_str()) {
                return Err(AppError::Config(format!(
                    "Station '{}' is configured more than once",
                    station.id
                )));
            }

            if station.hidden
                && station
                    .read_key
                    .as_deref()
                    .map_or(true, |key| key.trim().is_empty())
            {
                return Err(AppError::Config(format!(
                    "Station '{}' is hidden and requires a read_key",
                    station.id
                )));
            }
        }

        Ok(())
    }
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid placeholder pattern: {}", e)))?;

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}
