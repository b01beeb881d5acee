use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Load an explicit env file. Unlike [`load_dotenv`], a missing file is an error.
pub fn load_dotenv_from(path: &Path) -> Result<(), ConfigError> {
    dotenvy::from_path(path)
        .map(|_| ())
        .map_err(|e| ConfigError::EnvFile(format!("{}: {e}", path.display())))
}

/// Profiled variable lookup: tries `{PROFILE}_{KEY}` first, falls back to `{KEY}`.
///
/// Empty values count as unset.
struct Vars<'a> {
    profile: &'a str,
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|s| !s.is_empty())
    }

    fn opt(&self, key: &str) -> Option<String> {
        if !self.profile.is_empty() {
            let prefixed = format!("{}_{}", self.profile, key);
            if let Some(v) = self.raw(&prefixed) {
                return Some(v);
            }
        }
        self.raw(key)
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    /// Parse `key` if present. A value that is set but unparsable is an error,
    /// never a silent fallback to the default.
    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.opt(key)
            .map(|raw| {
                raw.trim().parse().map_err(|e| ConfigError::Invalid {
                    key: key.to_string(),
                    reason: format!("{raw:?}: {e}"),
                })
            })
            .transpose()
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigError> {
        let Some(raw) = self.opt(key) else {
            return Ok(false);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                reason: format!("{raw:?} is not a boolean"),
            }),
        }
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    /// Target database; also hosts the jobs table read by the producer.
    pub target: PostgresConfig,
    pub source: PostgresConfig,
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub jobs: JobsConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `ROWBUS_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let lookup = |key: &str| env::var(key).ok();
        let profile = lookup("ROWBUS_PROFILE").unwrap_or_default();
        Self::from_lookup(&profile, &lookup)
    }

    /// Build config from an explicit key/value map instead of the process environment.
    pub fn from_map(profile: &str, vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(profile, &|key: &str| vars.get(key).cloned())
    }

    fn from_lookup(
        profile: &str,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let profile = profile.to_uppercase();
        let v = Vars {
            profile: &profile,
            lookup,
        };
        Ok(Self {
            profile: profile.clone(),
            target: PostgresConfig::from_vars(&v, "PG")?,
            source: PostgresConfig::from_vars(&v, "SOURCE")?,
            broker: BrokerConfig::from_vars(&v)?,
            consumer: ConsumerConfig::from_vars(&v)?,
            jobs: JobsConfig::from_vars(&v),
        })
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Validate everything the producer needs.
    pub fn producer_settings(&self) -> Result<ProducerSettings, ConfigError> {
        let mut missing = Vec::new();
        missing.extend(self.broker.missing_keys());
        missing.extend(self.target.missing_keys("PG"));
        missing.extend(self.source.missing_keys("SOURCE"));
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        check_identifier("JOBS_TABLE", &self.jobs.table)?;

        Ok(ProducerSettings {
            config_store: self.target.clone(),
            source: self.source.clone(),
            broker: self.broker.clone(),
            jobs_table: self.jobs.table.clone(),
        })
    }

    /// Validate everything the consumer needs.
    pub fn consumer_settings(&self) -> Result<ConsumerSettings, ConfigError> {
        let mut missing = Vec::new();
        missing.extend(self.broker.missing_keys());
        if self.consumer.queue_name.is_none() {
            missing.push("QUEUE_NAME".to_string());
        }
        if self.consumer.procedure_name.is_none() {
            missing.push("PROCEDURE_NAME".to_string());
        }
        missing.extend(self.target.missing_keys("PG"));

        let (Some(queue_name), Some(procedure_name), true) = (
            self.consumer.queue_name.clone(),
            self.consumer.procedure_name.clone(),
            missing.is_empty(),
        ) else {
            return Err(ConfigError::Missing(missing));
        };
        check_identifier("PROCEDURE_NAME", &procedure_name)?;

        let failure_policy = match self.consumer.max_attempts {
            Some(max_attempts) => FailurePolicy::DeadLetter { max_attempts },
            None => FailurePolicy::LeaveUnacked,
        };

        Ok(ConsumerSettings {
            target: self.target.clone(),
            broker: self.broker.clone(),
            queue_name,
            procedure_name,
            failure_policy,
            reconnect_backoff: Duration::from_secs(self.consumer.reconnect_backoff_secs),
        })
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  target:   {}", self.target.redacted());
        tracing::info!("  source:   {}", self.source.redacted());
        tracing::info!(
            "  broker:   host={}, port={}, vhost={}, heartbeat={}s, confirms={}",
            self.broker.host.as_deref().unwrap_or("(none)"),
            self.broker.port,
            self.broker.vhost,
            self.broker.heartbeat_secs,
            self.broker.publish_confirms
        );
        tracing::info!(
            "  consumer: queue={}, procedure={}, max_attempts={:?}, backoff={}s",
            self.consumer.queue_name.as_deref().unwrap_or("(none)"),
            self.consumer.procedure_name.as_deref().unwrap_or("(none)"),
            self.consumer.max_attempts,
            self.consumer.reconnect_backoff_secs
        );
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: Option<String>,
    pub port: u16,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
}

impl PostgresConfig {
    fn from_vars(v: &Vars<'_>, prefix: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            host: v.opt(&format!("{prefix}_HOST")),
            port: v.parse_or(&format!("{prefix}_PORT"), 5432)?,
            database: v.opt(&format!("{prefix}_DBNAME")),
            username: v.opt(&format!("{prefix}_USER")),
            password: v.opt(&format!("{prefix}_PASS")),
            ssl_mode: v.or(&format!("{prefix}_SSL_MODE"), "prefer"),
        })
    }

    fn missing_keys(&self, prefix: &str) -> Vec<String> {
        [
            ("HOST", self.host.is_none()),
            ("DBNAME", self.database.is_none()),
            ("USER", self.username.is_none()),
        ]
        .into_iter()
        .filter(|(_, missing)| *missing)
        .map(|(key, _)| format!("{prefix}_{key}"))
        .collect()
    }

    /// `host:port/db as user`, never the password.
    pub fn redacted(&self) -> String {
        format!(
            "{}:{}/{} as {}",
            self.host.as_deref().unwrap_or("(none)"),
            self.port,
            self.database.as_deref().unwrap_or("(none)"),
            self.username.as_deref().unwrap_or("(none)")
        )
    }
}

// ── Broker (AMQP) ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat_secs: u16,
    pub blocked_timeout_secs: u64,
    pub publish_confirms: bool,
}

impl BrokerConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: v.opt("RABBIT_HOST"),
            port: v.parse_or("RABBIT_PORT", 5672)?,
            username: v.or("RABBIT_USER", "guest"),
            password: v.or("RABBIT_PASS", "guest"),
            vhost: v.or("RABBIT_VHOST", "/"),
            heartbeat_secs: v.parse_or("RABBIT_HEARTBEAT_SECS", 600)?,
            blocked_timeout_secs: v.parse_or("RABBIT_BLOCKED_TIMEOUT_SECS", 300)?,
            publish_confirms: v.flag("RABBIT_PUBLISH_CONFIRMS")?,
        })
    }

    fn missing_keys(&self) -> Vec<String> {
        if self.host.is_none() {
            vec!["RABBIT_HOST".to_string()]
        } else {
            Vec::new()
        }
    }

    pub fn blocked_timeout(&self) -> Duration {
        Duration::from_secs(self.blocked_timeout_secs)
    }

    /// AMQP URI with credentials, vhost and heartbeat encoded.
    pub fn amqp_uri(&self) -> Result<String, ConfigError> {
        let host = self
            .host
            .as_deref()
            .ok_or_else(|| ConfigError::Missing(vec!["RABBIT_HOST".to_string()]))?;
        let mut url = Url::parse(&format!("amqp://{}:{}", host, self.port))
            .map_err(|e| ConfigError::Invalid {
                key: "RABBIT_HOST".to_string(),
                reason: e.to_string(),
            })?;
        let invalid = |key: &str| ConfigError::Invalid {
            key: key.to_string(),
            reason: "cannot be used in an AMQP URI".to_string(),
        };
        url.set_username(&self.username)
            .map_err(|_| invalid("RABBIT_USER"))?;
        url.set_password(Some(&self.password))
            .map_err(|_| invalid("RABBIT_PASS"))?;
        let vhost: String = url::form_urlencoded::byte_serialize(self.vhost.as_bytes()).collect();
        url.set_path(&format!("/{vhost}"));
        url.query_pairs_mut()
            .append_pair("heartbeat", &self.heartbeat_secs.to_string());
        Ok(url.to_string())
    }
}

// ── Consumer ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub queue_name: Option<String>,
    pub procedure_name: Option<String>,
    /// Unset keeps failed deliveries unacknowledged.
    pub max_attempts: Option<u32>,
    pub reconnect_backoff_secs: u64,
}

impl ConsumerConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        let max_attempts = v.parse::<u32>("CONSUMER_MAX_ATTEMPTS")?;
        if max_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                key: "CONSUMER_MAX_ATTEMPTS".to_string(),
                reason: "must be at least 1 (unset it to leave failures unacknowledged)"
                    .to_string(),
            });
        }
        Ok(Self {
            queue_name: v.opt("QUEUE_NAME"),
            procedure_name: v.opt("PROCEDURE_NAME"),
            max_attempts,
            reconnect_backoff_secs: v.parse_or("RECONNECT_BACKOFF_SECS", 10)?,
        })
    }
}

// ── Jobs table ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub table: String,
}

impl JobsConfig {
    fn from_vars(v: &Vars<'_>) -> Self {
        Self {
            table: v.or("JOBS_TABLE", "etl_jobs"),
        }
    }
}

// ── Validated settings ────────────────────────────────────────

/// What the consumer does with a delivery whose procedure call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Leave the delivery unacknowledged; the broker redelivers it once the
    /// channel closes.
    LeaveUnacked,
    /// Requeue until the message has failed `max_attempts` times, then move it
    /// to `<queue>.dead-letter` and acknowledge the original.
    DeadLetter { max_attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub config_store: PostgresConfig,
    pub source: PostgresConfig,
    pub broker: BrokerConfig,
    pub jobs_table: String,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub target: PostgresConfig,
    pub broker: BrokerConfig,
    pub queue_name: String,
    pub procedure_name: String,
    pub failure_policy: FailurePolicy,
    pub reconnect_backoff: Duration,
}

/// Plain or schema-qualified SQL identifier (`name` or `schema.name`).
pub fn is_sql_identifier(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        })
}

fn check_identifier(key: &str, value: &str) -> Result<(), ConfigError> {
    if is_sql_identifier(value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}
