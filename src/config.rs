//! Configuration types.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;

/// Per-category overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryConfig {
    /// Agent that handles tasks of this category. Falls back to the default agent.
    pub agent: Option<String>,
    /// Concurrency slots for this category. Falls back to the default limit.
    pub concurrency: Option<usize>,
}

/// Task supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval of the shared polling loop.
    pub poll_interval: Duration,
    /// Minimum runtime before an idle event is trusted.
    pub min_idle_time: Duration,
    /// Minimum runtime before message-count stability is tracked.
    pub min_stability_time: Duration,
    /// Consecutive unchanged polls required by the stability signal.
    pub stable_polls_required: u32,
    /// A task with no activity for this long is considered stale.
    pub stale_timeout: Duration,
    /// Stale detection never fires before this much runtime.
    pub min_runtime_before_stale: Duration,
    /// How long finished tasks stay queryable.
    pub task_retention: Duration,
    /// Slots per category when the category has no explicit limit.
    pub default_concurrency: usize,
    /// Agent used for categories without an explicit agent.
    pub default_agent: String,
    /// Category table.
    pub categories: HashMap<String, CategoryConfig>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            min_idle_time: Duration::from_secs(5),
            min_stability_time: Duration::from_secs(10),
            stable_polls_required: 3,
            stale_timeout: Duration::from_secs(180), // 3 minutes
            min_runtime_before_stale: Duration::from_secs(30),
            task_retention: Duration::from_secs(300), // 5 minutes
            default_concurrency: 5,
            default_agent: "general".to_string(),
            categories: HashMap::new(),
        }
    }
}

impl SupervisorConfig {
    /// Build a config from `MAGNUS_*` environment variables.
    ///
    /// Absent variables keep their defaults; malformed ones are an error.
    /// Category tables are comma-separated `name=value` lists:
    ///
    /// ```text
    /// MAGNUS_CATEGORY_AGENTS=review=reviewer,build=builder
    /// MAGNUS_CATEGORY_LIMITS=review=2
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads from an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let millis = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(key) {
                Some(raw) => parse_number::<u64>(key, &raw).map(Duration::from_millis),
                None => Ok(default),
            }
        };

        config.poll_interval = millis("MAGNUS_POLL_INTERVAL_MS", config.poll_interval)?;
        config.min_idle_time = millis("MAGNUS_MIN_IDLE_TIME_MS", config.min_idle_time)?;
        config.min_stability_time =
            millis("MAGNUS_MIN_STABILITY_TIME_MS", config.min_stability_time)?;
        config.stale_timeout = millis("MAGNUS_STALE_TIMEOUT_MS", config.stale_timeout)?;
        config.min_runtime_before_stale = millis(
            "MAGNUS_MIN_RUNTIME_BEFORE_STALE_MS",
            config.min_runtime_before_stale,
        )?;
        config.task_retention = millis("MAGNUS_TASK_RETENTION_MS", config.task_retention)?;

        if let Some(raw) = lookup("MAGNUS_STABLE_POLLS") {
            config.stable_polls_required = parse_number("MAGNUS_STABLE_POLLS", &raw)?;
        }
        if let Some(raw) = lookup("MAGNUS_DEFAULT_CONCURRENCY") {
            config.default_concurrency = parse_number("MAGNUS_DEFAULT_CONCURRENCY", &raw)?;
        }
        if let Some(agent) = lookup("MAGNUS_DEFAULT_AGENT") {
            let agent = agent.trim();
            if !agent.is_empty() {
                config.default_agent = agent.to_string();
            }
        }

        if let Some(raw) = lookup("MAGNUS_CATEGORY_AGENTS") {
            for (category, agent) in parse_pairs("MAGNUS_CATEGORY_AGENTS", &raw)? {
                config.categories.entry(category).or_default().agent = Some(agent);
            }
        }
        if let Some(raw) = lookup("MAGNUS_CATEGORY_LIMITS") {
            for (category, limit) in parse_pairs("MAGNUS_CATEGORY_LIMITS", &raw)? {
                let limit = parse_number("MAGNUS_CATEGORY_LIMITS", &limit)?;
                config.categories.entry(category).or_default().concurrency = Some(limit);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Add or replace a category entry.
    pub fn with_category(mut self, name: impl Into<String>, category: CategoryConfig) -> Self {
        self.categories.insert(name.into(), category);
        self
    }

    /// Reject values the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "must be greater than zero"));
        }
        if self.stable_polls_required == 0 {
            return Err(invalid("stable_polls_required", "must be at least 1"));
        }
        if self.default_concurrency == 0 {
            return Err(invalid("default_concurrency", "must be at least 1"));
        }
        for (name, category) in &self.categories {
            if category.concurrency == Some(0) {
                return Err(invalid(
                    &format!("categories.{name}.concurrency"),
                    "must be at least 1",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(key, &format!("expected a non-negative integer, got '{raw}'")))
}

fn parse_pairs(key: &str, raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                ConfigError::ParseError(format!("{key}: expected name=value, got '{pair}'"))
            })?;
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() || value.is_empty() {
                return Err(ConfigError::ParseError(format!(
                    "{key}: empty name or value in '{pair}'"
                )));
            }
            Ok((name.to_string(), value.to_string()))
        })
        .collect()
}
