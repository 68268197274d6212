//! # Configuration
//!
//! A small string key/value store, mirroring `app.set()` / `app.get()`,
//! plus a typed [`DeferSettings`] view for the keys this workspace reads.
//!
//! ```rust
//! use defer_core::DeferConfig;
//!
//! let mut config = DeferConfig::new();
//! config.set("tasks.project", "my-project");
//! config.set("tasks.queue", "default");
//!
//! assert_eq!(config.get("tasks.queue"), Some("default"));
//! ```
//!
//! ## Environment overrides
//! [`load_env_config`] maps `PREFIX__A__B=value` to `a.b = value`:
//!
//! ```bash
//! export DEFER__TASKS__PROJECT=my-project
//! export DEFER__LOCAL=true
//! ```
//!
//! Recognised keys:
//!
//! | key | meaning |
//! |---|---|
//! | `local` | local/offline mode (no callback verification) |
//! | `base_url` | public base URL the queue calls back to |
//! | `tasks.project`, `tasks.location`, `tasks.queue` | queue identity |
//! | `scheduler.location` | scheduler location (defaults to `tasks.location`) |
//! | `tasks.endpoint`, `scheduler.endpoint` | API endpoint overrides (emulators) |
//! | `tasks.deadline_secs` | default dispatch deadline |
//! | `tasks.max_retries` | default retry ceiling for handlers |
//! | `tasks.create_timeout_secs` | submit timeout |
//! | `auth.service_account` | identity used for OIDC tokens on callbacks |

use std::collections::HashMap;
use std::time::Duration;

use crate::errors::TaskError;
use crate::paths::{LocationPath, QueueIdentity};

#[derive(Debug, Default, Clone)]
pub struct DeferConfig {
    values: HashMap<String, String>,
}

impl DeferConfig {
    /// Create an empty config store.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Set a configuration key to a string value.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Get a configuration value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn snapshot(&self) -> DeferConfigSnapshot {
        DeferConfigSnapshot::new(self.values.clone())
    }
}

/// Copy every `PREFIX__A__B` environment variable into `config` as `a.b`.
pub fn load_env_config(config: &mut DeferConfig, prefix: &str) {
    load_config_from(config, prefix, std::env::vars());
}

fn load_config_from<I>(config: &mut DeferConfig, prefix: &str, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    let prefix = format!("{}__", prefix.trim_end_matches('_'));
    for (key, value) in vars {
        if let Some(stripped) = key.strip_prefix(&prefix) {
            let normalized = stripped.to_lowercase().replace("__", ".");
            config.set(normalized, value);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeferConfigSnapshot {
    map: HashMap<String, String>,
}

impl DeferConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
    }

    /// Comma-separated list; empty entries are dropped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn require(&self, key: &str) -> anyhow::Result<String> {
        self.get_string(key).ok_or_else(|| {
            TaskError::validation(format!("missing configuration value '{key}'")).into_anyhow()
        })
    }
}

const DEFAULT_LOCATION: &str = "us-central1";

/// Typed settings shared by the route builders and clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferSettings {
    pub is_local: bool,
    pub base_url: String,
    pub project: String,
    pub location: String,
    pub queue: String,
    pub scheduler_location: String,
    pub tasks_endpoint: Option<String>,
    pub scheduler_endpoint: Option<String>,
    pub default_deadline: Option<Duration>,
    pub max_retries: Option<u32>,
    pub task_create_timeout: Duration,
    pub service_account: Option<String>,
}

impl DeferSettings {
    pub fn from_snapshot(snapshot: &DeferConfigSnapshot) -> anyhow::Result<Self> {
        let location = snapshot
            .get_string("tasks.location")
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string());
        let max_retries = match snapshot.get("tasks.max_retries") {
            Some(raw) => Some(raw.trim().parse::<u32>().map_err(|_| {
                TaskError::validation(format!("tasks.max_retries '{raw}' is not a number"))
                    .into_anyhow()
            })?),
            None => None,
        };

        let settings = Self {
            is_local: snapshot.get_bool("local").unwrap_or(false),
            base_url: snapshot.require("base_url")?,
            project: snapshot.require("tasks.project")?,
            queue: snapshot.require("tasks.queue")?,
            scheduler_location: snapshot
                .get_string("scheduler.location")
                .unwrap_or_else(|| location.clone()),
            location,
            tasks_endpoint: snapshot.get_string("tasks.endpoint"),
            scheduler_endpoint: snapshot.get_string("scheduler.endpoint"),
            default_deadline: snapshot
                .get_u64("tasks.deadline_secs")
                .map(Duration::from_secs),
            max_retries,
            task_create_timeout: snapshot
                .get_u64("tasks.create_timeout_secs")
                .map(Duration::from_secs)
                .unwrap_or(crate::delayer::DEFAULT_CREATE_TIMEOUT),
            service_account: snapshot.get_string("auth.service_account"),
        };

        // Fail on a bad identity at startup rather than on first submit.
        settings.queue_identity()?;
        settings.scheduler_location_path()?;
        Ok(settings)
    }

    pub fn from_env(prefix: &str) -> anyhow::Result<Self> {
        let mut config = DeferConfig::new();
        load_env_config(&mut config, prefix);
        Self::from_snapshot(&config.snapshot())
    }

    pub fn queue_identity(&self) -> anyhow::Result<QueueIdentity> {
        QueueIdentity::new(self.project.clone(), self.location.clone(), self.queue.clone())
    }

    pub fn scheduler_location_path(&self) -> anyhow::Result<LocationPath> {
        LocationPath::new(self.project.clone(), self.scheduler_location.clone())
    }
}
