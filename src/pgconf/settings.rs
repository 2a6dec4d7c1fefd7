//! Settings assembly for postgresql.conf
//!
//! Built-in defaults, version specific values, memory tuning and the
//! operator's `extra_pg_conf` overrides are merged into one ordered map.

use serde::{Deserialize, Serialize};

use super::scanner::{parse_config, ParseMode};
use crate::error::Result;
use crate::tuning::MemoryTuning;

/// Default value of the `extra_pg_conf` option. The built-in defaults are
/// parsed from this same text so the two never drift apart.
pub const DEFAULT_EXTRA_PG_CONF: &str = "\
# Additional service configuration parameters, in postgresql.conf syntax.
# Values set here override the defaults managed by wolfpg.
listen_addresses = '*'
max_connections = 100
wal_level = replica
max_wal_senders = 10
max_replication_slots = 10
hot_standby = on
log_timezone = UTC
log_line_prefix = '%t [%p]: [%l-1] db=%d,user=%u '
";

/// Keys that can never be injected through `extra_pg_conf`:
/// `ssl` is driven by the TLS inputs, the synchronous replication keys
/// belong to the replication setup.
pub const DO_NOT_TOUCH_KEYS: &[&str] = &["ssl", "synchronous_commit", "synchronous_standby_names"];

/// Ordered `key -> value` mapping.
///
/// Re-inserting an existing key replaces its value but keeps its position,
/// so later layers override earlier ones without reshuffling the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    entries: Vec<(String, String)>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Merge another mapping on top of this one
    pub fn extend(&mut self, other: Settings) {
        for (k, v) in other.entries {
            self.insert(k, v);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut settings = Settings::new();
        for (k, v) in iter {
            settings.insert(k, v);
        }
        settings
    }
}

/// Built-in defaults for a given major version
pub fn defaults(major_version: u32) -> Result<Settings> {
    let mut defaults = parse_config(DEFAULT_EXTRA_PG_CONF, ParseMode::Fatal)?;

    // Before 10 the setting is a boolean. 10 introduced scram-sha-256 but
    // keeps md5 for the libpq clients of the time.
    let password_encryption = match major_version {
        0..=9 => "on",
        10 => "md5",
        _ => "scram-sha-256",
    };
    defaults.insert("password_encryption", password_encryption);

    if major_version >= 13 {
        defaults.insert("wal_keep_size", "1024");
    } else {
        defaults.insert("wal_keep_segments", "64");
    }

    Ok(defaults)
}

/// Assemble the postgresql.conf settings: defaults, tuning, then the
/// operator overrides, minus the keys wolfpg manages itself.
pub fn assemble(
    extra_pg_conf: &str,
    major_version: u32,
    tuning: Option<&MemoryTuning>,
    mode: ParseMode,
) -> Result<Settings> {
    let mut conf = defaults(major_version)?;

    if let Some(tuning) = tuning {
        conf.insert("shared_buffers", format!("{} MB", tuning.shared_buffers_mb));
        conf.insert(
            "effective_cache_size",
            format!("{} MB", tuning.effective_cache_size_mb),
        );
    }

    conf.extend(parse_config(extra_pg_conf, mode)?);

    for key in DO_NOT_TOUCH_KEYS {
        if conf.remove(key).is_some() {
            tracing::debug!(
                "Operator requested to add key {} to postgresql.conf, which is not allowed. Ignoring it",
                key
            );
        }
    }

    Ok(conf)
}
