//! Configuration for tzdispatch, loaded from `~/.tzdispatch/config.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::types::Provider;
use crate::window::{parse_zone, SendWindow};

/// How the claimer protects rows from concurrent claimers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockingMode {
    /// Non-blocking row locks; concurrent claims never share a message.
    #[default]
    SkipLocked,
    /// Plain read-then-update. Two concurrent claims may return the same
    /// message. Only for stores without non-blocking row locks.
    Unlocked,
}

impl LockingMode {
    pub fn at_most_once(&self) -> bool {
        matches!(self, LockingMode::SkipLocked)
    }
}

impl std::fmt::Display for LockingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockingMode::SkipLocked => write!(f, "skip_locked"),
            LockingMode::Unlocked => write!(f, "unlocked"),
        }
    }
}

/// Closed range of accepted batch sizes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitRange {
    pub min: usize,
    pub max: usize,
}

impl Default for LimitRange {
    fn default() -> Self {
        Self { min: 1, max: 100 }
    }
}

impl LimitRange {
    pub fn contains(&self, limit: usize) -> bool {
        (self.min..=self.max).contains(&limit)
    }
}

/// Backing store selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// "sqlite", "postgres", or "memory".
    pub backend: String,
    pub sqlite_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".into(),
            sqlite_path: "~/.tzdispatch/queue.db".into(),
            postgres_url: None,
            max_connections: 5,
        }
    }
}

impl StoreConfig {
    /// Whether the selected backend can skip rows locked by another claim.
    /// SQLite cannot; unknown backends are rejected by `create_store`.
    pub fn has_row_locks(&self) -> bool {
        self.backend != "sqlite"
    }

    /// SQLite path with `~` expanded.
    pub fn sqlite_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.sqlite_path).to_string())
    }
}

pub const DEFAULT_ZONES: &[&str] = &[
    "America/New_York",
    "America/Chicago",
    "America/Denver",
    "America/Phoenix",
    "America/Los_Angeles",
    "America/Anchorage",
    "Pacific/Honolulu",
    "America/Toronto",
    "America/Halifax",
    "America/St_Johns",
];

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// IANA zones the send window is evaluated for.
    pub zones: Vec<String>,
    /// Providers this deployment accepts.
    pub providers: Vec<Provider>,
    /// A file that omits this gets `skip_locked`, not the in-code default.
    #[serde(default)]
    pub locking: LockingMode,
    pub window: SendWindow,
    pub limits: LimitRange,
    pub store: StoreConfig,
}

impl Default for DispatchConfig {
    /// Defaults target the SQLite backend, which has no row locks, so
    /// locking starts out `unlocked`.
    fn default() -> Self {
        Self {
            zones: DEFAULT_ZONES.iter().map(|z| z.to_string()).collect(),
            providers: Provider::ALL.to_vec(),
            locking: LockingMode::Unlocked,
            window: SendWindow::default(),
            limits: LimitRange::default(),
            store: StoreConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// `~/.tzdispatch`
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tzdispatch")
    }

    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Load from the default path, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DispatchError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| DispatchError::config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DispatchError::config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that would otherwise be silently ignored at claim time.
    pub fn validate(&self) -> Result<()> {
        for zone in &self.zones {
            parse_zone(zone).map_err(|_| {
                DispatchError::config(format!("Unknown IANA time zone in config: {zone}"))
            })?;
        }
        self.window.validate()?;
        if self.limits.min == 0 || self.limits.min > self.limits.max {
            return Err(DispatchError::config(format!(
                "Invalid limit range {}..={}",
                self.limits.min, self.limits.max
            )));
        }
        if self.providers.is_empty() {
            return Err(DispatchError::config("At least one provider must be enabled"));
        }
        if self.locking == LockingMode::SkipLocked && !self.store.has_row_locks() {
            return Err(DispatchError::config(format!(
                "Backend '{}' has no non-blocking row locks; set locking = \"unlocked\" to run without the at-most-once guarantee",
                self.store.backend
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DispatchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.zones.len(), 10);
        assert_eq!(config.limits, LimitRange { min: 1, max: 100 });
        assert_eq!(config.locking, LockingMode::Unlocked);
        assert!(!config.store.has_row_locks());
    }

    #[test]
    fn test_sqlite_rejects_skip_locked() {
        let config = DispatchConfig {
            locking: LockingMode::SkipLocked,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
        assert!(err.to_string().contains("unlocked"));

        let postgres = DispatchConfig {
            locking: LockingMode::SkipLocked,
            store: StoreConfig {
                backend: "postgres".into(),
                postgres_url: Some("postgres://localhost/tzdispatch".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        postgres.validate().unwrap();
    }

    #[test]
    fn test_omitted_locking_is_skip_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, "[store]\nbackend = \"postgres\"\npostgres_url = \"postgres://db/q\"\n").unwrap();
        let loaded = DispatchConfig::load_from(&path).unwrap();
        assert_eq!(loaded.locking, LockingMode::SkipLocked);

        // SQLite without an explicit unlocked mode is caught at load time.
        std::fs::write(&path, "zones = [\"America/Chicago\"]\n").unwrap();
        let err = DispatchConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    fn test_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        DispatchConfig::default().save_to(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("locking = \"unlocked\""));
        assert_eq!(DispatchConfig::load_from(&path).unwrap(), DispatchConfig::default());
    }

    #[test]
    fn test_rejects_colloquial_zone() {
        let config = DispatchConfig {
            zones: vec!["America/Chicago".into(), "Canada/Quebec".into()],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Canada/Quebec"));
    }

    #[test]
    fn test_rejects_bad_limits() {
        let config = DispatchConfig {
            limits: LimitRange { min: 0, max: 10 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = DispatchConfig::default();
        config.window = SendWindow::new(8, 21).inclusive(true);
        config.locking = LockingMode::Unlocked;
        config.providers = vec![Provider::Sinch];
        config.save_to(&path).unwrap();

        let loaded = DispatchConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "locking = \"unlocked\"\n\n[window]\nstart_hour = 10\nend_hour = 20\n").unwrap();

        let loaded = DispatchConfig::load_from(&path).unwrap();
        assert_eq!(loaded.locking, LockingMode::Unlocked);
        assert_eq!(loaded.window, SendWindow::new(10, 20));
        assert_eq!(loaded.providers, Provider::ALL.to_vec());
    }

    #[test]
    fn test_missing_file() {
        let err = DispatchConfig::load_from(Path::new("/nonexistent/tzdispatch.toml")).unwrap_err();
        assert!(matches!(err, DispatchError::ConfigNotFound(_)));
    }

    #[test]
    fn test_locking_mode() {
        assert!(LockingMode::SkipLocked.at_most_once());
        assert!(!LockingMode::Unlocked.at_most_once());
        assert_eq!(LockingMode::Unlocked.to_string(), "unlocked");
    }
}
