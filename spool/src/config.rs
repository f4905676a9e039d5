//! Configuration for spool.
//!
//! SPOOL_ROOT resolution order:
//! 1. Explicit path passed to Config::with_root()
//! 2. SPOOL_ROOT environment variable
//! 3. Default: ~/.local/share/spool

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A call site whose profiling is switched on by configuration rather than
/// by an annotation in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicProfile {
    /// Key the application passes to `profiling::dynamic::call_site`.
    #[serde(default)]
    pub function: Option<String>,

    /// Profile name; defaults to the function key.
    #[serde(default)]
    pub name: Option<String>,

    /// First line of the profiled block (block form only).
    #[serde(default)]
    pub start_line: Option<u32>,

    /// Last line of the profiled block (block form only).
    #[serde(default)]
    pub end_line: Option<u32>,
}

/// spool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for all spool data.
    pub spool_root: PathBuf,

    /// Probability (0-100) that a request is intercepted at all.
    #[serde(default = "default_intercept_percent")]
    pub intercept_percent: u8,

    /// Request paths that are never intercepted (exact match).
    #[serde(default)]
    pub ignore_paths: Vec<String>,

    /// Substrings; a rendered query containing any of them is not recorded.
    #[serde(default)]
    pub ignore_queries: Vec<String>,

    /// Request bodies larger than this many bytes are dropped. -1 disables.
    #[serde(default = "default_body_size")]
    pub max_request_body_size: i64,

    /// Response bodies larger than this many bytes are dropped. -1 disables.
    #[serde(default = "default_body_size")]
    pub max_response_body_size: i64,

    /// Body and header keys whose values are masked before storage.
    #[serde(default = "default_sensitive_keys")]
    pub sensitive_keys: Vec<String>,

    /// Mask the cookie header.
    #[serde(default = "default_true")]
    pub hide_cookies: bool,

    /// Record the profiler's own overhead on each request.
    #[serde(default)]
    pub meta: bool,

    /// Run the statistical sampler for each intercepted request.
    #[serde(default)]
    pub sampling_profiler: bool,

    /// Persist the raw sampler report as a blob next to the text summary.
    #[serde(default)]
    pub sampling_profiler_binary: bool,

    /// Sampler period in microseconds.
    #[serde(default = "default_sampling_interval_us")]
    pub sampling_interval_us: u64,

    /// Maximum number of lines kept in the sampler text summary.
    #[serde(default = "default_profile_summary_lines")]
    pub profile_summary_lines: usize,

    /// Where sampler blobs are written. Defaults to `<root>/profiles`.
    #[serde(default)]
    pub profiler_result_path: Option<PathBuf>,

    /// Attach `EXPLAIN` output to recorded queries.
    #[serde(default)]
    pub analyze_queries: bool,

    /// Keep at most this many requests.
    #[serde(default = "default_max_recorded_requests")]
    pub max_recorded_requests: usize,

    /// Probability (0-100) that garbage collection runs after a request save.
    #[serde(default = "default_check_percent")]
    pub max_recorded_requests_check_percent: u8,

    /// Runtime-configured profiled call sites.
    #[serde(default)]
    pub dynamic_profiling: Vec<DynamicProfile>,
}

fn default_intercept_percent() -> u8 {
    100
}

fn default_body_size() -> i64 {
    -1
}

fn default_sensitive_keys() -> Vec<String> {
    ["username", "api", "token", "key", "secret", "password", "signature"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_sampling_interval_us() -> u64 {
    1_000
}

fn default_profile_summary_lines() -> usize {
    100
}

fn default_max_recorded_requests() -> usize {
    10_000
}

fn default_check_percent() -> u8 {
    10
}

impl Config {
    /// Create a new config with the given SPOOL_ROOT.
    pub fn with_root(spool_root: impl Into<PathBuf>) -> Self {
        Self {
            spool_root: spool_root.into(),
            intercept_percent: default_intercept_percent(),
            ignore_paths: Vec::new(),
            ignore_queries: Vec::new(),
            max_request_body_size: default_body_size(),
            max_response_body_size: default_body_size(),
            sensitive_keys: default_sensitive_keys(),
            hide_cookies: true,
            meta: false,
            sampling_profiler: false,
            sampling_profiler_binary: false,
            sampling_interval_us: default_sampling_interval_us(),
            profile_summary_lines: default_profile_summary_lines(),
            profiler_result_path: None,
            analyze_queries: false,
            max_recorded_requests: default_max_recorded_requests(),
            max_recorded_requests_check_percent: default_check_percent(),
            dynamic_profiling: Vec::new(),
        }
    }

    /// Create a config using default SPOOL_ROOT resolution.
    pub fn default_location() -> Result<Self> {
        let spool_root = resolve_spool_root()?;
        Ok(Self::with_root(spool_root))
    }

    /// Load config from SPOOL_ROOT/config.toml, or create default.
    pub fn load() -> Result<Self> {
        let spool_root = resolve_spool_root()?;
        Self::load_from(&spool_root)
    }

    /// Load config from a specific SPOOL_ROOT.
    pub fn load_from(spool_root: &Path) -> Result<Self> {
        let config_path = spool_root.join("config.toml");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            let mut config: Config = toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
            // Ensure spool_root matches the actual location
            config.spool_root = spool_root.to_path_buf();
            Ok(config)
        } else {
            Ok(Self::with_root(spool_root))
        }
    }

    /// Save config to SPOOL_ROOT/config.toml.
    pub fn save(&self) -> Result<()> {
        let config_path = self.spool_root.join("config.toml");
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(config_path, contents)?;
        Ok(())
    }

    /// Reject configurations that cannot be applied.
    pub fn validate(&self) -> Result<()> {
        if self.intercept_percent > 100 {
            return Err(Error::Config(format!(
                "intercept_percent must be within 0-100, got {}",
                self.intercept_percent
            )));
        }
        if self.max_recorded_requests_check_percent > 100 {
            return Err(Error::Config(format!(
                "max_recorded_requests_check_percent must be within 0-100, got {}",
                self.max_recorded_requests_check_percent
            )));
        }
        crate::profiling::dynamic::DynamicProfiler::new(&self.dynamic_profiling)?;
        Ok(())
    }

    // Path helpers

    /// Path to the DuckDB database file.
    pub fn db_path(&self) -> PathBuf {
        self.spool_root.join("db/spool.duckdb")
    }

    /// Directory that receives sampler blobs.
    pub fn profiles_dir(&self) -> PathBuf {
        self.profiler_result_path
            .clone()
            .unwrap_or_else(|| self.spool_root.join("profiles"))
    }
}

/// Resolve SPOOL_ROOT using the standard resolution order.
fn resolve_spool_root() -> Result<PathBuf> {
    // 1. Environment variable
    if let Ok(path) = std::env::var("SPOOL_ROOT") {
        return Ok(PathBuf::from(path));
    }

    // 2. XDG data directory (via directories crate)
    if let Some(proj_dirs) = ProjectDirs::from("", "", "spool") {
        return Ok(proj_dirs.data_dir().to_path_buf());
    }

    // 3. Fallback to ~/.local/share/spool
    let home = std::env::var("HOME")
        .map_err(|_| Error::Config("Could not determine home directory".to_string()))?;
    Ok(PathBuf::from(home).join(".local/share/spool"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_with_root() {
        let config = Config::with_root("/tmp/test-spool");
        assert_eq!(config.spool_root, PathBuf::from("/tmp/test-spool"));
        assert_eq!(config.intercept_percent, 100);
        assert_eq!(config.max_request_body_size, -1);
        assert!(config.sensitive_keys.contains(&"password".to_string()));
        assert!(config.hide_cookies);
        assert!(!config.meta);
    }

    #[test]
    fn test_config_paths() {
        let mut config = Config::with_root("/tmp/test-spool");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/test-spool/db/spool.duckdb"));
        assert_eq!(config.profiles_dir(), PathBuf::from("/tmp/test-spool/profiles"));

        config.profiler_result_path = Some(PathBuf::from("/var/profiles"));
        assert_eq!(config.profiles_dir(), PathBuf::from("/var/profiles"));
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let spool_root = tmp.path().to_path_buf();
        std::fs::create_dir_all(&spool_root).unwrap();

        let mut config = Config::with_root(&spool_root);
        config.meta = true;
        config.ignore_paths = vec!["/health".to_string()];
        config.dynamic_profiling = vec![DynamicProfile {
            function: Some("orders::checkout".to_string()),
            name: None,
            start_line: Some(10),
            end_line: Some(20),
        }];
        config.save().unwrap();

        let loaded = Config::load_from(&spool_root).unwrap();
        assert!(loaded.meta);
        assert_eq!(loaded.ignore_paths, vec!["/health".to_string()]);
        assert_eq!(loaded.dynamic_profiling, config.dynamic_profiling);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "spool_root = \"/elsewhere\"\nintercept_percent = 25\n",
        )
        .unwrap();

        let loaded = Config::load_from(tmp.path()).unwrap();
        assert_eq!(loaded.spool_root, tmp.path());
        assert_eq!(loaded.intercept_percent, 25);
        assert_eq!(loaded.max_recorded_requests, 10_000);
        assert_eq!(loaded.max_recorded_requests_check_percent, 10);
    }

    #[test]
    fn test_validate_rejects_bad_dynamic_mapping() {
        let mut config = Config::with_root("/tmp/test-spool");
        config.dynamic_profiling = vec![DynamicProfile {
            function: None,
            name: Some("orphan".to_string()),
            start_line: None,
            end_line: None,
        }];
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.dynamic_profiling[0].function = Some("orders::checkout".to_string());
        config.dynamic_profiling[0].start_line = Some(3);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.dynamic_profiling[0].end_line = Some(9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_percentages() {
        let mut config = Config::with_root("/tmp/test-spool");
        config.intercept_percent = 101;
        assert!(config.validate().is_err());
    }
}
