use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub plans: PlansConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else {
            let default_path = PathBuf::from("claude-usage.toml");
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| "failed to parse configuration TOML")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(addr) = env::var("CLAUDE_USAGE_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(db_path) = env::var("CLAUDE_USAGE_DB_PATH") {
            self.storage.database_path = PathBuf::from(db_path);
        }
        if let Ok(dirs) = env::var("CLAUDE_USAGE_PROJECTS_DIR") {
            self.sessions.root_dirs = env::split_paths(&dirs).collect();
        }
        if let Ok(value) = env::var("CLAUDE_USAGE_REFRESH_MS") {
            self.display.refresh_interval_ms = value
                .parse()
                .with_context(|| format!("invalid CLAUDE_USAGE_REFRESH_MS: {value}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_root_dirs")]
    pub root_dirs: Vec<PathBuf>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            root_dirs: default_root_dirs(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    #[serde(default = "default_recent_sessions")]
    pub recent_sessions: usize,
    #[serde(default = "default_redraw_hz")]
    pub redraw_hz: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
            recent_sessions: default_recent_sessions(),
            redraw_hz: default_redraw_hz(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlansConfig {
    #[serde(default = "default_plan")]
    pub default_plan: String,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            default_plan: default_plan(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// Checked in order; the first rule with a matching substring wins.
    #[serde(default = "default_model_pricing")]
    pub models: Vec<ModelPricing>,
    #[serde(default = "default_fallback_pricing")]
    pub fallback: TokenRates,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            models: default_model_pricing(),
            fallback: default_fallback_pricing(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelPricing {
    #[serde(rename = "match")]
    pub patterns: Vec<String>,
    #[serde(flatten)]
    pub rates: TokenRates,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TokenRates {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
    pub cache_creation_per_1m: f64,
    pub cache_read_per_1m: f64,
}

impl TokenRates {
    const fn new(input: f64, output: f64, cache_creation: f64, cache_read: f64) -> Self {
        Self {
            input_per_1m: input,
            output_per_1m: output,
            cache_creation_per_1m: cache_creation,
            cache_read_per_1m: cache_read,
        }
    }
}

fn default_root_dirs() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    vec![
        home.join(".claude").join("projects"),
        home.join(".config").join("claude").join("projects"),
    ]
}

fn default_poll_interval() -> u64 {
    2
}

fn default_database_path() -> PathBuf {
    PathBuf::from("claude-usage.db")
}

fn default_refresh_interval_ms() -> u64 {
    30_000
}

fn default_recent_sessions() -> usize {
    5
}

fn default_redraw_hz() -> u64 {
    4
}

fn default_listen_addr() -> String {
    "127.0.0.1:8788".to_string()
}

fn default_plan() -> String {
    "pro".to_string()
}

fn default_fallback_pricing() -> TokenRates {
    TokenRates::new(3.0, 15.0, 3.75, 0.30)
}

fn default_model_pricing() -> Vec<ModelPricing> {
    let rule = |patterns: &[&str], rates: TokenRates| ModelPricing {
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
        rates,
    };

    vec![
        rule(&["opus-4-5", "opus-4.5"], TokenRates::new(5.0, 25.0, 6.25, 0.50)),
        rule(
            &["sonnet-4-5", "sonnet-4.5", "3-5-sonnet", "3.5-sonnet"],
            TokenRates::new(3.0, 15.0, 3.75, 0.30),
        ),
        rule(&["sonnet-4-", "sonnet-4."], TokenRates::new(3.0, 15.0, 3.75, 0.30)),
        rule(
            &["haiku-4-5", "haiku-4.5", "3-5-haiku", "3.5-haiku"],
            TokenRates::new(1.0, 5.0, 1.25, 0.10),
        ),
        rule(&["haiku"], TokenRates::new(0.25, 1.25, 0.30, 0.03)),
        rule(&["opus"], TokenRates::new(15.0, 75.0, 18.75, 1.50)),
        rule(&["sonnet"], TokenRates::new(3.0, 15.0, 3.75, 0.30)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        env, fs,
        path::PathBuf,
        sync::{Mutex, OnceLock},
    };
    use tempfile::NamedTempFile;

    #[test]
    fn load_from_file_applies_overrides() {
        let _lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _listen_guard = EnvGuard::unset("CLAUDE_USAGE_LISTEN_ADDR");
        let _db_guard = EnvGuard::unset("CLAUDE_USAGE_DB_PATH");
        let _dirs_guard = EnvGuard::unset("CLAUDE_USAGE_PROJECTS_DIR");
        let _refresh_guard = EnvGuard::unset("CLAUDE_USAGE_REFRESH_MS");

        let file = NamedTempFile::new().unwrap();
        let toml = r#"
            [sessions]
            root_dirs = ["/data/claude/projects"]

            [storage]
            database_path = "custom.db"

            [display]
            recent_sessions = 8

            [plans]
            default_plan = "max5"

            [[pricing.models]]
            match = ["test-model"]
            input_per_1m = 1.0
            output_per_1m = 3.0
            cache_creation_per_1m = 1.5
            cache_read_per_1m = 0.1
        "#;
        fs::write(file.path(), toml).unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(
            config.sessions.root_dirs,
            vec![PathBuf::from("/data/claude/projects")]
        );
        assert_eq!(config.storage.database_path, PathBuf::from("custom.db"));
        assert_eq!(config.display.recent_sessions, 8);
        assert_eq!(config.display.refresh_interval_ms, 30_000);
        assert_eq!(config.plans.default_plan, "max5");
        assert_eq!(config.pricing.models.len(), 1);
        assert_eq!(config.pricing.models[0].patterns, vec!["test-model"]);
        assert!((config.pricing.models[0].rates.output_per_1m - 3.0).abs() < f64::EPSILON);
        assert!((config.pricing.fallback.input_per_1m - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let _lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _listen_guard = EnvGuard::set("CLAUDE_USAGE_LISTEN_ADDR", "127.0.0.1:7000");
        let _db_guard = EnvGuard::set("CLAUDE_USAGE_DB_PATH", "/tmp/claude-usage-test.db");
        let _dirs_guard = EnvGuard::set("CLAUDE_USAGE_PROJECTS_DIR", "/tmp/projects");
        let _refresh_guard = EnvGuard::set("CLAUDE_USAGE_REFRESH_MS", "5000");

        let file = NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            r#"
            [server]
            listen_addr = "0.0.0.0:1"
            "#,
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:7000");
        assert_eq!(
            config.storage.database_path,
            PathBuf::from("/tmp/claude-usage-test.db")
        );
        assert_eq!(config.sessions.root_dirs, vec![PathBuf::from("/tmp/projects")]);
        assert_eq!(config.display.refresh_interval_ms, 5000);
    }

    #[test]
    fn invalid_refresh_override_is_rejected() {
        let _lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _refresh_guard = EnvGuard::set("CLAUDE_USAGE_REFRESH_MS", "soon");

        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "").unwrap();

        assert!(AppConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn defaults_cover_known_model_families() {
        let config = AppConfig::default();
        assert_eq!(config.display.refresh_interval_ms, 30_000);
        assert_eq!(config.plans.default_plan, "pro");
        assert!(!config.server.enabled);
        assert_eq!(config.pricing.models.len(), 7);
    }

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = env::var(key).ok();
            unsafe { env::set_var(key, value) };
            Self { key, previous }
        }

        fn unset(key: &'static str) -> Self {
            let previous = env::var(key).ok();
            if previous.is_some() {
                unsafe { env::remove_var(key) };
            }
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(ref value) = self.previous {
                unsafe { env::set_var(self.key, value) };
            } else {
                unsafe { env::remove_var(self.key) };
            }
        }
    }

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
}
