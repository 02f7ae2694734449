//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The store access token comes from SHOP_ACCESS_TOKEN or access_token_file
//! and the image edit keys from IMAGE_EDIT_API_KEYS or keys_file. Neither is
//! ever read from the TOML itself.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{Secret, split_secret_list};
use engine::{EngineSettings, TaskSettings};
use key_pool::ResetSchedule;
use rate_gate::{GateBank, GateSettings};
use serde::Deserialize;

const TOKEN_ENV: &str = "SHOP_ACCESS_TOKEN";
const KEYS_ENV: &str = "IMAGE_EDIT_API_KEYS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub gates: GatesConfig,
    pub store: StoreConfig,
    pub enhancer: EnhancerConfig,
    pub image_edit: ImageEditConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Job engine settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub parallelism: usize,
    /// JSON file holding jobs, source products, and generated items
    pub data_file: PathBuf,
    /// IANA timezone of the quota reset clock, e.g. `America/Los_Angeles`
    pub reset_timezone: String,
    /// Wall-clock time of the daily quota reset, `HH:MM`
    pub reset_time: String,
    pub safety_margin_secs: u64,
    pub max_image_attempts: u32,
    pub image_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 3,
            data_file: PathBuf::from("publish-worker.json"),
            reset_timezone: "America/Los_Angeles".into(),
            reset_time: "00:00".into(),
            safety_margin_secs: 60,
            max_image_attempts: 3,
            image_backoff_ms: 500,
        }
    }
}

/// Rate gate capacities and post-call delays
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    pub enhancement_capacity: usize,
    pub enhancement_delay_ms: u64,
    pub image_edit_capacity: usize,
    pub image_edit_delay_ms: u64,
    pub store_delay_ms: u64,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            enhancement_capacity: 2,
            enhancement_delay_ms: 500,
            image_edit_capacity: 2,
            image_edit_delay_ms: 1000,
            store_delay_ms: 600,
        }
    }
}

/// Destination store
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub shop_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(skip)]
    pub access_token: Option<Secret<String>>,
    /// Path to a file containing the access token (alternative to SHOP_ACCESS_TOKEN)
    #[serde(default)]
    pub access_token_file: Option<PathBuf>,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct EnhancerConfig {
    pub endpoint: String,
    #[serde(default = "default_enhancer_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct ImageEditConfig {
    pub endpoint: String,
    #[serde(skip)]
    pub keys: Vec<Secret<String>>,
    /// Comma or newline separated keys (alternative to IMAGE_EDIT_API_KEYS)
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    /// Where exhausted keys are remembered across restarts
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default = "default_image_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics here when set
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

fn default_api_version() -> String {
    "2024-07".into()
}

fn default_store_timeout() -> u64 {
    30
}

fn default_enhancer_timeout() -> u64 {
    60
}

fn default_image_timeout() -> u64 {
    120
}

fn require_http(name: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{name} must start with http:// or https://, got: {url}"
        )))
    }
}

fn require_nonzero(name: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!("{name} must be greater than 0")));
    }
    Ok(())
}

fn read_secret_file(name: &str, path: &Path) -> common::Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        common::Error::Config(format!("failed to read {name} {}: {e}", path.display()))
    })
}

impl Config {
    /// Load configuration from a TOML file, then overlay secrets from the
    /// environment or their files.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(token) = std::env::var(TOKEN_ENV) {
            config.store.access_token = Some(Secret::new(token));
        } else if let Some(ref file) = config.store.access_token_file {
            let token = read_secret_file("access_token_file", file)?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.store.access_token = Some(Secret::new(token));
            }
        }
        if config.store.access_token.is_none() {
            return Err(common::Error::MissingSecret(format!(
                "{TOKEN_ENV} or store.access_token_file"
            )));
        }

        if let Ok(raw) = std::env::var(KEYS_ENV) {
            config.image_edit.keys = split_secret_list(&raw);
        } else if let Some(ref file) = config.image_edit.keys_file {
            config.image_edit.keys = split_secret_list(&read_secret_file("keys_file", file)?);
        }
        if config.image_edit.keys.is_empty() {
            return Err(common::Error::MissingSecret(format!(
                "{KEYS_ENV} or image_edit.keys_file (at least one key)"
            )));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http("store.shop_url", &self.store.shop_url)?;
        require_http("enhancer.endpoint", &self.enhancer.endpoint)?;
        require_http("image_edit.endpoint", &self.image_edit.endpoint)?;

        require_nonzero("engine.parallelism", self.engine.parallelism as u64)?;
        require_nonzero("engine.max_image_attempts", u64::from(self.engine.max_image_attempts))?;
        require_nonzero("gates.enhancement_capacity", self.gates.enhancement_capacity as u64)?;
        require_nonzero("gates.image_edit_capacity", self.gates.image_edit_capacity as u64)?;
        require_nonzero("store.timeout_secs", self.store.timeout_secs)?;
        require_nonzero("enhancer.timeout_secs", self.enhancer.timeout_secs)?;
        require_nonzero("image_edit.timeout_secs", self.image_edit.timeout_secs)?;

        self.reset_schedule()?;
        Ok(())
    }

    /// Daily quota reset boundary.
    pub fn reset_schedule(&self) -> common::Result<ResetSchedule> {
        ResetSchedule::parse(&self.engine.reset_timezone, &self.engine.reset_time)
            .map_err(|e| common::Error::Config(e.to_string()))
    }

    pub fn gate_bank(&self) -> GateBank {
        let gates = &self.gates;
        GateBank::new(
            GateSettings::new(
                gates.enhancement_capacity,
                Duration::from_millis(gates.enhancement_delay_ms),
            ),
            GateSettings::new(
                gates.image_edit_capacity,
                Duration::from_millis(gates.image_edit_delay_ms),
            ),
            Duration::from_millis(gates.store_delay_ms),
        )
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            parallelism: self.engine.parallelism,
            safety_margin: Duration::from_secs(self.engine.safety_margin_secs),
        }
    }

    pub fn task_settings(&self) -> TaskSettings {
        TaskSettings {
            max_image_attempts: self.engine.max_image_attempts,
            image_backoff: Duration::from_millis(self.engine.image_backoff_ms),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("publish-worker.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch process environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_secret_env() {
        unsafe {
            remove_env(TOKEN_ENV);
            remove_env(KEYS_ENV);
        }
    }

    const BASE: &str = r#"
[store]
shop_url = "https://example.myshopify.com"

[enhancer]
endpoint = "https://enhance.internal/v1/enhance"

[image_edit]
endpoint = "https://images.internal/v1/edit"
"#;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn load_with_env(toml: &str) -> common::Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", toml);
        Config::load(&path)
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            set_env(TOKEN_ENV, "shpat_test");
            set_env(KEYS_ENV, "key-a, key-b,");
        }
        let config = load_with_env(BASE).unwrap();
        clear_secret_env();

        assert_eq!(config.engine.parallelism, 3);
        assert_eq!(config.engine.reset_timezone, "America/Los_Angeles");
        assert_eq!(config.store.api_version, "2024-07");
        assert_eq!(config.gates.image_edit_delay_ms, 1000);
        assert!(config.metrics.listen_addr.is_none());
        assert_eq!(config.store.access_token.as_ref().unwrap().expose(), "shpat_test");
        assert_eq!(config.image_edit.keys.len(), 2);
        assert_eq!(config.image_edit.keys[1].expose(), "key-b");
        assert_eq!(config.engine_settings().safety_margin, Duration::from_secs(60));
        assert_eq!(config.task_settings().max_image_attempts, 3);
    }

    #[test]
    fn secrets_load_from_files() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let token = write(&dir, "token", "shpat_file\n");
        let keys = write(&dir, "keys", "k1\nk2\n\nk3\n");
        let toml = format!(
            r#"
[store]
shop_url = "https://example.myshopify.com"
access_token_file = "{}"

[enhancer]
endpoint = "https://enhance.internal/v1/enhance"

[image_edit]
endpoint = "https://images.internal/v1/edit"
keys_file = "{}"
"#,
            token.display(),
            keys.display()
        );
        let path = write(&dir, "config.toml", &toml);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.access_token.as_ref().unwrap().expose(), "shpat_file");
        assert_eq!(config.image_edit.keys.len(), 3);
    }

    #[test]
    fn env_overrides_files() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
[store]
shop_url = "https://example.myshopify.com"
access_token_file = "/nonexistent/token"

[enhancer]
endpoint = "https://enhance.internal/v1/enhance"

[image_edit]
endpoint = "https://images.internal/v1/edit"
keys_file = "/nonexistent/keys"
"#;
        let path = write(&dir, "config.toml", toml);
        unsafe {
            set_env(TOKEN_ENV, "from-env");
            set_env(KEYS_ENV, "env-key");
        }
        let config = Config::load(&path).unwrap();
        clear_secret_env();

        assert_eq!(config.store.access_token.as_ref().unwrap().expose(), "from-env");
        assert_eq!(config.image_edit.keys[0].expose(), "env-key");
    }

    #[test]
    fn missing_token_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        unsafe { set_env(KEYS_ENV, "k1") };
        let err = load_with_env(BASE).unwrap_err();
        clear_secret_env();
        assert!(matches!(err, common::Error::MissingSecret(ref s) if s.contains(TOKEN_ENV)));
    }

    #[test]
    fn empty_key_list_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            set_env(TOKEN_ENV, "shpat_test");
            set_env(KEYS_ENV, " , ,");
        }
        let err = load_with_env(BASE).unwrap_err();
        clear_secret_env();
        assert!(matches!(err, common::Error::MissingSecret(ref s) if s.contains(KEYS_ENV)));
    }

    #[test]
    fn zero_values_are_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            set_env(TOKEN_ENV, "shpat_test");
            set_env(KEYS_ENV, "k1");
        }
        for (section, line) in [
            ("engine", "parallelism = 0"),
            ("engine", "max_image_attempts = 0"),
            ("gates", "enhancement_capacity = 0"),
            ("gates", "image_edit_capacity = 0"),
        ] {
            let toml = format!("{BASE}\n[{section}]\n{line}\n");
            let err = load_with_env(&toml).unwrap_err();
            assert!(
                err.to_string().contains("must be greater than 0"),
                "{line} should be rejected, got: {err}"
            );
        }
        clear_secret_env();
    }

    #[test]
    fn bad_reset_settings_are_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            set_env(TOKEN_ENV, "shpat_test");
            set_env(KEYS_ENV, "k1");
        }
        for line in ["reset_time = \"25:00\"", "reset_timezone = \"-08:00\""] {
            let toml = format!("{BASE}\n[engine]\n{line}\n");
            let err = load_with_env(&toml).unwrap_err();
            assert!(matches!(err, common::Error::Config(_)), "{line} should be rejected");
        }
        clear_secret_env();
    }

    #[test]
    fn endpoint_without_scheme_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let toml = BASE.replace("https://images.internal", "images.internal");
        let err = load_with_env(&toml).unwrap_err();
        assert!(err.to_string().contains("image_edit.endpoint"), "got: {err}");
    }

    #[test]
    fn missing_file_and_invalid_toml_fail() {
        assert!(Config::load(Path::new("/nonexistent/publish-worker.toml")).is_err());
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "bad.toml", "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn example_config_loads() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            set_env(TOKEN_ENV, "shpat_test");
            set_env(KEYS_ENV, "k1,k2,k3");
        }
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("publish-worker.example.toml");
        let config = Config::load(&path).unwrap();
        clear_secret_env();

        assert_eq!(config.image_edit.keys.len(), 3);
        assert_eq!(
            config.image_edit.ledger_path,
            Some(PathBuf::from("key-ledger.json"))
        );
        assert_eq!(
            config.metrics.listen_addr,
            Some("127.0.0.1:9464".parse().unwrap())
        );
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        assert_eq!(
            Config::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml")
        );
        assert_eq!(Config::resolve_path(None), PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("publish-worker.toml"));
    }
}
