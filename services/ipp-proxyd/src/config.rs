//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The guardian bearer token is loaded from the GUARDIAN_TOKEN env var or
//! auth_token_file, never stored in the TOML directly to avoid leaking
//! secrets.

use common::Secret;
use proxy_session::ManagerConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var holding the guardian bearer token.
pub const TOKEN_ENV: &str = "GUARDIAN_TOKEN";

/// Root configuration. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub guardian: GuardianConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Credential service connection settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    pub base_url: String,
    /// Path to a file containing the bearer token (alternative to GUARDIAN_TOKEN)
    pub auth_token_file: Option<PathBuf>,
    pub timeout_secs: u64,
    #[serde(skip)]
    pub auth_token: Option<Secret<String>>,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            base_url: guardian::DEFAULT_BASE_URL.to_string(),
            auth_token_file: None,
            timeout_secs: 30,
            auth_token: None,
        }
    }
}

/// Session timing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub rotation_margin_secs: u64,
    pub min_rotation_delay_secs: u64,
    pub usage_refresh_secs: u64,
    /// Activate as soon as the daemon is up
    pub autostart: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rotation_margin_secs: 60,
            min_rotation_delay_secs: 10,
            usage_refresh_secs: 300,
            autostart: false,
        }
    }
}

/// Usage snapshot persistence
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false, usage is kept in memory only and lost on restart
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/var/lib/ipp-proxyd/usage.json"),
        }
    }
}

/// Control and status listener
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_connections: 64,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve the
    /// bearer token.
    ///
    /// Token resolution order:
    /// 1. GUARDIAN_TOKEN env var
    /// 2. auth_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.guardian.auth_token =
            Secret::from_env_or_file(TOKEN_ENV, config.guardian.auth_token_file.as_deref())?;
        if config.guardian.auth_token.is_none() {
            return Err(common::Error::Config(format!(
                "no guardian token: set {TOKEN_ENV} or guardian.auth_token_file"
            )));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.guardian.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "guardian.base_url must start with http:// or https://, got: {base_url}"
            )));
        }
        if self.guardian.timeout_secs == 0 {
            return Err(common::Error::Config(
                "guardian.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.session.usage_refresh_secs == 0 {
            return Err(common::Error::Config(
                "session.usage_refresh_secs must be greater than 0".into(),
            ));
        }
        if self.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "admin.max_connections must be greater than 0".into(),
            ));
        }
        if self.cache.enabled && self.cache.path.as_os_str().is_empty() {
            return Err(common::Error::Config(
                "cache.path must be set when the cache is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("ipp-proxyd.toml")
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            rotation_margin: Duration::from_secs(self.session.rotation_margin_secs),
            min_rotation_delay: Duration::from_secs(self.session.min_rotation_delay_secs),
            fetch_timeout: Duration::from_secs(self.guardian.timeout_secs),
        }
    }

    pub fn usage_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.session.usage_refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn full_toml() -> &'static str {
        r#"
[guardian]
base_url = "https://guardian.example.com"
timeout_secs = 10

[session]
rotation_margin_secs = 120
min_rotation_delay_secs = 5
usage_refresh_secs = 600
autostart = true

[cache]
enabled = false
path = "/tmp/usage.json"

[admin]
listen_addr = "0.0.0.0:9191"
max_connections = 8
"#
    }

    #[test]
    fn full_config_loads() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", full_toml());

        unsafe { set_env(TOKEN_ENV, "bearer-from-env") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(TOKEN_ENV) };

        assert_eq!(config.guardian.base_url, "https://guardian.example.com");
        assert_eq!(config.guardian.timeout_secs, 10);
        assert!(config.session.autostart);
        assert!(!config.cache.enabled);
        assert_eq!(config.admin.listen_addr.port(), 9191);
        assert_eq!(config.admin.max_connections, 8);
        assert_eq!(
            config.guardian.auth_token.as_ref().unwrap().expose(),
            "bearer-from-env"
        );

        let manager = config.manager_config();
        assert_eq!(manager.rotation_margin, Duration::from_secs(120));
        assert_eq!(manager.min_rotation_delay, Duration::from_secs(5));
        assert_eq!(manager.fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.usage_refresh_interval(), Duration::from_secs(600));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", "");

        unsafe { set_env(TOKEN_ENV, "t") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(TOKEN_ENV) };

        assert_eq!(config.guardian.base_url, guardian::DEFAULT_BASE_URL);
        assert_eq!(config.guardian.timeout_secs, 30);
        assert_eq!(config.session.rotation_margin_secs, 60);
        assert_eq!(config.session.usage_refresh_secs, 300);
        assert!(!config.session.autostart);
        assert!(config.cache.enabled);
        assert_eq!(config.admin.listen_addr.to_string(), "127.0.0.1:9090");
    }

    #[test]
    fn token_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let token_path = write(&dir, "token", "bearer-from-file\n");
        let toml = format!(
            "[guardian]\nauth_token_file = \"{}\"\n",
            token_path.display()
        );
        let path = write(&dir, "config.toml", &toml);

        unsafe { remove_env(TOKEN_ENV) };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.guardian.auth_token.as_ref().unwrap().expose(),
            "bearer-from-file"
        );
    }

    #[test]
    fn token_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let token_path = write(&dir, "token", "bearer-from-file");
        let toml = format!(
            "[guardian]\nauth_token_file = \"{}\"\n",
            token_path.display()
        );
        let path = write(&dir, "config.toml", &toml);

        unsafe { set_env(TOKEN_ENV, "bearer-from-env") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(TOKEN_ENV) };

        assert_eq!(
            config.guardian.auth_token.as_ref().unwrap().expose(),
            "bearer-from-env"
        );
    }

    #[test]
    fn missing_token_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", "");

        unsafe { remove_env(TOKEN_ENV) };
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains(TOKEN_ENV), "got: {err}");
    }

    #[test]
    fn unreadable_token_file_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "config.toml",
            "[guardian]\nauth_token_file = \"/nonexistent/token\"\n",
        );

        unsafe { remove_env(TOKEN_ENV) };
        assert!(matches!(
            Config::load(&path),
            Err(common::Error::SecretFile { .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        unsafe { set_env(TOKEN_ENV, "t") };

        for (name, toml) in [
            ("scheme", "[guardian]\nbase_url = \"ftp://guardian.example.com\"\n"),
            ("timeout", "[guardian]\ntimeout_secs = 0\n"),
            ("refresh", "[session]\nusage_refresh_secs = 0\n"),
            ("connections", "[admin]\nmax_connections = 0\n"),
            ("cache path", "[cache]\nenabled = true\npath = \"\"\n"),
        ] {
            let path = write(&dir, "config.toml", toml);
            let result = Config::load(&path);
            assert!(
                matches!(result, Err(common::Error::Config(_))),
                "{name}: expected config error"
            );
        }

        unsafe { remove_env(TOKEN_ENV) };
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load(Path::new("/nonexistent/ipp-proxyd.toml")).is_err());
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "bad.toml", "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();

        unsafe { set_env("CONFIG_PATH", "/etc/from-env.toml") };
        assert_eq!(
            Config::resolve_path(Some("/etc/from-cli.toml")),
            PathBuf::from("/etc/from-cli.toml")
        );
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("/etc/from-env.toml")
        );

        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("ipp-proxyd.toml"));
    }
}
