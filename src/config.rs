use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AgentError, Result};

pub const DEFAULT_JUPYTER_BASE_PORT: u16 = 8800;
pub const DEFAULT_SYNC_INTERVAL_MIN: u64 = 10;

/// Who this agent acts for. Every queue row it touches must belong to this user.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Linux account name, matched against `users.linux_user` when no user id is given
    pub linux_user: String,
    /// Recipient of job notifications
    pub email: String,
    /// Pre-resolved user id; skips the users table lookup
    pub user_id: Option<String>,
}

/// Connection settings for the remote queue store.
#[derive(Clone)]
pub struct StoreConfig {
    pub url: String,
    pub service_key: String,
    pub request_timeout: Duration,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url)
            .field("service_key", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Sender address. Falls back to the identity email when unset.
    pub from: Option<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25,
            from: None,
        }
    }
}

/// Notebook server settings.
#[derive(Debug, Clone)]
pub struct JupyterConfig {
    /// Session port is `base_port + uid % 100`
    pub base_port: u16,
    /// Interface the server binds to
    pub ip: String,
    /// Use the `NotebookApp` flag dialect instead of `ServerApp`
    pub legacy: bool,
}

impl Default for JupyterConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_JUPYTER_BASE_PORT,
            ip: "0.0.0.0".to_string(),
            legacy: false,
        }
    }
}

/// External programs the agent invokes.
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    pub python: String,
    pub jupyter: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            python: "python".to_string(),
            jupyter: "jupyter".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub identity: IdentityConfig,
    pub store: StoreConfig,
    pub smtp: SmtpConfig,
    pub jupyter: JupyterConfig,
    pub toolchain: ToolchainConfig,
    /// Root of the script index and of job path confinement
    pub home: PathBuf,
    /// Per-job log directories, session logs and the sync marker live here
    pub log_root: PathBuf,
    /// Zero means reconcile on every tick
    pub sync_interval: Duration,
}

impl AgentConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an environment-style key/value lookup.
    ///
    /// Empty values are treated as absent. Required keys are `LAB_USER`,
    /// `LAB_EMAIL`, `SUPABASE_URL` and `SUPABASE_SERVICE_KEY`; everything else
    /// falls back to a default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| {
            get(key).ok_or_else(|| AgentError::Config(format!("{} is required", key)))
        };

        let identity = IdentityConfig {
            linux_user: require("LAB_USER")?,
            email: require("LAB_EMAIL")?,
            user_id: get("LAB_USER_ID"),
        };

        let store = StoreConfig {
            url: require("SUPABASE_URL")?,
            service_key: require("SUPABASE_SERVICE_KEY")?,
            request_timeout: Duration::from_secs(30),
        };

        let smtp_defaults = SmtpConfig::default();
        let smtp = SmtpConfig {
            host: get("SMTP_HOST").unwrap_or(smtp_defaults.host),
            port: parse_or("SMTP_PORT", get("SMTP_PORT"), smtp_defaults.port)?,
            from: get("LAB_FROM_EMAIL"),
        };

        let jupyter_defaults = JupyterConfig::default();
        let base_port = parse_or(
            "JUPYTER_BASE_PORT",
            get("JUPYTER_BASE_PORT"),
            jupyter_defaults.base_port,
        )?;
        // Leave room for the uid offset.
        if base_port > u16::MAX - 99 {
            return Err(AgentError::Config(format!(
                "JUPYTER_BASE_PORT must be at most {}, got {}",
                u16::MAX - 99,
                base_port
            )));
        }
        let jupyter = JupyterConfig {
            base_port,
            ip: get("JUPYTER_IP").unwrap_or(jupyter_defaults.ip),
            legacy: get("JUPYTER_LEGACY").is_some_and(|v| is_truthy(&v)),
        };

        let toolchain_defaults = ToolchainConfig::default();
        let toolchain = ToolchainConfig {
            python: get("LAB_PYTHON").unwrap_or(toolchain_defaults.python),
            jupyter: get("LAB_JUPYTER").unwrap_or(toolchain_defaults.jupyter),
        };

        let home = match get("LAB_HOME").or_else(|| get("HOME")) {
            Some(home) => PathBuf::from(home),
            None => {
                return Err(AgentError::Config(
                    "LAB_HOME or HOME must point at the user's home directory".to_string(),
                ))
            }
        };
        let log_root = get("LAB_LOG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("lab_job_logs"));

        let interval_min = parse_or(
            "SYNC_INTERVAL_MIN",
            get("SYNC_INTERVAL_MIN"),
            DEFAULT_SYNC_INTERVAL_MIN,
        )?;

        Ok(Self {
            identity,
            store,
            smtp,
            jupyter,
            toolchain,
            home,
            log_root,
            sync_interval: Duration::from_secs(interval_min.saturating_mul(60)),
        })
    }

    pub fn from_address(&self) -> &str {
        self.smtp.from.as_deref().unwrap_or(&self.identity.email)
    }
}

/// Load `KEY=value` lines into the process environment. Variables already set
/// win. Without an explicit path a missing `./.env` is not an error.
pub fn load_env_file(path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => dotenvy::from_path(path)
            .map_err(|e| AgentError::Config(format!("{}: {}", path.display(), e))),
        None => {
            dotenvy::dotenv().ok();
            Ok(())
        }
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AgentError::Config(format!("{} has invalid value {:?}: {}", key, raw, e))),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("LAB_USER", "alice"),
            ("LAB_EMAIL", "alice@example.com"),
            ("SUPABASE_URL", "https://queue.example.com"),
            ("SUPABASE_SERVICE_KEY", "secret"),
            ("HOME", "/home/alice"),
        ]
    }

    #[test]
    fn smtp_config_default() {
        let cfg = SmtpConfig::default();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 25);
        assert!(cfg.from.is_none());
    }

    #[test]
    fn jupyter_config_default() {
        let cfg = JupyterConfig::default();
        assert_eq!(cfg.base_port, 8800);
        assert_eq!(cfg.ip, "0.0.0.0");
        assert!(!cfg.legacy);
    }

    #[test]
    fn defaults_apply_when_optional_keys_absent() {
        let cfg = AgentConfig::from_lookup(lookup_from(&required())).unwrap();
        assert_eq!(cfg.identity.linux_user, "alice");
        assert!(cfg.identity.user_id.is_none());
        assert_eq!(cfg.smtp.host, "localhost");
        assert_eq!(cfg.smtp.port, 25);
        assert_eq!(cfg.from_address(), "alice@example.com");
        assert_eq!(cfg.jupyter.base_port, 8800);
        assert_eq!(cfg.toolchain.python, "python");
        assert_eq!(cfg.home, PathBuf::from("/home/alice"));
        assert_eq!(cfg.log_root, PathBuf::from("/home/alice/lab_job_logs"));
        assert_eq!(cfg.sync_interval, Duration::from_secs(600));
    }

    #[test]
    fn optional_keys_override_defaults() {
        let mut pairs = required();
        pairs.extend([
            ("LAB_USER_ID", "u-123"),
            ("SMTP_PORT", "2525"),
            ("LAB_FROM_EMAIL", "lab@example.com"),
            ("JUPYTER_BASE_PORT", "9000"),
            ("JUPYTER_LEGACY", "Yes"),
            ("SYNC_INTERVAL_MIN", "0"),
            ("LAB_HOME", "/srv/alice"),
        ]);
        let cfg = AgentConfig::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(cfg.identity.user_id.as_deref(), Some("u-123"));
        assert_eq!(cfg.smtp.port, 2525);
        assert_eq!(cfg.from_address(), "lab@example.com");
        assert_eq!(cfg.jupyter.base_port, 9000);
        assert!(cfg.jupyter.legacy);
        assert_eq!(cfg.sync_interval, Duration::ZERO);
        assert_eq!(cfg.home, PathBuf::from("/srv/alice"));
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let pairs: Vec<_> = required()
            .into_iter()
            .filter(|(k, _)| *k != "SUPABASE_SERVICE_KEY")
            .collect();
        let err = AgentConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("SUPABASE_SERVICE_KEY"));
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let mut pairs = required();
        pairs.retain(|(k, _)| *k != "LAB_USER");
        pairs.push(("LAB_USER", "  "));
        assert!(AgentConfig::from_lookup(lookup_from(&pairs)).is_err());
    }

    #[test]
    fn invalid_number_is_rejected() {
        let mut pairs = required();
        pairs.push(("SMTP_PORT", "twenty-five"));
        let err = AgentConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("SMTP_PORT"));
    }

    #[test]
    fn base_port_leaves_room_for_uid_offset() {
        let mut pairs = required();
        pairs.push(("JUPYTER_BASE_PORT", "65500"));
        assert!(AgentConfig::from_lookup(lookup_from(&pairs)).is_err());
    }

    #[test]
    fn store_config_debug_hides_key() {
        let cfg = AgentConfig::from_lookup(lookup_from(&required())).unwrap();
        let rendered = format!("{:?}", cfg.store);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn env_file_populates_process_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.env");
        std::fs::write(&path, "LAB_AGENT_ENV_FILE_TEST=debug\n").unwrap();

        load_env_file(Some(path.as_path())).unwrap();
        assert_eq!(
            std::env::var("LAB_AGENT_ENV_FILE_TEST").as_deref(),
            Ok("debug")
        );
        assert!(matches!(
            load_env_file(Some(dir.path().join("missing.env").as_path())),
            Err(AgentError::Config(_))
        ));
    }
}
