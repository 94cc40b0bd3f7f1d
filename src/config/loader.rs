use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::PathBuf;

use super::types::{Config, ConfigFile};
use super::validator::validate;

/// Configuration file loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(config_path: Option<&str>) -> Self {
        Self {
            config_path: config_path.map(expand_env).map(PathBuf::from),
        }
    }

    /// Load and parse the configuration file.
    ///
    /// Without a path, the built-in defaults are returned. Validation failures
    /// are fatal at startup.
    pub fn load(&self) -> Result<Config> {
        let config = match &self.config_path {
            None => Config::default(),
            Some(path) => {
                if !path.exists() {
                    return Err(anyhow!("config file not found: {}", path.display()));
                }

                let content = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file: {}", path.display()))?;

                let file: ConfigFile = serde_yml::from_str(&content)
                    .with_context(|| format!("failed to parse config file: {}", path.display()))?;

                tracing::info!(path = %path.display(), "loaded configuration file");
                file.eco
            }
        };

        validate(&config)?;
        Ok(config)
    }
}

/// Expand `$VAR` references in a path string
fn expand_env(path: &str) -> String {
    let mut result = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut name = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_ascii_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }

        if name.is_empty() {
            result.push('$');
        } else {
            result.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults_without_path() {
        let config = ConfigLoader::new(None).load().unwrap();
        assert_eq!(config.check_interval, Duration::from_secs(15));
        assert_eq!(config.unhealthy_member_ttl, Duration::from_secs(120));
        assert_eq!(config.snapshot.interval, Duration::from_secs(30 * 60));
        assert_eq!(config.snapshot.ttl, Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.etcd.data_dir.to_str(), Some("/var/lib/etcd"));
        assert!(config.etcd.peer_transport_security.auto_tls);
        assert!(config.snapshot.provider.is_empty());
        assert!(config.logging.enabled);
    }

    #[test]
    fn test_load_yaml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
eco:
  check-interval: 30s
  unhealthy-member-ttl: 4m
  etcd:
    data-dir: /tmp/etcd-data
    backend-quota: 4294967296
  asg:
    provider: docker
    size: 5
    name-filter: eco-test-
  snapshot:
    provider: file
    interval: 10m
    ttl: 12h
    dir: /tmp/snapshots
"#
        )
        .unwrap();

        let config = ConfigLoader::new(f.path().to_str()).load().unwrap();
        assert_eq!(config.check_interval, Duration::from_secs(30));
        assert_eq!(config.unhealthy_member_ttl, Duration::from_secs(240));
        assert_eq!(config.etcd.data_dir.to_str(), Some("/tmp/etcd-data"));
        assert_eq!(config.etcd.backend_quota, 4294967296);
        assert_eq!(config.asg.provider, "docker");
        assert_eq!(config.snapshot.provider, "file");
        assert_eq!(config.snapshot.interval, Duration::from_secs(600));
        assert!(config.asg.params.contains_key("size"));
        assert!(config.snapshot.params.contains_key("dir"));
    }

    #[test]
    fn test_missing_file() {
        assert!(ConfigLoader::new(Some("/nonexistent/eco.yaml")).load().is_err());
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("ECO_TEST_DIR", "/tmp/eco");
        assert_eq!(expand_env("$ECO_TEST_DIR/config.yaml"), "/tmp/eco/config.yaml");
        assert_eq!(expand_env("/plain/path"), "/plain/path");
    }
}
