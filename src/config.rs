use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::model::{Tool, UserProfile};
use crate::store::{InMemoryStore, StoreError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name}: cannot parse {value:?}")]
    InvalidVar { name: &'static str, value: String },
    #[error("reading seed {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing seed {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("loading seed: {0}")]
    Store(#[from] StoreError),
}

/// Server settings, read from `TOOLSHED_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub seed: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7878,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            seed: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their
    /// defaults; set but unparsable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup("TOOLSHED_PORT") {
            config.port = parse("TOOLSHED_PORT", v)?;
        }
        if let Some(v) = lookup("TOOLSHED_BIND") {
            config.bind = v;
        }
        if let Some(v) = lookup("TOOLSHED_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TOOLSHED_MAX_CONNECTIONS") {
            config.max_connections = parse("TOOLSHED_MAX_CONNECTIONS", v)?;
        }
        if let Some(v) = lookup("TOOLSHED_COMPACT_THRESHOLD") {
            config.compact_threshold = parse("TOOLSHED_COMPACT_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("TOOLSHED_METRICS_PORT") {
            config.metrics_port = Some(parse("TOOLSHED_METRICS_PORT", v)?);
        }
        config.seed = lookup("TOOLSHED_SEED").map(PathBuf::from);
        Ok(config)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("toolshed.wal")
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidVar { name, value })
}

/// Users and tools to register at startup. The catalog and identity
/// provider live outside this service; the seed stands in for them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<UserProfile>,
    #[serde(default)]
    pub tools: Vec<Tool>,
}

impl Seed {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Upsert everything into `store`; safe to repeat on every boot.
    pub async fn load_into(self, store: &InMemoryStore) -> Result<(), ConfigError> {
        for user in self.users {
            store.upsert_user(user).await?;
        }
        for tool in self.tools {
            store.upsert_tool(tool).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IdentityResolver, ToolCatalog};
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.addr(), "0.0.0.0:7878");
        assert_eq!(config.wal_path(), PathBuf::from("./data/toolshed.wal"));
    }

    #[test]
    fn overrides_from_vars() {
        let config = Config::from_lookup(lookup(&[
            ("TOOLSHED_PORT", "9000"),
            ("TOOLSHED_BIND", "127.0.0.1"),
            ("TOOLSHED_MAX_CONNECTIONS", " 8 "),
            ("TOOLSHED_METRICS_PORT", "9100"),
            ("TOOLSHED_SEED", "/etc/toolshed/seed.json"),
        ]))
        .unwrap();
        assert_eq!(config.addr(), "127.0.0.1:9000");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.seed, Some(PathBuf::from("/etc/toolshed/seed.json")));
        assert_eq!(config.compact_threshold, 1000);
    }

    #[test]
    fn bad_number_is_an_error() {
        let err = Config::from_lookup(lookup(&[("TOOLSHED_PORT", "seventy")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidVar {
                name: "TOOLSHED_PORT",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn seed_loads_users_and_tools() {
        let owner = ulid::Ulid::new();
        let tool = ulid::Ulid::new();
        let json = format!(
            r#"{{
                "users": [{{"id": "{owner}", "external_id": "auth|owner", "display_name": "Olive"}}],
                "tools": [{{"id": "{tool}", "owner_id": "{owner}", "name": "Ladder",
                            "status": "available", "max_loan_days": 7}}]
            }}"#
        );
        let dir = std::env::temp_dir().join("toolshed_test_config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("seed.json");
        std::fs::write(&path, json).unwrap();

        let seed = Seed::from_path(&path).unwrap();
        assert_eq!(seed.tools[0].advance_notice_days, 0);

        let store = InMemoryStore::new();
        seed.load_into(&store).await.unwrap();
        let user = store.resolve("auth|owner").await.unwrap().unwrap();
        assert_eq!(user.id, owner);
        assert_eq!(store.get_tool(tool).await.unwrap().unwrap().owner_id, owner);
    }

    #[test]
    fn missing_seed_file() {
        let err = Seed::from_path(Path::new("/nonexistent/seed.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
