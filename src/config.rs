use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{editor::WidgetKind, error::ConfigError, logger::LogLevel};

pub const SCRIPT_KEY: &str = "SCALPEL_SCRIPT";
pub const LOG_LEVEL_KEY: &str = "SCALPEL_LOG_LEVEL";
pub const LOG_DIR_KEY: &str = "SCALPEL_LOG_DIR";
pub const ENABLED_KEY: &str = "SCALPEL_ENABLED";
pub const EDITOR_KEY: &str = "SCALPEL_EDITOR";
pub const WATCH_INTERVAL_KEY: &str = "SCALPEL_WATCH_INTERVAL_MS";
pub const ROOT_KEY: &str = "SCALPEL_ROOT";

const DEFAULT_ROOT: &str = "./scalpel";
const DEFAULT_WATCH_INTERVAL_MS: u64 = 2000;

/// A key/value configuration source.
#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    async fn del(&self, key: &str);

    /// Every key with its value.
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                pairs.push((key, value));
            }
        }
        pairs
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file that `set`/`del` keep up to date.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        match dotenvy::from_path(&env_file) {
            Ok(()) => info!(path = %env_file.display(), "loaded .env"),
            Err(e) => debug!(path = %env_file.display(), error = %e, "no .env loaded"),
        }
        Box::new(Self { env_file })
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// Replace or drop `key` in the `.env` file, keeping every other line as is.
    fn rewrite_env_file(&self, key: &str, value: Option<&str>) -> std::io::Result<()> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut replaced = false;
        let mut lines: Vec<String> = Vec::new();

        for line in content.lines() {
            let is_key = line
                .split_once('=')
                .is_some_and(|(k, _)| k.trim() == key);
            match (is_key, value) {
                (true, Some(value)) => {
                    lines.push(format!("{key}={value}"));
                    replaced = true;
                }
                (true, None) => {}
                (false, _) => lines.push(line.to_string()),
            }
        }
        if let (false, Some(value)) = (replaced, value) {
            lines.push(format!("{key}={value}"));
        }

        fs::write(&self.env_file, lines.join("\n"))
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        }
        self.rewrite_env_file(key, Some(value))
            .map_err(|e| format!("could not update {}: {e}", self.env_file.display()))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        }
        if self.env_file.exists() {
            if let Err(e) = self.rewrite_env_file(key, None) {
                warn!(path = %self.env_file.display(), error = %e, "could not update .env");
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory configuration, for tests and embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(pairs: &[(&str, &str)]) -> Box<Self> {
        let me = Self::new();
        for (k, v) in pairs {
            me.map.insert(k.to_string(), v.to_string());
        }
        me
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.value().clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Everything the binary needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub root: PathBuf,
    pub script: Option<PathBuf>,
    pub log_level: LogLevel,
    pub log_dir: PathBuf,
    pub enabled: bool,
    pub editor: WidgetKind,
    pub watch_interval: Duration,
}

impl Settings {
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigError> {
        let source = &config.0;

        let root = source
            .get(ROOT_KEY)
            .await
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));

        // relative paths live under the root
        let under_root = |raw: String| {
            let path = PathBuf::from(raw);
            if path.is_absolute() { path } else { root.join(path) }
        };

        let script = source.get(SCRIPT_KEY).await.filter(|s| !s.trim().is_empty()).map(&under_root);
        let log_dir = source
            .get(LOG_DIR_KEY)
            .await
            .map(&under_root)
            .unwrap_or_else(|| root.join("logs"));

        let log_level = source
            .get(LOG_LEVEL_KEY)
            .await
            .map(|l| LogLevel::parse(&l))
            .unwrap_or_default();

        let enabled = match source.get(ENABLED_KEY).await {
            Some(raw) => parse_bool(ENABLED_KEY, &raw)?,
            None => true,
        };

        let editor = match source.get(EDITOR_KEY).await {
            Some(raw) => WidgetKind::from_str(&raw)?,
            None => WidgetKind::default(),
        };

        let watch_interval = match source.get(WATCH_INTERVAL_KEY).await {
            Some(raw) => {
                let ms: u64 = raw.trim().parse().map_err(|e| ConfigError::Invalid {
                    key: WATCH_INTERVAL_KEY.into(),
                    reason: format!("`{raw}`: {e}"),
                })?;
                if ms == 0 {
                    return Err(ConfigError::Invalid {
                        key: WATCH_INTERVAL_KEY.into(),
                        reason: "must be greater than zero".into(),
                    });
                }
                Duration::from_millis(ms)
            }
            None => Duration::from_millis(DEFAULT_WATCH_INTERVAL_MS),
        };

        Ok(Self {
            root,
            script,
            log_level,
            log_dir,
            enabled,
            editor,
            watch_interval,
        })
    }

    /// The script path, or an error naming the key to set.
    pub fn require_script(&self) -> Result<&Path, ConfigError> {
        self.script
            .as_deref()
            .ok_or_else(|| ConfigError::Missing(SCRIPT_KEY.to_string()))
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            key: key.to_string(),
            reason: format!("`{other}` is not a boolean"),
        }),
    }
}
