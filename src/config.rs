use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::{env, path::PathBuf};
use thiserror::Error;
use tracing::{error, info};

use crate::logger::{LogConfig, LogLevel};
use crate::router::Router;
use crate::router::queue::{
    DEFAULT_QUEUE, DEFAULT_RESULT_TTL, QueueInvoker, QueueOptions, QueueWorker,
};
use crate::transaction::TransactionHandler;

pub const ROUTING_ENABLED_KEY: &str = "EMIT_ROUTING_ENABLED";
pub const STRATEGY_KEY: &str = "EMIT_STRATEGY";
pub const QUEUE_KEY: &str = "EMIT_QUEUE";
pub const QUEUE_TIMEOUT_KEY: &str = "EMIT_QUEUE_TIMEOUT_SECS";
pub const RESULT_TTL_KEY: &str = "EMIT_RESULT_TTL_SECS";
pub const LOG_LEVEL_KEY: &str = "EMIT_LOG_LEVEL";
pub const LOG_DIR_KEY: &str = "EMIT_LOG_DIR";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Read-only source of settings.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

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

/// Process environment, seeded from a `.env` file when one exists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            error!("could not load .env from {}", env_file.display())
        }

        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::new(Self { map })
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Direct,
    Queue,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(StrategyKind::Direct),
            "queue" => Ok(StrategyKind::Queue),
            other => Err(format!("expected `direct` or `queue`, got `{other}`")),
        }
    }
}

/// Settings for building a router.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    pub routing_enabled: bool,
    pub strategy: StrategyKind,
    pub queue: QueueOptions,
    pub log: LogConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            routing_enabled: true,
            strategy: StrategyKind::Direct,
            queue: QueueOptions::default(),
            log: LogConfig::default(),
        }
    }
}

/// A router built from config, with the queue pieces when the queue
/// strategy is selected. The worker still has to be spawned.
pub struct RouterParts {
    pub router: Arc<Router>,
    pub queue: Option<Arc<QueueInvoker>>,
    pub worker: Option<QueueWorker>,
}

async fn parse_key<T>(config: &ConfigManager, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = config.0.get(key).await else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            value,
            reason: e.to_string(),
        })
}

impl RouterConfig {
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigError> {
        let routing_enabled = parse_key::<bool>(config, ROUTING_ENABLED_KEY)
            .await?
            .unwrap_or(true);
        let strategy = parse_key::<StrategyKind>(config, STRATEGY_KEY)
            .await?
            .unwrap_or(StrategyKind::Direct);

        let queue = QueueOptions {
            queue: config
                .0
                .get(QUEUE_KEY)
                .await
                .unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            timeout: parse_key::<u64>(config, QUEUE_TIMEOUT_KEY)
                .await?
                .map(Duration::from_secs),
            result_ttl: parse_key::<u64>(config, RESULT_TTL_KEY)
                .await?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RESULT_TTL),
        };

        let log = LogConfig::new(
            parse_key::<LogLevel>(config, LOG_LEVEL_KEY)
                .await?
                .unwrap_or(LogLevel::Info),
            config.0.get(LOG_DIR_KEY).await.map(PathBuf::from),
        );

        Ok(Self {
            routing_enabled,
            strategy,
            queue,
            log,
        })
    }

    pub fn build(&self) -> RouterParts {
        self.assemble(None)
    }

    pub fn build_with_transactions(&self, handler: Arc<dyn TransactionHandler>) -> RouterParts {
        self.assemble(Some(handler))
    }

    fn assemble(&self, handler: Option<Arc<dyn TransactionHandler>>) -> RouterParts {
        let mut builder = Router::builder().routing_enabled(self.routing_enabled);
        if let Some(handler) = handler {
            builder = builder.transactions(handler);
        }

        match self.strategy {
            StrategyKind::Direct => RouterParts {
                router: Arc::new(builder.build()),
                queue: None,
                worker: None,
            },
            StrategyKind::Queue => {
                let invoker = Arc::new(QueueInvoker::new(self.queue.clone()));
                let worker = invoker.worker(&self.queue.queue);
                RouterParts {
                    router: Arc::new(builder.invoker(invoker.clone()).build()),
                    queue: Some(invoker),
                    worker: Some(worker),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::from_pairs([("foo", "bar"), ("a", "1")]);

        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));
        assert_eq!(mgr.get("a").await, Some("1".to_string()));
        assert_eq!(mgr.get("missing").await, None);
        assert_eq!(MapConfigManager::new().get("foo").await, None);
    }

    #[tokio::test]
    async fn test_config_manager_clone_and_debug() {
        let config = ConfigManager(MapConfigManager::from_pairs([(QUEUE_KEY, "words")]));
        let copy = config.clone();

        assert_eq!(copy.0.get(QUEUE_KEY).await, Some("words".to_string()));
        assert_eq!(format!("{config:?}"), "MapConfigManager(1 entries)");

        let env = ConfigManager(EnvConfigManager::new(PathBuf::from("/nonexistent/.env")));
        assert_eq!(
            format!("{:?}", env.clone()),
            "EnvConfigManager(/nonexistent/.env)"
        );
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "EMIT_TEST_QUEUE=fast\nEMIT_TEST_LOG_LEVEL=debug\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);

        assert_eq!(mgr.get("EMIT_TEST_QUEUE").await, Some("fast".to_string()));
        assert_eq!(mgr.get("EMIT_TEST_LOG_LEVEL").await, Some("debug".to_string()));
    }

    #[tokio::test]
    async fn test_router_config_defaults() {
        let config = ConfigManager(MapConfigManager::new());
        let loaded = RouterConfig::load(&config).await.unwrap();
        assert_eq!(loaded, RouterConfig::default());

        let parts = loaded.build();
        assert!(parts.router.routing_enabled());
        assert!(parts.queue.is_none());
        assert!(parts.worker.is_none());
    }

    #[tokio::test]
    async fn test_router_config_queue_strategy() {
        let config = ConfigManager(MapConfigManager::from_pairs([
            (ROUTING_ENABLED_KEY, "false"),
            (STRATEGY_KEY, "Queue"),
            (QUEUE_KEY, "words"),
            (QUEUE_TIMEOUT_KEY, "5"),
            (RESULT_TTL_KEY, "60"),
            (LOG_LEVEL_KEY, "debug"),
            (LOG_DIR_KEY, "/tmp/emit-logs"),
        ]));
        let loaded = RouterConfig::load(&config).await.unwrap();

        assert!(!loaded.routing_enabled);
        assert_eq!(loaded.strategy, StrategyKind::Queue);
        assert_eq!(loaded.queue.queue, "words");
        assert_eq!(loaded.queue.timeout, Some(Duration::from_secs(5)));
        assert_eq!(loaded.queue.result_ttl, Duration::from_secs(60));
        assert_eq!(loaded.log.log_level, LogLevel::Debug);
        assert_eq!(loaded.log.log_dir, Some(PathBuf::from("/tmp/emit-logs")));

        let parts = loaded.build();
        assert!(!parts.router.routing_enabled());
        assert_eq!(parts.worker.as_ref().map(|w| w.queue()), Some("words"));
        assert!(parts.queue.is_some());
    }

    #[tokio::test]
    async fn test_router_config_rejects_bad_values() {
        let config = ConfigManager(MapConfigManager::from_pairs([(STRATEGY_KEY, "celery")]));
        let err = RouterConfig::load(&config).await.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == STRATEGY_KEY));

        let config = ConfigManager(MapConfigManager::from_pairs([(QUEUE_TIMEOUT_KEY, "soon")]));
        assert!(RouterConfig::load(&config).await.is_err());
    }
}
