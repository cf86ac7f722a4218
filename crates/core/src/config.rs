use serde::{Deserialize, Serialize};

use crate::errors::{DdlEngineError, DdlResult};

/// 引擎配置
///
/// 支持从TOML配置文件加载，并允许通过 `DDL_ENGINE_` 前缀的环境变量覆盖，
/// 例如 `DDL_ENGINE_EXECUTOR__DEFAULT_MAX_PARALLELISM=8`。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 作业状态存储的连接串，`memory` 表示使用进程内存储
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "memory".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// 单个作业默认的最大任务并行度
    pub default_max_parallelism: usize,
    /// 基础设施错误的最大本地重试次数
    pub infra_retry_attempts: u32,
    /// 基础设施错误重试的退避基数（毫秒）
    pub infra_retry_base_ms: u64,
    /// 变更通知（fire-and-forget）自身的重试次数
    pub sync_notify_retry_attempts: u32,
    /// 回填任务默认批大小
    pub backfill_batch_size: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_max_parallelism: 4,
            infra_retry_attempts: 3,
            infra_retry_base_ms: 200,
            sync_notify_retry_attempts: 5,
            backfill_batch_size: 4096,
        }
    }
}

impl EngineConfig {
    /// 加载配置：缺省值 <- 配置文件 <- 环境变量，右侧覆盖左侧
    pub fn load(path: Option<&str>) -> DdlResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DDL_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder
            .build()
            .map_err(|e| DdlEngineError::Configuration(e.to_string()))?;

        raw.try_deserialize()
            .map_err(|e| DdlEngineError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.database.url, "memory");
        assert_eq!(config.executor.default_max_parallelism, 4);
        assert_eq!(config.executor.infra_retry_attempts, 3);
        assert_eq!(config.executor.backfill_batch_size, 4096);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[database]
url = "sqlite://ddl_jobs.db"

[executor]
default_max_parallelism = 8
"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.database.url, "sqlite://ddl_jobs.db");
        assert_eq!(config.executor.default_max_parallelism, 8);
        // 未出现在文件中的字段保持缺省
        assert_eq!(config.executor.infra_retry_attempts, 3);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = EngineConfig::load(Some("/nonexistent/ddl-engine.toml")).unwrap();
        assert_eq!(config.database.url, "memory");
    }

    #[test]
    fn test_config_toml_round_trip() {
        let config = EngineConfig::default();
        let rendered = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(
            parsed.executor.default_max_parallelism,
            config.executor.default_max_parallelism
        );
        assert_eq!(parsed.database.url, config.database.url);
    }
}
