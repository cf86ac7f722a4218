//! 基础设施错误的有界重试
//!
//! 超时、连接中断一类的瞬时错误在任务边界内先做带抖动的指数退避
//! 重试，重试耗尽后才升级为任务执行失败。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use ddl_core::{DdlResult, ExecutorConfig};

pub async fn with_infra_retry<T, F, Fut>(
    config: &ExecutorConfig,
    operation: &str,
    mut f: F,
) -> DdlResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DdlResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < config.infra_retry_attempts.max(1) => {
                attempt += 1;
                let base = config.infra_retry_base_ms.max(1) * (1u64 << (attempt - 1).min(8));
                let jitter = rand::rng().random_range(0..=config.infra_retry_base_ms.max(1));
                let backoff = Duration::from_millis(base + jitter);
                warn!(
                    "操作 {} 遇到基础设施错误，第 {} 次重试，退避 {:?}: {}",
                    operation, attempt, backoff, e
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use ddl_core::DdlEngineError;

    use super::*;

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            infra_retry_attempts: 3,
            infra_retry_base_ms: 1,
            ..ExecutorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let config = fast_config();
        let calls = AtomicU32::new(0);

        let result = with_infra_retry(&config, "test", || {
            let calls = &calls;
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DdlEngineError::Infrastructure("连接超时".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let config = fast_config();
        let calls = AtomicU32::new(0);

        let result: DdlResult<()> = with_infra_retry(&config, "test", || {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DdlEngineError::Infrastructure("连接超时".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_propagate_immediately() {
        let config = fast_config();
        let calls = AtomicU32::new(0);

        let result: DdlResult<()> = with_infra_retry(&config, "test", || {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DdlEngineError::Validation("表组不存在".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(DdlEngineError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
