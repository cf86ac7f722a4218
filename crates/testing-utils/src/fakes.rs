//! 假协作方实现
//!
//! 不依赖真实数据库或网络：物理执行器记录每条语句并统计并发度，
//! 可按语句内容注入确定性失败或瞬时基础设施错误。

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use ddl_core::{DdlEngineError, DdlResult};
use ddl_domain::{BackfillSpec, ChangeLogSink, PhysicalDdlExecutor};

/// 记录语句、统计并发、可注入失败的物理执行器
#[derive(Debug, Default)]
pub struct CountingPhysicalExecutor {
    /// 每次调用的人为耗时（毫秒），用于并发观测
    pub delay_ms: u64,
    /// 语句包含该子串时确定性失败
    fail_marker: Mutex<Option<String>>,
    /// 先返回N次基础设施错误再成功
    infra_failures_remaining: AtomicU32,
    current: AtomicUsize,
    max_observed: AtomicUsize,
    executed: Mutex<Vec<String>>,
    copied: Mutex<Vec<BackfillSpec>>,
    purged: Mutex<Vec<(String, Vec<String>)>>,
    rows_per_copy: AtomicU64,
}

impl CountingPhysicalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay_ms(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::default()
        }
    }

    /// 语句包含 `marker` 时执行失败
    pub fn fail_statements_containing(&self, marker: &str) {
        *self.fail_marker.lock().unwrap() = Some(marker.to_string());
    }

    /// 注入N次瞬时基础设施错误
    pub fn inject_infra_failures(&self, count: u32) {
        self.infra_failures_remaining.store(count, Ordering::SeqCst);
    }

    /// 观测到的最大并发执行数
    pub fn max_observed_concurrency(&self) -> usize {
        self.max_observed.load(Ordering::SeqCst)
    }

    pub fn executed_statements(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn copied_specs(&self) -> Vec<BackfillSpec> {
        self.copied.lock().unwrap().clone()
    }

    pub fn purged_calls(&self) -> Vec<(String, Vec<String>)> {
        self.purged.lock().unwrap().clone()
    }

    fn enter(&self) {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(current, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn check_injected_failures(&self, statement: &str) -> DdlResult<()> {
        if self
            .infra_failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DdlEngineError::Infrastructure(
                "注入的瞬时错误: 连接超时".to_string(),
            ));
        }
        if let Some(marker) = self.fail_marker.lock().unwrap().as_ref() {
            if statement.contains(marker.as_str()) {
                return Err(DdlEngineError::Internal(format!(
                    "注入的确定性失败: {statement}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PhysicalDdlExecutor for CountingPhysicalExecutor {
    async fn execute_statement(
        &self,
        _schema_name: &str,
        _phy_group: &str,
        _phy_table: &str,
        statement: &str,
    ) -> DdlResult<()> {
        self.enter();
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        let result = self.check_injected_failures(statement);
        if result.is_ok() {
            self.executed.lock().unwrap().push(statement.to_string());
        }
        self.leave();
        result
    }

    async fn copy_rows(&self, _schema_name: &str, spec: &BackfillSpec) -> DdlResult<u64> {
        self.enter();
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        let result = self.check_injected_failures("COPY_ROWS");
        if result.is_ok() {
            self.copied.lock().unwrap().push(spec.clone());
        }
        self.leave();
        result?;
        Ok(self.rows_per_copy.load(Ordering::SeqCst))
    }

    async fn purge_rows(
        &self,
        _schema_name: &str,
        table_name: &str,
        target_partitions: &[String],
    ) -> DdlResult<u64> {
        self.purged
            .lock()
            .unwrap()
            .push((table_name.to_string(), target_partitions.to_vec()));
        Ok(0)
    }
}

/// 记录通知、可注入失败的变更通知接收方
#[derive(Debug, Default)]
pub struct RecordingChangeLogSink {
    failures_remaining: AtomicU32,
    marks: Mutex<Vec<(String, String)>>,
}

impl RecordingChangeLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_failures(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn marks(&self) -> Vec<(String, String)> {
        self.marks.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeLogSink for RecordingChangeLogSink {
    async fn mark_ddl(&self, _schema_name: &str, object_name: &str, mark: &str) -> DdlResult<()> {
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DdlEngineError::Infrastructure(
                "通知通道不可用".to_string(),
            ));
        }
        self.marks
            .lock()
            .unwrap()
            .push((object_name.to_string(), mark.to_string()));
        Ok(())
    }
}
