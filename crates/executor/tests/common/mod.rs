//! 执行器测试的公共装配

use std::sync::Arc;

use ddl_core::ExecutorConfig;
use ddl_executor::EngineContext;
use ddl_infrastructure::{InMemoryJobRepository, InMemoryMetaStore};
use ddl_testing_utils::{CountingPhysicalExecutor, RecordingChangeLogSink};

pub struct TestHarness {
    pub ctx: Arc<EngineContext>,
    pub repository: Arc<InMemoryJobRepository>,
    pub meta: InMemoryMetaStore,
    pub physical: Arc<CountingPhysicalExecutor>,
    pub changelog: Arc<RecordingChangeLogSink>,
}

pub fn harness() -> TestHarness {
    harness_with(CountingPhysicalExecutor::new())
}

pub fn harness_with(physical: CountingPhysicalExecutor) -> TestHarness {
    let repository = Arc::new(InMemoryJobRepository::new());
    let meta = InMemoryMetaStore::new();
    let physical = Arc::new(physical);
    let changelog = Arc::new(RecordingChangeLogSink::new());
    let config = ExecutorConfig {
        // 测试里把退避压到最小
        infra_retry_base_ms: 1,
        ..ExecutorConfig::default()
    };
    let ctx = EngineContext::new(
        repository.clone(),
        Arc::new(meta.clone()),
        physical.clone(),
        changelog.clone(),
        config,
    );
    TestHarness {
        ctx,
        repository,
        meta,
        physical,
        changelog,
    }
}
