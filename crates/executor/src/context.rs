use std::sync::Arc;

use ddl_core::ExecutorConfig;
use ddl_domain::{ChangeLogSink, JobRepository, MetaStore, PhysicalDdlExecutor};

use crate::admission::AdmissionGate;

/// 一次引擎实例的执行上下文
///
/// 所有协作方显式注入，生命周期与进程一致；不存在线程局部或
/// 静态单例。
pub struct EngineContext {
    pub repository: Arc<dyn JobRepository>,
    pub meta: Arc<dyn MetaStore>,
    pub physical: Arc<dyn PhysicalDdlExecutor>,
    pub changelog: Arc<dyn ChangeLogSink>,
    pub admission: Arc<AdmissionGate>,
    pub config: ExecutorConfig,
}

impl EngineContext {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        meta: Arc<dyn MetaStore>,
        physical: Arc<dyn PhysicalDdlExecutor>,
        changelog: Arc<dyn ChangeLogSink>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            repository,
            meta,
            physical,
            changelog,
            admission: Arc::new(AdmissionGate::new()),
            config,
        })
    }
}
