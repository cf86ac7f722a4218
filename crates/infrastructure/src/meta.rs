//! 进程内元数据存储与协作方实现
//!
//! `InMemoryMetaStore` 提供带暂存提交语义的元数据事务；
//! `TracingPhysicalExecutor` / `TracingChangeLogSink` 只记录日志，
//! 用于嵌入式运行和演示。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use ddl_core::DdlResult;
use ddl_domain::{
    AddMetaSpec, BackfillSpec, ChangeLogSink, MetaStore, MetaTransaction, MetaWrite,
    PhysicalDdlExecutor, TableVisibility,
};

#[derive(Debug, Clone)]
pub struct TableGroupMeta {
    /// 成员表 -> 版本
    pub tables: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
struct MetaState {
    /// (schema, 表组) -> 表组元数据
    table_groups: BTreeMap<(String, String), TableGroupMeta>,
    /// (schema, 物理分组)
    physical_groups: BTreeSet<(String, String)>,
    /// (schema, 对象) -> 登记的重组/索引元数据
    registered: BTreeMap<(String, String), AddMetaSpec>,
    /// (schema, 对象) -> 可见性
    visibility: BTreeMap<(String, String), TableVisibility>,
    /// 已提交写操作的审计流水
    journal: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryMetaStore {
    state: Arc<RwLock<MetaState>>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 测试/演示用：登记一个表组及其成员表版本
    pub fn register_table_group(
        &self,
        schema_name: &str,
        table_group: &str,
        tables: BTreeMap<String, i64>,
    ) {
        let mut state = self.state.write().unwrap();
        state.table_groups.insert(
            (schema_name.to_string(), table_group.to_string()),
            TableGroupMeta { tables },
        );
    }

    pub fn register_physical_group(&self, schema_name: &str, group: &str) {
        let mut state = self.state.write().unwrap();
        state
            .physical_groups
            .insert((schema_name.to_string(), group.to_string()));
    }

    /// 已提交写操作的审计流水（按提交顺序）
    pub fn journal(&self) -> Vec<String> {
        self.state.read().unwrap().journal.clone()
    }

    pub fn registered_meta(&self, schema_name: &str, object_name: &str) -> Option<AddMetaSpec> {
        self.state
            .read()
            .unwrap()
            .registered
            .get(&(schema_name.to_string(), object_name.to_string()))
            .cloned()
    }
}

struct InMemoryMetaTransaction {
    state: Arc<RwLock<MetaState>>,
    staged: Vec<(String, MetaWrite)>,
}

#[async_trait]
impl MetaTransaction for InMemoryMetaTransaction {
    async fn apply(&mut self, schema_name: &str, write: &MetaWrite) -> DdlResult<()> {
        self.staged.push((schema_name.to_string(), write.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DdlResult<()> {
        let mut state = self.state.write().unwrap();
        for (schema, write) in self.staged {
            match write {
                MetaWrite::AddMeta(spec) => {
                    let object = spec.object_name().to_string();
                    state.journal.push(format!("ADD_META {schema}.{object}"));
                    state.registered.insert((schema.clone(), object), spec);
                }
                MetaWrite::RemoveMeta(spec) => {
                    let object = spec.object_name().to_string();
                    state.journal.push(format!("REMOVE_META {schema}.{object}"));
                    state.registered.remove(&(schema.clone(), object));
                }
                MetaWrite::SetVisibility {
                    object_name,
                    target,
                } => {
                    state.journal.push(format!(
                        "SET_VISIBILITY {schema}.{object_name} {}",
                        target.as_str()
                    ));
                    state.visibility.insert((schema, object_name), target);
                }
            }
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> DdlResult<()> {
        debug!("丢弃 {} 条未提交的元数据写入", self.staged.len());
        Ok(())
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn begin(&self) -> DdlResult<Box<dyn MetaTransaction>> {
        Ok(Box::new(InMemoryMetaTransaction {
            state: self.state.clone(),
            staged: Vec::new(),
        }))
    }

    async fn tables_version(
        &self,
        schema_name: &str,
        table_group: &str,
    ) -> DdlResult<Option<BTreeMap<String, i64>>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .table_groups
            .get(&(schema_name.to_string(), table_group.to_string()))
            .map(|meta| meta.tables.clone()))
    }

    async fn table_group_member_count(
        &self,
        schema_name: &str,
        table_group: &str,
    ) -> DdlResult<Option<usize>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .table_groups
            .get(&(schema_name.to_string(), table_group.to_string()))
            .map(|meta| meta.tables.len()))
    }

    async fn physical_group_exists(&self, schema_name: &str, group: &str) -> DdlResult<bool> {
        Ok(self
            .state
            .read()
            .unwrap()
            .physical_groups
            .contains(&(schema_name.to_string(), group.to_string())))
    }

    async fn visibility(
        &self,
        schema_name: &str,
        object_name: &str,
    ) -> DdlResult<Option<TableVisibility>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .visibility
            .get(&(schema_name.to_string(), object_name.to_string()))
            .copied())
    }
}

/// 只打日志的物理执行器，嵌入式运行用
#[derive(Debug, Default)]
pub struct TracingPhysicalExecutor;

#[async_trait]
impl PhysicalDdlExecutor for TracingPhysicalExecutor {
    async fn execute_statement(
        &self,
        schema_name: &str,
        phy_group: &str,
        phy_table: &str,
        statement: &str,
    ) -> DdlResult<()> {
        info!(
            "物理DDL: schema={}, group={}, table={}, statement={}",
            schema_name, phy_group, phy_table, statement
        );
        Ok(())
    }

    async fn copy_rows(&self, schema_name: &str, spec: &BackfillSpec) -> DdlResult<u64> {
        info!(
            "回填: schema={}, table={}, {:?} -> {:?}",
            schema_name, spec.table_name, spec.source_partitions, spec.target_partitions
        );
        Ok(0)
    }

    async fn purge_rows(
        &self,
        schema_name: &str,
        table_name: &str,
        target_partitions: &[String],
    ) -> DdlResult<u64> {
        info!(
            "清除回填数据: schema={}, table={}, partitions={:?}",
            schema_name, table_name, target_partitions
        );
        Ok(0)
    }
}

/// 只打日志的变更通知实现
#[derive(Debug, Default)]
pub struct TracingChangeLogSink;

#[async_trait]
impl ChangeLogSink for TracingChangeLogSink {
    async fn mark_ddl(&self, schema_name: &str, object_name: &str, mark: &str) -> DdlResult<()> {
        info!(
            "变更通知: schema={}, object={}, mark={}",
            schema_name, object_name, mark
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_applies_staged_writes() {
        let store = InMemoryMetaStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.apply(
            "d1",
            &MetaWrite::AddMeta(AddMetaSpec::PartitionReorg {
                table_group: "tg1".to_string(),
                outdated_partitions: vec!["p1".to_string()],
                invisible_partition_groups: vec![],
            }),
        )
        .await
        .unwrap();
        txn.commit().await.unwrap();

        assert!(store.registered_meta("d1", "tg1").is_some());
        assert_eq!(store.journal(), vec!["ADD_META d1.tg1"]);
    }

    #[tokio::test]
    async fn test_abort_discards_staged_writes() {
        let store = InMemoryMetaStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.apply(
            "d1",
            &MetaWrite::SetVisibility {
                object_name: "tg1".to_string(),
                target: TableVisibility::Public,
            },
        )
        .await
        .unwrap();
        txn.abort().await.unwrap();

        assert!(store.visibility("d1", "tg1").await.unwrap().is_none());
        assert!(store.journal().is_empty());
    }
}
