//! 准入门：作业级资源互斥
//!
//! 两张作业图并发运行的前提是二者的排除资源集不相交。检查与预留在
//! 同一个临界区内完成，因此准入是无竞态的；锁只在准入时刻检查一次，
//! 不存在增量加锁，也就不存在死锁。子作业在父作业的预约之下准入，
//! 与祖先链不互斥。

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use tracing::debug;

use ddl_core::{DdlEngineError, DdlResult};

#[derive(Debug)]
struct Reservation {
    schema_name: String,
    resources: BTreeSet<String>,
    parent: Option<u64>,
}

#[derive(Debug, Default)]
struct AdmissionState {
    next_ticket: u64,
    reservations: HashMap<u64, Reservation>,
}

#[derive(Debug, Default)]
pub struct AdmissionGate {
    inner: Mutex<AdmissionState>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AdmissionState {
                next_ticket: 1,
                reservations: HashMap::new(),
            }),
        }
    }

    /// 准入一个新作业：排除资源与所有在运行作业不相交才放行
    pub fn admit(&self, schema_name: &str, resources: &BTreeSet<String>) -> DdlResult<u64> {
        let mut state = self.inner.lock().unwrap();

        Self::check_conflict(&state, schema_name, resources, &BTreeSet::new())?;
        let ticket = Self::reserve(&mut state, schema_name, resources, None);
        debug!(
            "作业准入成功: ticket={}, schema={}, resources={:?}",
            ticket, schema_name, resources
        );
        Ok(ticket)
    }

    /// 在父作业预约之下准入子作业
    ///
    /// `parent_acquire_resource = true` 时子作业必须完全落在祖先链
    /// 已持有的资源内；`false` 时允许额外申请，额外部分按常规冲突
    /// 检查处理。
    pub fn admit_sub_job(
        &self,
        parent_ticket: u64,
        schema_name: &str,
        resources: &BTreeSet<String>,
        parent_acquire_resource: bool,
    ) -> DdlResult<u64> {
        let mut state = self.inner.lock().unwrap();

        if !state.reservations.contains_key(&parent_ticket) {
            return Err(DdlEngineError::Internal(format!(
                "父作业预约 {parent_ticket} 不存在"
            )));
        }
        let ancestors = Self::ancestor_chain(&state, parent_ticket);
        let inherited: BTreeSet<String> = ancestors
            .iter()
            .flat_map(|t| state.reservations[t].resources.iter().cloned())
            .collect();

        let extra: BTreeSet<String> = resources.difference(&inherited).cloned().collect();
        if parent_acquire_resource && !extra.is_empty() {
            return Err(DdlEngineError::ResourceConflict(format!(
                "子作业申请了父作业未持有的资源 {extra:?}，\
                 如确需额外资源请关闭 parent_acquire_resource"
            )));
        }
        Self::check_conflict(&state, schema_name, resources, &ancestors)?;

        let ticket = Self::reserve(&mut state, schema_name, resources, Some(parent_ticket));
        debug!(
            "子作业准入成功: ticket={}, parent={}, resources={:?}",
            ticket, parent_ticket, resources
        );
        Ok(ticket)
    }

    pub fn release(&self, ticket: u64) {
        let mut state = self.inner.lock().unwrap();
        if state.reservations.remove(&ticket).is_some() {
            debug!("释放资源预约: ticket={}", ticket);
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().reservations.len()
    }

    fn reserve(
        state: &mut AdmissionState,
        schema_name: &str,
        resources: &BTreeSet<String>,
        parent: Option<u64>,
    ) -> u64 {
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.reservations.insert(
            ticket,
            Reservation {
                schema_name: schema_name.to_string(),
                resources: resources.clone(),
                parent,
            },
        );
        ticket
    }

    fn check_conflict(
        state: &AdmissionState,
        schema_name: &str,
        resources: &BTreeSet<String>,
        exempt: &BTreeSet<u64>,
    ) -> DdlResult<()> {
        for (ticket, reservation) in &state.reservations {
            if exempt.contains(ticket) || reservation.schema_name != schema_name {
                continue;
            }
            let overlap: Vec<&String> = reservation
                .resources
                .intersection(resources)
                .collect();
            if !overlap.is_empty() {
                return Err(DdlEngineError::ResourceConflict(format!(
                    "资源 {overlap:?} 已被运行中的作业持有"
                )));
            }
        }
        Ok(())
    }

    fn ancestor_chain(state: &AdmissionState, ticket: u64) -> BTreeSet<u64> {
        let mut chain = BTreeSet::new();
        let mut current = Some(ticket);
        while let Some(t) = current {
            if !chain.insert(t) {
                break;
            }
            current = state.reservations.get(&t).and_then(|r| r.parent);
        }
        chain
    }
}
