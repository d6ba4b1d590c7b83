//! In-memory state tracking for the supervisor.

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::runnable::{Discovered, Runnable, RunnableId};

/// Which implementation of an entity is (or was last) running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Implementation {
    #[default]
    Current,
    Origin,
}

#[derive(Debug, Clone)]
pub struct EntityState {
    pub name: String,
    pub is_addon: bool,
    /// Claimed by a worker, either running a process or parked.
    pub running: bool,
    /// A kill request was honoured; the run ends with teardown.
    pub stopping: bool,
    /// Waiting for an operator to remove the dummy placeholder.
    pub parked: bool,
    /// Exit code of the last run, `-1` for signals and spawn failures.
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub active: Implementation,
    pub current: Runnable,
    pub origin: Option<Runnable>,
    /// Start-script timestamp seen by the last reconciliation.
    pub observed_current: Option<SystemTime>,
}

impl EntityState {
    fn new(discovered: &Discovered) -> Self {
        let current = discovered.current().clone();
        Self {
            name: current.name.clone(),
            is_addon: discovered.is_addon(),
            running: false,
            stopping: false,
            parked: false,
            exit_code: None,
            pid: None,
            active: Implementation::Current,
            observed_current: current.modified,
            origin: discovered.origin().cloned(),
            current,
        }
    }

    /// Runnable for the active implementation. Falls back to the current
    /// one if the origin disappeared from the snapshot.
    pub fn active_runnable(&self) -> &Runnable {
        match (self.active, &self.origin) {
            (Implementation::Origin, Some(origin)) => origin,
            _ => &self.current,
        }
    }

    pub fn is_running_origin(&self) -> bool {
        self.is_addon && self.active == Implementation::Origin
    }

    fn refresh(&mut self, discovered: &Discovered) {
        self.current = discovered.current().clone();
        self.origin = discovered.origin().cloned();
    }

    fn observe_timestamp(&mut self, discovered: &Discovered) {
        self.observed_current = discovered.current().modified;
    }
}

/// Live view of one runnable identity. The mutex is only ever held for
/// short synchronous sections.
#[derive(Debug)]
pub struct ManagedEntity {
    id: RunnableId,
    state: Mutex<EntityState>,
}

impl ManagedEntity {
    pub fn new(discovered: &Discovered) -> Self {
        Self {
            id: discovered.id().clone(),
            state: Mutex::new(EntityState::new(discovered)),
        }
    }

    pub fn id(&self) -> &RunnableId {
        &self.id
    }

    pub fn snapshot(&self) -> EntityState {
        self.state.lock().clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.state.lock().stopping
    }

    /// Marks a freshly registered entity as claimed by its first worker.
    pub fn claim_new(&self) -> bool {
        let mut state = self.state.lock();
        if state.running {
            return false;
        }
        state.running = true;
        true
    }

    /// Refreshes the snapshots and, if the entity is idle, claims it. The
    /// returned state still carries the previously observed timestamps so
    /// the caller can tell whether the start script changed.
    pub fn try_claim(&self, discovered: &Discovered) -> Option<EntityState> {
        let mut state = self.state.lock();
        state.refresh(discovered);
        if state.running {
            return None;
        }
        let before = state.clone();
        state.observe_timestamp(discovered);
        state.running = true;
        Some(before)
    }

    pub fn activate(&self, implementation: Implementation) {
        self.state.lock().active = implementation;
    }

    pub fn begin_attempt(&self) {
        let mut state = self.state.lock();
        state.stopping = false;
        state.exit_code = Some(-1);
        state.pid = None;
    }

    pub fn record_pid(&self, pid: u32) {
        self.state.lock().pid = Some(pid);
    }

    pub fn clear_pid(&self) {
        self.state.lock().pid = None;
    }

    pub fn mark_stopping(&self) {
        self.state.lock().stopping = true;
    }

    pub fn record_exit(&self, code: i32) {
        self.state.lock().exit_code = Some(code);
    }

    pub fn park(&self) {
        let mut state = self.state.lock();
        state.running = true;
        state.parked = true;
        state.exit_code = None;
        state.pid = None;
    }

    /// The placeholder is gone; a zero exit code sends the next poll back
    /// to the current implementation.
    pub fn resume_after_dummy(&self) {
        let mut state = self.state.lock();
        state.parked = false;
        state.running = false;
        state.exit_code = Some(0);
    }

    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.pid = None;
    }
}

/// Managed entities keyed by identity.
#[derive(Debug, Default)]
pub struct Registry {
    entities: RwLock<HashMap<RunnableId, Arc<ManagedEntity>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &RunnableId) -> Option<Arc<ManagedEntity>> {
        self.entities.read().await.get(id).cloned()
    }

    /// Registers a new entity unless the identity is already known, and
    /// returns whichever entity is registered afterwards.
    pub async fn insert(&self, entity: ManagedEntity) -> (Arc<ManagedEntity>, bool) {
        let mut entities = self.entities.write().await;
        if let Some(existing) = entities.get(entity.id()) {
            return (existing.clone(), false);
        }
        let entity = Arc::new(entity);
        entities.insert(entity.id().clone(), entity.clone());
        (entity, true)
    }

    pub async fn remove(&self, id: &RunnableId) -> Option<Arc<ManagedEntity>> {
        self.entities.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        path::PathBuf,
        time::{Duration, UNIX_EPOCH},
    };

    use crate::runnable::{RunnableConfig, RunnableKind};

    fn addon(modified: u64) -> Discovered {
        let runnable = |kind, run_dir: &str| Runnable {
            id: PathBuf::from("/u/addons/web/web.start"),
            name: "web".to_string(),
            kind,
            start_path: PathBuf::from("/u/addons/web/web.start"),
            stop_path: None,
            config_path: None,
            modified: Some(UNIX_EPOCH + Duration::from_secs(modified)),
            run_dir: PathBuf::from(run_dir),
            config: RunnableConfig::default(),
        };
        Discovered::Addon {
            current: runnable(RunnableKind::Addon, "/r/addons/web"),
            origin: Some(runnable(RunnableKind::Origin, "/r/origins/web")),
        }
    }

    #[test]
    fn claim_is_exclusive() {
        let discovered = addon(1);
        let entity = ManagedEntity::new(&discovered);
        assert!(entity.claim_new());
        assert!(!entity.claim_new());
        assert!(entity.try_claim(&discovered).is_none());

        entity.finish();
        assert!(entity.try_claim(&discovered).is_some());
        assert!(entity.try_claim(&discovered).is_none());
    }

    #[test]
    fn claim_reports_previous_timestamps() {
        let entity = ManagedEntity::new(&addon(1));
        let before = entity.try_claim(&addon(2)).expect("idle entity");
        assert_eq!(before.observed_current, Some(UNIX_EPOCH + Duration::from_secs(1)));
        assert_eq!(before.current.modified, Some(UNIX_EPOCH + Duration::from_secs(2)));
        assert_eq!(
            entity.snapshot().observed_current,
            Some(UNIX_EPOCH + Duration::from_secs(2))
        );
    }

    #[test]
    fn active_runnable_follows_implementation() {
        let entity = ManagedEntity::new(&addon(1));
        assert_eq!(entity.snapshot().active_runnable().run_dir, PathBuf::from("/r/addons/web"));
        entity.activate(Implementation::Origin);
        let state = entity.snapshot();
        assert!(state.is_running_origin());
        assert_eq!(state.active_runnable().run_dir, PathBuf::from("/r/origins/web"));
    }

    #[test]
    fn dummy_park_and_resume() {
        let entity = ManagedEntity::new(&addon(1));
        entity.begin_attempt();
        entity.record_exit(1);
        entity.park();
        let parked = entity.snapshot();
        assert!(parked.running && parked.parked);
        assert_eq!(parked.exit_code, None);

        entity.resume_after_dummy();
        let resumed = entity.snapshot();
        assert!(!resumed.running && !resumed.parked);
        assert_eq!(resumed.exit_code, Some(0));
    }

    #[tokio::test]
    async fn registry_keeps_first_entity() {
        let registry = Registry::new();
        let (first, inserted) = registry.insert(ManagedEntity::new(&addon(1))).await;
        assert!(inserted);
        first.claim_new();
        let (second, inserted) = registry.insert(ManagedEntity::new(&addon(2))).await;
        assert!(!inserted);
        assert!(second.snapshot().running);
        assert_eq!(registry.len().await, 1);

        registry.remove(first.id()).await;
        assert!(registry.get(first.id()).await.is_none());
    }
}
