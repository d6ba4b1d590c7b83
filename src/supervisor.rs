//! Top-level poller: diffs each discovery snapshot against the registry and
//! hands entities to workers.

use std::{future::Future, sync::Arc, time::Duration};

use nix::sys::signal::Signal;
use tokio::time::MissedTickBehavior;

use crate::{
    discovery::Discovery,
    runnable::{Discovered, Runnable, RunnableId},
    runner::{
        RunOutcome, Runner,
        fallback::{Decision, decide},
        ledger,
        terminate::{KillScheduler, kill_sentinel_path, signal_process},
    },
    state::{Implementation, ManagedEntity, Registry},
};

#[derive(Debug)]
pub struct Supervisor {
    discovery: Discovery,
    registry: Arc<Registry>,
    runner: Arc<Runner>,
    killer: KillScheduler,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(
        discovery: Discovery,
        runner: Arc<Runner>,
        killer: KillScheduler,
        poll_interval: Duration,
    ) -> Self {
        Self {
            discovery,
            registry: Arc::new(Registry::new()),
            runner,
            killer,
            poll_interval,
        }
    }

    /// Polls until `shutdown` resolves. Running children are left alone.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            units = %self.discovery.layout().units_dir().display(),
            interval_secs = self.poll_interval.as_secs_f64(),
            "supervisor loop started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested; leaving children running");
                    break;
                }
                _ = ticker.tick() => self.poll_once().await,
            }
        }
    }

    pub async fn poll_once(&self) {
        let discovery = self.discovery.clone();
        let found = match tokio::task::spawn_blocking(move || discovery.scan()).await {
            Ok(found) => found,
            Err(error) => {
                tracing::error!(%error, "discovery task failed");
                return;
            }
        };
        tracing::debug!(
            found = found.len(),
            registered = self.registry.len().await,
            "discovery cycle"
        );
        for (id, discovered) in found {
            self.reconcile(id, discovered).await;
        }
    }

    async fn reconcile(&self, id: RunnableId, discovered: Discovered) {
        let entity = match self.registry.get(&id).await {
            Some(entity) => entity,
            None => {
                let (entity, inserted) = self.registry.insert(ManagedEntity::new(&discovered)).await;
                if inserted && entity.claim_new() {
                    tracing::info!(
                        runnable = %discovered.current().name,
                        kind = discovered.current().kind.process_type(),
                        path = %id.display(),
                        "new runnable detected"
                    );
                    self.launch(entity, Implementation::Current, discovered.current().clone());
                    return;
                }
                entity
            }
        };

        match entity.try_claim(&discovered) {
            Some(previous) => {
                let decision = decide(&previous, &discovered);
                tracing::debug!(runnable = %previous.name, %decision, "reconciling idle runnable");
                self.apply(entity, decision, &discovered);
            }
            None => self.check_termination(&entity),
        }
    }

    fn apply(&self, entity: Arc<ManagedEntity>, decision: Decision, discovered: &Discovered) {
        let current = discovered.current();
        match (decision, discovered.origin()) {
            (Decision::StartCurrent, _) => {
                self.launch(entity, Implementation::Current, current.clone())
            }
            (Decision::RestartOrigin, Some(origin)) => {
                self.launch(entity, Implementation::Origin, origin.clone())
            }
            (Decision::FallbackToOrigin, Some(origin)) => {
                tracing::warn!(runnable = %current.name, "falling back to origin");
                for runnable in [current, origin] {
                    if let Err(error) = ledger::reset(runnable) {
                        tracing::warn!(%error, runnable = %runnable.name, "failed to reset restart counters");
                    }
                }
                self.launch(entity, Implementation::Origin, origin.clone())
            }
            (Decision::ParkDummy, _) => self.park(entity, current.clone()),
            (Decision::RestartOrigin | Decision::FallbackToOrigin, None) => {
                tracing::debug!(runnable = %current.name, "origin vanished; releasing claim");
                entity.finish();
            }
        }
    }

    fn launch(&self, entity: Arc<ManagedEntity>, implementation: Implementation, runnable: Runnable) {
        entity.activate(implementation);
        let runner = self.runner.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            match runner.start_and_retry(&entity, runnable).await {
                RunOutcome::Idle => entity.finish(),
                RunOutcome::TornDown => {
                    registry.remove(entity.id()).await;
                    entity.finish();
                }
            }
        });
    }

    fn park(&self, entity: Arc<ManagedEntity>, runnable: Runnable) {
        let runner = self.runner.clone();
        tokio::spawn(async move {
            runner.watch_dummy(&entity, &runnable).await;
        });
    }

    /// Honours a kill request for a running entity.
    fn check_termination(&self, entity: &ManagedEntity) {
        let state = entity.snapshot();
        if state.parked {
            tracing::trace!(runnable = %state.name, "parked; waiting for placeholder removal");
            return;
        }
        let Some(pid) = state.pid else {
            return;
        };
        let sentinel = kill_sentinel_path(&state);
        if !matches!(sentinel.try_exists(), Ok(true)) {
            return;
        }

        // Killing an origin only ends the fallback; the addon itself stays.
        if !state.is_running_origin() {
            entity.mark_stopping();
        }
        tracing::info!(
            runnable = %state.name,
            pid,
            path = %sentinel.display(),
            "kill requested; sending SIGTERM"
        );
        if let Err(error) = signal_process(pid, Signal::SIGTERM) {
            tracing::warn!(%error, runnable = %state.name, pid, "failed to send SIGTERM");
        }
        self.killer.schedule(pid);
    }
}
