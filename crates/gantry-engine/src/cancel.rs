//! Supersede-on-trigger cancellation of runs.
//!
//! A new trigger for a ref cancels every still-active run of the same
//! pipeline and ref, unless the trigger is for the protected branch.
//! Runs owned by this process are torn down through their
//! [`CancellationToken`]; runs owned by another process are marked
//! cancelled in the state store and their owner receives `SIGTERM`, but
//! only while the owner is still a live gantry process. The owner answers
//! the signal with [`CancellationController::cancel_marked`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use gantry_state::{StateBackend, StateError};
use gantry_types::state::{PipelineId, RunId, RunStatus, TriggerEvent};
use tokio_util::sync::CancellationToken;

/// Message recorded on runs cancelled by a newer trigger.
pub const SUPERSEDED: &str = "superseded by a newer trigger";

/// A freshly created run and the token that cancels it.
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub run_id: RunId,
    pub token: CancellationToken,
}

pub struct CancellationController {
    state: Arc<dyn StateBackend>,
    owner_pid: u32,
    /// Serializes supersede-then-create so two triggers for one ref
    /// cannot both survive.
    trigger_lock: Mutex<()>,
    local: Mutex<HashMap<RunId, CancellationToken>>,
}

impl CancellationController {
    #[must_use]
    pub fn new(state: Arc<dyn StateBackend>) -> Self {
        Self::with_owner(state, std::process::id())
    }

    #[must_use]
    pub fn with_owner(state: Arc<dyn StateBackend>, owner_pid: u32) -> Self {
        Self {
            state,
            owner_pid,
            trigger_lock: Mutex::new(()),
            local: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> &Arc<dyn StateBackend> {
        &self.state
    }

    /// Handle a trigger: cancel superseded runs, then create the new run.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the state store cannot be read or written.
    pub fn on_trigger(
        &self,
        pipeline: &PipelineId,
        trigger: &TriggerEvent,
    ) -> Result<RunTicket, StateError> {
        let _guard = self
            .trigger_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if trigger.is_protected {
            tracing::info!(
                pipeline = %pipeline,
                git_ref = %trigger.git_ref,
                "Protected ref, earlier runs keep running"
            );
        } else {
            let git_ref = &trigger.git_ref;
            for prior in self.state.active_runs(pipeline, git_ref)? {
                if prior.is_protected {
                    continue;
                }
                tracing::info!(
                    pipeline = %pipeline,
                    git_ref = %git_ref,
                    run_id = prior.id,
                    owner_pid = prior.owner_pid,
                    "Superseding active run"
                );
                self.cancel_run(prior.id, SUPERSEDED)?;
            }
        }

        let run_id = self.state.create_run(pipeline, trigger, self.owner_pid)?;
        let token = CancellationToken::new();
        self.lock_local().insert(run_id, token.clone());
        tracing::info!(pipeline = %pipeline, git_ref = %trigger.git_ref, run_id, "Run created");
        Ok(RunTicket { run_id, token })
    }

    /// Cancel a run. Cancelling a terminal or unknown run is a no-op.
    ///
    /// Returns `true` if this call moved the run to `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the state store cannot be read or written.
    pub fn cancel_run(&self, run_id: RunId, reason: &str) -> Result<bool, StateError> {
        let Some(record) = self.state.get_run(run_id)? else {
            tracing::debug!(run_id, "Cancel requested for unknown run");
            return Ok(false);
        };
        if record.status.is_terminal() {
            tracing::debug!(run_id, status = %record.status, "Run already terminal");
            return Ok(false);
        }

        let applied = self
            .state
            .finish_run(run_id, RunStatus::Cancelled, Some(reason))?;

        let local = self.lock_local().get(&run_id).cloned();
        if let Some(token) = local {
            token.cancel();
        } else if applied && record.owner_pid != self.owner_pid {
            signal_owner(run_id, record.owner_pid);
        }
        Ok(applied)
    }

    /// Trip the tokens of local runs the state store already records as
    /// cancelled, typically by another process. Returns how many were
    /// tripped by this call.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the state store cannot be read.
    pub fn cancel_marked(&self) -> Result<usize, StateError> {
        let local: Vec<(RunId, CancellationToken)> = self
            .lock_local()
            .iter()
            .map(|(run_id, token)| (*run_id, token.clone()))
            .collect();
        let mut tripped = 0;
        for (run_id, token) in local {
            if token.is_cancelled() {
                continue;
            }
            let marked = self
                .state
                .get_run(run_id)?
                .is_some_and(|record| record.status == RunStatus::Cancelled);
            if marked {
                tracing::info!(run_id, "Run marked cancelled in state store, cancelling");
                token.cancel();
                tripped += 1;
            }
        }
        Ok(tripped)
    }

    /// Cancel every run owned by this process.
    pub fn cancel_all(&self) {
        for (run_id, token) in self.lock_local().iter() {
            tracing::info!(run_id = *run_id, "Cancelling run");
            token.cancel();
        }
    }

    /// Forget a finished run's token.
    pub fn complete(&self, run_id: RunId) {
        self.lock_local().remove(&run_id);
    }

    fn lock_local(&self) -> MutexGuard<'_, HashMap<RunId, CancellationToken>> {
        self.local
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Ask the process owning a run to tear it down.
fn signal_owner(run_id: RunId, owner_pid: u32) {
    let Ok(pid) = i32::try_from(owner_pid) else {
        return;
    };
    if pid <= 0 || !is_live_peer(pid) {
        tracing::warn!(
            run_id,
            owner_pid,
            "Run owner is gone or not a gantry process; marked cancelled only"
        );
        return;
    }
    // SAFETY: kill(2) with a positive pid signals exactly that process.
    let delivered = unsafe { libc::kill(pid, libc::SIGTERM) == 0 };
    if delivered {
        tracing::info!(run_id, owner_pid, "Sent SIGTERM to run owner");
    } else {
        tracing::warn!(run_id, owner_pid, "Run owner is gone; marked cancelled only");
    }
}

/// Whether `pid` is alive and runs the same executable as this process.
/// A pid recycled by an unrelated program after its owner crashed is not.
/// Without procfs only liveness can be checked.
fn is_live_peer(pid: i32) -> bool {
    // SAFETY: signal 0 performs the existence and permission checks only.
    if unsafe { libc::kill(pid, 0) } != 0 {
        return false;
    }
    let Ok(own) = std::fs::read_link("/proc/self/exe") else {
        return true;
    };
    std::fs::read_link(format!("/proc/{pid}/exe")).is_ok_and(|exe| exe == own)
}

#[cfg(test)]
mod tests {
    use gantry_state::SqliteStateBackend;

    use super::*;

    fn controller() -> CancellationController {
        CancellationController::new(Arc::new(SqliteStateBackend::in_memory().unwrap()))
    }

    fn pipeline() -> PipelineId {
        PipelineId::new("unit")
    }

    #[test]
    fn new_trigger_supersedes_active_run_on_same_ref() {
        let c = controller();
        let first = c
            .on_trigger(&pipeline(), &TriggerEvent::new("pr-7", "aaa", false))
            .unwrap();
        let second = c
            .on_trigger(&pipeline(), &TriggerEvent::new("pr-7", "bbb", false))
            .unwrap();

        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        let prior = c.state().get_run(first.run_id).unwrap().unwrap();
        assert_eq!(prior.status, RunStatus::Cancelled);
        assert_eq!(prior.error_message.as_deref(), Some(SUPERSEDED));
        let current = c.state().get_run(second.run_id).unwrap().unwrap();
        assert_eq!(current.status, RunStatus::Running);
    }

    #[test]
    fn other_refs_and_pipelines_are_untouched() {
        let c = controller();
        let a = c
            .on_trigger(&pipeline(), &TriggerEvent::new("pr-7", "aaa", false))
            .unwrap();
        let b = c
            .on_trigger(&PipelineId::new("integration"), &TriggerEvent::new("pr-7", "aaa", false))
            .unwrap();
        c.on_trigger(&pipeline(), &TriggerEvent::new("pr-8", "ccc", false))
            .unwrap();
        assert!(!a.token.is_cancelled());
        assert!(!b.token.is_cancelled());
    }

    #[test]
    fn protected_runs_are_never_superseded() {
        let c = controller();
        let tickets: Vec<_> = (0..3)
            .map(|i| {
                c.on_trigger(&pipeline(), &TriggerEvent::new("main", format!("c{i}"), true))
                    .unwrap()
            })
            .collect();
        for ticket in &tickets {
            assert!(!ticket.token.is_cancelled());
            let record = c.state().get_run(ticket.run_id).unwrap().unwrap();
            assert_eq!(record.status, RunStatus::Running);
        }
    }

    #[test]
    fn cancellation_is_idempotent() {
        let c = controller();
        let t = c
            .on_trigger(&pipeline(), &TriggerEvent::new("pr-1", "aaa", false))
            .unwrap();
        assert!(c.cancel_run(t.run_id, "manual").unwrap());
        assert!(!c.cancel_run(t.run_id, "manual").unwrap());
        assert!(!c.cancel_run(9_999, "manual").unwrap());

        c.state()
            .finish_run(t.run_id, RunStatus::Succeeded, None)
            .unwrap();
        let record = c.state().get_run(t.run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
    }

    #[test]
    fn cancelling_a_finished_run_is_a_no_op() {
        let c = controller();
        let t = c
            .on_trigger(&pipeline(), &TriggerEvent::new("pr-2", "aaa", false))
            .unwrap();
        c.state()
            .finish_run(t.run_id, RunStatus::Succeeded, None)
            .unwrap();
        assert!(!c.cancel_run(t.run_id, "manual").unwrap());
        assert!(!t.token.is_cancelled());
    }

    #[test]
    fn foreign_run_is_marked_cancelled() {
        let state: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        // Owner pid that cannot belong to a live process.
        let foreign = CancellationController::with_owner(Arc::clone(&state), u32::MAX);
        let old = foreign
            .on_trigger(&pipeline(), &TriggerEvent::new("pr-3", "aaa", false))
            .unwrap();

        let c = CancellationController::new(state);
        c.on_trigger(&pipeline(), &TriggerEvent::new("pr-3", "bbb", false))
            .unwrap();
        let record = c.state().get_run(old.run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
    }

    #[test]
    fn cancel_all_trips_every_local_token() {
        let c = controller();
        let a = c
            .on_trigger(&pipeline(), &TriggerEvent::new("pr-4", "a", false))
            .unwrap();
        let b = c
            .on_trigger(&pipeline(), &TriggerEvent::new("pr-5", "b", false))
            .unwrap();
        c.complete(b.run_id);
        c.cancel_all();
        assert!(a.token.is_cancelled());
        assert!(!b.token.is_cancelled());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn recycled_owner_pid_is_not_signalled() {
        let state: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        // A live process that is not gantry holds the crashed owner's pid.
        let mut unrelated = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let crashed = CancellationController::with_owner(Arc::clone(&state), unrelated.id());
        let stale = crashed
            .on_trigger(&pipeline(), &TriggerEvent::new("pr-6", "aaa", false))
            .unwrap();

        let c = CancellationController::new(state);
        c.on_trigger(&pipeline(), &TriggerEvent::new("pr-6", "bbb", false))
            .unwrap();
        let record = c.state().get_run(stale.run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);

        std::thread::sleep(std::time::Duration::from_millis(100));
        let still_running = unrelated.try_wait().unwrap().is_none();
        unrelated.kill().unwrap();
        let _ = unrelated.wait();
        assert!(still_running, "unrelated process was signalled");
    }

    #[test]
    fn own_pid_is_a_live_peer() {
        let pid = i32::try_from(std::process::id()).unwrap();
        assert!(is_live_peer(pid));
        assert!(!is_live_peer(i32::MAX));
    }

    #[test]
    fn cancel_marked_trips_only_runs_cancelled_in_the_store() {
        let c = controller();
        let unit = c
            .on_trigger(&pipeline(), &TriggerEvent::new("pr-7", "aaa", false))
            .unwrap();
        let integration = c
            .on_trigger(&PipelineId::new("integration"), &TriggerEvent::new("pr-7", "aaa", false))
            .unwrap();

        assert_eq!(c.cancel_marked().unwrap(), 0);
        // Another process superseded the unit run.
        c.state()
            .finish_run(unit.run_id, RunStatus::Cancelled, Some(SUPERSEDED))
            .unwrap();

        assert_eq!(c.cancel_marked().unwrap(), 1);
        assert!(unit.token.is_cancelled());
        assert!(!integration.token.is_cancelled());
        assert_eq!(c.cancel_marked().unwrap(), 0);
    }
}
