//! State backend trait definition.
//!
//! [`StateBackend`] defines the storage contract for run records and
//! instance records. Model types live in [`gantry_types::state`].

use gantry_types::state::{
    InstanceRecord, PipelineId, RefName, RunId, RunRecord, RunStatus, TriggerEvent,
};

use crate::error;

/// Query filter for [`StateBackend::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub pipeline: Option<PipelineId>,
    pub git_ref: Option<RefName>,
    /// Maximum number of rows, newest first.
    pub limit: Option<u32>,
}

/// Storage contract for run history.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
/// Terminal statuses are sticky: once a run or instance is cancelled,
/// succeeded or failed, later status writes for it are ignored.
pub trait StateBackend: Send + Sync {
    /// Record a new run in `running` state and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn create_run(
        &self,
        pipeline: &PipelineId,
        trigger: &TriggerEvent,
        owner_pid: u32,
    ) -> error::Result<RunId>;

    /// Fetch a run by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_run(&self, run_id: RunId) -> error::Result<Option<RunRecord>>;

    /// Runs for `(pipeline, git_ref)` that are still pending or running.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn active_runs(
        &self,
        pipeline: &PipelineId,
        git_ref: &RefName,
    ) -> error::Result<Vec<RunRecord>>;

    /// Move a run to `status` unless it is already terminal.
    ///
    /// Returns `true` if the transition was applied and `false` if the run
    /// was already terminal (or does not exist).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> error::Result<bool>;

    /// List runs matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_runs(&self, filter: &RunFilter) -> error::Result<Vec<RunRecord>>;

    /// Insert or update an instance row, never overwriting a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn record_instance(&self, record: &InstanceRecord) -> error::Result<()>;

    /// All instances of a run in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_instances(&self, run_id: RunId) -> error::Result<Vec<InstanceRecord>>;
}
