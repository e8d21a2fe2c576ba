//! Directly invoked actions.
//!
//! Besides parsed provider notifications, the entry point accepts four
//! direct actions: `build` (a fully specified descriptor), `rebuild` (re-run
//! a stored build), `version`, and `updateStatus` (the second terminal path
//! for container-delegated builds, invoked by the runner once the container
//! exits).

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::broadcast::{FinishedBuild, StatusBroadcaster};
use crate::config::{init_config, ConfigError, EffectiveConfig};
use crate::events::ActionEnvelope;
use crate::executor::{BuildError, BuildOutcome, Executor};
use crate::store::StoreError;
use crate::types::{
    BuildDescriptor, BuildNumber, BuildStatus, ProjectId, RecordError, RequestId,
};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("No build #{build_num} found for project {project}")]
    NotFound {
        project: ProjectId,
        build_num: BuildNumber,
    },

    #[error("updateStatus only accepts success or failure, got {0}")]
    NotTerminal(BuildStatus),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// What a completed action reports back to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Build(BuildOutcome),
    Version(String),
    /// Terminal status applied to a previously pending record.
    StatusUpdated(BuildNumber),
    /// The record was already terminal, nothing to do.
    StatusUnchanged(BuildNumber),
}

/// Runs one direct action to completion. `request_id` is the transport-level
/// id of this invocation; the `build` action carries its own inside the
/// descriptor.
pub async fn dispatch(
    executor: &Executor,
    action: ActionEnvelope,
    request_id: RequestId,
) -> Result<ActionOutcome, ActionError> {
    match action {
        ActionEnvelope::Build(descriptor) => {
            let outcome = executor.run_build(*descriptor).await?;
            Ok(ActionOutcome::Build(outcome))
        }
        ActionEnvelope::Rebuild { project, build_num } => {
            rebuild(executor, project, build_num, request_id).await
        }
        ActionEnvelope::Version => Ok(ActionOutcome::Version(
            env!("CARGO_PKG_VERSION").to_string(),
        )),
        ActionEnvelope::UpdateStatus {
            project,
            build_num,
            status,
        } => update_status(executor, project, build_num, status, request_id).await,
    }
}

/// Re-runs a stored build as a fresh one: new request id, new build number,
/// full clone history.
async fn rebuild(
    executor: &Executor,
    project: ProjectId,
    build_num: BuildNumber,
    request_id: RequestId,
) -> Result<ActionOutcome, ActionError> {
    let record = executor
        .store
        .get_build(&project, build_num)
        .await?
        .ok_or_else(|| ActionError::NotFound {
            project: project.clone(),
            build_num,
        })?;

    let descriptor = BuildDescriptor::from_record(&record, request_id, true)?;
    info!(project = %project, original = build_num.0, "rebuilding stored build");
    let outcome = executor.run_build(descriptor).await?;
    Ok(ActionOutcome::Build(outcome))
}

/// Completes a build whose record is still pending because the build itself
/// ran elsewhere. Rebuilds the notifier set from stored config (the clone is
/// long gone, so repository file overrides cannot apply) and fires the same
/// finish broadcast an in-process build would have produced.
async fn update_status(
    executor: &Executor,
    project: ProjectId,
    build_num: BuildNumber,
    status: BuildStatus,
    request_id: RequestId,
) -> Result<ActionOutcome, ActionError> {
    if status.is_pending() {
        return Err(ActionError::NotTerminal(status));
    }

    let config_keys = ["global".to_string(), project.as_str().to_string()];
    let (record, stored) = tokio::join!(
        executor.store.get_build(&project, build_num),
        executor.store.get_configs(&config_keys),
    );
    let record = record?.ok_or_else(|| ActionError::NotFound {
        project: project.clone(),
        build_num,
    })?;
    if !record.status.is_pending() {
        info!(
            project = %project,
            build = build_num.0,
            status = record.status.as_str(),
            "status update ignored, record already terminal"
        );
        return Ok(ActionOutcome::StatusUnchanged(build_num));
    }

    let mut descriptor = BuildDescriptor::from_record(&record, request_id, false)?;
    descriptor.build_num = build_num;

    let config = init_config(&stored?, &descriptor);
    let view = EffectiveConfig::from_value(&config)?;

    let log_url = executor.log_sink.location(&project, build_num);
    let mut broadcaster = StatusBroadcaster::new();
    executor.attach_notifiers(&mut broadcaster, &descriptor, &view, &log_url, false);
    executor.attach_store_update(&mut broadcaster);

    let build = FinishedBuild {
        descriptor,
        status,
        ended_at: Utc::now(),
        error: None,
        log_tail: String::new(),
    };
    info!(
        project = %project,
        build = build_num.0,
        status = status.as_str(),
        "delegated build finished"
    );
    broadcaster.broadcast_finish(Arc::new(build)).await;
    Ok(ActionOutcome::StatusUpdated(build_num))
}
