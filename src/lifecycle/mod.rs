//! Per-branch resource lifecycle: provisioning on create, teardown on delete.
//!
//! Both handlers are fire-and-forget: they return a [`Submission`] once the
//! build job has been started, never waiting for the run to finish. Every
//! external failure is logged with the branch, job, and step, then returned
//! unchanged; retries are the caller's business.

pub mod buildspec;
pub mod decommissioner;
pub mod provisioner;

use std::fmt;
use std::future::Future;

use serde::Serialize;
use tracing::error;

use crate::event::EventType;
use crate::resources::ResourceError;

pub use decommissioner::BranchDecommissioner;
pub use provisioner::BranchProvisioner;

/// Deterministic build job names for one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNames {
    pub create: String,
    pub destroy: String,
}

impl JobNames {
    pub fn for_branch(prefix: &str, branch: &str) -> Self {
        Self {
            create: format!("{prefix}-{branch}-create"),
            destroy: format!("{prefix}-{branch}-destroy"),
        }
    }
}

/// A build run that has been submitted. Completion is never observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub branch: String,
    pub job_name: String,
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreateJob,
    StartJob,
    DeleteJob,
    DeleteStack,
    DeletePrefix,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::CreateJob => "create_job",
            Step::StartJob => "start_job",
            Step::DeleteJob => "delete_job",
            Step::DeleteStack => "delete_stack",
            Step::DeletePrefix => "delete_prefix",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{step} failed for '{target}' (branch '{branch}'): {source}")]
    Resource {
        step: Step,
        branch: String,
        target: String,
        #[source]
        source: ResourceError,
    },
    #[error("no repository for branch '{branch}' and no default_repository configured")]
    MissingRepository { branch: String },
    #[error("{handler} received a {actual} event")]
    WrongEventType {
        handler: &'static str,
        actual: EventType,
    },
}

/// Await one external call, logging and wrapping its failure.
async fn run_step<T>(
    step: Step,
    branch: &str,
    target: &str,
    call: impl Future<Output = Result<T, ResourceError>>,
) -> Result<T, LifecycleError> {
    call.await.map_err(|source| {
        error!(branch, target, step = %step, error = %source, "resource call failed");
        LifecycleError::Resource {
            step,
            branch: branch.to_string(),
            target: target.to_string(),
            source,
        }
    })
}
