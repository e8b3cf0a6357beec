//! Delete subscriber: tear down everything a branch left behind.
//!
//! Call order is fixed: create the destroy job, start it, delete the destroy
//! job definition, delete the create job definition. The destroy run keeps
//! going after its definition is deleted. With `direct_cleanup`, the
//! infrastructure stack and the artifact prefix are then deleted from here
//! instead of from the destroy script.

use std::sync::Arc;

use tracing::info;

use super::{buildspec, run_step, JobNames, LifecycleError, Step, Submission};
use crate::bus::{BranchHandler, HandlerFuture};
use crate::config::ProvisioningConfig;
use crate::event::{BranchEvent, EventType};
use crate::resources::{
    ArtifactStore, BuildJobSpec, BuildResourceManager, JobArtifacts, JobSource, SourceKind,
    StackManager,
};

pub struct BranchDecommissioner {
    builds: Arc<dyn BuildResourceManager>,
    stacks: Arc<dyn StackManager>,
    artifacts: Arc<dyn ArtifactStore>,
    settings: Arc<ProvisioningConfig>,
}

impl BranchDecommissioner {
    pub fn new(
        builds: Arc<dyn BuildResourceManager>,
        stacks: Arc<dyn StackManager>,
        artifacts: Arc<dyn ArtifactStore>,
        settings: Arc<ProvisioningConfig>,
    ) -> Self {
        Self {
            builds,
            stacks,
            artifacts,
            settings,
        }
    }

    pub fn job_spec(&self, branch: &str) -> BuildJobSpec {
        let names = JobNames::for_branch(&self.settings.prefix, branch);
        BuildJobSpec {
            description: "Build project to destroy branch resources".to_string(),
            source: JobSource {
                kind: SourceKind::ObjectStore,
                location: format!(
                    "{}/{branch}/{}/",
                    self.settings.artifact_bucket, names.create
                ),
                version: None,
            },
            build_script: buildspec::destroy_script(&self.settings, branch),
            artifacts: JobArtifacts::None,
            service_role_arn: self.settings.service_role_arn.clone(),
            compute: self.settings.compute.clone(),
            name: names.destroy,
        }
    }

    pub async fn decommission(&self, event: &BranchEvent) -> Result<Submission, LifecycleError> {
        if event.event_type() != EventType::Delete {
            return Err(LifecycleError::WrongEventType {
                handler: "decommissioner",
                actual: event.event_type(),
            });
        }

        let branch = event.branch();
        let names = JobNames::for_branch(&self.settings.prefix, branch);
        let spec = self.job_spec(branch);
        info!(
            branch,
            repository = ?event.repository_name(),
            destroy_job = %names.destroy,
            "decommissioning branch"
        );

        run_step(Step::CreateJob, branch, &names.destroy, self.builds.create_job(&spec)).await?;
        let run_id = run_step(
            Step::StartJob,
            branch,
            &names.destroy,
            self.builds.start_job(&names.destroy),
        )
        .await?;

        info!(branch, destroy_job = %names.destroy, create_job = %names.create, "deleting build jobs");
        run_step(Step::DeleteJob, branch, &names.destroy, self.builds.delete_job(&names.destroy)).await?;
        run_step(Step::DeleteJob, branch, &names.create, self.builds.delete_job(&names.create)).await?;

        if self.settings.direct_cleanup {
            let stack = buildspec::infrastructure_stack(&self.settings, branch);
            let bucket = &self.settings.artifact_bucket;
            run_step(Step::DeleteStack, branch, &stack, self.stacks.delete_stack(&stack)).await?;
            run_step(
                Step::DeletePrefix,
                branch,
                bucket,
                self.artifacts.delete_prefix(bucket, branch),
            )
            .await?;
        }

        info!(branch, run_id = %run_id, "branch decommissioning submitted");
        Ok(Submission {
            branch: branch.to_string(),
            job_name: names.destroy,
            run_id,
        })
    }
}

impl BranchHandler for BranchDecommissioner {
    fn name(&self) -> &str {
        "decommissioner"
    }

    fn handle<'a>(&'a self, event: &'a BranchEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.decommission(event).await?;
            Ok(())
        })
    }
}
