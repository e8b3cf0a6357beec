//! Create subscriber: define and start the branch's deploy job.

use std::sync::Arc;

use tracing::{error, info};

use super::{buildspec, run_step, JobNames, LifecycleError, Step, Submission};
use crate::bus::{BranchHandler, HandlerFuture};
use crate::config::ProvisioningConfig;
use crate::event::{BranchEvent, EventType};
use crate::resources::{BuildJobSpec, BuildResourceManager, JobArtifacts, JobSource, SourceKind};

pub struct BranchProvisioner {
    builds: Arc<dyn BuildResourceManager>,
    settings: Arc<ProvisioningConfig>,
}

impl BranchProvisioner {
    pub fn new(builds: Arc<dyn BuildResourceManager>, settings: Arc<ProvisioningConfig>) -> Self {
        Self { builds, settings }
    }

    /// Repository source for the branch. Names with an owner (`org/repo`)
    /// are GitHub repositories; bare names are CodeCommit repositories.
    fn source(&self, event: &BranchEvent) -> Result<JobSource, LifecycleError> {
        let Some(repository) = event
            .repository_name()
            .or(self.settings.default_repository.as_deref())
            .filter(|r| !r.trim().is_empty())
        else {
            error!(branch = event.branch(), "no repository to build from, not provisioning");
            return Err(LifecycleError::MissingRepository {
                branch: event.branch().to_string(),
            });
        };
        let version = Some(format!("refs/heads/{}", event.branch()));

        Ok(if repository.contains('/') {
            JobSource {
                kind: SourceKind::GitHub,
                location: format!("https://github.com/{repository}.git"),
                version,
            }
        } else {
            JobSource {
                kind: SourceKind::CodeCommit,
                location: format!(
                    "https://git-codecommit.{}.amazonaws.com/v1/repos/{repository}",
                    self.settings.region
                ),
                version,
            }
        })
    }

    pub fn job_spec(&self, event: &BranchEvent) -> Result<BuildJobSpec, LifecycleError> {
        let branch = event.branch();
        let names = JobNames::for_branch(&self.settings.prefix, branch);
        Ok(BuildJobSpec {
            description: "Build project to deploy branch resources".to_string(),
            source: self.source(event)?,
            build_script: buildspec::create_script(&self.settings, branch),
            artifacts: JobArtifacts::ObjectStore {
                bucket: self.settings.artifact_bucket.clone(),
                path: branch.to_string(),
                name: names.create.clone(),
            },
            service_role_arn: self.settings.service_role_arn.clone(),
            compute: self.settings.compute.clone(),
            name: names.create,
        })
    }

    /// Create the branch's deploy job and start it. Returns once started.
    ///
    /// A job with the same name left over from an earlier create fails the
    /// create call; that error is returned as is.
    pub async fn provision(&self, event: &BranchEvent) -> Result<Submission, LifecycleError> {
        if event.event_type() != EventType::Create {
            return Err(LifecycleError::WrongEventType {
                handler: "provisioner",
                actual: event.event_type(),
            });
        }

        let branch = event.branch();
        let spec = self.job_spec(event)?;
        info!(
            branch,
            job = %spec.name,
            repository = ?event.repository_name(),
            "provisioning branch"
        );

        run_step(Step::CreateJob, branch, &spec.name, self.builds.create_job(&spec)).await?;
        let run_id = run_step(Step::StartJob, branch, &spec.name, self.builds.start_job(&spec.name)).await?;

        info!(branch, job = %spec.name, run_id = %run_id, "branch provisioning submitted");
        Ok(Submission {
            branch: branch.to_string(),
            job_name: spec.name,
            run_id,
        })
    }
}

impl BranchHandler for BranchProvisioner {
    fn name(&self) -> &str {
        "provisioner"
    }

    fn handle<'a>(&'a self, event: &'a BranchEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.provision(event).await?;
            Ok(())
        })
    }
}
