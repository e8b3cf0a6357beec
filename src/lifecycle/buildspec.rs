//! Build scripts (buildspec YAML) for the per-branch jobs.

use crate::config::ProvisioningConfig;

/// Stack holding the branch's application, deployed by the create job.
pub fn application_stack(settings: &ProvisioningConfig, branch: &str) -> String {
    format!("{}-{branch}", settings.stack_prefix)
}

/// Infrastructure stack removed on teardown.
pub fn infrastructure_stack(settings: &ProvisioningConfig, branch: &str) -> String {
    format!("{}-{branch}", settings.dev_stage_name)
}

fn header(settings: &ProvisioningConfig, branch: &str) -> String {
    format!(
        "version: 0.2
env:
  variables:
    BRANCH: {branch}
    DEV_ACCOUNT_ID: {account}
    PROD_ACCOUNT_ID: {account}
    REGION: {region}
phases:
  pre_build:
    commands:
      - {install}
",
        account = settings.account_id,
        region = settings.region,
        install = settings.install_command,
    )
}

/// Synthesize and deploy the branch's application stack. The whole working
/// tree is kept as the job's output so teardown can run from it.
pub fn create_script(settings: &ProvisioningConfig, branch: &str) -> String {
    let stack = application_stack(settings, branch);
    let mut script = header(settings, branch);
    script.push_str(&format!(
        "  build:
    commands:
      - cdk synth
      - cdk deploy {stack} --require-approval never
artifacts:
  files:
    - '**/*'"
    ));
    script
}

/// Destroy the branch's application stack. Unless `direct_cleanup` is set,
/// the script also deletes the infrastructure stack and the branch's
/// artifact prefix.
pub fn destroy_script(settings: &ProvisioningConfig, branch: &str) -> String {
    let mut script = header(settings, branch);
    script.push_str("  build:\n    commands:\n");
    script.push_str(&format!(
        "      - cdk destroy {} --force",
        application_stack(settings, branch)
    ));
    if !settings.direct_cleanup {
        script.push_str(&format!(
            "\n      - aws cloudformation delete-stack --stack-name {}\n      - aws s3 rm s3://{}/{branch} --recursive",
            infrastructure_stack(settings, branch),
            settings.artifact_bucket,
        ));
    }
    script
}
