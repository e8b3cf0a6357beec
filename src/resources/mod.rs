//! External resource collaborators.
//!
//! The lifecycle handlers only see these traits. [`http::ControlPlaneClient`]
//! implements all of them against the REST control plane; tests use
//! in-memory recorders.

pub mod http;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("control plane returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid control plane url: {0}")]
    InvalidUrl(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

pub type ResourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ResourceError>> + Send + 'a>>;

/// Creates, starts, and deletes build job definitions.
pub trait BuildResourceManager: Send + Sync {
    fn create_job<'a>(&'a self, spec: &'a BuildJobSpec) -> ResourceFuture<'a, ()>;

    /// Start one run of an existing job. Returns the run id.
    fn start_job<'a>(&'a self, name: &'a str) -> ResourceFuture<'a, String>;

    /// Delete a job definition. Runs already started keep going.
    fn delete_job<'a>(&'a self, name: &'a str) -> ResourceFuture<'a, ()>;
}

pub trait StackManager: Send + Sync {
    fn delete_stack<'a>(&'a self, name: &'a str) -> ResourceFuture<'a, ()>;
}

pub trait ArtifactStore: Send + Sync {
    /// Recursively delete every object under `prefix` in `bucket`.
    fn delete_prefix<'a>(&'a self, bucket: &'a str, prefix: &'a str) -> ResourceFuture<'a, ()>;
}

/// Everything needed to define one build job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildJobSpec {
    pub name: String,
    pub description: String,
    pub source: JobSource,
    /// Build script (buildspec) text run by the job.
    pub build_script: String,
    pub artifacts: JobArtifacts,
    pub service_role_arn: String,
    pub compute: ComputeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSource {
    pub kind: SourceKind,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceKind {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "codecommit")]
    CodeCommit,
    #[serde(rename = "object_store")]
    ObjectStore,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobArtifacts {
    None,
    ObjectStore {
        bucket: String,
        path: String,
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeConfig {
    #[serde(default = "default_environment_type")]
    pub environment_type: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_compute_type")]
    pub compute_type: String,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            environment_type: default_environment_type(),
            image: default_image(),
            compute_type: default_compute_type(),
        }
    }
}

fn default_environment_type() -> String {
    "LINUX_CONTAINER".to_string()
}

fn default_image() -> String {
    "aws/codebuild/standard:6.0".to_string()
}

fn default_compute_type() -> String {
    "BUILD_GENERAL1_SMALL".to_string()
}
