//! REST control-plane client implementing every resource collaborator.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | create job | `POST {base}/jobs` with the [`BuildJobSpec`] as JSON |
//! | start job | `POST {base}/jobs/{name}/runs` → `{"run_id": ...}` |
//! | delete job | `DELETE {base}/jobs/{name}` |
//! | delete stack | `DELETE {base}/stacks/{name}` |
//! | delete prefix | `DELETE {base}/buckets/{bucket}/objects?prefix=...` |
//! | get secret | `GET {base}/secrets/{name}` → `{"secret_string": ...}` |
//!
//! Deletes treat 404 as success so teardown of something that never existed
//! does not fail the sequence.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info};

use super::{
    ArtifactStore, BuildJobSpec, BuildResourceManager, ResourceError, ResourceFuture,
    StackManager,
};
use crate::config::ControlPlaneConfig;
use crate::secrets::{SecretError, SecretFuture, SecretStore};

#[derive(Deserialize)]
struct StartedRun {
    run_id: String,
}

#[derive(Deserialize)]
struct SecretValue {
    secret_string: String,
}

pub struct ControlPlaneClient {
    base_url: Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ResourceError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ResourceError::InvalidUrl(format!("{base_url}: {e}")))?;
        if parsed.cannot_be_a_base() {
            return Err(ResourceError::InvalidUrl(base_url.to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("branchhook-server/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: parsed,
            token,
            client,
        })
    }

    /// Build a client from config, reading the bearer token from its env var if set.
    pub fn from_config(config: &ControlPlaneConfig) -> Result<Self, ResourceError> {
        let token = config
            .token_env
            .as_deref()
            .and_then(|env_name| std::env::var(env_name).ok())
            .filter(|t| !t.is_empty());
        Self::new(
            &config.base_url,
            token,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ResourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ResourceError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn delete(&self, url: Url, what: &str) -> Result<(), ResourceError> {
        let resp = self.request(Method::DELETE, url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(target_resource = what, "already absent");
            return Ok(());
        }
        error_for_status(resp).await?;
        Ok(())
    }
}

async fn error_for_status(resp: Response) -> Result<Response, ResourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ResourceError::Api {
        status: status.as_u16(),
        body,
    })
}

impl BuildResourceManager for ControlPlaneClient {
    fn create_job<'a>(&'a self, spec: &'a BuildJobSpec) -> ResourceFuture<'a, ()> {
        Box::pin(async move {
            let url = self.endpoint(&["jobs"])?;
            let resp = self.request(Method::POST, url).json(spec).send().await?;
            if resp.status() == StatusCode::CONFLICT {
                return Err(ResourceError::AlreadyExists {
                    kind: "job",
                    name: spec.name.clone(),
                });
            }
            error_for_status(resp).await?;
            info!(job = %spec.name, "build job created");
            Ok(())
        })
    }

    fn start_job<'a>(&'a self, name: &'a str) -> ResourceFuture<'a, String> {
        Box::pin(async move {
            let url = self.endpoint(&["jobs", name, "runs"])?;
            let resp = self.request(Method::POST, url).send().await?;
            let run: StartedRun = error_for_status(resp)
                .await?
                .json()
                .await
                .map_err(|e| ResourceError::InvalidResponse(e.to_string()))?;
            info!(job = %name, run_id = %run.run_id, "build job started");
            Ok(run.run_id)
        })
    }

    fn delete_job<'a>(&'a self, name: &'a str) -> ResourceFuture<'a, ()> {
        Box::pin(async move {
            let url = self.endpoint(&["jobs", name])?;
            self.delete(url, name).await
        })
    }
}

impl StackManager for ControlPlaneClient {
    fn delete_stack<'a>(&'a self, name: &'a str) -> ResourceFuture<'a, ()> {
        Box::pin(async move {
            let url = self.endpoint(&["stacks", name])?;
            self.delete(url, name).await
        })
    }
}

impl ArtifactStore for ControlPlaneClient {
    fn delete_prefix<'a>(&'a self, bucket: &'a str, prefix: &'a str) -> ResourceFuture<'a, ()> {
        Box::pin(async move {
            let mut url = self.endpoint(&["buckets", bucket, "objects"])?;
            url.query_pairs_mut().append_pair("prefix", prefix);
            self.delete(url, prefix).await
        })
    }
}

impl SecretStore for ControlPlaneClient {
    fn get_secret<'a>(&'a self, name: &'a str) -> SecretFuture<'a> {
        Box::pin(async move {
            let url = self
                .endpoint(&["secrets", name])
                .map_err(|e| SecretError::Store(e.to_string()))?;
            let resp = self
                .request(Method::GET, url)
                .send()
                .await
                .map_err(|e| SecretError::Store(e.to_string()))?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(SecretError::NotFound(name.to_string()));
            }
            let value: SecretValue = error_for_status(resp)
                .await
                .map_err(|e| SecretError::Store(e.to_string()))?
                .json()
                .await
                .map_err(|e| SecretError::Store(e.to_string()))?;
            if value.secret_string.is_empty() {
                return Err(SecretError::Empty(name.to_string()));
            }
            Ok(value.secret_string)
        })
    }
}
