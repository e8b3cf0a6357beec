use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::bus::{BusError, EventBus};
use crate::config::{Config, SecretSource};
use crate::event::EventType;
use crate::lifecycle::{BranchDecommissioner, BranchProvisioner};
use crate::resources::http::ControlPlaneClient;
use crate::resources::ResourceError;
use crate::secrets::{EnvSecretStore, SecretCache, SecretStore};
use crate::sources::github::{GitHubSource, EVENT_HEADER};
use crate::sources::native::NativeSource;
use crate::sources::{Normalized, SourceError, WebhookRequest, NATIVE_SOURCE, WEBHOOK_SOURCE};

pub const MSG_PROCESSED: &str = "Event processed successfully";
pub const MSG_NOT_PROCESSED: &str = "Event received but not processed (not a branch event)";

/// Shared state across all routes.
pub struct SharedState {
    pub github: GitHubSource,
    pub native: NativeSource,
    pub bus: EventBus,
    pub prefix: String,
    pub webhook_path: String,
    /// `None` disables the native hook routes.
    pub native_path: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("publish failed: {0}")]
    Publish(#[from] BusError),
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            IngressError::Source(SourceError::Verification(_)) => {
                (StatusCode::UNAUTHORIZED, "Invalid signature")
            }
            IngressError::Source(SourceError::Unauthorized(_)) => {
                (StatusCode::UNAUTHORIZED, "Unauthorized")
            }
            IngressError::Source(SourceError::InvalidBody(_)) => {
                (StatusCode::BAD_REQUEST, "Invalid JSON")
            }
            IngressError::Source(SourceError::InvalidEncoding(_)) => {
                (StatusCode::BAD_REQUEST, "Invalid body encoding")
            }
            IngressError::Source(SourceError::Secret(_) | SourceError::Config(_))
            | IngressError::Publish(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }

        (status, Json(json!({ "message": message }))).into_response()
    }
}

/// Wire collaborators, handlers, and the bus from config, then build the router.
/// The returned bus handle is for draining on shutdown.
pub fn build(config: &Config) -> Result<(Router, EventBus), ResourceError> {
    let client = Arc::new(ControlPlaneClient::from_config(&config.control_plane)?);
    let settings = Arc::new(config.provisioning.clone());

    let provisioner = Arc::new(BranchProvisioner::new(client.clone(), settings.clone()));
    let decommissioner = Arc::new(BranchDecommissioner::new(
        client.clone(),
        client.clone(),
        client.clone(),
        settings,
    ));

    let bus = EventBus::from_config(&config.bus)
        .subscribe(EventType::Create, provisioner)
        .subscribe(EventType::Delete, decommissioner)
        .start();

    let store: Arc<dyn SecretStore> = match config.webhook.secret_source {
        SecretSource::Env => Arc::new(EnvSecretStore),
        SecretSource::ControlPlane => client,
    };
    let secret = Arc::new(SecretCache::new(config.webhook.secret_name.clone(), store));

    let shared = Arc::new(SharedState {
        github: GitHubSource::new(secret),
        native: NativeSource::from_config(&config.native),
        bus: bus.clone(),
        prefix: config.provisioning.prefix.clone(),
        webhook_path: config.webhook.path.clone(),
        native_path: config.native.enabled.then(|| config.native.path.clone()),
    });

    Ok((build_router(shared), bus))
}

pub fn build_router(shared: Arc<SharedState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/status", get(status));

    info!(path = %shared.webhook_path, "mounting webhook endpoint");
    router = router.route(&shared.webhook_path, post(handle_webhook));

    if let Some(ref native_path) = shared.native_path {
        let base = native_path.trim_end_matches('/');
        info!(path = %base, "mounting native reference hook endpoints");
        router = router
            .route(&format!("{base}/created"), post(handle_native_created))
            .route(&format!("{base}/deleted"), post(handle_native_deleted));
    }

    router.with_state(shared)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status(State(shared): State<Arc<SharedState>>) -> impl IntoResponse {
    Json(json!({
        "bus": shared.bus.name(),
        "prefix": shared.prefix,
        "subscribers": {
            "create": shared.bus.subscriber_count(EventType::Create),
            "delete": shared.bus.subscriber_count(EventType::Delete),
        },
    }))
}

async fn handle_webhook(
    State(shared): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, IngressError> {
    let request = WebhookRequest::from_http(headers, body);
    let delivery = shared.github.delivery_id(&request.headers);
    let github_event = request
        .headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    info!(
        delivery = ?delivery,
        github_event = %github_event,
        base64 = request.base64_encoded,
        "received webhook"
    );

    let body = request.raw_body()?;
    shared.github.verify(&request.headers, &body).await?;
    let normalized = shared.github.build_event(&request.headers, &body)?;

    accept(&shared, normalized, WEBHOOK_SOURCE).await
}

async fn handle_native_created(
    State(shared): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, IngressError> {
    handle_native(&shared, EventType::Create, &headers, &body).await
}

async fn handle_native_deleted(
    State(shared): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, IngressError> {
    handle_native(&shared, EventType::Delete, &headers, &body).await
}

async fn handle_native(
    shared: &SharedState,
    event_type: EventType,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Json<Value>, IngressError> {
    info!(event_type = %event_type, "received native reference event");
    shared.native.verify(headers)?;
    let normalized = shared.native.build_event(event_type, body)?;
    accept(shared, normalized, NATIVE_SOURCE).await
}

/// Publish an applicable event; answer 200 either way.
async fn accept(
    shared: &SharedState,
    normalized: Normalized,
    source: &str,
) -> Result<Json<Value>, IngressError> {
    match normalized {
        Normalized::Branch(event) => {
            let envelope = shared.bus.publish(&event, source).await?;
            Ok(Json(json!({ "message": MSG_PROCESSED, "id": envelope.id })))
        }
        Normalized::NotApplicable { .. } | Normalized::Rejected(_) => {
            Ok(Json(json!({ "message": MSG_NOT_PROCESSED })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BranchHandler, HandlerFuture};
    use crate::event::BranchEvent;
    use crate::secrets::{SecretError, SecretFuture};
    use crate::verification::sign_github_hmac;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    const SECRET: &str = "s3cret";

    struct Fixed(Option<&'static str>);

    impl SecretStore for Fixed {
        fn get_secret<'a>(&'a self, name: &'a str) -> SecretFuture<'a> {
            let value = self.0;
            Box::pin(async move {
                value
                    .map(str::to_string)
                    .ok_or_else(|| SecretError::NotFound(name.to_string()))
            })
        }
    }

    struct Forwarding(mpsc::UnboundedSender<BranchEvent>);

    impl BranchHandler for Forwarding {
        fn name(&self) -> &str {
            "forwarding"
        }

        fn handle<'a>(&'a self, event: &'a BranchEvent) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.0.send(event.clone()).ok();
                Ok(())
            })
        }
    }

    fn app(
        secret: Option<&'static str>,
        native: NativeSource,
    ) -> (Router, mpsc::UnboundedReceiver<BranchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Forwarding(tx));
        let bus = EventBus::builder("test")
            .subscribe(EventType::Create, handler.clone())
            .subscribe(EventType::Delete, handler)
            .start();
        let shared = Arc::new(SharedState {
            github: GitHubSource::new(Arc::new(SecretCache::new(
                "webhook",
                Arc::new(Fixed(secret)),
            ))),
            native,
            bus,
            prefix: "app".into(),
            webhook_path: "/webhook".into(),
            native_path: Some("/hooks/reference".into()),
        });
        (build_router(shared), rx)
    }

    fn webhook(event: &str, body: &'static str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::post("/webhook").header(EVENT_HEADER, event);
        if let Some(signature) = signature {
            builder = builder.header("x-hub-signature-256", signature);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn signed(event: &str, body: &'static str) -> Request<Body> {
        webhook(event, body, Some(sign_github_hmac(SECRET.as_bytes(), body.as_bytes()).unwrap()))
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<BranchEvent>) -> Option<BranchEvent> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn signed_push_is_published() {
        let (app, mut rx) = app(Some(SECRET), NativeSource::new(None, None));
        let response = app
            .oneshot(signed("push", r#"{"ref":"refs/heads/demo","created":true}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["message"], MSG_PROCESSED);
        let event = next(&mut rx).await.unwrap();
        assert_eq!(event.event_type(), EventType::Create);
        assert_eq!(event.branch(), "demo");
    }

    #[tokio::test]
    async fn bad_signature_is_401() {
        let (app, mut rx) = app(Some(SECRET), NativeSource::new(None, None));
        let body = r#"{"ref":"refs/heads/demo","created":true}"#;
        let signature = sign_github_hmac(b"other", body.as_bytes()).unwrap();
        let response = app.oneshot(webhook("push", body, Some(signature))).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["message"], "Invalid signature");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_signature_is_401() {
        let (app, _rx) = app(Some(SECRET), NativeSource::new(None, None));
        let response = app
            .oneshot(webhook("push", r#"{"ref":"refs/heads/demo","created":true}"#, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn signed_malformed_json_is_400() {
        let (app, _rx) = app(Some(SECRET), NativeSource::new(None, None));
        let response = app.oneshot(signed("push", "{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["message"], "Invalid JSON");
    }

    #[tokio::test]
    async fn unavailable_secret_is_500() {
        let (app, _rx) = app(None, NativeSource::new(None, None));
        let response = app.oneshot(signed("push", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["message"], "Internal server error");
    }

    #[tokio::test]
    async fn non_branch_event_is_200_not_processed() {
        let (app, mut rx) = app(Some(SECRET), NativeSource::new(None, None));
        let response = app
            .oneshot(signed("create", r#"{"ref":"v1.0","ref_type":"tag"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["message"], MSG_NOT_PROCESSED);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_branch_names_are_not_published() {
        let (app, mut rx) = app(Some(SECRET), NativeSource::new(None, None));
        for body in [
            r#"{"ref":"","ref_type":"branch"}"#,
            r#"{"ref":"x;rm -rf /","ref_type":"branch"}"#,
        ] {
            let response = app.clone().oneshot(signed("create", body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(json_body(response).await["message"], MSG_NOT_PROCESSED);
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn base64_body_is_verified_after_decoding() {
        let (app, mut rx) = app(Some(SECRET), NativeSource::new(None, None));
        let raw = r#"{"ref":"refs/heads/demo","deleted":true}"#;
        let encoded = "eyJyZWYiOiJyZWZzL2hlYWRzL2RlbW8iLCJkZWxldGVkIjp0cnVlfQ==";
        let request = Request::post("/webhook")
            .header(EVENT_HEADER, "push")
            .header("x-body-encoding", "base64")
            .header(
                "x-hub-signature-256",
                sign_github_hmac(SECRET.as_bytes(), raw.as_bytes()).unwrap(),
            )
            .body(Body::from(encoded))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(next(&mut rx).await.unwrap().event_type(), EventType::Delete);
    }

    #[tokio::test]
    async fn native_deleted_route_publishes_delete() {
        let (app, mut rx) = app(Some(SECRET), NativeSource::new(None, None));
        let request = Request::post("/hooks/reference/deleted")
            .body(Body::from(
                r#"{"detail":{"referenceType":"branch","referenceName":"demo","repositoryName":"my-repo"}}"#,
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let event = next(&mut rx).await.unwrap();
        assert_eq!(event.event_type(), EventType::Delete);
        assert_eq!(event.repository_name(), Some("my-repo"));
    }

    #[tokio::test]
    async fn native_route_requires_configured_token() {
        let (app, _rx) = app(
            Some(SECRET),
            NativeSource::new(Some("TOKEN".into()), Some("t0ken".into())),
        );
        let request = Request::post("/hooks/reference/created")
            .body(Body::from(
                r#"{"detail":{"referenceType":"branch","referenceName":"demo"}}"#,
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_reports_subscribers() {
        let (app, _rx) = app(Some(SECRET), NativeSource::new(None, None));
        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["bus"], "test");
        assert_eq!(body["prefix"], "app");
        assert_eq!(body["subscribers"]["create"], 1);
        assert_eq!(body["subscribers"]["delete"], 1);
    }
}
