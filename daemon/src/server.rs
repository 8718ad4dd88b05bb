//! Invocation gateway
//!
//! HTTP front of the daemon. Capability calls name their target plugin in
//! `X-Plugin-Identifier` and get the plugin's result stream back as
//! server-sent events.

use crate::auth::{ApiKey, require_api_key};
use crate::metrics::Metrics;
use anyhow::Result;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt, stream};
use plugind_runtime::{
    InvocationEvent, InvocationRequest, PluginIdentity, RuntimeError, RuntimeRegistry,
    RuntimeSnapshot,
};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

pub const PLUGIN_IDENTIFIER_HEADER: &str = "x-plugin-identifier";

/// Route under `/plugin` and the method sent to the plugin
const CAPABILITIES: &[(&str, &str)] = &[
    ("/tool/invoke", "tool.invoke"),
    ("/tool/validate_credentials", "tool.validate_credentials"),
    ("/llm/invoke", "llm.invoke"),
    ("/text_embedding/invoke", "text_embedding.invoke"),
    ("/rerank/invoke", "rerank.invoke"),
    ("/tts/invoke", "tts.invoke"),
    ("/speech2text/invoke", "speech2text.invoke"),
    ("/moderation/invoke", "moderation.invoke"),
    (
        "/model/validate_provider_credentials",
        "model.validate_provider_credentials",
    ),
    (
        "/model/validate_model_credentials",
        "model.validate_model_credentials",
    ),
];

#[derive(Clone)]
pub struct AppState {
    registry: Arc<RuntimeRegistry>,
    metrics: Metrics,
}

impl AppState {
    pub fn new(registry: Arc<RuntimeRegistry>, metrics: Metrics) -> Self {
        Self { registry, metrics }
    }
}

#[derive(Debug)]
enum GatewayError {
    MissingIdentifier,
    Unavailable(String),
    Invocation(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            GatewayError::MissingIdentifier => (
                StatusCode::BAD_REQUEST,
                format!("missing {PLUGIN_IDENTIFIER_HEADER} header"),
            ),
            GatewayError::Unavailable(reason) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("capability unavailable: {reason}"),
            ),
            GatewayError::Invocation(reason) => (StatusCode::BAD_GATEWAY, reason),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: AppState, key: ApiKey) -> Router {
    let plugin = CAPABILITIES
        .iter()
        .fold(Router::<AppState>::new(), |router, &(path, method)| {
            router.route(
                path,
                post(
                    move |State(state): State<AppState>,
                          headers: HeaderMap,
                          Json(payload): Json<Value>| {
                        invoke(state, headers, method, payload)
                    },
                ),
            )
        })
        .route("/runtimes", get(list_runtimes))
        .route_layer(middleware::from_fn_with_state(key, require_api_key));

    Router::new()
        .route("/health/check", get(health))
        .nest("/plugin", plugin)
        .with_state(state)
}

/// Start the gateway
pub async fn start_server(listener: TcpListener, state: AppState, key: ApiKey) -> Result<()> {
    info!("Plugin gateway listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state, key)).await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "runtimes": state.registry.count(),
        "ready": state.registry.ready_count(),
    }))
}

async fn list_runtimes(State(state): State<AppState>) -> Json<Vec<RuntimeSnapshot>> {
    Json(state.registry.list())
}

async fn invoke(
    state: AppState,
    headers: HeaderMap,
    method: &'static str,
    payload: Value,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let identity = headers
        .get(PLUGIN_IDENTIFIER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(PluginIdentity::new)
        .ok_or(GatewayError::MissingIdentifier)?;

    state.metrics.invocations.with_label_values(&[method]).inc();

    let request = InvocationRequest {
        method: method.to_string(),
        payload,
    };
    let mut rx = match state.registry.lookup_ready(&identity) {
        Ok(handle) => handle.invoke(request).await,
        Err(e) => Err(e),
    }
    .map_err(|e| reject(&state, &identity, method, e))?;

    // The first event decides the status; later errors travel in-band.
    let first = match rx.recv().await {
        Some(InvocationEvent::Chunk(value)) => value,
        Some(InvocationEvent::Error(message)) => {
            state.metrics.invocations_failed.inc();
            warn!("{} on {} failed: {}", method, identity, message);
            return Err(GatewayError::Invocation(message));
        }
        None => {
            // Plugin ended the session without output
            debug!("{} on {} returned no results", method, identity);
            return Ok(Sse::new(into_events(stream::empty().boxed())));
        }
    };

    let events = stream::once(async move { InvocationEvent::Chunk(first) })
        .chain(UnboundedReceiverStream::new(rx))
        .boxed();
    Ok(Sse::new(into_events(events)).keep_alive(KeepAlive::default()))
}

fn reject(
    state: &AppState,
    identity: &PluginIdentity,
    method: &str,
    e: RuntimeError,
) -> GatewayError {
    if e.is_unavailable() {
        state.metrics.invocations_unavailable.inc();
        debug!("{} on {} unavailable: {}", method, identity, e);
        GatewayError::Unavailable(e.to_string())
    } else {
        state.metrics.invocations_failed.inc();
        warn!("{} on {} failed: {}", method, identity, e);
        GatewayError::Invocation(e.to_string())
    }
}

fn into_events(
    events: stream::BoxStream<'static, InvocationEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    events
        .map(|event| {
            let event = match event {
                InvocationEvent::Chunk(value) => Event::default().data(value.to_string()),
                InvocationEvent::Error(message) => Event::default()
                    .event("error")
                    .data(json!({ "message": message }).to_string()),
            };
            Ok(event)
        })
        .chain(stream::once(async { Ok(Event::default().event("end").data("")) }))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use plugind_runtime::{PluginProcess, RuntimeState};
    use std::net::SocketAddr;
    use tokio::process::Command;

    const ECHO_PLUGIN: &str = r#"
while IFS= read -r line; do
  sid=$(printf '%s' "$line" | sed 's/.*"session_id":"\([^"]*\)".*/\1/')
  method=$(printf '%s' "$line" | sed 's/.*"method":"\([^"]*\)".*/\1/')
  printf '{"session_id":"%s","event":"stream","data":{"method":"%s"}}\n' "$sid" "$method"
  printf '{"session_id":"%s","event":"end"}\n' "$sid"
done
"#;

    const FAILING_PLUGIN: &str = r#"
while IFS= read -r line; do
  sid=$(printf '%s' "$line" | sed 's/.*"session_id":"\([^"]*\)".*/\1/')
  printf '{"session_id":"%s","event":"error","data":{"message":"bad credentials"}}\n' "$sid"
done
"#;

    async fn ready_plugin(registry: &RuntimeRegistry, name: &str, script: &str) {
        let dir = std::env::temp_dir();
        let identity = PluginIdentity::from_parts("acme", name, "0.1.0");
        let handle = registry.begin(identity.clone(), &dir).unwrap();
        handle.transition(RuntimeState::Provisioning).unwrap();
        handle
            .transition(RuntimeState::InstallingDependencies)
            .unwrap();
        handle
            .transition(RuntimeState::Ready {
                interpreter: "/bin/sh".into(),
            })
            .unwrap();

        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        let process = PluginProcess::spawn_command(identity, command, &dir)
            .await
            .unwrap();
        handle.replace_process(Arc::new(process)).unwrap();
    }

    async fn serve(registry: Arc<RuntimeRegistry>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(registry, Metrics::new().unwrap());
        tokio::spawn(start_server(listener, state, ApiKey::new("secret")));
        addr
    }

    fn call(addr: SocketAddr, path: &str, plugin: &str) -> reqwest::RequestBuilder {
        reqwest::Client::new()
            .post(format!("http://{addr}{path}"))
            .header("X-Api-Key", "secret")
            .header("X-Plugin-Identifier", plugin)
            .json(&json!({ "tool": "forecast" }))
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let addr = serve(RuntimeRegistry::new()).await;
        let response = reqwest::get(format!("http://{addr}/health/check"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_plugin_routes_require_key() {
        let addr = serve(RuntimeRegistry::new()).await;
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/plugin/tool/invoke"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/plugin/runtimes"))
            .header("X-Api-Key", "nope")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_and_unready_plugins_are_unavailable() {
        let registry = RuntimeRegistry::new();
        registry
            .begin(PluginIdentity::from_parts("acme", "slow", "0.1.0"), "/tmp")
            .unwrap();
        let addr = serve(registry).await;

        let response = call(addr, "/plugin/tool/invoke", "acme/missing:0.1.0")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = call(addr, "/plugin/tool/invoke", "acme/slow:0.1.0")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().starts_with("capability unavailable"));
    }

    #[tokio::test]
    async fn test_invoke_streams_events() {
        let registry = RuntimeRegistry::new();
        ready_plugin(&registry, "echo", ECHO_PLUGIN).await;
        let addr = serve(registry.clone()).await;

        let response = call(addr, "/plugin/llm/invoke", "acme/echo:0.1.0")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let body = response.text().await.unwrap();
        let fields: Vec<(&str, &str)> = body
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name, value.trim()))
            .collect();
        assert!(fields.contains(&("data", r#"{"method":"llm.invoke"}"#)));
        assert!(fields.contains(&("event", "end")));
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_plugin_error_is_bad_gateway() {
        let registry = RuntimeRegistry::new();
        ready_plugin(&registry, "broken", FAILING_PLUGIN).await;
        let addr = serve(registry.clone()).await;

        let response = call(addr, "/plugin/tool/validate_credentials", "acme/broken:0.1.0")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "bad credentials");
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_list_runtimes() {
        let registry = RuntimeRegistry::new();
        registry
            .begin(PluginIdentity::from_parts("acme", "a", "1"), "/tmp/a")
            .unwrap();
        let addr = serve(registry).await;

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/plugin/runtimes"))
            .header("X-Api-Key", "secret")
            .send()
            .await
            .unwrap();
        let body: Value = response.json().await.unwrap();
        assert_eq!(body[0]["identity"], "acme/a:1");
        assert_eq!(body[0]["state"], "uninitialized");
    }
}
