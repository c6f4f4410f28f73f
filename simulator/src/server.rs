use std::{
    future::IntoFuture, io::ErrorKind, net::SocketAddr, path::Path, sync::Arc, time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN,
        },
        HeaderValue, Method, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tower_http::{limit::RequestBodyLimitLayer, set_header::SetResponseHeaderLayer};
use tracing::{error, info, warn};

use climate_common::{
    config::ENV_CONFIG_PATH, describe_changes, CommandPayload, SimulatorConfig, ThermostatEngine,
};

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<ThermostatEngine>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config().await?;
    let engine = ThermostatEngine::new(config.physics.clone(), config.initial.clone(), Utc::now());
    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
    };

    let tick_loop = spawn_tick_loop(
        app_state.clone(),
        Duration::from_millis(config.tick_interval_ms),
    );

    let app = build_router(app_state, config.max_body_bytes);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind simulator server at {addr}"))?;

    info!("simulator listening on http://{addr}");
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    tokio::select! {
        result = server.into_future() => result.context("simulator server failed"),
        err = watch_tick_loop(tick_loop) => Err(err),
    }
}

async fn load_config() -> anyhow::Result<SimulatorConfig> {
    let mut config = match std::env::var(ENV_CONFIG_PATH) {
        Ok(path) => read_config_file(Path::new(&path))
            .await
            .with_context(|| format!("failed to load simulator config from {path}"))?,
        Err(_) => SimulatorConfig::default(),
    };

    for rejected in config.apply_overrides(|key| std::env::var(key).ok()) {
        warn!(
            "ignoring {}={:?}, keeping configured value",
            rejected.var, rejected.value
        );
    }
    config.sanitize().context("invalid simulator config")?;
    Ok(config)
}

async fn read_config_file(path: &Path) -> anyhow::Result<SimulatorConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(SimulatorConfig::from_json(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("config file {} not found, using defaults", path.display());
            Ok(SimulatorConfig::default())
        }
        Err(err) => Err(err.into()),
    }
}

fn build_router(app_state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route(
            "/state",
            get(handle_get_state).fallback(handle_not_found),
        )
        .route(
            "/command",
            post(handle_command).fallback(handle_not_found),
        )
        .fallback(handle_not_found)
        .layer(middleware::from_fn(answer_preflight))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET,POST,OPTIONS"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        ))
        .with_state(app_state)
}

fn spawn_tick_loop(app_state: AppState, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Late ticks are replayed back to back; the model assumes a fixed step.
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            interval.tick().await;

            let transition = {
                let mut engine = app_state.engine.lock().await;
                engine.tick(Utc::now())
            };

            if let Some(transition) = transition {
                info!("{transition}");
            }
        }
    })
}

/// Resolves once the tick task is gone. The model is frozen from then on, so
/// the caller treats this as fatal.
async fn watch_tick_loop(tick_loop: JoinHandle<()>) -> anyhow::Error {
    let err = match tick_loop.await {
        Ok(()) => anyhow::anyhow!("tick loop exited"),
        Err(err) => anyhow::Error::new(err).context("tick loop stopped"),
    };
    error!("{err:#}");
    err
}

async fn answer_preflight(request: Request, next: Next) -> Response {
    match *request.method() {
        Method::OPTIONS => StatusCode::NO_CONTENT.into_response(),
        // axum would answer HEAD from the GET route.
        Method::HEAD => handle_not_found().await,
        _ => next.run(request).await,
    }
}

async fn handle_get_state(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.engine.lock().await.state().clone();
    Json(snapshot)
}

async fn handle_command(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let command = CommandPayload::from_slice(&body);

    let (changes, snapshot) = {
        let mut engine = state.engine.lock().await;
        let changes = engine.apply_command(&command);
        (changes, engine.state().clone())
    };

    if let Some(line) = describe_changes(&changes) {
        info!("{line}");
    }

    Json(snapshot)
}

async fn handle_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("simulator shutting down");
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use climate_common::{HvacState, InitialConditions, Mode, PhysicsConfig};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    fn test_state() -> AppState {
        AppState {
            engine: Arc::new(Mutex::new(ThermostatEngine::new(
                PhysicsConfig::default(),
                InitialConditions::default(),
                Utc::now(),
            ))),
        }
    }

    fn test_router(state: &AppState) -> Router {
        build_router(state.clone(), 1_000_000)
    }

    async fn send(router: Router, method: Method, uri: &str, body: Body) -> (StatusCode, Response) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn get_state_returns_full_record() {
        let state = test_state();
        let (status, response) =
            send(test_router(&state), Method::GET, "/state", Body::empty()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            HeaderValue::from_static("*")
        );
        let body = json_body(response).await;
        assert_eq!(body["setpoint"], 22.0);
        assert_eq!(body["humiditySetpoint"], 45.0);
        assert_eq!(body["mode"], "Ogrevanje");
        assert_eq!(body["hvacState"], "IDLE");
        assert_eq!(body["currentTemp"], 20.2);
        assert_eq!(body["currentHumidity"], 48.0);
        assert_eq!(body["outsideTemp"], 5.0);
        assert_eq!(body["outsideHumidity"], 70.0);
        assert_eq!(body["duty"], 0.0);
        assert!(body["lastUpdated"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn command_is_reflected_in_next_state_read() {
        let state = test_state();
        let payload = json!({
            "setpoint": 24.5,
            "humiditySetpoint": 50,
            "mode": "Hlajenje",
            "outsideTemp": 31.27,
            "outsideHumidity": 80
        });

        let (status, response) = send(
            test_router(&state),
            Method::POST,
            "/command",
            Body::from(payload.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let posted = json_body(response).await;

        let (_, response) = send(test_router(&state), Method::GET, "/state", Body::empty()).await;
        let read_back = json_body(response).await;

        assert_eq!(posted, read_back);
        assert_eq!(read_back["setpoint"], 24.5);
        assert_eq!(read_back["humiditySetpoint"], 50.0);
        assert_eq!(read_back["mode"], "Hlajenje");
        assert_eq!(read_back["outsideTemp"], 31.3);
        assert_eq!(read_back["outsideHumidity"], 80.0);
        // Derived fields only move on tick.
        assert_eq!(read_back["hvacState"], "IDLE");
    }

    #[tokio::test]
    async fn unknown_mode_is_ignored() {
        let state = test_state();
        let (status, response) = send(
            test_router(&state),
            Method::POST,
            "/command",
            Body::from(r#"{"mode":"NotAMode"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await["mode"], "Ogrevanje");
        assert_eq!(state.engine.lock().await.state().mode, Mode::Heating);
    }

    #[tokio::test]
    async fn malformed_body_is_a_no_op() {
        let state = test_state();
        let before = state.engine.lock().await.state().clone();

        for body in ["", "{not json", "[]", "42"] {
            let (status, _) = send(
                test_router(&state),
                Method::POST,
                "/command",
                Body::from(body),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        assert_eq!(state.engine.lock().await.state(), &before);
    }

    #[tokio::test]
    async fn out_of_range_values_are_clamped() {
        let state = test_state();
        let (_, response) = send(
            test_router(&state),
            Method::POST,
            "/command",
            Body::from(r#"{"setpoint": 99, "humiditySetpoint": 5, "outsideHumidity": 100}"#),
        )
        .await;

        let body = json_body(response).await;
        assert_eq!(body["setpoint"], 30.0);
        assert_eq!(body["humiditySetpoint"], 30.0);
        assert_eq!(body["outsideHumidity"], 95.0);
    }

    #[tokio::test]
    async fn options_on_any_path_is_no_content() {
        let state = test_state();
        for uri in ["/state", "/command", "/anything"] {
            let (status, response) =
                send(test_router(&state), Method::OPTIONS, uri, Body::empty()).await;

            assert_eq!(status, StatusCode::NO_CONTENT);
            let headers = response.headers();
            assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
            assert_eq!(headers[ACCESS_CONTROL_ALLOW_METHODS], "GET,POST,OPTIONS");
            assert_eq!(headers[ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            assert!(bytes.is_empty());
        }
    }

    #[tokio::test]
    async fn unknown_routes_and_methods_are_not_found() {
        let state = test_state();
        let cases = [
            (Method::GET, "/nope"),
            (Method::GET, "/command"),
            (Method::POST, "/state"),
            (Method::DELETE, "/state"),
        ];

        for (method, uri) in cases {
            let (status, response) =
                send(test_router(&state), method, uri, Body::empty()).await;

            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
            assert_eq!(json_body(response).await, json!({ "error": "Not found" }));
        }
    }

    #[tokio::test]
    async fn head_is_not_routed_to_get() {
        let state = test_state();
        for uri in ["/state", "/command"] {
            let (status, response) =
                send(test_router(&state), Method::HEAD, uri, Body::empty()).await;

            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        }
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let state = test_state();
        let router = build_router(state.clone(), 64);
        let body = format!(r#"{{"setpoint": 25, "pad": "{}"}}"#, "x".repeat(128));

        let request = Request::builder()
            .method(Method::POST)
            .uri("/command")
            .header("content-type", "application/json")
            .header("content-length", body.len())
            .body(Body::from(body))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(state.engine.lock().await.state().setpoint, 22.0);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_loop_advances_the_model() {
        let state = test_state();
        let handle = spawn_tick_loop(state.clone(), Duration::from_millis(1_000));

        tokio::time::sleep(Duration::from_millis(3_500)).await;

        {
            let engine = state.engine.lock().await;
            let snapshot = engine.state();
            assert_eq!(snapshot.hvac_state, HvacState::Heating);
            assert_eq!(snapshot.current_temp, 20.26);
        }
        handle.abort();
    }

    #[tokio::test]
    async fn dead_tick_loop_is_reported() {
        let crashed = tokio::spawn(async {
            panic!("tick exploded");
        });
        let err = watch_tick_loop(crashed).await;
        assert!(format!("{err:#}").contains("panicked"));

        let finished = tokio::spawn(async {});
        let err = watch_tick_loop(finished).await;
        assert_eq!(err.to_string(), "tick loop exited");
    }
}
