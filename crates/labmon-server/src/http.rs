//! Hyper service: routing, request decoding, error mapping.
//!
//! Routes are matched on method plus path segments. Error mapping follows
//! the store/engine error kinds: 400 validation, 404 not found, 409 name or
//! reference conflict, 504 transport timeout, 500 everything else.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use serde_json::json;

use labmon_core::model::{
    InstrumentUpdate, MonitoringSetupUpdate, NewInstrument, NewMonitoringSetup,
};
use labmon_core::{MonitorError, MonitorResult, TransportErrorKind};
use labmon_engine::state_machine::StateMachineEngine;
use labmon_engine::{DataCollector, ModeOverrides};
use labmon_store::{ConfigStore, ReadingsRing};
use labmon_transport::{execute, InstrumentAddress, TcpTransportFactory, TransportFactory};

use crate::config::ServerConfig;
use crate::export::readings_to_csv;

const DEFAULT_READINGS_LIMIT: usize = 100;

/// Process-wide services injected into every handler.
pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub readings: Arc<ReadingsRing>,
    pub collector: Arc<DataCollector>,
    pub engine: Arc<StateMachineEngine>,
    pub factory: Arc<dyn TransportFactory>,
}

impl AppState {
    /// Production wiring: TCP transport, stores under the configured data
    /// directory.
    pub async fn init(config: &ServerConfig) -> MonitorResult<Self> {
        let factory: Arc<dyn TransportFactory> =
            Arc::new(TcpTransportFactory::new(config.transport_deadline()));
        Self::assemble(
            ConfigStore::open(&config.data_dir).await?,
            ReadingsRing::open(&config.data_dir, config.readings_cap).await?,
            factory,
            config.tick_period(),
        )
    }

    /// Wiring with an injected transport factory; tests use this with the
    /// mock.
    pub fn assemble(
        store: ConfigStore,
        readings: ReadingsRing,
        factory: Arc<dyn TransportFactory>,
        tick_period: Duration,
    ) -> MonitorResult<Self> {
        let store = Arc::new(store);
        let readings = Arc::new(readings);
        let overrides = Arc::new(ModeOverrides::new());
        let collector = Arc::new(DataCollector::new(
            Arc::clone(&store),
            Arc::clone(&readings),
            Arc::clone(&overrides),
            Arc::clone(&factory),
        ));
        let engine = Arc::new(StateMachineEngine::new(
            Arc::clone(&store),
            Arc::clone(&readings),
            overrides,
            Arc::clone(&collector),
            Arc::clone(&factory),
            tick_period,
        ));
        Ok(Self {
            store,
            readings,
            collector,
            engine,
            factory,
        })
    }

    /// Ordered teardown: sessions first (they own instrument modes), then
    /// collectors.
    pub async fn shutdown(&self) {
        self.engine.stop_all().await;
        self.collector.stop_all().await;
    }
}

/// Serve until ctrl-c, then run the ordered teardown.
pub async fn run_server(config: &ServerConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let service_state = Arc::clone(&state);
    let make_service = make_service_fn(move |_conn| {
        let state = Arc::clone(&service_state);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(handle(state, req).await) }
            }))
        }
    });

    let addr = config.listen_addr();
    let server = hyper::Server::try_bind(&addr)?
        .serve(make_service)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        });

    tracing::info!(%addr, "labmon listening");
    server.await?;

    tracing::info!("shutting down");
    state.shutdown().await;
    Ok(())
}

/// Top-level request handler; never fails, all errors become responses.
pub async fn handle(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match route(&state, req).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    };
    tracing::debug!(%method, %path, status = response.status().as_u16(), "request");
    with_cors(response)
}

async fn route(state: &Arc<AppState>, req: Request<Body>) -> MonitorResult<Response<Body>> {
    let method = req.method().clone();
    let path = req.uri().path().trim_matches('/').to_string();
    let query = parse_query(req.uri().query());
    let segments: Vec<&str> = if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    };

    if method == Method::OPTIONS {
        return Ok(status_only(StatusCode::NO_CONTENT));
    }

    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => json_response(StatusCode::OK, &json!({"status": "ok"})),

        // --- instruments -----------------------------------------------------
        (&Method::GET, ["instruments"]) => {
            json_response(StatusCode::OK, &state.store.list_instruments().await?)
        }
        (&Method::POST, ["instruments"]) => {
            let new: NewInstrument = read_json(req).await?;
            let created = state.store.create_instrument(new).await?;
            json_response(StatusCode::CREATED, &created)
        }
        (&Method::GET, ["instruments", id]) => {
            let instrument = state.store.get_instrument(parse_id(id)?).await?;
            json_response(StatusCode::OK, &instrument)
        }
        (&Method::PUT, ["instruments", id]) => {
            let id = parse_id(id)?;
            let update: InstrumentUpdate = read_json(req).await?;
            let updated = state.store.update_instrument(id, update).await?;
            json_response(StatusCode::OK, &updated)
        }
        (&Method::DELETE, ["instruments", id]) => {
            state.store.delete_instrument(parse_id(id)?).await?;
            Ok(status_only(StatusCode::NO_CONTENT))
        }
        (&Method::POST, ["instruments", id, "command"]) => {
            let id = parse_id(id)?;
            let body: CommandRequest = read_json(req).await?;
            let response = send_command(state, id, &body.command).await?;
            json_response(StatusCode::OK, &json!({ "response": response }))
        }

        // --- setups ----------------------------------------------------------
        (&Method::GET, ["setups"]) => {
            json_response(StatusCode::OK, &state.store.list_setups().await?)
        }
        (&Method::POST, ["setups"]) => {
            let new: NewMonitoringSetup = read_json(req).await?;
            let created = state.store.create_setup(new).await?;
            json_response(StatusCode::CREATED, &created)
        }
        (&Method::GET, ["setups", id]) => {
            let setup = state.store.get_setup(parse_id(id)?).await?;
            json_response(StatusCode::OK, &setup)
        }
        (&Method::PUT, ["setups", id]) => {
            let id = parse_id(id)?;
            let update: MonitoringSetupUpdate = read_json(req).await?;
            let updated = state.store.update_setup(id, update).await?;
            json_response(StatusCode::OK, &updated)
        }
        (&Method::DELETE, ["setups", id]) => {
            state.store.delete_setup(parse_id(id)?).await?;
            Ok(status_only(StatusCode::NO_CONTENT))
        }

        // --- data collection -------------------------------------------------
        (&Method::POST, ["collect", id, "start"]) => {
            state.collector.start(parse_id(id)?).await?;
            json_response(StatusCode::OK, &json!({"running": true}))
        }
        (&Method::POST, ["collect", id, "stop"]) => {
            state.collector.stop(parse_id(id)?).await?;
            json_response(StatusCode::OK, &json!({"running": false}))
        }
        (&Method::POST, ["collect", id, "once"]) => {
            let sample = state.collector.collect_now(parse_id(id)?).await?;
            json_response(StatusCode::OK, &sample)
        }
        (&Method::GET, ["collect", id, "status"]) => {
            json_response(StatusCode::OK, &state.collector.status(parse_id(id)?).await)
        }
        (&Method::POST, ["collect", id, "reset"]) => {
            let removed = state.readings.clear_setup(parse_id(id)?).await?;
            json_response(StatusCode::OK, &json!({"status": "reset", "removed": removed}))
        }

        // --- state machine ---------------------------------------------------
        (&Method::POST, ["sm", id, "start"]) => {
            let status = state.engine.start(parse_id(id)?).await?;
            json_response(StatusCode::OK, &status)
        }
        (&Method::POST, ["sm", id, "stop"]) => {
            state.engine.stop(parse_id(id)?).await?;
            json_response(StatusCode::OK, &json!({"running": false}))
        }
        (&Method::GET, ["sm", id, "status"]) => {
            json_response(StatusCode::OK, &state.engine.status(parse_id(id)?).await)
        }
        (&Method::GET, ["sm"]) => json_response(StatusCode::OK, &state.engine.all_statuses().await),

        // --- readings --------------------------------------------------------
        (&Method::GET, ["readings"]) => {
            let limit = query_usize(&query, "limit").unwrap_or(DEFAULT_READINGS_LIMIT);
            let samples = match (query_u64(&query, "setup_id"), query_u64(&query, "max_age_s")) {
                (Some(setup_id), Some(age)) => {
                    let mut samples = state
                        .readings
                        .since(setup_id, Duration::from_secs(age));
                    samples.truncate(limit);
                    samples
                }
                (Some(setup_id), None) => state.readings.latest(setup_id, limit),
                (None, _) => state.readings.latest_any(limit),
            };
            json_response(StatusCode::OK, &samples)
        }
        (&Method::GET, ["readings", "export.csv"]) => {
            let samples = match query_u64(&query, "setup_id") {
                Some(setup_id) => state.readings.latest(setup_id, usize::MAX),
                None => state.readings.latest_any(usize::MAX),
            };
            let csv = readings_to_csv(&samples)?;
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/csv; charset=utf-8")
                .header(
                    "Content-Disposition",
                    "attachment; filename=\"readings.csv\"",
                )
                .body(Body::from(csv))
                .expect("response builder"))
        }

        // --- dashboard -------------------------------------------------------
        (&Method::GET, ["dashboard", "summary"]) => {
            let setups = state.store.list_setups().await?;
            let instruments = state.store.list_instruments().await?;
            let referenced: std::collections::HashSet<u64> = setups
                .iter()
                .flat_map(|s| s.instruments.iter().map(|t| t.instrument_id))
                .collect();
            json_response(
                StatusCode::OK,
                &json!({
                    "timestamp": labmon_store::readings::now_micros(),
                    "monitoring_setups": setups.len(),
                    "instruments": instruments.len(),
                    "connected_instruments": referenced.len(),
                    "setups": setups,
                }),
            )
        }

        _ => Err(MonitorError::not_found("route", path)),
    }
}

#[derive(serde::Deserialize)]
struct CommandRequest {
    command: String,
}

/// Send a one-off command to an instrument through a fresh session.
async fn send_command(state: &Arc<AppState>, id: u64, command: &str) -> MonitorResult<String> {
    let instrument = state.store.get_instrument(id).await?;
    let address: InstrumentAddress = instrument.address.parse()?;
    let session = state.factory.connect(&address).await?;
    let result = execute(&session, command).await;
    session.close().await;
    Ok(result?)
}

fn parse_id(segment: &str) -> MonitorResult<u64> {
    segment
        .parse::<u64>()
        .map_err(|_| MonitorError::validation("id", format!("'{}' is not a valid id", segment)))
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(query) = query {
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some((key, value)) => out.insert(key.to_string(), value.to_string()),
                None => out.insert(pair.to_string(), String::new()),
            };
        }
    }
    out
}

fn query_u64(query: &HashMap<String, String>, key: &str) -> Option<u64> {
    query.get(key).and_then(|v| v.parse().ok())
}

fn query_usize(query: &HashMap<String, String>, key: &str) -> Option<usize> {
    query.get(key).and_then(|v| v.parse().ok())
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> MonitorResult<T> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| MonitorError::validation("body", e.to_string()))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| MonitorError::validation("body", format!("invalid JSON body: {}", e)))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> MonitorResult<Response<Body>> {
    let body = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .expect("response builder"))
}

fn status_only(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("response builder")
}

fn error_response(error: &MonitorError) -> Response<Body> {
    let status = match error {
        MonitorError::Validation { .. } | MonitorError::ParameterMissing { .. } => {
            StatusCode::BAD_REQUEST
        }
        MonitorError::NotFound { .. } => StatusCode::NOT_FOUND,
        MonitorError::NameTaken(_) | MonitorError::Conflict(_) => StatusCode::CONFLICT,
        MonitorError::Transport(e) if e.kind == TransportErrorKind::Timeout => {
            StatusCode::GATEWAY_TIMEOUT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %error, "internal error");
    }
    let body = serde_json::to_vec(&json!({"detail": error.to_string()}))
        .unwrap_or_else(|_| b"{\"detail\":\"error\"}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .expect("response builder")
}

/// Permissive CORS for the web UI; the surface carries no credentials.
fn with_cors(mut response: Response<Body>) -> Response<Body> {
    let headers = response.headers_mut();
    headers.insert(
        "Access-Control-Allow-Origin",
        hyper::header::HeaderValue::from_static("*"),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        hyper::header::HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        hyper::header::HeaderValue::from_static("Content-Type"),
    );
    response
}
