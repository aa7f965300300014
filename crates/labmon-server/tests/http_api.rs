//! In-process tests of the HTTP surface: requests go straight into the
//! handler with the mock transport behind it, no sockets involved.

use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::{json, Value};

use labmon_server::{handle, AppState};
use labmon_store::{ConfigStore, ReadingsRing};
use labmon_transport::MockTransportFactory;

struct TestApi {
    _dir: tempfile::TempDir,
    state: Arc<AppState>,
    factory: MockTransportFactory,
}

async fn api() -> TestApi {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(dir.path()).await.unwrap();
    let readings = ReadingsRing::open(dir.path(), 100).await.unwrap();
    let factory = MockTransportFactory::new();
    let state = Arc::new(
        AppState::assemble(
            store,
            readings,
            Arc::new(factory.clone()),
            Duration::from_millis(50),
        )
        .unwrap(),
    );
    TestApi {
        _dir: dir,
        state,
        factory,
    }
}

impl TestApi {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Response<Body> {
        let builder = Request::builder().method(method).uri(path);
        let request = match body {
            Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        handle(Arc::clone(&self.state), request).await
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self.request(Method::GET, path, None).await;
        split(response).await
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self.request(Method::POST, path, Some(body)).await;
        split(response).await
    }
}

async fn split(response: Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn instrument_payload(name: &str) -> Value {
    json!({
        "name": name,
        "address": format!("{name}.lab/inst0"),
        "description": json!({
            "signals": [{"id": "v", "name": "v", "measureCommand": "MEAS?"}],
            "modes": [{"id": "run", "name": "Run", "enableCommands": ["MODE RUN"],
                       "disableCommands": ["MODE OFF"], "parameters": []}],
            "signalModeConfigs": [
                {"modeId": "run", "signalId": "v", "unit": "V", "scalingFactor": 1.0}
            ]
        }).to_string(),
        "is_active": true
    })
}

fn setup_payload(name: &str, instrument_id: u64) -> Value {
    json!({
        "name": name,
        "frequency_hz": 20.0,
        "instruments": [{"instrument_id": instrument_id, "parameters": {"modeId": "run"}}]
    })
}

#[tokio::test]
async fn instrument_crud_with_conflicts() {
    let api = api().await;

    let (status, created) = api.post("/instruments", instrument_payload("psu")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], 1);
    assert_eq!(created["name"], "psu");

    // Duplicate name: 409.
    let (status, body) = api.post("/instruments", instrument_payload("psu")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["detail"].as_str().unwrap().contains("psu"));

    let (status, list) = api.get("/instruments").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    // Partial update.
    let response = api
        .request(
            Method::PUT,
            "/instruments/1",
            Some(json!({"is_active": false})),
        )
        .await;
    let (status, updated) = split(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["is_active"], false);
    assert_eq!(updated["name"], "psu");

    // Missing instrument: 404.
    let (status, _) = api.get("/instruments/99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Delete: 204, then the list is empty.
    let response = api.request(Method::DELETE, "/instruments/1", None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let (_, list) = api.get("/instruments").await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn deleting_a_referenced_instrument_is_a_conflict() {
    let api = api().await;
    let (_, instrument) = api.post("/instruments", instrument_payload("psu")).await;
    let id = instrument["id"].as_u64().unwrap();
    let (status, _) = api.post("/setups", setup_payload("bake", id)).await;
    assert_eq!(status, StatusCode::CREATED);

    let response = api
        .request(Method::DELETE, &format!("/instruments/{id}"), None)
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // After the setup goes away the delete succeeds.
    let response = api.request(Method::DELETE, "/setups/1", None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = api
        .request(Method::DELETE, &format!("/instruments/{id}"), None)
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn setup_validation_maps_to_400() {
    let api = api().await;
    let (_, instrument) = api.post("/instruments", instrument_payload("psu")).await;
    let id = instrument["id"].as_u64().unwrap();

    let mut bad = setup_payload("bake", id);
    bad["frequency_hz"] = json!(0.0);
    let (status, body) = api.post("/setups", bad).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("frequency_hz"));

    // Unknown instrument reference is validation too.
    let (status, _) = api.post("/setups", setup_payload("bake", 42)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Malformed JSON body.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/setups")
        .body(Body::from("{not json"))
        .unwrap();
    let response = handle(Arc::clone(&api.state), request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn command_endpoint_dispatches_queries_and_writes() {
    let api = api().await;
    api.factory.behavior.reply("*IDN?", "LABMON,MOCK,1");
    let (_, instrument) = api.post("/instruments", instrument_payload("psu")).await;
    let id = instrument["id"].as_u64().unwrap();

    let (status, body) = api
        .post(
            &format!("/instruments/{id}/command"),
            json!({"command": "*IDN?"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "LABMON,MOCK,1");

    // Non-query commands are acknowledged.
    let (status, body) = api
        .post(
            &format!("/instruments/{id}/command"),
            json!({"command": "OUTP ON"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "OK");

    let (status, _) = api
        .post("/instruments/99/command", json!({"command": "*IDN?"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn collect_lifecycle_over_http() {
    let api = api().await;
    api.factory.behavior.reply("MEAS?", "7.5");
    let (_, instrument) = api.post("/instruments", instrument_payload("psu")).await;
    let id = instrument["id"].as_u64().unwrap();
    let (_, setup) = api.post("/setups", setup_payload("bake", id)).await;
    let setup_id = setup["id"].as_u64().unwrap();

    let (status, body) = api.post(&format!("/collect/{setup_id}/start"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);

    // Wait for at least one sample, then check status and readings.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let (_, status_body) = api.get(&format!("/collect/{setup_id}/status")).await;
    assert_eq!(status_body["running"], true);
    assert!(status_body["last_success_ts"].is_string());

    let (_, readings) = api
        .get(&format!("/readings?setup_id={setup_id}&limit=3"))
        .await;
    let readings = readings.as_array().unwrap().clone();
    assert!(!readings.is_empty());
    assert!(readings.len() <= 3);
    assert_eq!(readings[0]["targets"][0]["signals"]["v"]["value"], 7.5);

    let (status, body) = api.post(&format!("/collect/{setup_id}/stop"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);
    let (_, status_body) = api.get(&format!("/collect/{setup_id}/status")).await;
    assert_eq!(status_body["running"], false);

    // Reset clears this setup's readings.
    let (_, reset) = api.post(&format!("/collect/{setup_id}/reset"), json!({})).await;
    assert!(reset["removed"].as_u64().unwrap() > 0);
    let (_, readings) = api.get(&format!("/readings?setup_id={setup_id}")).await;
    assert!(readings.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn collect_once_returns_the_sample() {
    let api = api().await;
    api.factory.behavior.reply("MEAS?", "1.5");
    let (_, instrument) = api.post("/instruments", instrument_payload("psu")).await;
    let id = instrument["id"].as_u64().unwrap();
    let (_, setup) = api.post("/setups", setup_payload("once", id)).await;
    let setup_id = setup["id"].as_u64().unwrap();

    let (status, sample) = api.post(&format!("/collect/{setup_id}/once"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sample["setup_name"], "once");
    assert_eq!(sample["targets"][0]["signals"]["v"]["raw_value"], 1.5);
}

#[tokio::test]
async fn state_machine_endpoints_drive_a_session() {
    let api = api().await;
    api.factory.behavior.reply("MEAS?", "1.0");
    let (_, instrument) = api.post("/instruments", instrument_payload("psu")).await;
    let id = instrument["id"].as_u64().unwrap();

    let mut payload = setup_payload("drive", id);
    payload["states"] = json!([
        {"id": "idle", "name": "Idle", "isEndState": false, "instrumentSettings": {}},
        {"id": "done", "name": "Done", "isEndState": true, "instrumentSettings": {}}
    ]);
    payload["transitions"] = json!([
        {"id": "t1", "sourceStateID": "idle", "targetStateID": "done",
         "rules": [{"type": "timeInState", "seconds": 0.2}]}
    ]);
    payload["initialStateID"] = json!("idle");
    let (status, setup) = api.post("/setups", payload).await;
    assert_eq!(status, StatusCode::CREATED);
    let setup_id = setup["id"].as_u64().unwrap();

    let (status, body) = api.post(&format!("/sm/{setup_id}/start"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);
    assert_eq!(body["current_state_id"], "idle");

    // All-session listing includes it.
    let (_, sessions) = api.get("/sm").await;
    assert_eq!(sessions.as_array().unwrap().len(), 1);

    // The time rule ends the session on its own.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let (_, status_body) = api.get(&format!("/sm/{setup_id}/status")).await;
        if status_body["running"] == false {
            assert_eq!(status_body["current_state_id"], "done");
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never finished"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Stop after finish is a no-op.
    let (status, _) = api.post(&format!("/sm/{setup_id}/stop"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn sm_start_without_state_machine_is_400() {
    let api = api().await;
    let (_, instrument) = api.post("/instruments", instrument_payload("psu")).await;
    let id = instrument["id"].as_u64().unwrap();
    let (_, setup) = api.post("/setups", setup_payload("plain", id)).await;
    let setup_id = setup["id"].as_u64().unwrap();

    let (status, body) = api.post(&format!("/sm/{setup_id}/start"), json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("state machine"));

    // Status for a never-started setup is a clean not-running snapshot.
    let (status, body) = api.get(&format!("/sm/{setup_id}/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);
}

#[tokio::test]
async fn csv_export_streams_flattened_rows() {
    let api = api().await;
    api.factory.behavior.reply("MEAS?", "2.25");
    let (_, instrument) = api.post("/instruments", instrument_payload("psu")).await;
    let id = instrument["id"].as_u64().unwrap();
    let (_, setup) = api.post("/setups", setup_payload("csv", id)).await;
    let setup_id = setup["id"].as_u64().unwrap();
    api.post(&format!("/collect/{setup_id}/once"), json!({})).await;

    let response = api
        .request(Method::GET, "/readings/export.csv", None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("Content-Type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.lines().next().unwrap().starts_with("timestamp,"));
    assert!(text.contains("2.25"));
    assert!(text.contains("csv"));
}

#[tokio::test]
async fn unknown_routes_bad_ids_and_cors() {
    let api = api().await;

    let (status, _) = api.get("/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = api.get("/instruments/abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = api.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    // Preflight and CORS headers.
    let response = api.request(Method::OPTIONS, "/instruments", None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("Access-Control-Allow-Origin")
            .unwrap(),
        "*"
    );

    let (_, summary) = api.get("/dashboard/summary").await;
    assert_eq!(summary["monitoring_setups"], 0);
}
