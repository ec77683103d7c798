//! HTTP ingestion and replay API over a single [`EventStore`].
//!
//! Routes:
//!
//! | method | path | body / query |
//! |---|---|---|
//! | `POST` | `/events` | `{attempt_id, events}`; 201 once durably stored |
//! | `POST` | `/attempts` | `{assignment_id?, starter_state?}` |
//! | `POST` | `/attempts/{id}/finish` | `{final_state?}` |
//! | `GET` | `/attempts` | `?assignment_id=` |
//! | `GET` | `/events/{id}` | `?after=&limit=` |
//! | `GET` | `/replay/{id}` | |
//! | `GET` | `/replay/{id}/metrics` | |
//! | `GET` | `/replay/{id}/snapshot` | `?seq=` or `?step=` |
//! | `GET` | `/health` | |
//!
//! Every route answers `OPTIONS` with CORS headers so browser clients can
//! post events cross-origin. Errors carry the stable `E####` code.

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use chrono::Utc;
use quill_core::config::{ProjectConfig, ServerConfig};
use quill_core::error::ErrorCode;
use quill_core::event::EventBatch;
use quill_core::metrics::MetricsCache;
use quill_core::replay::{ReplayError, Timeline, reconstruct_at_sequence, reconstruct_at_step};
use quill_core::store::{EventStore, NewAttempt, StoreError, StoredEvent};
use quill_core::{AttemptId, FileMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
    pub events_limit: usize,
}

impl From<&ServerConfig> for ServeConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            events_limit: config.events_limit,
        }
    }
}

/// Everything a request handler needs.
#[derive(Debug)]
pub struct ServerState {
    store: EventStore,
    cache: MetricsCache,
    events_limit: usize,
    default_file: String,
}

impl ServerState {
    pub fn new(store: EventStore, project: &ProjectConfig, events_limit: usize) -> Self {
        Self {
            store,
            cache: MetricsCache::new(project.metrics.clone()),
            events_limit,
            default_file: project.recorder.default_file.clone(),
        }
    }

    #[cfg(test)]
    fn in_memory() -> Self {
        let store = EventStore::open_in_memory().expect("in-memory store");
        Self::new(store, &ProjectConfig::default(), 3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
    Options,
}

impl ApiMethod {
    fn from_http(method: &tiny_http::Method) -> Option<Self> {
        match method {
            tiny_http::Method::Get => Some(Self::Get),
            tiny_http::Method::Post => Some(Self::Post),
            tiny_http::Method::Options => Some(Self::Options),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status_code: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub extra_headers: Vec<tiny_http::Header>,
}

impl ApiResponse {
    fn json<T: Serialize>(status_code: u16, value: &T) -> Result<Self, ApiError> {
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| ApiError::new(500, ErrorCode::InternalUnexpected, e.to_string()))?;
        Ok(Self {
            status_code,
            content_type: "application/json",
            body,
            extra_headers: cors_headers(),
        })
    }

    fn text(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            content_type: "text/plain",
            body: body.into(),
            extra_headers: cors_headers(),
        }
    }
}

/// A failed request, rendered as `{"error": {code, message, hint}}`.
#[derive(Debug)]
struct ApiError {
    status: u16,
    code: ErrorCode,
    message: String,
}

impl ApiError {
    fn new(status: u16, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, ErrorCode::InvalidRequest, message)
    }

    fn into_response(self) -> ApiResponse {
        let body = serde_json::json!({
            "error": {
                "code": self.code.code(),
                "message": self.message,
                "hint": self.code.hint(),
            }
        });
        let bytes = serde_json::to_vec_pretty(&body).unwrap_or_else(|_| b"{}".to_vec());
        ApiResponse {
            status_code: self.status,
            content_type: "application/json",
            body: bytes,
            extra_headers: cors_headers(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::AttemptNotFound(_) => 404,
            StoreError::AttemptFinished(_) => 409,
            _ if err.is_client_error() => 400,
            _ => 500,
        };
        if status >= 500 {
            error!(error = %err, "store failure while serving request");
        }
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<ReplayError> for ApiError {
    fn from(err: ReplayError) -> Self {
        Self::new(400, err.code(), err.to_string())
    }
}

fn header(name: &str, value: &str) -> Option<tiny_http::Header> {
    tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn cors_headers() -> Vec<tiny_http::Header> {
    [
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
        ("Access-Control-Allow-Headers", "Content-Type"),
    ]
    .into_iter()
    .filter_map(|(name, value)| header(name, value))
    .collect()
}

fn parse_query(url: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some((_path, qs)) = url.split_once('?') else {
        return out;
    };
    for part in qs.split('&') {
        if part.trim().is_empty() {
            continue;
        }
        let (k, v) = part.split_once('=').unwrap_or((part, ""));
        out.insert(k.to_string(), v.to_string());
    }
    out
}

fn query_number<T: std::str::FromStr>(
    query: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ApiError> {
    query
        .get(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| ApiError::bad_request(format!("query parameter {key}={raw} is not a number")))
        })
        .transpose()
}

fn parse_json_body<T: for<'de> Deserialize<'de>>(body: Option<&[u8]>) -> Result<T, ApiError> {
    let raw = body.ok_or_else(|| ApiError::bad_request("request body is required"))?;
    serde_json::from_slice(raw).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

fn parse_id(raw: &str) -> Result<AttemptId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("'{raw}' is not an attempt id")))
}

/// Methods a known path accepts, for 405 responses.
fn allowed_methods(segments: &[&str]) -> Option<&'static str> {
    match segments {
        ["health"] | ["events", _] | ["replay", _] | ["replay", _, "metrics" | "snapshot"] => {
            Some("GET")
        }
        ["events"] | ["attempts", _, "finish"] => Some("POST"),
        ["attempts"] => Some("GET, POST"),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
struct CreateAttemptRequest {
    #[serde(default, alias = "assignmentId")]
    assignment_id: Option<String>,
    #[serde(default, alias = "starterState")]
    starter_state: FileMap,
}

#[derive(Debug, Default, Deserialize)]
struct FinishRequest {
    #[serde(default, alias = "finalState")]
    final_state: Option<FileMap>,
}

/// Route one request. Never fails: errors become JSON error responses.
pub fn handle_request(
    state: &mut ServerState,
    method: ApiMethod,
    url: &str,
    body: Option<&[u8]>,
) -> ApiResponse {
    if method == ApiMethod::Options {
        return ApiResponse::text(204, "");
    }
    route(state, method, url, body).unwrap_or_else(ApiError::into_response)
}

fn route(
    state: &mut ServerState,
    method: ApiMethod,
    url: &str,
    body: Option<&[u8]>,
) -> Result<ApiResponse, ApiError> {
    let (path, _qs) = url.split_once('?').unwrap_or((url, ""));
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let query = parse_query(url);

    match (method, segments.as_slice()) {
        (ApiMethod::Get, ["health"]) => Ok(ApiResponse::text(200, "ok\n")),
        (ApiMethod::Post, ["events"]) => post_events(state, body),
        (ApiMethod::Post, ["attempts"]) => {
            let request: CreateAttemptRequest = match body {
                Some(_) => parse_json_body(body)?,
                None => CreateAttemptRequest::default(),
            };
            let attempt = state.store.create_attempt(&NewAttempt {
                assignment_id: request.assignment_id,
                started_at: None,
                starter_state: request.starter_state,
            })?;
            ApiResponse::json(201, &attempt)
        }
        (ApiMethod::Post, ["attempts", id, "finish"]) => {
            let id = parse_id(id)?;
            let request: FinishRequest = match body {
                Some(_) => parse_json_body(body)?,
                None => FinishRequest::default(),
            };
            let report = state
                .store
                .finish_attempt(id, request.final_state.as_ref(), None)?;
            state.cache.invalidate(id);
            ApiResponse::json(200, &report)
        }
        (ApiMethod::Get, ["attempts"]) => {
            let attempts = state
                .store
                .list_attempts(query.get("assignment_id").map(String::as_str))?;
            ApiResponse::json(200, &attempts)
        }
        (ApiMethod::Get, ["events", id]) => get_events(state, parse_id(id)?, &query),
        (ApiMethod::Get, ["replay", id]) => {
            let id = parse_id(id)?;
            let attempt = state.store.attempt(id)?;
            let events = state.store.ledger(id)?;
            let meaningful = Timeline::from_stored(&events).meaningful_sequences(&state.default_file);
            ApiResponse::json(
                200,
                &serde_json::json!({
                    "attempt": attempt,
                    "events": events,
                    "meaningful_sequences": meaningful,
                }),
            )
        }
        (ApiMethod::Get, ["replay", id, "metrics"]) => {
            let id = parse_id(id)?;
            let attempt = state.store.attempt(id)?;
            let timeline = Timeline::from_stored(&state.store.ledger(id)?);
            let metrics = state.cache.get_or_compute(&attempt, &timeline, Utc::now());
            ApiResponse::json(200, &metrics)
        }
        (ApiMethod::Get, ["replay", id, "snapshot"]) => get_snapshot(state, parse_id(id)?, &query),
        (_, segments) => match allowed_methods(segments) {
            Some(allowed) => Err(ApiError::new(
                405,
                ErrorCode::InvalidRequest,
                format!("{method:?} is not allowed for {path}; use {allowed}"),
            )),
            None => Err(ApiError::new(
                404,
                ErrorCode::InvalidRequest,
                format!("no route for {path}"),
            )),
        },
    }
}

fn get_events(
    state: &ServerState,
    id: AttemptId,
    query: &HashMap<String, String>,
) -> Result<ApiResponse, ApiError> {
    state.store.attempt(id)?;
    let after = query_number::<u64>(query, "after")?;
    let limit = query_number::<usize>(query, "limit")?.unwrap_or(state.events_limit);
    let events = state.store.ledger_page(id, after, Some(limit))?;
    let next_after = (events.len() == limit)
        .then(|| events.last().map(StoredEvent::sequence))
        .flatten();
    ApiResponse::json(
        200,
        &serde_json::json!({
            "attempt_id": id,
            "events": events,
            "next_after": next_after,
        }),
    )
}

fn get_snapshot(
    state: &ServerState,
    id: AttemptId,
    query: &HashMap<String, String>,
) -> Result<ApiResponse, ApiError> {
    let attempt = state.store.attempt(id)?;
    let timeline = Timeline::from_stored(&state.store.ledger(id)?);
    let starter = &attempt.starter_state;
    let snapshot = match (
        query_number::<u64>(query, "seq")?,
        query_number::<usize>(query, "step")?,
    ) {
        (Some(seq), None) => reconstruct_at_sequence(&timeline, starter, &state.default_file, seq)?,
        (None, Some(step)) => reconstruct_at_step(&timeline, starter, &state.default_file, step)?,
        _ => return Err(ApiError::bad_request("pass exactly one of seq or step")),
    };
    ApiResponse::json(200, &snapshot)
}

fn post_events(state: &mut ServerState, body: Option<&[u8]>) -> Result<ApiResponse, ApiError> {
    let batch: EventBatch = parse_json_body(body)?;
    let report = state.store.ingest(&batch).inspect_err(|err| {
        warn!(attempt_id = batch.attempt_id, error = %err, "batch rejected");
    })?;
    if report.inserted > 0 {
        state.cache.invalidate(batch.attempt_id);
    }
    debug!(
        attempt_id = batch.attempt_id,
        inserted = report.inserted,
        duplicates = report.duplicates,
        "batch stored"
    );
    ApiResponse::json(201, &report)
}

/// Bind and serve until the process is stopped.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub fn serve(config: &ServeConfig, mut state: ServerState) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let server = tiny_http::Server::http(&addr).map_err(|e| anyhow!("failed to bind {addr}: {e}"))?;

    info!(%addr, "quill serve listening");
    eprintln!("quill serve listening on http://{addr}");

    for mut req in server.incoming_requests() {
        let Some(method) = ApiMethod::from_http(req.method()) else {
            let _ = req.respond(tiny_http::Response::empty(405));
            continue;
        };

        let mut request_body = Vec::new();
        if method == ApiMethod::Post {
            if let Err(err) = req.as_reader().read_to_end(&mut request_body) {
                warn!(error = %err, "failed to read request body");
                let _ = req.respond(tiny_http::Response::empty(400));
                continue;
            }
        }

        let url = req.url().to_string();
        let response = handle_request(
            &mut state,
            method,
            &url,
            if request_body.is_empty() {
                None
            } else {
                Some(request_body.as_slice())
            },
        );
        debug!(?method, %url, status = response.status_code, "request served");

        let mut tiny = tiny_http::Response::from_data(response.body)
            .with_status_code(response.status_code);
        if let Some(content_type) = header("Content-Type", response.content_type) {
            tiny = tiny.with_header(content_type);
        }
        for h in response.extra_headers {
            tiny = tiny.with_header(h);
        }
        let _ = req.respond(tiny);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn json_value(resp: &ApiResponse) -> Value {
        serde_json::from_slice(&resp.body).expect("json")
    }

    fn get(state: &mut ServerState, url: &str) -> ApiResponse {
        handle_request(state, ApiMethod::Get, url, None)
    }

    fn post(state: &mut ServerState, url: &str, body: &Value) -> ApiResponse {
        let bytes = serde_json::to_vec(body).expect("body");
        handle_request(state, ApiMethod::Post, url, Some(&bytes))
    }

    fn create_attempt(state: &mut ServerState) -> i64 {
        let resp = post(
            state,
            "/attempts",
            &serde_json::json!({"assignment_id": "hw1", "starter_state": {"main.py": ""}}),
        );
        assert_eq!(resp.status_code, 201);
        json_value(&resp)["id"].as_i64().expect("id")
    }

    fn edit(seq: u64, t: f64, code: &str) -> Value {
        let payload = serde_json::json!({"fullCode": code}).to_string();
        serde_json::json!({
            "t": t, "seq": seq, "type": "edit", "file_path": "main.py", "payload_json": payload
        })
    }

    fn paste(seq: u64, t: f64, size: usize) -> Value {
        let payload = serde_json::json!({"size": size}).to_string();
        serde_json::json!({
            "t": t, "seq": seq, "type": "paste", "file_path": "main.py", "payload_json": payload
        })
    }

    #[test]
    fn options_returns_cors() {
        let mut state = ServerState::in_memory();
        let resp = handle_request(&mut state, ApiMethod::Options, "/events", None);
        assert_eq!(resp.status_code, 204);
        assert_eq!(resp.extra_headers.len(), 3);
    }

    #[test]
    fn health_ok() {
        let mut state = ServerState::in_memory();
        let resp = get(&mut state, "/health");
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, b"ok\n");
    }

    #[test]
    fn post_events_stores_and_resend_is_duplicate() {
        let mut state = ServerState::in_memory();
        let id = create_attempt(&mut state);
        let batch = serde_json::json!({"attemptId": id, "events": [edit(1, 0.5, "a"), edit(2, 1.0, "ab")]});

        let first = post(&mut state, "/events", &batch);
        assert_eq!(first.status_code, 201);
        assert_eq!(json_value(&first)["inserted"], 2);

        let again = post(&mut state, "/events", &batch);
        assert_eq!(again.status_code, 201);
        let v = json_value(&again);
        assert_eq!(v["inserted"], 0);
        assert_eq!(v["duplicates"], 2);
    }

    #[test]
    fn collision_is_acknowledged_and_flagged() {
        let mut state = ServerState::in_memory();
        let id = create_attempt(&mut state);
        post(&mut state, "/events", &serde_json::json!({"attempt_id": id, "events": [edit(1, 0.5, "a")]}));
        let resp = post(
            &mut state,
            "/events",
            &serde_json::json!({"attempt_id": id, "events": [edit(1, 0.5, "zzz")]}),
        );
        assert_eq!(resp.status_code, 201);
        assert_eq!(json_value(&resp)["collisions"], 1);
        assert_eq!(state.store.flags(id).expect("flags").len(), 1);
    }

    #[test]
    fn events_for_unknown_attempt_is_404_with_code() {
        let mut state = ServerState::in_memory();
        let resp = post(
            &mut state,
            "/events",
            &serde_json::json!({"attempt_id": 99, "events": [edit(1, 0.0, "a")]}),
        );
        assert_eq!(resp.status_code, 404);
        assert_eq!(json_value(&resp)["error"]["code"], "E2001");
    }

    #[test]
    fn malformed_body_is_400() {
        let mut state = ServerState::in_memory();
        let resp = handle_request(&mut state, ApiMethod::Post, "/events", Some(b"{nope"));
        assert_eq!(resp.status_code, 400);
        assert_eq!(json_value(&resp)["error"]["code"], "E6001");

        let resp = handle_request(&mut state, ApiMethod::Post, "/events", None);
        assert_eq!(resp.status_code, 400);
    }

    #[test]
    fn replay_returns_ordered_ledger() {
        let mut state = ServerState::in_memory();
        let id = create_attempt(&mut state);
        post(&mut state, "/events", &serde_json::json!({"attempt_id": id, "events": [edit(2, 1.0, "ab")]}));
        post(&mut state, "/events", &serde_json::json!({"attempt_id": id, "events": [edit(1, 0.5, "a")]}));

        let resp = get(&mut state, &format!("/replay/{id}"));
        assert_eq!(resp.status_code, 200);
        let v = json_value(&resp);
        assert_eq!(v["attempt"]["id"], id);
        assert_eq!(v["events"][0]["seq"], 1);
        assert_eq!(v["events"][1]["seq"], 2);
        assert_eq!(v["meaningful_sequences"], serde_json::json!([1, 2]));
    }

    #[test]
    fn snapshot_by_seq_and_step() {
        let mut state = ServerState::in_memory();
        let id = create_attempt(&mut state);
        post(
            &mut state,
            "/events",
            &serde_json::json!({"attempt_id": id, "events": [
                edit(1, 0.5, "a"), edit(2, 0.7, "a"), edit(3, 1.0, "ab")
            ]}),
        );

        let by_seq = json_value(&get(&mut state, &format!("/replay/{id}/snapshot?seq=1")));
        assert_eq!(by_seq["files"]["main.py"], "a");

        // Seq 2 repeats seq 1's code, so step 1 is seq 3.
        let by_step = json_value(&get(&mut state, &format!("/replay/{id}/snapshot?step=1")));
        assert_eq!(by_step["at_sequence"], 3);
        assert_eq!(by_step["files"]["main.py"], "ab");

        let past_end = get(&mut state, &format!("/replay/{id}/snapshot?seq=10"));
        assert_eq!(past_end.status_code, 400);
        let neither = get(&mut state, &format!("/replay/{id}/snapshot"));
        assert_eq!(neither.status_code, 400);
        let bad = get(&mut state, &format!("/replay/{id}/snapshot?seq=x"));
        assert_eq!(bad.status_code, 400);
    }

    #[test]
    fn metrics_count_pastes() {
        let mut state = ServerState::in_memory();
        let id = create_attempt(&mut state);
        post(
            &mut state,
            "/events",
            &serde_json::json!({"attempt_id": id, "events": [paste(1, 1.0, 20), paste(2, 2.0, 500)]}),
        );

        let resp = get(&mut state, &format!("/replay/{id}/metrics"));
        assert_eq!(resp.status_code, 200);
        let v = json_value(&resp);
        assert_eq!(v["pasteCount"], 2);
        assert_eq!(v["largePasteCount"], 1);
        assert_eq!(v["eventCount"], 2);
    }

    #[test]
    fn events_are_paged() {
        let mut state = ServerState::in_memory();
        let id = create_attempt(&mut state);
        let events: Vec<Value> = (1..=5).map(|seq| paste(seq, 0.0, 1)).collect();
        post(&mut state, "/events", &serde_json::json!({"attempt_id": id, "events": events}));

        // Server limit is 3 in tests.
        let first = json_value(&get(&mut state, &format!("/events/{id}")));
        assert_eq!(first["events"].as_array().map(Vec::len), Some(3));
        assert_eq!(first["next_after"], 3);

        let rest = json_value(&get(&mut state, &format!("/events/{id}?after=3&limit=10")));
        assert_eq!(rest["events"].as_array().map(Vec::len), Some(2));
        assert!(rest["next_after"].is_null());
    }

    #[test]
    fn attempts_filter_by_assignment() {
        let mut state = ServerState::in_memory();
        create_attempt(&mut state);
        post(&mut state, "/attempts", &serde_json::json!({"assignmentId": "hw2"}));

        let all = json_value(&get(&mut state, "/attempts"));
        assert_eq!(all.as_array().map(Vec::len), Some(2));
        let hw2 = json_value(&get(&mut state, "/attempts?assignment_id=hw2"));
        assert_eq!(hw2.as_array().map(Vec::len), Some(1));
        assert_eq!(hw2[0]["assignment_id"], "hw2");
    }

    #[test]
    fn finish_twice_conflicts() {
        let mut state = ServerState::in_memory();
        let id = create_attempt(&mut state);
        let url = format!("/attempts/{id}/finish");
        let first = post(&mut state, &url, &serde_json::json!({"final_state": {"main.py": ""}}));
        assert_eq!(first.status_code, 200);
        assert!(json_value(&first)["gaps"].as_array().is_some_and(Vec::is_empty));

        let second = post(&mut state, &url, &serde_json::json!({}));
        assert_eq!(second.status_code, 409);
        assert_eq!(json_value(&second)["error"]["code"], "E2002");
    }

    #[test]
    fn unknown_route_404_and_wrong_method_405() {
        let mut state = ServerState::in_memory();
        assert_eq!(get(&mut state, "/nope").status_code, 404);
        assert_eq!(get(&mut state, "/events").status_code, 405);
        assert_eq!(
            handle_request(&mut state, ApiMethod::Post, "/replay/1", None).status_code,
            405
        );
    }

    #[test]
    fn query_parsing() {
        let q = parse_query("/events/1?after=3&limit=&flag");
        assert_eq!(q.get("after").map(String::as_str), Some("3"));
        assert_eq!(q.get("limit").map(String::as_str), Some(""));
        assert_eq!(q.get("flag").map(String::as_str), Some(""));
        assert!(parse_query("/events/1").is_empty());
    }
}
