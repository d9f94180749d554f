//! Minimal HTTP/1.1 front end over the inspection pipeline.
//!
//! One request per connection. Accepted connections are handed to a fixed
//! worker pool, so a slow inference never stalls the accept loop or other
//! clients. Errors map onto status codes by taxonomy (see
//! [`InspectError::http_status`]) with a `{"error", "message"}` body.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::aggregate::{Category, Counts};
use crate::config::ApiSettings;
use crate::detect::{BoundingBox, Detection};
use crate::error::InspectError;
use crate::ingest::UploadSource;
use crate::record::DetectionRecord;
use crate::session::Pipeline;
use crate::storage::{RecordFilter, RecordKey};
use crate::worker::WorkerPool;

const MAX_HEADER_BYTES: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub workers: usize,
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from(&ApiSettings::default())
    }
}

impl From<&ApiSettings> for ApiConfig {
    fn from(settings: &ApiSettings) -> Self {
        Self {
            addr: settings.addr.clone(),
            workers: settings.workers,
            max_body_bytes: settings.max_body_bytes,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, let in-flight requests finish, and join the server thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    pipeline: Pipeline,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, pipeline: Pipeline) -> Self {
        Self { cfg, pipeline }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;
        let pool = WorkerPool::new("api", self.cfg.workers)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let state = Arc::new(ApiState {
            pipeline: self.pipeline,
            max_body_bytes: self.cfg.max_body_bytes,
        });
        let join = std::thread::Builder::new()
            .name("api-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, pool, state, shutdown_thread) {
                    log::error!("inspection api stopped: {}", err);
                }
            })?;
        log::info!("inspection api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct ApiState {
    pipeline: Pipeline,
    max_body_bytes: usize,
}

fn run_api(
    listener: TcpListener,
    mut pool: WorkerPool,
    state: Arc<ApiState>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let state = state.clone();
                pool.spawn(move || {
                    if let Err(err) = handle_connection(stream, &state) {
                        log::warn!("inspection api connection dropped: {}", err);
                    }
                })?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    pool.shutdown();
    Ok(())
}

fn handle_connection(mut stream: TcpStream, state: &ApiState) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        return Response::plain_error(403, "forbidden", "loopback-only api").write_to(&mut stream);
    }

    let request = match read_request(&mut stream, state.max_body_bytes) {
        Ok(request) => request,
        Err(RequestError::TooLarge) => {
            log::warn!("inspection api request from {} rejected: too large", peer);
            return Response::plain_error(413, "payload_too_large", "request exceeds size limit")
                .write_to(&mut stream);
        }
        Err(RequestError::Malformed(msg)) => {
            log::warn!("inspection api request from {} rejected: {}", peer, msg);
            return Response::plain_error(400, "bad_request", &msg).write_to(&mut stream);
        }
        Err(RequestError::Io(err)) => return Err(err.into()),
    };

    let response = route(&request, &state.pipeline);
    if response.status >= 400 {
        log::warn!(
            "inspection api {} {} -> {}",
            request.method,
            request.path,
            response.status
        );
    } else {
        log::debug!(
            "inspection api {} {} -> {}",
            request.method,
            request.path,
            response.status
        );
    }
    response.write_to(&mut stream)
}

fn route(request: &HttpRequest, pipeline: &Pipeline) -> Response {
    let segments: Vec<&str> = request
        .path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    let result = match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => Ok(Response::json(200, &json!({ "status": "ok" }))),
        ("POST", ["upload"]) => submit_upload(request, pipeline),
        ("POST", ["capture"]) => submit_capture(request, pipeline),
        ("GET", ["detections"]) => list_detections(request, pipeline),
        ("GET", ["detections", id]) => get_detection(id, pipeline),
        ("DELETE", ["detections"]) => delete_detection_by_id(request, pipeline),
        ("DELETE", ["detections", key]) => delete_detection(key, pipeline),
        ("GET", ["export.csv"]) => export_csv(request, pipeline),
        (
            _,
            ["health"] | ["upload"] | ["capture"] | ["detections"] | ["detections", _]
            | ["export.csv"],
        ) => {
            return Response::plain_error(
                405,
                "method_not_allowed",
                &format!("{} is not supported on {}", request.method, request.path),
            )
        }
        _ => {
            return Response::plain_error(
                404,
                "not_found",
                &format!("no route for {}", request.path),
            )
        }
    };
    result.unwrap_or_else(|err| Response::error(&err))
}

fn submit_upload(request: &HttpRequest, pipeline: &Pipeline) -> Result<Response, InspectError> {
    let chamber = request.query_param("chamber_id").unwrap_or_default();
    let mut source = UploadSource::new(request.body.clone(), "upload");
    let outcome = pipeline.run(chamber, &mut source)?;
    Ok(Response::json(200, &RecordView::from(&outcome.record)))
}

#[derive(Debug, Deserialize)]
struct CaptureRequest {
    #[serde(default)]
    chamber_id: String,
    image_data: String,
}

fn submit_capture(request: &HttpRequest, pipeline: &Pipeline) -> Result<Response, InspectError> {
    let capture: CaptureRequest = serde_json::from_slice(&request.body)
        .map_err(|e| InspectError::Validation(format!("invalid capture payload: {e}")))?;
    // Blank chamber ids are rejected before the payload is even decoded.
    let mut controller = pipeline.controller();
    controller.identify(&capture.chamber_id)?;
    let mut source = UploadSource::from_data_url(&capture.image_data, "capture")?;
    controller.acquire(&mut source)?;
    controller.infer()?;
    let record = controller.persist()?;
    controller.display()?;
    Ok(Response::json(200, &RecordView::from(&record)))
}

fn list_detections(request: &HttpRequest, pipeline: &Pipeline) -> Result<Response, InspectError> {
    let query = pipeline.query();
    let records = if let Some(chamber) = request.query_param("chamber_id") {
        match query.by_chamber(chamber) {
            Ok(records) => records.into_vec(),
            Err(InspectError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err),
        }
    } else if let Some(substring) = request.query_param("search") {
        query.search(substring)?
    } else {
        query.list(&RecordFilter::all())?
    };
    let views: Vec<RecordView> = records.iter().map(RecordView::from).collect();
    Ok(Response::json(200, &views))
}

fn parse_record_id(raw_id: &str) -> Result<i64, InspectError> {
    raw_id
        .trim()
        .parse()
        .map_err(|_| InspectError::Validation(format!("record id must be an integer, got '{raw_id}'")))
}

fn get_detection(raw_id: &str, pipeline: &Pipeline) -> Result<Response, InspectError> {
    let record = pipeline.query().by_id(parse_record_id(raw_id)?)?;
    Ok(Response::json(200, &RecordView::from(&record)))
}

/// `DELETE /detections/{key}`: the key is a chamber id in upsert mode and a
/// record id in append mode. Upserts replace the record, so its id changes on
/// every write; `DELETE /detections?id=N` takes the id from `GET` in either mode.
fn delete_detection(raw_key: &str, pipeline: &Pipeline) -> Result<Response, InspectError> {
    let key = decode_path_segment(raw_key)?;
    let store = pipeline.store();
    let key = RecordKey::parse_for(store.mode(), &key)?;
    deleted(store.delete(&key)?)
}

fn delete_detection_by_id(request: &HttpRequest, pipeline: &Pipeline) -> Result<Response, InspectError> {
    let raw_id = request
        .query_param("id")
        .ok_or_else(|| InspectError::Validation("id query parameter is required".into()))?;
    deleted(pipeline.store().delete(&RecordKey::Id(parse_record_id(raw_id)?))?)
}

fn deleted(removed: DetectionRecord) -> Result<Response, InspectError> {
    Ok(Response::json(
        200,
        &json!({ "deleted": RecordView::from(&removed) }),
    ))
}

fn export_csv(request: &HttpRequest, pipeline: &Pipeline) -> Result<Response, InspectError> {
    let body = pipeline
        .query()
        .export_matching(request.query_param("search"))?;
    Ok(Response {
        status: 200,
        content_type: "text/csv; charset=utf-8",
        body,
    })
}

/// Wire projection of a stored record.
#[derive(Debug, Serialize)]
struct RecordView {
    id: i64,
    chamber_id: String,
    timestamp: DateTime<Utc>,
    counts: Counts,
    detections: Vec<DetectionView>,
    image_ref: Option<String>,
    result_image_ref: Option<String>,
}

#[derive(Debug, Serialize)]
struct DetectionView {
    class: &'static str,
    class_id: u32,
    confidence: f32,
    bbox: BoundingBox,
}

impl From<&Detection> for DetectionView {
    fn from(detection: &Detection) -> Self {
        Self {
            class: Category::for_class(detection.class_id).label(),
            class_id: detection.class_id,
            confidence: detection.confidence,
            bbox: detection.bbox,
        }
    }
}

impl From<&DetectionRecord> for RecordView {
    fn from(record: &DetectionRecord) -> Self {
        Self {
            id: record.id,
            chamber_id: record.chamber_id.clone(),
            timestamp: record.timestamp,
            counts: record.counts,
            detections: record.raw_detections.iter().map(DetectionView::from).collect(),
            image_ref: record.image_ref.clone(),
            result_image_ref: record.result_image_ref.clone(),
        }
    }
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(err) => {
                log::error!("failed to encode response body: {}", err);
                Self::plain_error(500, "internal_error", "response encoding failed")
            }
        }
    }

    fn error(err: &InspectError) -> Self {
        Self::plain_error(err.http_status(), err.code(), &err.to_string())
    }

    fn plain_error(status: u16, code: &str, message: &str) -> Self {
        let body = json!({ "error": code, "message": message }).to_string();
        Self {
            status,
            content_type: "application/json",
            body: body.into_bytes(),
        }
    }

    fn write_to(&self, stream: &mut TcpStream) -> Result<()> {
        write_response(stream, self.status, self.content_type, &self.body)
    }
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        504 => "HTTP/1.1 504 Gateway Timeout",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug, Error)]
enum RequestError {
    #[error("request too large")]
    TooLarge,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    /// First value for `key`, percent-decoded. Empty values count as absent.
    fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }
}

fn read_request(stream: &mut TcpStream, max_body: usize) -> Result<HttpRequest, RequestError> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(RequestError::TooLarge);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Malformed(
                "connection closed before end of headers".into(),
            ));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RequestError::Malformed("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RequestError::Malformed("missing method".into()))?;
    let raw_path = parts
        .next()
        .ok_or_else(|| RequestError::Malformed("missing path".into()))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed(format!("invalid content-length '{value}'")))?,
        None => 0,
    };
    if content_length > max_body {
        return Err(RequestError::TooLarge);
    }
    let mut body: Vec<u8> = data[header_end + 4..].to_vec();
    body.truncate(content_length);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Malformed(
                "body shorter than content-length".into(),
            ));
        }
        let take = n.min(content_length - body.len());
        body.extend_from_slice(&buf[..take]);
    }

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        query: url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
        body,
    })
}

fn decode_path_segment(raw: &str) -> Result<String, InspectError> {
    // percent_decode_str passes malformed escapes through; reject them instead.
    for (pos, _) in raw.match_indices('%') {
        let escape = raw.as_bytes().get(pos + 1..pos + 3).unwrap_or_default();
        if escape.len() != 2 || !escape.iter().all(u8::is_ascii_hexdigit) {
            return Err(InspectError::Validation(format!("bad escape in '{raw}'")));
        }
    }
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| InspectError::Validation(format!("'{raw}' is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segments_are_percent_decoded() {
        assert_eq!(decode_path_segment("A1%2D01%20x").unwrap(), "A1-01 x");
        assert_eq!(decode_path_segment("B2").unwrap(), "B2");
        assert!(decode_path_segment("bad%zz").is_err());
        assert!(decode_path_segment("trail%2").is_err());
        assert!(decode_path_segment("A1%2Dok%g1").is_err());
        assert!(decode_path_segment("%FF").is_err());
        assert_eq!(decode_path_segment("%E2%9C%93").unwrap(), "\u{2713}");
    }

    #[test]
    fn query_params_skip_empty_values() {
        let request = HttpRequest {
            method: "GET".into(),
            path: "/detections".into(),
            query: url::form_urlencoded::parse(b"search=&chamber_id=A1%2B02")
                .into_owned()
                .collect(),
            body: Vec::new(),
        };
        assert_eq!(request.query_param("search"), None);
        assert_eq!(request.query_param("chamber_id"), Some("A1+02"));
    }

    #[test]
    fn error_response_carries_code_and_status() {
        let response = Response::error(&InspectError::NotFound("no record #4".into()));
        assert_eq!(response.status, 404);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["message"], "not found: no record #4");
    }
}
