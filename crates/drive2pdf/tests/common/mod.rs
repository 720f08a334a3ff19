//! Shared test utilities for integration tests.
//!
//! [`FakeGoogle`] serves the slice of Drive v3 and the OAuth token endpoint
//! that drive2pdf talks to, on an ephemeral `tiny_http` port.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use drive2pdf::auth::{Authorizer, Credential};
use drive2pdf::config::{Config, Endpoints, FOLDER_MIME_TYPE};
use drive2pdf::drive::{DriveClient, DriveConnector, http_client};
use drive2pdf::error::Error;

pub const VALID_TOKEN: &str = "valid-token";
pub const GOOD_REFRESH: &str = "good-refresh";
pub const AUTH_CODE: &str = "good-code";

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub name: String,
    pub mime_type: String,
    pub parents: Vec<String>,
    pub content: Vec<u8>,
    /// Content type of the media part it was uploaded with.
    pub media_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Logged {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
}

#[derive(Debug, Default)]
pub struct ServerState {
    pub files: BTreeMap<String, StoredFile>,
    pub valid_tokens: HashSet<String>,
    pub refresh_tokens: HashSet<String>,
    pub requests: Vec<Logged>,
    /// Page size for `files.list`; 0 means 100.
    pub page_size: usize,
    /// Answer ranged exports with `bytes a-b/*`.
    pub omit_total: bool,
    /// Answer ranged exports with the whole body and status 200.
    pub ignore_range: bool,
    next_id: usize,
    issued: usize,
}

impl ServerState {
    fn new_id(&mut self) -> String {
        self.next_id += 1;
        format!("file{:03}", self.next_id)
    }

    fn issue_token(&mut self) -> String {
        self.issued += 1;
        let token = format!("access-{}", self.issued);
        self.valid_tokens.insert(token.clone());
        token
    }

    pub fn documents(&self) -> Vec<&StoredFile> {
        self.files
            .values()
            .filter(|f| f.mime_type != FOLDER_MIME_TYPE)
            .collect()
    }

    pub fn folders(&self) -> Vec<&StoredFile> {
        self.files
            .values()
            .filter(|f| f.mime_type == FOLDER_MIME_TYPE)
            .collect()
    }

    pub fn count(&self, method: &str, path_prefix: &str) -> usize {
        self.requests
            .iter()
            .filter(|r| r.method == method && r.path.starts_with(path_prefix))
            .count()
    }

    pub fn exports(&self) -> Vec<&Logged> {
        self.requests
            .iter()
            .filter(|r| r.method == "GET" && r.path.ends_with("/export"))
            .collect()
    }
}

/// What the fake server exports a document named `name` as.
pub fn exported_pdf(name: &str) -> Vec<u8> {
    let mut pdf = format!("%PDF-1.4\n% converted from {name}\n").into_bytes();
    pdf.extend(std::iter::repeat_n(b'.', 100));
    pdf.extend_from_slice(b"\n%%EOF\n");
    pdf
}

/// A fake Google API server running on its own thread until dropped.
pub struct FakeGoogle {
    pub base_url: String,
    state: Arc<Mutex<ServerState>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeGoogle {
    pub fn start() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = match server.server_addr() {
            tiny_http::ListenAddr::IP(addr) => addr.port(),
            _ => panic!("expected IP address"),
        };

        let mut initial = ServerState::default();
        initial.valid_tokens.insert(VALID_TOKEN.to_string());
        initial.refresh_tokens.insert(GOOD_REFRESH.to_string());
        let state = Arc::new(Mutex::new(initial));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if let Ok(Some(mut request)) = server.recv_timeout(Duration::from_millis(20)) {
                        let response = dispatch(&state, &mut request);
                        let _ = request.respond(response);
                    }
                }
            })
        };

        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            state,
            stop,
            handle: Some(handle),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            api_base: self.base_url.clone(),
            upload_base: self.base_url.clone(),
        }
    }

    pub fn token_uri(&self) -> String {
        format!("{}/token", self.base_url)
    }

    /// A credential the server accepts as-is.
    pub fn valid_credential(&self) -> Credential {
        Credential {
            token: VALID_TOKEN.to_string(),
            refresh_token: Some(GOOD_REFRESH.to_string()),
            token_uri: self.token_uri(),
            client_id: "test-client".to_string(),
            client_secret: "test-secret".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/drive".to_string()],
            expiry: Some(Utc::now() + TimeDelta::hours(1)),
        }
    }

    /// An expired credential carrying `refresh_token`.
    pub fn expired_credential(&self, refresh_token: &str) -> Credential {
        Credential {
            token: "stale-token".to_string(),
            refresh_token: Some(refresh_token.to_string()),
            expiry: Some(Utc::now() - TimeDelta::hours(1)),
            ..self.valid_credential()
        }
    }

    pub fn client(&self, chunk_size: u64) -> DriveClient {
        DriveClient::new(
            http_client().unwrap(),
            self.endpoints(),
            &self.valid_credential(),
            chunk_size,
        )
    }

    /// Configuration pointing at this server, with state under `dir`.
    pub fn config(&self, dir: &Path) -> Config {
        let mut config = Config {
            chunk_size: 32,
            idle_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(20),
            endpoints: self.endpoints(),
            ..Config::default()
        };
        config.auth.token_path = dir.join("token.json");
        config.auth.client_secret_path = dir.join("credentials.json");
        config
    }

    pub fn connector<A: Authorizer>(&self, config: &Config, authorizer: A) -> DriveConnector<A> {
        DriveConnector::new(config, authorizer, http_client().unwrap())
    }
}

impl Drop for FakeGoogle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Authorizer that hands out a fixed credential and counts calls.
#[derive(Clone)]
pub struct StaticAuthorizer {
    pub credential: Credential,
    pub calls: Arc<AtomicUsize>,
}

impl StaticAuthorizer {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize(&self, _scopes: &[String]) -> Result<Credential, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.credential.clone())
    }
}

/// Authorizer for tests that must never prompt.
pub struct NoAuthorizer;

impl Authorizer for NoAuthorizer {
    fn authorize(&self, _scopes: &[String]) -> Result<Credential, Error> {
        Err(Error::Auth("interactive authorization not available".to_string()))
    }
}

pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// --- Request handling ---

type Response = tiny_http::Response<std::io::Cursor<Vec<u8>>>;

fn header(name: &str, value: &str) -> tiny_http::Header {
    tiny_http::Header::from_bytes(name, value).unwrap()
}

fn json_response(status: u16, body: serde_json::Value) -> Response {
    tiny_http::Response::from_string(body.to_string())
        .with_header(header("Content-Type", "application/json"))
        .with_status_code(status)
}

fn google_error(status: u16, message: &str) -> Response {
    json_response(
        status,
        serde_json::json!({
            "error": { "code": status, "message": message, "errors": [] }
        }),
    )
}

fn request_header(request: &tiny_http::Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str().to_string())
}

fn query_params(url: &str) -> BTreeMap<String, String> {
    url::Url::parse(&format!("http://localhost{url}"))
        .map(|u| u.query_pairs().into_owned().collect())
        .unwrap_or_default()
}

fn dispatch(state: &Mutex<ServerState>, request: &mut tiny_http::Request) -> Response {
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or(&url).to_string();
    let method = request.method().to_string();
    let params = query_params(&url);
    let mut body = Vec::new();
    let _ = request.as_reader().read_to_end(&mut body);

    let mut state = state.lock().unwrap();
    state.requests.push(Logged {
        method: method.clone(),
        path: path.clone(),
        range: request_header(request, "Range"),
    });

    if method == "POST" && path == "/token" {
        return handle_token(&mut state, &body);
    }

    let bearer = request_header(request, "Authorization")
        .and_then(|v| v.strip_prefix("Bearer ").map(str::to_string));
    if !bearer.is_some_and(|t| state.valid_tokens.contains(&t)) {
        return google_error(401, "Request had invalid authentication credentials.");
    }

    let file_id = path
        .strip_prefix("/drive/v3/files/")
        .map(|rest| rest.trim_end_matches("/export").to_string());
    match (method.as_str(), path.as_str(), file_id) {
        ("GET", "/drive/v3/files", _) => handle_list(&state, &params),
        ("POST", "/drive/v3/files", _) => handle_create(&mut state, &body),
        ("POST", "/upload/drive/v3/files", _) => {
            let content_type = request_header(request, "Content-Type").unwrap_or_default();
            handle_upload(&mut state, &params, &content_type, &body)
        }
        ("GET", p, Some(id)) if p.ends_with("/export") => {
            let range = request_header(request, "Range");
            handle_export(&state, &id, &params, range.as_deref())
        }
        ("DELETE", _, Some(id)) => match state.files.remove(&id) {
            Some(_) => tiny_http::Response::from_data(Vec::new()).with_status_code(204),
            None => google_error(404, &format!("File not found: {id}.")),
        },
        _ => google_error(404, "Not found"),
    }
}

fn handle_token(state: &mut ServerState, body: &[u8]) -> Response {
    let form: BTreeMap<String, String> = url::form_urlencoded::parse(body).into_owned().collect();
    let grant = form.get("grant_type").map(String::as_str);
    match grant {
        Some("refresh_token") => {
            let token = form.get("refresh_token").cloned().unwrap_or_default();
            if !state.refresh_tokens.contains(&token) {
                return json_response(
                    400,
                    serde_json::json!({
                        "error": "invalid_grant",
                        "error_description": "Token has been expired or revoked."
                    }),
                );
            }
            let access = state.issue_token();
            json_response(
                200,
                serde_json::json!({
                    "access_token": access,
                    "expires_in": 3599,
                    "token_type": "Bearer"
                }),
            )
        }
        Some("authorization_code") if form.get("code").map(String::as_str) == Some(AUTH_CODE) => {
            let access = state.issue_token();
            let refresh = format!("refresh-for-{access}");
            state.refresh_tokens.insert(refresh.clone());
            json_response(
                200,
                serde_json::json!({
                    "access_token": access,
                    "refresh_token": refresh,
                    "expires_in": 3599,
                    "token_type": "Bearer"
                }),
            )
        }
        _ => json_response(400, serde_json::json!({ "error": "invalid_request" })),
    }
}

/// Folder name from a `name = '...' and mimeType = '...'` query.
fn queried_folder_name(query: &str) -> Option<String> {
    let rest = query.strip_prefix("name = '")?;
    let (escaped, tail) = rest.rsplit_once("' and mimeType = '")?;
    if tail.trim_end_matches('\'') != FOLDER_MIME_TYPE {
        return None;
    }
    let mut name = String::new();
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            name.extend(chars.next());
        } else {
            name.push(c);
        }
    }
    Some(name)
}

fn handle_list(state: &ServerState, params: &BTreeMap<String, String>) -> Response {
    let mut matching: Vec<(&String, &StoredFile)> = match params.get("q") {
        Some(query) => {
            let Some(name) = queried_folder_name(query) else {
                return google_error(400, "Invalid Value");
            };
            state
                .files
                .iter()
                .filter(|(_, f)| f.mime_type == FOLDER_MIME_TYPE && f.name == name)
                .collect()
        }
        None => state.files.iter().rev().collect(),
    };

    let server_page = if state.page_size == 0 { 100 } else { state.page_size };
    let page_size = params
        .get("pageSize")
        .and_then(|s| s.parse::<usize>().ok())
        .map_or(server_page, |n| n.min(server_page));
    let start: usize = params
        .get("pageToken")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let end = (start + page_size).min(matching.len());
    let next = (end < matching.len()).then(|| end.to_string());
    let files: Vec<serde_json::Value> = matching
        .drain(start.min(end)..end)
        .map(|(id, f)| serde_json::json!({ "id": id, "name": f.name }))
        .collect();

    let mut body = serde_json::json!({ "files": files });
    if let Some(next) = next {
        body["nextPageToken"] = serde_json::Value::String(next);
    }
    json_response(200, body)
}

fn handle_create(state: &mut ServerState, body: &[u8]) -> Response {
    let metadata: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return google_error(400, "Invalid JSON"),
    };
    let id = state.new_id();
    state.files.insert(
        id.clone(),
        StoredFile {
            name: metadata["name"].as_str().unwrap_or_default().to_string(),
            mime_type: metadata["mimeType"]
                .as_str()
                .unwrap_or("application/octet-stream")
                .to_string(),
            parents: Vec::new(),
            content: Vec::new(),
            media_type: None,
        },
    );
    json_response(200, serde_json::json!({ "id": id }))
}

/// Split a `multipart/related` body into (headers, content) parts.
pub fn split_multipart(body: &[u8], boundary: &str) -> Vec<(String, Vec<u8>)> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut starts = Vec::new();
    let mut i = 0;
    while i + delimiter.len() <= body.len() {
        if body[i..].starts_with(&delimiter) {
            starts.push(i);
            i += delimiter.len();
        } else {
            i += 1;
        }
    }

    let mut parts = Vec::new();
    for pair in starts.windows(2) {
        let segment = &body[pair[0] + delimiter.len()..pair[1]];
        let segment = segment.strip_prefix(b"\r\n").unwrap_or(segment);
        let segment = segment.strip_suffix(b"\r\n").unwrap_or(segment);
        let Some(split) = segment.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&segment[..split]).to_string();
        parts.push((headers, segment[split + 4..].to_vec()));
    }
    parts
}

fn handle_upload(
    state: &mut ServerState,
    params: &BTreeMap<String, String>,
    content_type: &str,
    body: &[u8],
) -> Response {
    if params.get("uploadType").map(String::as_str) != Some("multipart") {
        return google_error(400, "Unsupported uploadType");
    }
    let Some(boundary) = content_type
        .split(';')
        .find_map(|p| p.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
    else {
        return google_error(400, "Missing boundary");
    };
    if !content_type.starts_with("multipart/related") {
        return google_error(400, "Expected multipart/related");
    }

    let parts = split_multipart(body, &boundary);
    let [(_, metadata), (media_headers, content)] = parts.as_slice() else {
        return google_error(400, "Expected metadata and media parts");
    };
    let metadata: serde_json::Value = match serde_json::from_slice(metadata) {
        Ok(v) => v,
        Err(_) => return google_error(400, "Invalid metadata"),
    };
    let media_type = media_headers
        .lines()
        .find_map(|l| l.strip_prefix("Content-Type: "))
        .map(str::to_string);

    let id = state.new_id();
    state.files.insert(
        id.clone(),
        StoredFile {
            name: metadata["name"].as_str().unwrap_or_default().to_string(),
            mime_type: metadata["mimeType"]
                .as_str()
                .map(str::to_string)
                .or_else(|| media_type.clone())
                .unwrap_or_default(),
            parents: metadata["parents"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|p| p.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            content: content.clone(),
            media_type,
        },
    );
    json_response(200, serde_json::json!({ "id": id }))
}

fn handle_export(
    state: &ServerState,
    id: &str,
    params: &BTreeMap<String, String>,
    range: Option<&str>,
) -> Response {
    let Some(file) = state.files.get(id) else {
        return google_error(404, &format!("File not found: {id}."));
    };
    if !file.mime_type.starts_with("application/vnd.google-apps.") {
        return google_error(403, "Export only supports Docs Editors files.");
    }
    if params.get("mimeType").map(String::as_str) != Some("application/pdf") {
        return google_error(400, "Unsupported export mime type");
    }

    let pdf = exported_pdf(&file.name);
    let len = pdf.len();
    let requested = range
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.split_once('-'))
        .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));

    match requested {
        Some(_) if state.ignore_range => full_pdf(pdf),
        None => full_pdf(pdf),
        Some((start, _)) if start >= len => tiny_http::Response::from_data(Vec::new())
            .with_header(header("Content-Range", &format!("bytes */{len}")))
            .with_status_code(416),
        Some((start, end)) => {
            let end = end.min(len - 1);
            let total = if state.omit_total {
                "*".to_string()
            } else {
                len.to_string()
            };
            tiny_http::Response::from_data(pdf[start..=end].to_vec())
                .with_header(header("Content-Type", "application/pdf"))
                .with_header(header(
                    "Content-Range",
                    &format!("bytes {start}-{end}/{total}"),
                ))
                .with_status_code(206)
        }
    }
}

fn full_pdf(pdf: Vec<u8>) -> Response {
    tiny_http::Response::from_data(pdf)
        .with_header(header("Content-Type", "application/pdf"))
        .with_status_code(200)
}
