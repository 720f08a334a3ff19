//! Google Drive v3 access.
//!
//! [`RemoteStore`] is the narrow slice of the Drive API the converter needs:
//! list, create, upload, export, delete. [`DriveClient`] implements it over
//! HTTP; [`DriveConnector`] opens authenticated clients for the
//! [`SessionManager`](crate::session::SessionManager).

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::{Authorizer, Credential, CredentialProvider, LocalServerFlow};
use crate::config::{Config, Endpoints, FOLDER_MIME_TYPE};
use crate::error::Error;
use crate::session::{Session, SessionFactory};

const FILE_LIST_FIELDS: &str = "nextPageToken, files(id, name)";

/// A file or folder in Drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
}

/// One page of a `files.list` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<RemoteFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Parameters of a `files.list` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListRequest<'a> {
    pub query: Option<&'a str>,
    pub page_size: Option<usize>,
    pub page_token: Option<&'a str>,
}

/// Metadata sent along with a new file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    /// Target type Drive should import the content as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Deserialize)]
struct CreatedFile {
    id: String,
}

/// Where a chunked download stands after a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStatus {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub done: bool,
}

impl ChunkStatus {
    /// Fraction downloaded, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        match self.total {
            Some(0) => 1.0,
            Some(total) => (self.downloaded as f64 / total as f64).min(1.0),
            None if self.done => 1.0,
            None => 0.0,
        }
    }
}

/// A download pulled in bounded-size pieces.
pub trait ChunkedDownload {
    /// Fetch the next chunk and append it to `sink`.
    fn next_chunk(&mut self, sink: &mut dyn Write) -> Result<ChunkStatus, Error>;
}

/// The remote operations the converter relies on.
pub trait RemoteStore {
    type Download: ChunkedDownload;

    fn list_files(&self, request: &ListRequest<'_>) -> Result<FileList, Error>;

    /// Create a folder at the root and return its id.
    fn create_folder(&self, name: &str) -> Result<String, Error>;

    /// Single-shot upload of a local file; returns the new file id.
    fn upload_file(
        &self,
        metadata: &FileMetadata,
        path: &Path,
        content_type: &str,
    ) -> Result<String, Error>;

    /// Start a server-side export of `file_id` to `mime_type`.
    fn export_file(&self, file_id: &str, mime_type: &str) -> Result<Self::Download, Error>;

    fn delete_file(&self, file_id: &str) -> Result<(), Error>;
}

/// Quote a value for use inside a Drive query string literal.
fn escape_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Query matching folders named exactly `name`.
pub fn folder_query(name: &str) -> String {
    format!(
        "name = '{}' and mimeType = '{}'",
        escape_query_literal(name),
        FOLDER_MIME_TYPE
    )
}

/// Run `query` and collect every page of results.
pub fn search_files<R: RemoteStore + ?Sized>(
    store: &R,
    query: &str,
) -> Result<Vec<RemoteFile>, Error> {
    let mut files = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = store.list_files(&ListRequest {
            query: Some(query),
            page_size: None,
            page_token: page_token.as_deref(),
        })?;
        files.extend(page.files);
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }
    Ok(files)
}

/// The `count` most recent files, as Drive orders an unfiltered listing.
pub fn recent_files<R: RemoteStore + ?Sized>(
    store: &R,
    count: usize,
) -> Result<Vec<RemoteFile>, Error> {
    let page = store.list_files(&ListRequest {
        query: None,
        page_size: Some(count),
        page_token: None,
    })?;
    Ok(page.files)
}

/// Id of the folder named `name`, creating it if none exists.
pub fn ensure_folder<R: RemoteStore + ?Sized>(store: &R, name: &str) -> Result<String, Error> {
    if let Some(folder) = search_files(store, &folder_query(name))?.into_iter().next() {
        return Ok(folder.id);
    }
    let id = store.create_folder(name)?;
    info!(folder = name, id = %id, "created base folder");
    Ok(id)
}

/// Build a `reqwest` client suitable for Drive transfers.
///
/// Uploads and 100 MiB download chunks can take a while, so only the
/// connect phase is bounded.
pub fn http_client() -> Result<Client, Error> {
    Ok(Client::builder()
        .user_agent(concat!("drive2pdf/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .timeout(None::<Duration>)
        .build()?)
}

fn check(response: Response) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(Error::api(status.as_u16(), &body))
}

fn multipart_boundary() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("drive2pdf-{nanos:x}")
}

/// Body of a `multipart/related` upload: JSON metadata, then the media.
fn multipart_related_body(
    boundary: &str,
    metadata: &FileMetadata,
    content_type: &str,
    content: &[u8],
) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_vec(metadata)?;
    let mut body = Vec::with_capacity(json.len() + content.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(&json);
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    Ok(body)
}

/// Total length from a `Content-Range: bytes a-b/total` header.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

/// Authenticated Drive session.
pub struct DriveClient {
    http: Client,
    endpoints: Endpoints,
    access_token: String,
    expiry: Option<DateTime<Utc>>,
    chunk_size: u64,
    closed: AtomicBool,
}

impl DriveClient {
    pub fn new(http: Client, endpoints: Endpoints, credential: &Credential, chunk_size: u64) -> Self {
        Self {
            http,
            endpoints,
            access_token: credential.token.clone(),
            expiry: credential.expiry,
            chunk_size: chunk_size.max(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn files_url(&self) -> String {
        format!(
            "{}/drive/v3/files",
            self.endpoints.api_base.trim_end_matches('/')
        )
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/drive/v3/files",
            self.endpoints.upload_base.trim_end_matches('/')
        )
    }
}

impl RemoteStore for DriveClient {
    type Download = RangedExport;

    fn list_files(&self, request: &ListRequest<'_>) -> Result<FileList, Error> {
        self.ensure_open()?;
        let mut params = vec![("fields", FILE_LIST_FIELDS.to_string())];
        if let Some(query) = request.query {
            params.push(("q", query.to_string()));
            params.push(("spaces", "drive".to_string()));
        }
        if let Some(size) = request.page_size {
            params.push(("pageSize", size.to_string()));
        }
        if let Some(token) = request.page_token {
            params.push(("pageToken", token.to_string()));
        }
        debug!(query = ?request.query, page_token = ?request.page_token, "files.list");

        let response = self
            .http
            .get(self.files_url())
            .bearer_auth(&self.access_token)
            .query(&params)
            .send()?;
        Ok(check(response)?.json()?)
    }

    fn create_folder(&self, name: &str) -> Result<String, Error> {
        self.ensure_open()?;
        let metadata = FileMetadata {
            name: name.to_string(),
            parents: Vec::new(),
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
        };
        debug!(name, "files.create folder");
        let response = self
            .http
            .post(self.files_url())
            .bearer_auth(&self.access_token)
            .query(&[("fields", "id")])
            .json(&metadata)
            .send()?;
        let created: CreatedFile = check(response)?.json()?;
        Ok(created.id)
    }

    fn upload_file(
        &self,
        metadata: &FileMetadata,
        path: &Path,
        content_type: &str,
    ) -> Result<String, Error> {
        self.ensure_open()?;
        let content = fs::read(path)?;
        let boundary = multipart_boundary();
        let body = multipart_related_body(&boundary, metadata, content_type, &content)?;
        debug!(name = %metadata.name, bytes = content.len(), "files.create upload");

        let response = self
            .http
            .post(self.upload_url())
            .bearer_auth(&self.access_token)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()?;
        let created: CreatedFile = check(response)?.json()?;
        Ok(created.id)
    }

    fn export_file(&self, file_id: &str, mime_type: &str) -> Result<RangedExport, Error> {
        self.ensure_open()?;
        debug!(file_id, mime_type, "files.export");
        Ok(RangedExport {
            http: self.http.clone(),
            url: format!("{}/{file_id}/export", self.files_url()),
            mime_type: mime_type.to_string(),
            access_token: self.access_token.clone(),
            chunk_size: self.chunk_size,
            offset: 0,
            total: None,
            done: false,
        })
    }

    fn delete_file(&self, file_id: &str) -> Result<(), Error> {
        self.ensure_open()?;
        debug!(file_id, "files.delete");
        let response = self
            .http
            .delete(format!("{}/{file_id}", self.files_url()))
            .bearer_auth(&self.access_token)
            .send()?;
        check(response)?;
        Ok(())
    }
}

impl Session for DriveClient {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Drive session closed");
        }
    }

    fn is_stale(&self) -> bool {
        self.expiry.is_some_and(|expiry| Utc::now() >= expiry)
    }
}

/// Export download driven by HTTP `Range` requests.
pub struct RangedExport {
    http: Client,
    url: String,
    mime_type: String,
    access_token: String,
    chunk_size: u64,
    offset: u64,
    total: Option<u64>,
    done: bool,
}

impl RangedExport {
    fn status(&self) -> ChunkStatus {
        ChunkStatus {
            downloaded: self.offset,
            total: self.total,
            done: self.done,
        }
    }
}

impl ChunkedDownload for RangedExport {
    fn next_chunk(&mut self, sink: &mut dyn Write) -> Result<ChunkStatus, Error> {
        if self.done {
            return Ok(self.status());
        }

        let end = self.offset + self.chunk_size - 1;
        let response = self
            .http
            .get(&self.url)
            .bearer_auth(&self.access_token)
            .query(&[("mimeType", self.mime_type.as_str())])
            .header(RANGE, format!("bytes={}-{end}", self.offset))
            .send()?;

        // Total was unknown and the previous chunk ended exactly on it.
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && self.offset > 0 {
            self.total = Some(self.offset);
            self.done = true;
            return Ok(self.status());
        }

        let response = check(response)?;
        let partial = response.status() == StatusCode::PARTIAL_CONTENT;
        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total);
        if !partial && self.offset > 0 {
            return Err(Error::Api {
                status: response.status().as_u16(),
                message: "server ignored the range request mid-download".to_string(),
            });
        }

        let bytes = response.bytes()?;
        sink.write_all(&bytes)?;
        self.offset += bytes.len() as u64;

        if partial {
            self.total = total.or(self.total);
            self.done = bytes.is_empty()
                || match self.total {
                    Some(total) => self.offset >= total,
                    None => (bytes.len() as u64) < self.chunk_size,
                };
        } else {
            self.total = Some(self.offset);
            self.done = true;
        }
        Ok(self.status())
    }
}

/// Opens [`DriveClient`] sessions with credentials from a [`CredentialProvider`].
pub struct DriveConnector<A> {
    credentials: CredentialProvider<A>,
    http: Client,
    endpoints: Endpoints,
    chunk_size: u64,
}

impl<A: Authorizer> DriveConnector<A> {
    pub fn new(config: &Config, authorizer: A, http: Client) -> Self {
        Self {
            credentials: CredentialProvider::new(&config.auth, authorizer, http.clone()),
            http,
            endpoints: config.endpoints.clone(),
            chunk_size: config.chunk_size,
        }
    }

    pub fn credentials(&self) -> &CredentialProvider<A> {
        &self.credentials
    }
}

impl DriveConnector<LocalServerFlow> {
    /// Connector that falls back to the interactive browser flow.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let http = http_client()?;
        let flow = LocalServerFlow::new(&config.auth.client_secret_path, http.clone());
        Ok(Self::new(config, flow, http))
    }
}

impl<A: Authorizer + 'static> SessionFactory for DriveConnector<A> {
    type Session = DriveClient;

    fn open(&self) -> Result<DriveClient, Error> {
        let credential = self.credentials.obtain()?;
        info!("opened Drive session");
        Ok(DriveClient::new(
            self.http.clone(),
            self.endpoints.clone(),
            &credential,
            self.chunk_size,
        ))
    }
}
