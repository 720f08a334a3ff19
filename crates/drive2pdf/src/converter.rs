//! Upload, export, download, and clean up one document.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{Config, WorkspaceType};
use crate::drive::{ChunkedDownload, FileMetadata, RemoteStore, ensure_folder};
use crate::error::Error;

/// Content type sent when the path gives no better guess.
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Result of a successful conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertOutcome {
    pub source: PathBuf,
    pub output: PathBuf,
    /// Id of the uploaded copy in Drive.
    pub remote_id: String,
    /// Size of the downloaded PDF.
    pub bytes: u64,
    pub remote_deleted: bool,
}

/// Per-file progress callbacks. Every method defaults to doing nothing.
pub trait Progress {
    fn start_file(&self, _path: &Path) {}

    /// Fraction of the current file's PDF downloaded so far.
    fn download(&self, _fraction: f64) {}

    fn finish_file(&self, _path: &Path, _result: Result<&ConvertOutcome, &Error>) {}
}

/// Reports nothing.
pub struct Silent;

impl Progress for Silent {}

/// Converts local files through a [`RemoteStore`].
pub struct Converter<'a, R: ?Sized> {
    store: &'a R,
    config: &'a Config,
    on_progress: Option<&'a dyn Fn(f64)>,
}

impl<'a, R: RemoteStore + ?Sized> Converter<'a, R> {
    pub fn new(store: &'a R, config: &'a Config) -> Self {
        Self {
            store,
            config,
            on_progress: None,
        }
    }

    /// Report download progress (`0.0..=1.0`) after every chunk.
    pub fn with_progress(mut self, on_progress: &'a dyn Fn(f64)) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    /// Upload `path` into the base folder and return the new file id.
    pub fn upload(&self, path: &Path, hint: Option<WorkspaceType>) -> Result<String, Error> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::UnsupportedFormat(format!("{} has no usable file name", path.display()))
            })?;
        let folder_id = ensure_folder(self.store, &self.config.base_folder_name)?;
        let metadata = FileMetadata {
            name: name.to_string(),
            parents: vec![folder_id],
            mime_type: hint.map(|h| h.mime_type().to_string()),
        };
        let content_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or(FALLBACK_CONTENT_TYPE);
        self.store.upload_file(&metadata, path, content_type)
    }

    /// Export `file_id` and write it to `output` chunk by chunk.
    pub fn download(&self, file_id: &str, output: &Path) -> Result<u64, Error> {
        let mut export = self
            .store
            .export_file(file_id, &self.config.target_mime_type)?;
        let mut file = File::create(output)?;
        loop {
            let status = export.next_chunk(&mut file)?;
            debug!(
                file_id,
                downloaded = status.downloaded,
                total = status.total,
                "chunk written"
            );
            if let Some(on_progress) = self.on_progress {
                on_progress(status.progress());
            }
            if status.done {
                file.flush()?;
                return Ok(status.downloaded);
            }
        }
    }

    /// Convert `path` to a PDF next to it.
    ///
    /// With `delete_after`, the uploaded copy is removed once the PDF is on
    /// disk. If export or download fails the upload stays in Drive.
    pub fn convert(&self, path: &Path, delete_after: bool) -> Result<ConvertOutcome, Error> {
        let output = self.config.output_path(path);
        let hint = self.config.format_hint(path);

        info!(source = %path.display(), ?hint, "uploading");
        let remote_id = self.upload(path, hint)?;
        debug!(remote_id = %remote_id, "uploaded");

        let bytes = match self.download(&remote_id, &output) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    remote_id = %remote_id,
                    source = %path.display(),
                    "export failed, uploaded copy left in Drive"
                );
                return Err(e);
            }
        };
        info!(output = %output.display(), bytes, "downloaded");

        if delete_after {
            self.store.delete_file(&remote_id)?;
            debug!(remote_id = %remote_id, "deleted uploaded copy");
        }

        Ok(ConvertOutcome {
            source: path.to_path_buf(),
            output,
            remote_id,
            bytes,
            remote_deleted: delete_after,
        })
    }
}
