use std::path::{Path, PathBuf};
use std::time::Duration;

/// MIME type Drive uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// MIME type of the exported document.
pub const PDF_MIME_TYPE: &str = "application/pdf";

/// Google Workspace document types a file can be imported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceType {
    Document,
    Presentation,
    Spreadsheet,
    Folder,
}

impl WorkspaceType {
    /// The Drive MIME type for this workspace type.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Document => "application/vnd.google-apps.document",
            Self::Presentation => "application/vnd.google-apps.presentation",
            Self::Spreadsheet => "application/vnd.google-apps.spreadsheet",
            Self::Folder => FOLDER_MIME_TYPE,
        }
    }
}

/// A group of source extensions that share an import hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatRule {
    /// Extensions including the leading dot, e.g. `".docx"`.
    pub extensions: Vec<String>,
    pub hint: WorkspaceType,
}

impl FormatRule {
    pub fn new(extensions: &[&str], hint: WorkspaceType) -> Self {
        Self {
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            hint,
        }
    }
}

/// Drive API base URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Base for metadata calls (`/drive/v3/...`).
    pub api_base: String,
    /// Base for media uploads (`/upload/drive/v3/...`).
    pub upload_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com".to_string(),
            upload_base: "https://www.googleapis.com".to_string(),
        }
    }
}

/// Where credentials live and how hard to try getting new ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Persisted access/refresh token bundle.
    pub token_path: PathBuf,
    /// OAuth client secret file, only read for interactive authorization.
    pub client_secret_path: PathBuf,
    pub scopes: Vec<String>,
    /// Upper bound on interactive authorizations per session open.
    pub max_reauth_attempts: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_path: PathBuf::from("token.json"),
            client_secret_path: PathBuf::from("credentials.json"),
            scopes: vec!["https://www.googleapis.com/auth/drive".to_string()],
            max_reauth_attempts: 3,
        }
    }
}

/// Runtime configuration shared by every component.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the remote folder uploads are placed in.
    pub base_folder_name: String,
    pub formats: Vec<FormatRule>,
    pub target_mime_type: String,
    /// Extension of the output file, without the dot.
    pub target_extension: String,
    /// Maximum bytes requested per download chunk.
    pub chunk_size: u64,
    /// How long an unused session stays open.
    pub idle_timeout: Duration,
    /// How often the watch loop checks for an interrupt.
    pub poll_interval: Duration,
    /// Pending creation events buffered ahead of the worker.
    pub queue_capacity: usize,
    /// Directories with more matches than this ask for confirmation.
    pub confirm_threshold: usize,
    /// Delete the uploaded copy once the PDF is downloaded.
    pub delete_after: bool,
    pub auth: AuthConfig,
    pub endpoints: Endpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_folder_name: "GDrive Conversions".to_string(),
            formats: vec![
                FormatRule::new(&[".doc", ".docx"], WorkspaceType::Document),
                FormatRule::new(&[".ppt", ".pptx"], WorkspaceType::Presentation),
            ],
            target_mime_type: PDF_MIME_TYPE.to_string(),
            target_extension: "pdf".to_string(),
            chunk_size: 100 * 1024 * 1024,
            idle_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            queue_capacity: 64,
            confirm_threshold: 0,
            delete_after: true,
            auth: AuthConfig::default(),
            endpoints: Endpoints::default(),
        }
    }
}

impl Config {
    /// All supported extensions in rule order.
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.formats
            .iter()
            .flat_map(|rule| rule.extensions.iter().map(String::as_str))
    }

    /// The supported extension `path` ends with, if any.
    ///
    /// Matching is an exact, case-sensitive suffix comparison on the file name.
    pub fn matching_extension(&self, path: &Path) -> Option<&str> {
        let name = path.file_name()?.to_str()?;
        self.extensions()
            .filter(|ext| name.ends_with(ext) && name.len() > ext.len())
            .max_by_key(|ext| ext.len())
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        self.matching_extension(path).is_some()
    }

    /// Import hint for a source file, based on its final extension.
    pub fn format_hint(&self, path: &Path) -> Option<WorkspaceType> {
        let ext = path.extension()?.to_str()?;
        let dotted = format!(".{ext}");
        self.formats
            .iter()
            .find(|rule| rule.extensions.iter().any(|e| *e == dotted))
            .map(|rule| rule.hint)
    }

    /// Output path for a source file: same directory and stem, target extension.
    pub fn output_path(&self, source: &Path) -> PathBuf {
        source.with_extension(&self.target_extension)
    }
}
