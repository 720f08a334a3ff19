pub mod auth;
pub mod batch;
pub mod config;
pub mod converter;
pub mod drive;
pub mod error;
pub mod handler;
pub mod session;
pub mod watcher;


use std::path::Path;

pub use batch::{BatchRunner, BatchSummary};
pub use config::Config;
pub use converter::{ConvertOutcome, Converter, Progress, Silent};
pub use drive::{DriveClient, DriveConnector, RemoteStore};
pub use error::Error;
pub use handler::EventHandler;
pub use session::{SessionFactory, SessionManager};
pub use watcher::Watcher;

use session::Session;

/// Convert one office document to a PDF next to it, using the default
/// configuration.
pub fn convert(path: impl AsRef<Path>) -> Result<ConvertOutcome, Error> {
    convert_with_config(path, &Config::default())
}

/// Convert one office document with an explicit configuration.
///
/// Opens a Drive session, authorizing interactively if no usable token is
/// stored, and closes it before returning.
pub fn convert_with_config(
    path: impl AsRef<Path>,
    config: &Config,
) -> Result<ConvertOutcome, Error> {
    let path = path.as_ref();
    if !config.is_supported(path) {
        return Err(Error::UnsupportedFormat(path.display().to_string()));
    }

    let session = DriveConnector::from_config(config)?.open()?;
    let result = Converter::new(&session, config).convert(path, config.delete_after);
    session.close();
    result
}
