//! One-shot conversion of explicit files and directory trees.

use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::Config;
use crate::converter::{Converter, Progress};
use crate::drive::RemoteStore;
use crate::error::Error;
use crate::session::{SessionFactory, SessionManager};

/// Asks the operator before a directory is converted.
pub trait Confirm {
    /// Whether to convert the `count` matches found under `dir`.
    fn confirm(&mut self, dir: &Path, count: usize) -> bool;
}

impl<T: FnMut(&Path, usize) -> bool> Confirm for T {
    fn confirm(&mut self, dir: &Path, count: usize) -> bool {
        self(dir, count)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Directories the operator declined to convert.
    pub declined: usize,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Replace a leading `~` with the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => match dirs::home_dir() {
            Some(home) => home.join(components.as_path()),
            None => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

/// Expand `~` and make `path` absolute without touching the filesystem.
pub fn resolve_path(path: &Path) -> Result<PathBuf, Error> {
    Ok(std::path::absolute(expand_home(path))?)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Supported files under `dir`, grouped by extension in configured order and
/// sorted by path within each group.
///
/// Hidden files and directories are skipped.
pub fn collect_documents(dir: &Path, config: &Config) -> Vec<PathBuf> {
    let order: Vec<&str> = config.extensions().collect();
    let mut found: Vec<(usize, PathBuf)> = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let ext = config.matching_extension(entry.path())?;
            let rank = order.iter().position(|e| *e == ext)?;
            Some((rank, entry.into_path()))
        })
        .collect();
    found.sort();
    found.into_iter().map(|(_, path)| path).collect()
}

/// Converts a list of paths one file at a time over a shared session.
pub struct BatchRunner<F>
where
    F: SessionFactory,
    F::Session: RemoteStore,
{
    sessions: SessionManager<F>,
    config: Config,
}

impl<F> BatchRunner<F>
where
    F: SessionFactory,
    F::Session: RemoteStore,
{
    /// The session opens on the first conversion and stays open until the
    /// run ends, however long the operator takes to answer a prompt.
    pub fn new(factory: F, config: Config) -> Self {
        Self {
            sessions: SessionManager::without_idle_timeout(factory),
            config,
        }
    }

    pub fn sessions(&self) -> &SessionManager<F> {
        &self.sessions
    }

    /// Convert every supported file named by `paths`.
    ///
    /// A file that fails to convert is counted and the batch moves on. Failing
    /// to open a session aborts the run. The session is shut down before
    /// returning either way.
    pub fn run(
        self,
        paths: &[PathBuf],
        confirm: &mut dyn Confirm,
        progress: &dyn Progress,
    ) -> Result<BatchSummary, Error> {
        let mut summary = BatchSummary::default();
        for arg in paths {
            let path = resolve_path(arg)?;
            if path.is_dir() {
                let files = collect_documents(&path, &self.config);
                if files.is_empty() {
                    info!(dir = %path.display(), "no supported files found");
                    continue;
                }
                if files.len() > self.config.confirm_threshold
                    && !confirm.confirm(&path, files.len())
                {
                    info!(dir = %path.display(), "skipped by operator");
                    summary.declined += 1;
                    continue;
                }
                for file in &files {
                    self.convert_file(file, progress, &mut summary)?;
                }
            } else if self.config.is_supported(&path) {
                self.convert_file(&path, progress, &mut summary)?;
            } else {
                warn!("{} has an invalid extension. Skipping file ...", path.display());
                summary.skipped += 1;
            }
        }
        self.sessions.shutdown();
        info!(
            converted = summary.converted,
            skipped = summary.skipped,
            failed = summary.failed,
            "batch finished"
        );
        Ok(summary)
    }

    fn convert_file(
        &self,
        path: &Path,
        progress: &dyn Progress,
        summary: &mut BatchSummary,
    ) -> Result<(), Error> {
        progress.start_file(path);
        let session = self.sessions.acquire()?;
        let report = |fraction: f64| progress.download(fraction);
        let result = Converter::new(&*session, &self.config)
            .with_progress(&report)
            .convert(path, self.config.delete_after);
        progress.finish_file(path, result.as_ref());
        match result {
            Ok(outcome) => {
                info!(
                    source = %outcome.source.display(),
                    output = %outcome.output.display(),
                    "converted"
                );
                summary.converted += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "conversion failed");
                summary.failed += 1;
            }
        }
        Ok(())
    }
}
