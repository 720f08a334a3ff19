//! Terminal rendering of conversion progress.

use std::cell::RefCell;
use std::path::Path;

use drive2pdf::converter::Progress;
use drive2pdf::{ConvertOutcome, Error};
use indicatif::{ProgressBar, ProgressStyle};

/// One bar per file, filled as the PDF downloads.
pub struct TerminalProgress {
    style: ProgressStyle,
    current: RefCell<Option<ProgressBar>>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");
        Self {
            style,
            current: RefCell::new(None),
        }
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl Progress for TerminalProgress {
    fn start_file(&self, path: &Path) {
        let bar = ProgressBar::new(100);
        bar.set_style(self.style.clone());
        bar.set_message(file_name(path));
        *self.current.borrow_mut() = Some(bar);
    }

    fn download(&self, fraction: f64) {
        if let Some(bar) = self.current.borrow().as_ref() {
            bar.set_position((fraction * 100.0).round() as u64);
        }
    }

    fn finish_file(&self, path: &Path, result: Result<&ConvertOutcome, &Error>) {
        let Some(bar) = self.current.borrow_mut().take() else {
            return;
        };
        match result {
            Ok(outcome) => bar.finish_with_message(format!(
                "{} -> {}",
                file_name(path),
                file_name(&outcome.output)
            )),
            Err(_) => bar.abandon_with_message(format!("{} failed", file_name(path))),
        }
    }
}
