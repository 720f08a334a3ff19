//! Turns file-creation events into sequential conversions.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::converter::{Converter, Progress, Silent};
use crate::drive::RemoteStore;
use crate::error::Error;
use crate::session::{SessionFactory, SessionManager};

/// Event counts since the handler was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub accepted: usize,
    pub ignored: usize,
    pub converted: usize,
    pub failed: usize,
    /// Accepted paths discarded by shutdown before they started.
    pub dropped: usize,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicUsize,
    ignored: AtomicUsize,
    converted: AtomicUsize,
    failed: AtomicUsize,
    dropped: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HandlerStats {
        HandlerStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            converted: self.converted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Filters creation events and converts matching files on one worker thread.
///
/// Events are queued in arrival order; a full queue blocks the caller. All
/// conversions share a [`SessionManager`], so a burst of files reuses one
/// remote session and the session closes once the burst is over.
pub struct EventHandler<F>
where
    F: SessionFactory,
    F::Session: RemoteStore,
{
    sessions: Arc<SessionManager<F>>,
    config: Arc<Config>,
    queue: Mutex<Option<SyncSender<PathBuf>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl<F> EventHandler<F>
where
    F: SessionFactory,
    F::Session: RemoteStore,
{
    pub fn new(factory: F, config: Config) -> Result<Self, Error> {
        Self::with_progress(factory, config, Silent)
    }

    /// Like [`new`](Self::new), reporting each conversion to `progress` from
    /// the worker thread.
    pub fn with_progress<P>(factory: F, config: Config, progress: P) -> Result<Self, Error>
    where
        P: Progress + Send + 'static,
    {
        let sessions = Arc::new(SessionManager::new(factory, config.idle_timeout));
        let config = Arc::new(config);
        let stopping = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);

        let worker = {
            let sessions = Arc::clone(&sessions);
            let config = Arc::clone(&config);
            let stopping = Arc::clone(&stopping);
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("convert-worker".to_string())
                .spawn(move || {
                    run_worker(receiver, &sessions, &config, &progress, &stopping, &counters)
                })?
        };

        Ok(Self {
            sessions,
            config,
            queue: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            stopping,
            counters,
        })
    }

    /// Handle a "file created" notification for `path`.
    ///
    /// Returns whether the path was queued for conversion.
    pub fn on_created(&self, path: &Path) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            debug!(path = %path.display(), "handler stopping, event ignored");
            Counters::bump(&self.counters.ignored);
            return false;
        }
        if path.is_dir() || !self.config.is_supported(path) {
            debug!(path = %path.display(), "not a supported document, event ignored");
            Counters::bump(&self.counters.ignored);
            return false;
        }

        // Clone the sender so a full queue does not block shutdown().
        let sender = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            Counters::bump(&self.counters.ignored);
            return false;
        };
        if sender.send(path.to_path_buf()).is_err() {
            warn!(path = %path.display(), "worker gone, event ignored");
            Counters::bump(&self.counters.ignored);
            return false;
        }
        info!(path = %path.display(), "queued for conversion");
        Counters::bump(&self.counters.accepted);
        true
    }

    /// Stop accepting events, finish the conversion in progress, and close
    /// the session.
    ///
    /// Queued paths that have not started are discarded. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        drop(
            self.queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            error!("conversion worker panicked");
        }
        self.sessions.shutdown();
    }

    pub fn sessions(&self) -> &SessionManager<F> {
        &self.sessions
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> HandlerStats {
        self.counters.snapshot()
    }
}

impl<F> Drop for EventHandler<F>
where
    F: SessionFactory,
    F::Session: RemoteStore,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<F>(
    receiver: Receiver<PathBuf>,
    sessions: &SessionManager<F>,
    config: &Config,
    progress: &dyn Progress,
    stopping: &AtomicBool,
    counters: &Counters,
) where
    F: SessionFactory,
    F::Session: RemoteStore,
{
    for path in receiver {
        if stopping.load(Ordering::SeqCst) {
            debug!(path = %path.display(), "discarded on shutdown");
            Counters::bump(&counters.dropped);
            continue;
        }
        match convert_one(sessions, config, progress, &path) {
            Ok(()) => Counters::bump(&counters.converted),
            Err(e) => {
                error!(path = %path.display(), error = %e, "conversion failed, event dropped");
                Counters::bump(&counters.failed);
            }
        }
    }
    debug!("conversion worker stopped");
}

fn convert_one<F>(
    sessions: &SessionManager<F>,
    config: &Config,
    progress: &dyn Progress,
    path: &Path,
) -> Result<(), Error>
where
    F: SessionFactory,
    F::Session: RemoteStore,
{
    let session = sessions.acquire()?;
    progress.start_file(path);
    let report = |fraction: f64| progress.download(fraction);
    let result = Converter::new(&*session, config)
        .with_progress(&report)
        .convert(path, config.delete_after);
    progress.finish_file(path, result.as_ref());
    let outcome = result?;
    info!(
        source = %outcome.source.display(),
        output = %outcome.output.display(),
        "converted"
    );
    Ok(())
}
