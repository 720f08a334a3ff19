//! Recursive directory observation feeding an [`EventHandler`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use notify::event::CreateKind;
use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use tracing::{debug, info, warn};

use crate::drive::RemoteStore;
use crate::error::Error;
use crate::handler::EventHandler;
use crate::session::SessionFactory;

/// Watches one directory tree and hands new files to an [`EventHandler`].
pub struct Watcher<F>
where
    F: SessionFactory,
    F::Session: RemoteStore,
{
    handler: Arc<EventHandler<F>>,
    root: PathBuf,
    poll_interval: Duration,
}

impl<F> Watcher<F>
where
    F: SessionFactory,
    F::Session: RemoteStore,
{
    pub fn new(handler: Arc<EventHandler<F>>, root: impl Into<PathBuf>) -> Self {
        let poll_interval = handler.config().poll_interval;
        Self {
            handler,
            root: root.into(),
            poll_interval,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn handler(&self) -> &EventHandler<F> {
        &self.handler
    }

    /// Observe the root until `interrupt` is set.
    ///
    /// On interrupt the handler is shut down first, which lets a running
    /// conversion finish, and only then is the observer stopped.
    pub fn start(&self, interrupt: &AtomicBool) -> Result<(), Error> {
        let handler = Arc::clone(&self.handler);
        let mut observer = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    dispatch_event(&*handler, &event);
                }
                Err(e) => warn!(error = %e, "watch error"),
            }
        })?;
        observer.watch(&self.root, RecursiveMode::Recursive)?;
        info!(root = %self.root.display(), "watching for new documents");

        while !interrupt.load(Ordering::SeqCst) {
            thread::sleep(self.poll_interval);
        }

        info!("interrupt received, stopping");
        self.handler.shutdown();
        if let Err(e) = observer.unwatch(&self.root) {
            debug!(error = %e, "unwatch failed");
        }
        drop(observer);
        Ok(())
    }
}

/// Forward the paths of a creation event to `handler`.
///
/// Folder creations and every other event kind are ignored. Returns how many
/// paths were queued.
pub fn dispatch_event<F>(handler: &EventHandler<F>, event: &Event) -> usize
where
    F: SessionFactory,
    F::Session: RemoteStore,
{
    match event.kind {
        EventKind::Create(CreateKind::Folder) => 0,
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter(|path| handler.on_created(path))
            .count(),
        _ => 0,
    }
}
