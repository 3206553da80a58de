//! Filesystem watching backed by `notify`.
//!
//! [`FileWatcher`] watches the content root recursively and translates raw
//! notifications into [`ChangeEvent`]s for [`crate::Engine::apply_changes`].
//! Overflows and backend errors become [`ChangeEvent::Rescan`]: the engine
//! then reconciles everything it tracks instead of trusting a partial
//! event stream.

use notify::event::{Flag, ModifyKind, RenameMode};
use notify::{Event, EventKind};

use crate::invalidate::ChangeEvent;

#[cfg(feature = "watch-notify")]
pub use backend::FileWatcher;

fn requests_rescan(event: &Event) -> bool {
    matches!(event.attrs.flag(), Some(Flag::Rescan))
        || (matches!(event.kind, EventKind::Other) && event.paths.is_empty())
}

/// Maps one notification to the changes it describes.
pub(crate) fn translate(event: Event) -> Vec<ChangeEvent> {
    if requests_rescan(&event) {
        return vec![ChangeEvent::Rescan];
    }
    let kind = event.kind;
    let mut paths = event.paths.into_iter();
    match kind {
        EventKind::Access(_) => Vec::new(),
        EventKind::Create(_) => paths.map(ChangeEvent::Created).collect(),
        EventKind::Remove(_) => paths.map(ChangeEvent::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            while let Some(from) = paths.next() {
                out.push(ChangeEvent::Removed(from));
                if let Some(to) = paths.next() {
                    out.push(ChangeEvent::Created(to));
                }
            }
            out
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.map(ChangeEvent::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.map(ChangeEvent::Created).collect()
        }
        _ => paths.map(ChangeEvent::Modified).collect(),
    }
}

#[cfg(feature = "watch-notify")]
mod backend {
    use std::io;
    use std::path::Path;

    use crossbeam_channel::{Receiver, Sender};
    use notify::{RecommendedWatcher, RecursiveMode, Watcher};
    use tracing::{debug, warn};

    use super::translate;
    use crate::invalidate::ChangeEvent;

    /// A recursive watch on one directory. Events queue until drained.
    pub struct FileWatcher {
        // Dropping the watcher stops the notifications.
        _watcher: RecommendedWatcher,
        events: Receiver<ChangeEvent>,
    }

    fn forward(tx: &Sender<ChangeEvent>, res: notify::Result<notify::Event>) {
        let events = match res {
            Ok(event) => translate(event),
            Err(err) => {
                warn!(error = %err, "watcher error, requesting rescan");
                vec![ChangeEvent::Rescan]
            }
        };
        for event in events {
            // The receiver is gone only while the watcher is being dropped.
            let _ = tx.send(event);
        }
    }

    impl FileWatcher {
        pub fn watch(root: impl AsRef<Path>) -> io::Result<Self> {
            let root = root.as_ref();
            let (tx, events) = crossbeam_channel::unbounded();
            let handler = move |res: notify::Result<notify::Event>| forward(&tx, res);
            let mut watcher = notify::recommended_watcher(handler).map_err(io::Error::other)?;
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(io::Error::other)?;
            debug!(root = %root.display(), "watching for changes");
            Ok(FileWatcher {
                _watcher: watcher,
                events,
            })
        }

        /// The event channel, for callers that want to block or select.
        pub fn events(&self) -> &Receiver<ChangeEvent> {
            &self.events
        }

        /// Every event received so far, without blocking.
        pub fn drain(&self) -> Vec<ChangeEvent> {
            self.events.try_iter().collect()
        }
    }
}
