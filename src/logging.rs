use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that initially discards writes, then logs to a file
/// once activated via `handle.set_file(path)`.
///
/// Embedders install the subscriber before they know the data root; the
/// engine log at `<root>/logs/nido.log` is switched on later.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

/// Handle returned by `DeferredFileWriter::new()`; `set_file` activates it.
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Activate the file writer, opening `path` in append mode.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("log writer lock poisoned"))?;
        *guard = Some(file);
        Ok(())
    }
}

/// Writer returned by `MakeWriter::make_writer`. Either writes to the
/// file or discards (when not yet activated).
pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let Ok(mut guard) = self.inner.lock() else {
            return Ok(buf.len());
        };
        if let Some(ref mut f) = *guard {
            f.write(buf)
        } else {
            Ok(buf.len()) // discard
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let Ok(mut guard) = self.inner.lock() else {
            return Ok(());
        };
        if let Some(ref mut f) = *guard {
            f.flush()
        } else {
            Ok(())
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── subscriber ───────────────────────────────────────────

/// Install the global subscriber: a stderr layer (`RUST_LOG`, or
/// `nido=debug` when `verbose`) and a file layer that captures `nido=debug`
/// once `log_file` is set.
///
/// Returns the handle so callers can point the file layer elsewhere later.
pub fn init(verbose: bool, log_file: Option<&Path>) -> DeferredFileHandle {
    let terminal_filter = if verbose {
        EnvFilter::new("nido=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nido=warn"))
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    let (file_writer, file_handle) = DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("nido=debug"));

    // A second init (tests, embedders) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .try_init();

    if let Some(path) = log_file
        && let Err(e) = file_handle.set_file(path)
    {
        tracing::warn!(path = %path.display(), error = %e, "cannot open log file");
    }
    file_handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn discards_until_activated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/nido.log");
        let (writer, handle) = DeferredFileWriter::new();

        writer.make_writer().write_all(b"dropped\n").unwrap();
        assert!(!path.exists());

        handle.set_file(&path).unwrap();
        writer.make_writer().write_all(b"kept\n").unwrap();
        writer.make_writer().write_all(b"appended\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "kept\nappended\n");
    }

    #[test]
    fn init_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nido.log");
        init(false, Some(&path));
        init(true, None);
        assert!(path.exists());
    }
}
