//! Tracing subscriber setup.
//!
//! Logs go to stderr by default so stdout stays free for command output.
//! With a log file, previous logs are rotated (`dispatch.log` → `.1` → `.2`
//! → `.3`) and every line is flushed as it is written.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "atlas_dispatch=info,warn";

/// Rotated log files kept next to the active one.
pub const KEEP_ROTATED: u32 = 3;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Write to this file instead of stderr.
    pub file: Option<PathBuf>,
    /// One JSON object per line.
    pub json: bool,
}

/// Install the global subscriber.
pub fn init_tracing(opts: &LogOptions) -> std::io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (writer, ansi) = match &opts.file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, KEEP_ROTATED);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            (BoxMakeWriter::new(FlushingWriter::new(file)), false)
        }
        None => (
            BoxMakeWriter::new(std::io::stderr),
            std::io::stderr().is_terminal(),
        ),
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi && !opts.json)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if opts.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| std::io::Error::other(e.to_string()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?opts.file,
        pid = std::process::id(),
        "atlas-dispatch starting"
    );
    Ok(())
}

/// Rotate `base` → `base.1` → … → `base.{keep}`; the oldest is deleted.
///
/// Missing files in the chain are skipped.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let numbered = |i: u32| PathBuf::from(format!("{}.{i}", base_path.display()));

    let _ = std::fs::remove_file(numbered(keep));
    for i in (1..keep).rev() {
        let _ = std::fs::rename(numbered(i), numbered(i + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// File writer that flushes after every write, so log lines survive a crash.
#[derive(Clone)]
pub struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path().join("dispatch.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(tmp.path().join("dispatch.log.1"), "one").unwrap();
        std::fs::write(tmp.path().join("dispatch.log.3"), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |name: &str| std::fs::read_to_string(tmp.path().join(name)).unwrap();
        assert_eq!(read("dispatch.log.1"), "current");
        assert_eq!(read("dispatch.log.2"), "one");
        // old .3 was deleted; .2 did not exist, so nothing moved into .3
        assert!(!tmp.path().join("dispatch.log.3").exists());
    }

    #[test]
    fn test_rotate_without_existing_log() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path().join("dispatch.log");
        rotate_log_file(&base, 3);
        assert!(!base.exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        let mut clone = writer.clone();
        clone.write_all(b"line two\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\nline two\n");
    }
}
