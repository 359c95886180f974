//! Append-only text sinks for sample logs and ML results.
//!
//! The router only talks to [`SinkFactory`] / [`LineSink`]; the binary uses
//! [`FileSinkFactory`], tests use an in-memory factory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

/// When buffered lines reach the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Flush after every packet.  Nothing acknowledged by the router is lost
    /// if the process dies, at the cost of one write per packet.
    #[default]
    PerPacket,
    /// Let the sink's buffer decide; flushed on mode exit and on drop.
    Buffered,
}

pub trait LineSink: Send {
    fn write_line(&mut self, line: &str) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

pub trait SinkFactory: Send {
    /// Create an empty sink called `name`, discarding anything previously
    /// stored under that name.
    fn create(&mut self, name: &str) -> io::Result<Box<dyn LineSink>>;
}

// ── Files ─────────────────────────────────────────────────────────────────────

struct FileSink {
    writer: BufWriter<File>,
}

impl LineSink for FileSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Creates one text file per sink inside `dir`.
#[derive(Debug, Clone)]
pub struct FileSinkFactory {
    dir: PathBuf,
}

impl FileSinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl SinkFactory for FileSinkFactory {
    fn create(&mut self, name: &str) -> io::Result<Box<dyn LineSink>> {
        let path = self.path_of(name);
        // A missing file is the normal case on first use.
        if let Err(e) = fs::remove_file(&path) {
            debug!("{}: not removed ({e}), creating", path.display());
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("created {}", path.display());
        Ok(Box::new(FileSink {
            writer: BufWriter::new(file),
        }))
    }
}

// ── In-memory (tests) ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    type Store = Arc<Mutex<HashMap<String, Vec<String>>>>;

    /// Records every line per sink name.  Lines become visible on flush, so
    /// tests also observe the flush policy.
    #[derive(Clone, Default)]
    pub struct MemorySinkFactory {
        store: Store,
        created: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl MemorySinkFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// A factory whose `create` always fails.
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn lines(&self, name: &str) -> Vec<String> {
            self.store
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_default()
        }

        pub fn created(&self) -> Vec<String> {
            self.created.lock().unwrap().clone()
        }
    }

    struct MemorySink {
        name: String,
        pending: Vec<String>,
        store: Store,
    }

    impl LineSink for MemorySink {
        fn write_line(&mut self, line: &str) -> io::Result<()> {
            self.pending.push(line.to_owned());
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            let mut store = self.store.lock().unwrap();
            store
                .entry(self.name.clone())
                .or_default()
                .append(&mut self.pending);
            Ok(())
        }
    }

    impl SinkFactory for MemorySinkFactory {
        fn create(&mut self, name: &str) -> io::Result<Box<dyn LineSink>> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
            }
            self.store.lock().unwrap().insert(name.to_owned(), Vec::new());
            self.created.lock().unwrap().push(name.to_owned());
            Ok(Box::new(MemorySink {
                name: name.to_owned(),
                pending: Vec::new(),
                store: Arc::clone(&self.store),
            }))
        }
    }
}
