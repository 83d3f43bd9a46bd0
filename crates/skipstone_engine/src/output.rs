//! Write-through-compare output streams.

use crate::context::ContextInner;
use crate::error::BuildError;
use crate::manager::BuildManager;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Where a settled stream reports its outcome.
pub(crate) enum StreamSink {
    /// A stream opened through a build context: the output lands in the
    /// context's modified or unmodified working set.
    Context(Arc<Mutex<ContextInner>>),
    /// A stream opened through the manager with no live context covering the
    /// output: a modified file is announced via `output_updated` directly.
    Manager(BuildManager),
}

impl StreamSink {
    fn settle(&self, path: &Path, modified: bool) {
        match self {
            StreamSink::Context(inner) => {
                let mut inner = inner.lock().unwrap();
                if modified {
                    inner.modified_outputs.insert(path.to_path_buf());
                } else {
                    inner.unmodified_outputs.insert(path.to_path_buf());
                }
            }
            StreamSink::Manager(manager) => {
                if modified {
                    manager.listener().output_updated(&BTreeSet::from([path.to_path_buf()]));
                }
            }
        }
    }
}

/// An output stream that leaves a byte-identical destination untouched.
///
/// Incoming bytes are compared against the existing file, read in tandem.
/// While they match, nothing is written. On the first divergent byte, or
/// when the existing file is absent or of different length, the stream
/// switches to rewriting: parent directories are created, the destination is
/// truncated, and the matched prefix plus everything after it is written
/// out. [`close`](Self::close) reports the outcome to the sink: an untouched
/// file keeps its modification time and counts as *unmodified*.
pub struct IncrementalOutputStream {
    path: PathBuf,
    sink: Option<StreamSink>,
    comparand: Option<BufReader<File>>,
    existing_len: Option<u64>,
    /// Bytes matched so far but not yet written anywhere.
    pending: Vec<u8>,
    writer: Option<File>,
    written: u64,
}

impl IncrementalOutputStream {
    pub(crate) fn new(path: PathBuf, sink: StreamSink) -> Self {
        let (comparand, existing_len) = match File::open(&path) {
            Ok(file) => {
                let len = file.metadata().ok().map(|m| m.len());
                (Some(BufReader::new(file)), len)
            }
            Err(_) => (None, None),
        };
        Self {
            path,
            sink: Some(sink),
            comparand,
            existing_len,
            pending: Vec::new(),
            writer: None,
            written: 0,
        }
    }

    /// The destination file of this stream.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Settles the stream: flushes a rewrite, or confirms the destination
    /// untouched when the full write was byte-identical to the existing
    /// content. Idempotent; a second call does nothing.
    pub fn close(&mut self) -> Result<(), BuildError> {
        let Some(sink) = self.sink.take() else {
            return Ok(());
        };

        let map_io = |e: io::Error, path: &Path| BuildError::io(path, e);

        let modified = match self.writer.as_mut() {
            Some(writer) => {
                writer.flush().map_err(|e| map_io(e, &self.path))?;
                true
            }
            None if self.existing_len == Some(self.written) => false,
            None => {
                // Matched every byte written, but the lengths differ (or the
                // file never existed): rewrite to the stream's content.
                self.diverge(&[]).map_err(|e| map_io(e, &self.path))?;
                if let Some(writer) = self.writer.as_mut() {
                    writer.flush().map_err(|e| map_io(e, &self.path))?;
                }
                true
            }
        };

        sink.settle(&self.path, modified);
        Ok(())
    }

    /// Whether `buf` equals the next bytes of the existing file.
    fn matches_existing(&mut self, buf: &[u8]) -> io::Result<bool> {
        let Some(reader) = self.comparand.as_mut() else {
            return Ok(false);
        };
        let mut existing = vec![0u8; buf.len()];
        match reader.read_exact(&mut existing) {
            Ok(()) => Ok(existing == buf),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Switches to rewrite mode: truncates the destination and writes the
    /// matched prefix plus `tail`.
    fn diverge(&mut self, tail: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.comparand = None;

        let mut file = File::create(&self.path)?;
        file.write_all(&self.pending)?;
        file.write_all(tail)?;
        self.written += tail.len() as u64;
        self.pending = Vec::new();
        self.writer = Some(file);
        Ok(())
    }
}

impl Write for IncrementalOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(buf)?;
            self.written += buf.len() as u64;
            return Ok(buf.len());
        }

        if self.matches_existing(buf)? {
            self.pending.extend_from_slice(buf);
            self.written += buf.len() as u64;
        } else {
            self.diverge(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for IncrementalOutputStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
