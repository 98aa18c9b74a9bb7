use std::{
    collections::HashSet,
    io::{self, Read, Write},
};

use tar::{Builder, EntryType, Header};
use tracing::{debug, trace};

use crate::ArchiveError;

/// Highest zstd level that does not need the "ultra" window sizes.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 19;

enum State<W: Write> {
    Open(Builder<zstd::Encoder<'static, W>>),
    Finalized,
    Aborted,
}

/// Append-only `.tar.zst` writer.
///
/// Entries may arrive in any order; each one is copied from its reader in
/// bounded chunks. Nothing usable is produced until [`finalize`] succeeds.
///
/// [`finalize`]: ArchiveAssembler::finalize
pub struct ArchiveAssembler<W: Write> {
    state: State<W>,
    entries: HashSet<String>,
    bytes_in: u64,
}

impl<W: Write> ArchiveAssembler<W> {
    pub fn begin(sink: W, compression_level: i32) -> Result<Self, ArchiveError> {
        let encoder = zstd::Encoder::new(sink, compression_level)?;
        Ok(Self {
            state: State::Open(Builder::new(encoder)),
            entries: HashSet::new(),
            bytes_in: 0,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Copies exactly `size` bytes from `reader` into a new entry named after
    /// `relative_path`.
    pub fn append_entry<R: Read>(
        &mut self,
        relative_path: &str,
        size: u64,
        mtime: Option<u64>,
        reader: R,
    ) -> Result<(), ArchiveError> {
        let State::Open(builder) = &mut self.state else {
            return Err(ArchiveError::Codec(io::Error::other("archive is not open")));
        };
        let name = entry_name(relative_path).ok_or_else(|| {
            ArchiveError::Codec(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no archive entry name for {relative_path:?}"),
            ))
        })?;
        if self.entries.contains(&name) {
            return Err(ArchiveError::DuplicateEntry(name));
        }
        if name != relative_path {
            debug!(relative_path, entry = %name, "renamed archive entry");
        }

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(mtime.unwrap_or(0));
        builder.append_data(&mut header, &name, ExactSizeReader::new(reader, size))?;

        trace!(entry = %name, size, "appended archive entry");
        self.entries.insert(name);
        self.bytes_in += size;
        Ok(())
    }

    /// Writes the tar trailer, finishes the zstd frame and hands back the
    /// flushed sink.
    pub fn finalize(&mut self) -> Result<W, ArchiveError> {
        match std::mem::replace(&mut self.state, State::Finalized) {
            State::Open(builder) => {
                let encoder = builder.into_inner()?;
                let mut sink = encoder.finish()?;
                sink.flush()?;
                debug!(
                    entries = self.entries.len(),
                    bytes_in = self.bytes_in,
                    "archive finalized"
                );
                Ok(sink)
            }
            previous => {
                self.state = previous;
                Err(ArchiveError::Codec(io::Error::other("archive is not open")))
            }
        }
    }

    /// Drops the codec state without producing a usable archive. No-op once
    /// finalized or aborted.
    pub fn abort(&mut self) {
        if let State::Open(_) = self.state {
            debug!(entries = self.entries.len(), "archive aborted");
            // The zstd frame is left unfinished so the output never decodes
            // as a complete archive.
            self.state = State::Aborted;
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }
}

/// The name an entry for `relative_path` gets inside the archive.
///
/// Object keys may hold segments tar cannot store: empty segments are
/// dropped and `.` or `..` segments are written as `%2E` and `%2E%2E`. Returns
/// `None` when nothing is left.
fn entry_name(relative_path: &str) -> Option<String> {
    let segments: Vec<&str> = relative_path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment {
            "." => "%2E",
            ".." => "%2E%2E",
            other => other,
        })
        .collect();
    (!segments.is_empty()).then(|| segments.join("/"))
}

/// Passes through exactly `expected` bytes and fails if the source delivers
/// fewer or more.
struct ExactSizeReader<R> {
    inner: R,
    expected: u64,
    read: u64,
}

impl<R: Read> ExactSizeReader<R> {
    fn new(inner: R, expected: u64) -> Self {
        Self {
            inner,
            expected,
            read: 0,
        }
    }
}

impl<R: Read> Read for ExactSizeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.expected - self.read;
        if remaining == 0 {
            let mut extra = [0u8; 1];
            return match self.inner.read(&mut extra)? {
                0 => Ok(0),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("object is longer than its advertised {} bytes", self.expected),
                )),
            };
        }
        let limit = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..limit])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "object ended after {} of {} advertised bytes",
                    self.read, self.expected
                ),
            ));
        }
        self.read += n as u64;
        Ok(n)
    }
}
