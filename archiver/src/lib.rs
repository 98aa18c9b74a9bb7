//! Streams every object below a blob store prefix into one compressed
//! archive.
//!
//! An [`ArchiveSession`] wires three stages together: the
//! [`KeyTreeWalker`] expands the prefix into leaf objects, a fetch
//! coordinator opens their streams with bounded concurrency and an
//! [`ArchiveAssembler`] copies each stream into a `.tar.zst` file as soon as
//! it is opened.

mod assembler;
mod error;
mod fetch;
mod session;
mod session_test;
#[cfg(test)]
mod test_support;
mod walker;

pub use assembler::{ArchiveAssembler, DEFAULT_COMPRESSION_LEVEL};
pub use error::{ArchiveError, FailureRecord};
pub use fetch::{FetchRegistry, PendingFetch};
pub use session::{ArchiveArtifact, ArchiveConfig, ArchiveSession, SessionState, ARCHIVE_EXTENSION};
pub use walker::{KeyTreeWalker, LeafObject};
