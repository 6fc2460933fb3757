//! Read-only source blobs and their content fingerprints.
//!
//! A [`Source`] is the immutable byte-addressable blob being searched. The
//! core never mutates it; callers keep ownership of the underlying file.
//! Identity is a SHA-256 content fingerprint, so cache entries survive
//! renames and process restarts for the same bytes.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use sha2::{Digest, Sha256};

use crate::api::Fingerprint;

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => map,
            Backing::Owned(vec) => vec,
        }
    }
}

/// An immutable, randomly-addressable view of a binary blob.
///
/// Cheap to clone (shared backing). File-backed sources are memory-mapped;
/// the map is private and read-only, so concurrent readers are safe.
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

struct SourceInner {
    backing: Backing,
    fingerprint: Fingerprint,
    path: Option<PathBuf>,
}

impl Source {
    /// Maps a file read-only and fingerprints its contents.
    ///
    /// Fingerprinting reads the whole blob once; for ROM-sized inputs this
    /// is a few milliseconds and buys stable cache identity for the rest of
    /// the session.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the map is read-only and private. Sources are immutable
        // by contract; a writer racing the map is external misuse.
        let map = unsafe { Mmap::map(&file)? };
        let fingerprint = fingerprint_bytes(&map);
        Ok(Self {
            inner: Arc::new(SourceInner {
                backing: Backing::Mapped(map),
                fingerprint,
                path: Some(path.to_path_buf()),
            }),
        })
    }

    /// Wraps an in-memory blob. Used by tests and embedded callers.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let fingerprint = fingerprint_bytes(&bytes);
        Self {
            inner: Arc::new(SourceInner {
                backing: Backing::Owned(bytes),
                fingerprint,
                path: None,
            }),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.inner.fingerprint
    }

    /// Path the source was opened from, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn len(&self) -> u64 {
        self.inner.backing.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.inner.backing.bytes().is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        self.inner.backing.bytes()
    }

    /// Byte window starting at `offset`, clamped to the blob's end.
    ///
    /// Returns an empty slice for offsets at or past the end; offset math
    /// never panics on caller-supplied addresses.
    pub fn window(&self, offset: u64, len: usize) -> &[u8] {
        let bytes = self.inner.backing.bytes();
        let Ok(start) = usize::try_from(offset) else {
            return &[];
        };
        if start >= bytes.len() {
            return &[];
        }
        let end = start.saturating_add(len).min(bytes.len());
        &bytes[start..end]
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("len", &self.len())
            .field("fingerprint", &self.fingerprint())
            .field("path", &self.inner.path)
            .finish()
    }
}

fn fingerprint_bytes(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Fingerprint(hasher.finalize().into())
}
