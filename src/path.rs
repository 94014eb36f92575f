//! Path reconstruction from journal records.
//!
//! A journal only names the entry a record is about and references its parent directory.
//! [`JournalPathResolver`] remembers the directories it has seen so later records can be
//! placed under them.

use log::debug;
use lru::LruCache;
use std::{num::NonZeroUsize, path::PathBuf};

use crate::{
    reason::UsnReason,
    record::{FileReference, UsnRecord},
};

const LRU_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(4 * 1024) {
    Some(capacity) => capacity,
    None => panic!("LRU cache capacity must be non-zero"),
};

/// Resolves record paths from the directory records observed so far.
///
/// Only each directory's name and parent are remembered; full paths are rebuilt on every
/// lookup, so moving or renaming a directory also moves everything cached beneath it.
#[derive(Debug)]
pub struct JournalPathResolver {
    root: PathBuf,
    // dir file reference -> (name, parent dir file reference)
    dir_cache: LruCache<FileReference, (String, FileReference)>,
}

impl Default for JournalPathResolver {
    fn default() -> Self {
        JournalPathResolver::new()
    }
}

impl JournalPathResolver {
    /// Paths are relative to the volume root, e.g. `Users/alice/file.txt`.
    pub fn new() -> Self {
        JournalPathResolver::with_root(PathBuf::new())
    }

    /// Paths are joined onto `root`, e.g. a drive or mount point.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        JournalPathResolver {
            root: root.into(),
            dir_cache: LruCache::new(LRU_CACHE_CAPACITY),
        }
    }

    pub fn with_capacity(root: impl Into<PathBuf>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        JournalPathResolver {
            root: root.into(),
            dir_cache: LruCache::new(capacity),
        }
    }

    /// Number of directories currently remembered.
    pub fn cached_directories(&self) -> usize {
        self.dir_cache.len()
    }

    /// Resolve the full path of the entry a record describes, learning from it if it is a
    /// directory.
    ///
    /// Returns `None` when an ancestor directory has not been seen (or was evicted).
    /// Records must be fed in journal order for renames, moves and deletions to be tracked.
    pub fn resolve_path(&mut self, record: &UsnRecord) -> Option<PathBuf> {
        let fid = record.file_reference;
        let parent_fid = record.parent_file_reference;

        if fid.is_root() {
            return Some(self.root.clone());
        }

        if record.is_dir() {
            if record.reason.contains(UsnReason::FILE_DELETE) {
                self.dir_cache.pop(&fid);
            } else {
                // Latest name and parent win, which covers renames and moves.
                self.dir_cache.put(fid, (record.file_name.clone(), parent_fid));
            }
        }

        let parent_dir_path = self.directory_path(parent_fid)?;
        Some(parent_dir_path.join(&record.file_name))
    }

    /// Walk parent links up to the root.
    fn directory_path(&mut self, mut fid: FileReference) -> Option<PathBuf> {
        let mut names = Vec::new();

        while !fid.is_root() {
            // A longer chain than the cache holds can only be a cycle.
            if names.len() > self.dir_cache.len() {
                debug!("Directory cycle detected at {}", fid);
                return None;
            }
            let (name, parent_fid) = self.dir_cache.get(&fid)?;
            names.push(name.clone());
            fid = *parent_fid;
        }

        let mut path = self.root.clone();
        path.extend(names.iter().rev());
        Some(path)
    }
}
