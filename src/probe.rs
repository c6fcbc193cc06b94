//! Filesystem probe: the single point where directory listings and metadata
//! queries hit the OS, and where their failures are observed.
//!
//! Probe calls may block (network mounts, cold caches), so the interactive
//! loop never calls them directly. [`FsDispatcher`] runs them on blocking
//! workers and delivers results back as [`FsEvent`]s on a channel drained by
//! the owner thread.

use std::{
    cmp, fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use thiserror::Error;
use tokio::{
    runtime::{Handle, Runtime},
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("no such entry: {0}")]
    NotFound(PathBuf),
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("not a file: {0}")]
    NotAFile(PathBuf),
    #[error("symlink loop at {0}")]
    SymlinkLoop(PathBuf),
    #[error("io error: {0}")]
    Io(String),
}

impl FsError {
    pub fn from_io(err: &io::Error, path: &Path) -> Self {
        match err.kind() {
            ErrorKind::NotFound => FsError::NotFound(path.to_path_buf()),
            ErrorKind::PermissionDenied => FsError::PermissionDenied(path.to_path_buf()),
            ErrorKind::NotADirectory => FsError::NotADirectory(path.to_path_buf()),
            _ => FsError::Io(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Immutable snapshot of one filesystem object. Re-fetched, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub hidden: bool,
    pub size: Option<u64>,
    pub modified: Option<SystemTime>,
    /// Canonical target for symlinks that resolve (one level) to a
    /// directory. Consumed by the cache's loop guard; `None` otherwise.
    pub link_target: Option<PathBuf>,
}

impl DirEntry {
    /// Whether the entry can be expanded as a directory in the tree.
    pub fn is_dir_like(&self) -> bool {
        self.kind == EntryKind::Directory || self.link_target.is_some()
    }
}

/// Result of listing one directory: its canonical path plus sorted entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub real_path: PathBuf,
    pub entries: Vec<DirEntry>,
}

/// One listing request issued by the node cache. The token ties the eventual
/// [`FsEvent`] back to the node state that asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub path: PathBuf,
    pub token: u64,
}

pub fn list_directory(dir: &Path) -> Result<Listing, FsError> {
    let read = fs::read_dir(dir).map_err(|err| FsError::from_io(&err, dir))?;
    let mut entries: Vec<DirEntry> = read
        .filter_map(|res| match res {
            Ok(item) => probe_entry(&item),
            Err(err) => {
                tracing::warn!("skipping entry in {}: {err}", dir.display());
                None
            }
        })
        .collect();
    sort_entries(&mut entries);
    let real_path = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    Ok(Listing { real_path, entries })
}

pub fn stat(path: &Path) -> Result<DirEntry, FsError> {
    let meta = fs::symlink_metadata(path).map_err(|err| FsError::from_io(&err, path))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".into());
    let hidden = name.starts_with('.');
    if meta.is_symlink() {
        return Ok(classify_symlink(path, name, hidden));
    }
    let kind = if meta.is_dir() {
        EntryKind::Directory
    } else if meta.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    Ok(DirEntry {
        name,
        kind,
        hidden,
        size: meta.is_file().then(|| meta.len()),
        modified: meta.modified().ok(),
        link_target: None,
    })
}

fn probe_entry(item: &fs::DirEntry) -> Option<DirEntry> {
    let name = item.file_name().to_string_lossy().into_owned();
    let hidden = name.starts_with('.');
    let meta = item.metadata().ok().or_else(|| {
        // metadata() follows symlinks; a broken link still has symlink metadata
        fs::symlink_metadata(item.path()).ok()
    })?;
    let is_symlink = fs::symlink_metadata(item.path())
        .map(|m| m.is_symlink())
        .unwrap_or(false);
    if is_symlink {
        return Some(classify_symlink(&item.path(), name, hidden));
    }
    let kind = if meta.is_dir() {
        EntryKind::Directory
    } else if meta.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    Some(DirEntry {
        name,
        kind,
        hidden,
        size: meta.is_file().then(|| meta.len()),
        modified: meta.modified().ok(),
        link_target: None,
    })
}

/// Resolve a symlink one level to classify it. The target is never walked
/// recursively here; cycle prevention belongs to the node cache.
fn classify_symlink(path: &Path, name: String, hidden: bool) -> DirEntry {
    let target = fs::metadata(path).ok();
    let link_target = match &target {
        Some(meta) if meta.is_dir() => fs::canonicalize(path).ok(),
        _ => None,
    };
    DirEntry {
        name,
        kind: EntryKind::Symlink,
        hidden,
        size: target.as_ref().filter(|m| m.is_file()).map(|m| m.len()),
        modified: target.as_ref().and_then(|m| m.modified().ok()),
        link_target,
    }
}

/// Directories before files, then case-insensitive lexicographic, ties
/// broken by the original name for determinism.
pub fn sort_entries(entries: &mut [DirEntry]) {
    entries.sort_by(|a, b| match (a.is_dir_like(), b.is_dir_like()) {
        (true, false) => cmp::Ordering::Less,
        (false, true) => cmp::Ordering::Greater,
        _ => a
            .name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name)),
    });
}

/// Trait seam in front of the OS so tests can count or stub probe calls.
pub trait Probe: Send + Sync {
    fn list_directory(&self, dir: &Path) -> Result<Listing, FsError>;
    fn stat(&self, path: &Path) -> Result<DirEntry, FsError>;
}

pub struct OsProbe;

impl Probe for OsProbe {
    fn list_directory(&self, dir: &Path) -> Result<Listing, FsError> {
        list_directory(dir)
    }

    fn stat(&self, path: &Path) -> Result<DirEntry, FsError> {
        stat(path)
    }
}

#[derive(Debug)]
pub enum FsEvent {
    Listed {
        path: PathBuf,
        token: u64,
        result: Result<Listing, FsError>,
    },
}

/// Hands probe work to blocking workers and streams completions back to the
/// owner thread. Failures travel inside the event; the channel never carries
/// an `Err` of its own.
#[derive(Clone)]
pub struct FsDispatcher {
    handle: Handle,
    probe: Arc<dyn Probe>,
    event_tx: UnboundedSender<FsEvent>,
}

impl FsDispatcher {
    pub fn new(runtime: &Runtime) -> (Self, UnboundedReceiver<FsEvent>) {
        Self::with_probe(runtime, Arc::new(OsProbe))
    }

    pub fn with_probe(
        runtime: &Runtime,
        probe: Arc<dyn Probe>,
    ) -> (Self, UnboundedReceiver<FsEvent>) {
        let (event_tx, event_rx) = unbounded_channel();
        let dispatcher = Self {
            handle: runtime.handle().clone(),
            probe,
            event_tx,
        };
        (dispatcher, event_rx)
    }

    pub fn request_listing(&self, request: ProbeRequest) {
        let tx = self.event_tx.clone();
        let probe = self.probe.clone();
        self.handle.spawn_blocking(move || {
            let result = probe.list_directory(&request.path);
            tracing::debug!(
                "listed {} (token {}): {}",
                request.path.display(),
                request.token,
                if result.is_ok() { "ok" } else { "err" }
            );
            let _ = tx.send(FsEvent::Listed {
                path: request.path,
                token: request.token,
                result,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn names(listing: &Listing) -> Vec<&str> {
        listing.entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn directories_sort_before_files_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("Zebra")).unwrap();
        fs::create_dir(tmp.path().join("banana")).unwrap();
        File::create(tmp.path().join("apple")).unwrap();

        let listing = list_directory(tmp.path()).unwrap();
        assert_eq!(names(&listing), vec!["banana", "Zebra", "apple"]);
    }

    #[test]
    fn sort_ties_break_on_original_case() {
        let mut entries = vec![
            DirEntry {
                name: "readme".into(),
                kind: EntryKind::File,
                hidden: false,
                size: None,
                modified: None,
                link_target: None,
            },
            DirEntry {
                name: "README".into(),
                kind: EntryKind::File,
                hidden: false,
                size: None,
                modified: None,
                link_target: None,
            },
        ];
        sort_entries(&mut entries);
        assert_eq!(entries[0].name, "README");
        assert_eq!(entries[1].name, "readme");
    }

    #[test]
    fn dotfiles_are_hidden() {
        let tmp = TempDir::new().unwrap();
        File::create(tmp.path().join(".secret")).unwrap();
        File::create(tmp.path().join("plain")).unwrap();

        let listing = list_directory(tmp.path()).unwrap();
        let hidden: Vec<bool> = listing.entries.iter().map(|e| e.hidden).collect();
        assert_eq!(names(&listing), vec![".secret", "plain"]);
        assert_eq!(hidden, vec![true, false]);
    }

    #[test]
    fn listing_a_missing_path_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let gone = tmp.path().join("gone");
        assert_eq!(
            list_directory(&gone),
            Err(FsError::NotFound(gone.clone()))
        );
    }

    #[test]
    fn listing_a_file_is_not_a_directory() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plain.txt");
        File::create(&file).unwrap();
        assert_eq!(
            list_directory(&file),
            Err(FsError::NotADirectory(file.clone()))
        );
    }

    #[test]
    fn stat_reports_file_size_and_modified_time() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("data.bin");
        fs::write(&file, b"12345").unwrap();
        let entry = stat(&file).unwrap();
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.size, Some(5));
        assert!(entry.modified.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_to_directory_is_classified_one_level() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("real")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("real"), tmp.path().join("link")).unwrap();

        let listing = list_directory(tmp.path()).unwrap();
        let link = listing.entries.iter().find(|e| e.name == "link").unwrap();
        assert_eq!(link.kind, EntryKind::Symlink);
        assert!(link.is_dir_like());
        assert_eq!(
            link.link_target.as_deref(),
            Some(fs::canonicalize(tmp.path().join("real")).unwrap().as_path())
        );
    }
}
