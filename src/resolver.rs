//! Turns a partially-typed path into a validity verdict plus sibling
//! completion candidates, using only the node cache for filesystem
//! knowledge. Listings the cache does not have yet come back as probe
//! requests for the caller to dispatch; the verdict stays `Pending` until
//! they land and the query is resolved again.

use std::path::{Component, Path, PathBuf};

use crate::cache::{ExpandOutcome, NodeCache};
use crate::probe::{DirEntry, FsError, ProbeRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid,
    Pending,
}

/// Transient decomposition of one typed input. Rebuilt from scratch on every
/// keystroke; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathQuery {
    pub raw: String,
    pub normalized: PathBuf,
    /// Longest ancestor confirmed to exist as a directory.
    pub existing_prefix: PathBuf,
    /// The trailing component still being typed; empty when the input ends
    /// with a separator or names the root.
    pub remainder: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    pub query: PathQuery,
    pub verdict: Verdict,
    pub candidates: Vec<String>,
    pub best_match: Option<String>,
    pub reason: Option<FsError>,
}

impl CompletionResult {
    fn new(query: PathQuery, verdict: Verdict) -> Self {
        Self {
            query,
            verdict,
            candidates: Vec::new(),
            best_match: None,
            reason: None,
        }
    }
}

/// Lexical normalization: home shorthand, redundant separators, `.` and
/// `..`, relative inputs joined to `base`. Never touches disk.
pub fn normalize(raw: &str, base: &Path) -> (PathBuf, bool) {
    let expanded = if raw == "~" || raw.starts_with("~/") {
        match dirs::home_dir() {
            Some(home) => {
                let rest = raw.trim_start_matches('~').trim_start_matches('/');
                if rest.is_empty() {
                    home.to_string_lossy().into_owned()
                } else {
                    home.join(rest).to_string_lossy().into_owned()
                }
            }
            None => raw.to_string(),
        }
    } else {
        raw.to_string()
    };
    let ends_with_sep = expanded.ends_with('/') || expanded.is_empty();
    let joined = if Path::new(&expanded).is_absolute() {
        PathBuf::from(&expanded)
    } else {
        base.join(&expanded)
    };
    let mut normalized = PathBuf::from("/");
    for component in joined.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {}
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    (normalized, ends_with_sep)
}

/// Resolve `raw` against the cache. Returns the completion result and any
/// probe requests the caller must dispatch before a `Pending` verdict can
/// settle.
pub fn resolve(
    raw: &str,
    base: &Path,
    cache: &mut NodeCache,
) -> (CompletionResult, Vec<ProbeRequest>) {
    let (normalized, ends_with_sep) = normalize(raw, base);
    let (prefix_target, remainder) = if ends_with_sep || normalized.parent().is_none() {
        (normalized.clone(), String::new())
    } else {
        (
            normalized.parent().map(Path::to_path_buf).unwrap_or_default(),
            normalized
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        )
    };

    let mut requests = Vec::new();
    // `base` is the canonicalized tree root; it is trusted to exist, so the
    // walk starts there when the input lives under it.
    let mut cursor = if base.is_absolute() && prefix_target.starts_with(base) {
        base.to_path_buf()
    } else {
        PathBuf::from("/")
    };
    cache.get_or_create(&cursor);
    let to_walk = prefix_target
        .strip_prefix(&cursor)
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let query = |existing: &Path| PathQuery {
        raw: raw.to_string(),
        normalized: normalized.clone(),
        existing_prefix: existing.to_path_buf(),
        remainder: remainder.clone(),
    };

    // Iterative walk of the existing prefix: each segment must be a known
    // directory before the next is considered.
    for component in to_walk.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        match ensure_listed(cache, &cursor, &mut requests) {
            Segment::Ready => {}
            Segment::Pending => {
                return (
                    CompletionResult::new(query(&cursor), Verdict::Pending),
                    requests,
                );
            }
            Segment::Failed(err) => {
                let mut result = CompletionResult::new(query(&cursor), Verdict::Invalid);
                result.reason = Some(err);
                return (result, requests);
            }
        }
        let name = part.to_string_lossy();
        let child = cache
            .children(&cursor)
            .and_then(|children| children.iter().find(|entry| entry.name == name).cloned());
        match child {
            Some(entry) if entry.is_dir_like() => cursor.push(name.as_ref()),
            Some(_) => {
                let mut result = CompletionResult::new(query(&cursor), Verdict::Invalid);
                result.reason = Some(FsError::NotADirectory(cursor.join(name.as_ref())));
                return (result, requests);
            }
            None => {
                let mut result = CompletionResult::new(query(&cursor), Verdict::Invalid);
                result.reason = Some(FsError::NotFound(cursor.join(name.as_ref())));
                return (result, requests);
            }
        }
    }

    if remainder.is_empty() {
        // The walk proved every segment is a directory.
        return (
            CompletionResult::new(query(&cursor), Verdict::Valid),
            requests,
        );
    }

    match ensure_listed(cache, &cursor, &mut requests) {
        Segment::Ready => {}
        Segment::Pending => {
            return (
                CompletionResult::new(query(&cursor), Verdict::Pending),
                requests,
            );
        }
        Segment::Failed(err) => {
            let mut result = CompletionResult::new(query(&cursor), Verdict::Invalid);
            result.reason = Some(err);
            return (result, requests);
        }
    }

    let needle = remainder.to_lowercase();
    let candidates: Vec<String> = cache
        .children(&cursor)
        .map(|children| {
            children
                .iter()
                .filter(|entry| entry.name.to_lowercase().starts_with(&needle))
                .map(|entry| entry.name.clone())
                .collect()
        })
        .unwrap_or_default();

    let mut result = if candidates.is_empty() {
        let mut invalid = CompletionResult::new(query(&cursor), Verdict::Invalid);
        invalid.reason = Some(FsError::NotFound(normalized.clone()));
        invalid
    } else {
        CompletionResult::new(query(&cursor), Verdict::Valid)
    };
    result.best_match = best_match(&candidates, &remainder);
    result.candidates = candidates;
    (result, requests)
}

/// Kind lookup for a candidate name, for callers deciding whether an accepted
/// completion is a directory.
pub fn candidate_entry<'a>(
    cache: &'a NodeCache,
    dir: &Path,
    name: &str,
) -> Option<&'a DirEntry> {
    cache
        .children(dir)
        .and_then(|children| children.iter().find(|entry| entry.name == name))
}

enum Segment {
    Ready,
    Pending,
    Failed(FsError),
}

fn ensure_listed(
    cache: &mut NodeCache,
    path: &Path,
    requests: &mut Vec<ProbeRequest>,
) -> Segment {
    match cache.expand(path) {
        ExpandOutcome::Expanded => Segment::Ready,
        ExpandOutcome::Requested(request) => {
            requests.push(request);
            Segment::Pending
        }
        ExpandOutcome::AlreadyLoading => Segment::Pending,
        ExpandOutcome::Errored(err) => Segment::Failed(err),
    }
}

/// Ghost-text policy: offer the first candidate when it is the only one, or
/// when every candidate shares a case-insensitive common prefix strictly
/// longer than what was typed. Anything more ambiguous offers nothing.
fn best_match(candidates: &[String], remainder: &str) -> Option<String> {
    match candidates {
        [] => None,
        [only] => Some(only.clone()),
        _ => {
            let typed = remainder.chars().count();
            let shared = common_prefix_len(candidates);
            (shared > typed).then(|| candidates[0].clone())
        }
    }
}

fn common_prefix_len(candidates: &[String]) -> usize {
    let first: Vec<char> = candidates[0].to_lowercase().chars().collect();
    let mut len = first.len();
    for candidate in &candidates[1..] {
        let lower: Vec<char> = candidate.to_lowercase().chars().collect();
        let mut shared = 0;
        while shared < len && shared < lower.len() && first[shared] == lower[shared] {
            shared += 1;
        }
        len = shared;
    }
    len
}
