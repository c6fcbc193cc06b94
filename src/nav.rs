//! The orchestrator: translates user intents into cache and resolver
//! operations, owns the authoritative current selection, and feeds the
//! presentation layer through an explicit event queue drained once per
//! interaction tick.

use std::{
    collections::VecDeque,
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use crate::cache::{ExpandOutcome, NodeCache, NodeState, TreeRow};
use crate::probe::{FsDispatcher, FsError, FsEvent, ProbeRequest};
use crate::resolver::{self, CompletionResult, Verdict};

/// Cap on bytes handed to the preview layer. The consumer renders a head of
/// the file, never the whole thing.
pub const FILE_CONTENT_MAX_BYTES: u64 = 64 * 1024;

const CACHE_NODE_BUDGET: usize = 512;

#[derive(Debug)]
pub enum NavEvent {
    SelectionChanged(PathBuf),
    NodeStateChanged {
        path: PathBuf,
        state: NodeState,
        expanded: bool,
    },
    CompletionUpdated(CompletionResult),
}

/// A superseded request carries the generation it was issued under; results
/// for an older generation are discarded rather than the I/O aborted.
struct PendingInput {
    raw: String,
    generation: u64,
}

pub struct Navigator {
    cache: NodeCache,
    fs: FsDispatcher,
    root: PathBuf,
    selection: PathBuf,
    events: VecDeque<NavEvent>,
    generation: u64,
    pending_input: Option<PendingInput>,
    pending_navigate: Option<PendingInput>,
}

impl Navigator {
    pub fn new(fs: FsDispatcher, root: PathBuf) -> Self {
        let mut nav = Self {
            cache: NodeCache::new(),
            fs,
            root: root.clone(),
            selection: root.clone(),
            events: VecDeque::new(),
            generation: 0,
            pending_input: None,
            pending_navigate: None,
        };
        nav.request_expand(&root);
        nav.events.push_back(NavEvent::SelectionChanged(root));
        nav
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn selection(&self) -> &Path {
        &self.selection
    }

    pub fn next_event(&mut self) -> Option<NavEvent> {
        self.events.pop_front()
    }

    pub fn visible_rows(&self, show_hidden: bool) -> Vec<TreeRow> {
        self.cache.visible_rows(&self.root, show_hidden)
    }

    pub fn node_state(&self, path: &Path) -> Option<NodeState> {
        self.cache.node(path).map(|node| node.state().clone())
    }

    /// Move the authoritative selection (cursor movement in the tree).
    pub fn select(&mut self, path: &Path) {
        if self.selection != path {
            self.selection = path.to_path_buf();
            self.events
                .push_back(NavEvent::SelectionChanged(self.selection.clone()));
        }
    }

    /// Expand a collapsed directory or collapse an expanded one.
    pub fn toggle(&mut self, path: &Path) {
        let expanded = self
            .cache
            .node(path)
            .map(|node| node.is_expanded())
            .unwrap_or(false);
        if expanded {
            self.cache.collapse(path);
            self.emit_node_state(path);
            self.cache.trim(&self.selection, CACHE_NODE_BUDGET);
        } else {
            self.request_expand(path);
        }
    }

    /// Drop cached listings under `path` and probe again.
    pub fn refresh(&mut self, path: &Path) {
        self.cache.invalidate(path);
        self.request_expand(path);
    }

    /// Explicit recovery for an errored node.
    pub fn retry(&mut self, path: &Path) {
        match self.cache.retry(path) {
            ExpandOutcome::Requested(request) => self.dispatch(request),
            ExpandOutcome::Expanded
            | ExpandOutcome::AlreadyLoading
            | ExpandOutcome::Errored(_) => {}
        }
        self.emit_node_state(path);
    }

    /// Per-keystroke resolution of the path-entry field. Only the most
    /// recent input is ever re-resolved when probe results land; anything
    /// older is logically superseded.
    pub fn set_input(&mut self, raw: &str) {
        self.generation += 1;
        let generation = self.generation;
        if let Some(old) = self.pending_input.take() {
            tracing::debug!(
                "superseding completion for {:?} (generation {})",
                old.raw,
                old.generation
            );
        }
        let (result, requests) = resolver::resolve(raw, &self.root, &mut self.cache);
        for request in requests {
            self.dispatch(request);
        }
        if result.verdict == Verdict::Pending {
            self.pending_input = Some(PendingInput {
                raw: raw.to_string(),
                generation,
            });
        }
        self.events.push_back(NavEvent::CompletionUpdated(result));
    }

    /// Resolve `raw` and, when it settles on a directory, expand the whole
    /// ancestor chain and move the selection there.
    pub fn navigate_to(&mut self, raw: &str) {
        self.generation += 1;
        let generation = self.generation;
        self.pending_navigate = None;
        let (result, requests) = resolver::resolve(raw, &self.root, &mut self.cache);
        for request in requests {
            self.dispatch(request);
        }
        match result.verdict {
            Verdict::Pending => {
                self.pending_navigate = Some(PendingInput {
                    raw: raw.to_string(),
                    generation,
                });
            }
            Verdict::Invalid => {
                self.events.push_back(NavEvent::CompletionUpdated(result));
            }
            Verdict::Valid => {
                if let Some(target) = accepted_target(&result, &self.cache) {
                    self.reveal(&target);
                } else {
                    // Valid but ambiguous: offer the candidates instead.
                    self.events.push_back(NavEvent::CompletionUpdated(result));
                }
            }
        }
    }

    /// A settled `Valid` resolution proved every ancestor is a loaded
    /// directory, so revealing is a plain iterative walk: flip each level
    /// expanded and kick off the target's own listing.
    fn reveal(&mut self, target: &Path) {
        let mut chain: Vec<PathBuf> = target
            .ancestors()
            .take_while(|ancestor| ancestor.starts_with(&self.root))
            .map(Path::to_path_buf)
            .collect();
        chain.reverse();
        if chain.is_empty() {
            // Target outside the current tree: re-root on it, the way the
            // goto action replaces the tree root.
            self.root = target.to_path_buf();
            chain.push(target.to_path_buf());
        }
        for path in chain {
            self.request_expand(&path);
        }
        self.select(target);
        self.cache.trim(&self.selection, CACHE_NODE_BUDGET);
    }

    /// Feed one dispatcher completion back into the cache and re-drive any
    /// resolution that was waiting on it.
    pub fn handle_fs_event(&mut self, event: FsEvent) {
        match event {
            FsEvent::Listed {
                path,
                token,
                result,
            } => {
                if self.cache.apply_listing(&path, token, result) {
                    self.emit_node_state(&path);
                }
            }
        }
        if let Some(pending) = self.pending_input.take() {
            let (result, requests) =
                resolver::resolve(&pending.raw, &self.root, &mut self.cache);
            for request in requests {
                self.dispatch(request);
            }
            if result.verdict == Verdict::Pending {
                self.pending_input = Some(pending);
            } else {
                self.events.push_back(NavEvent::CompletionUpdated(result));
            }
        }
        if let Some(pending) = self.pending_navigate.take() {
            self.navigate_to(&pending.raw);
        }
    }

    /// Whether a completion candidate under `dir` is a directory or a
    /// symlink to one. Lets the presentation append a separator when a
    /// completion is accepted.
    pub fn candidate_is_dir(&self, dir: &Path, name: &str) -> bool {
        resolver::candidate_entry(&self.cache, dir, name)
            .map(|entry| entry.is_dir_like())
            .unwrap_or(false)
    }

    /// Bytes of a regular file for the preview/highlighting layer, capped at
    /// [`FILE_CONTENT_MAX_BYTES`]. The core never interprets the contents.
    pub fn current_file_content(&self, path: &Path) -> Result<Vec<u8>, FsError> {
        // Opening a FIFO or socket can block until a writer appears, and
        // this runs on the owner thread. `metadata` follows symlinks, so
        // anything that is not a regular file is rejected before the open.
        let meta = fs::metadata(path).map_err(|err| FsError::from_io(&err, path))?;
        if !meta.is_file() {
            return Err(FsError::NotAFile(path.to_path_buf()));
        }
        let file = fs::File::open(path).map_err(|err| FsError::from_io(&err, path))?;
        let mut buffer = Vec::new();
        file.take(FILE_CONTENT_MAX_BYTES)
            .read_to_end(&mut buffer)
            .map_err(|err| FsError::from_io(&err, path))?;
        Ok(buffer)
    }

    fn request_expand(&mut self, path: &Path) {
        match self.cache.expand(path) {
            ExpandOutcome::Requested(request) => {
                self.emit_node_state(path);
                self.dispatch(request);
            }
            ExpandOutcome::Expanded => self.emit_node_state(path),
            ExpandOutcome::AlreadyLoading => {}
            ExpandOutcome::Errored(_) => self.emit_node_state(path),
        }
    }

    fn dispatch(&mut self, request: ProbeRequest) {
        self.fs.request_listing(request);
    }

    fn emit_node_state(&mut self, path: &Path) {
        if let Some(node) = self.cache.node(path) {
            self.events.push_back(NavEvent::NodeStateChanged {
                path: path.to_path_buf(),
                state: node.state().clone(),
                expanded: node.is_expanded(),
            });
        }
    }
}

/// Decide what a `Valid` resolution accepts: the walked prefix itself when
/// nothing more was typed, an exact (case-insensitive) directory match, or a
/// unique directory candidate.
fn accepted_target(result: &CompletionResult, cache: &NodeCache) -> Option<PathBuf> {
    let prefix = &result.query.existing_prefix;
    if result.query.remainder.is_empty() {
        return Some(prefix.clone());
    }
    let remainder = result.query.remainder.to_lowercase();
    let exact = result
        .candidates
        .iter()
        .find(|name| name.to_lowercase() == remainder);
    let chosen = match exact {
        Some(name) => Some(name),
        None if result.candidates.len() == 1 => result.candidates.first(),
        None => None,
    }?;
    let entry = resolver::candidate_entry(cache, prefix, chosen)?;
    entry.is_dir_like().then(|| prefix.join(chosen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::runtime::Runtime;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::probe::{DirEntry, Listing, OsProbe, Probe};

    struct CountingProbe {
        inner: OsProbe,
        listings: AtomicUsize,
    }

    impl Probe for CountingProbe {
        fn list_directory(&self, dir: &Path) -> Result<Listing, FsError> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            self.inner.list_directory(dir)
        }

        fn stat(&self, path: &Path) -> Result<DirEntry, FsError> {
            self.inner.stat(path)
        }
    }

    fn pump(nav: &mut Navigator, rx: &mut UnboundedReceiver<FsEvent>, count: usize) {
        for _ in 0..count {
            let event = rx.blocking_recv().expect("fs event");
            nav.handle_fs_event(event);
        }
    }

    fn drain(nav: &mut Navigator) -> Vec<NavEvent> {
        let mut events = Vec::new();
        while let Some(event) = nav.next_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn superseded_resolution_delivers_only_the_latest_result() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        fs::create_dir_all(tmp.path().join("a/bc")).unwrap();

        let runtime = Runtime::new().unwrap();
        let (fs_dispatcher, mut rx) = FsDispatcher::new(&runtime);
        let mut nav = Navigator::new(fs_dispatcher, tmp.path().to_path_buf());

        nav.set_input("a/b");
        nav.set_input("a/bc");
        drain(&mut nav);

        // Root listing (one probe, shared by both inputs), then the `a`
        // listing issued for the surviving query.
        pump(&mut nav, &mut rx, 2);

        let settled: Vec<CompletionResult> = drain(&mut nav)
            .into_iter()
            .filter_map(|event| match event {
                NavEvent::CompletionUpdated(result)
                    if result.verdict != Verdict::Pending =>
                {
                    Some(result)
                }
                _ => None,
            })
            .collect();
        assert_eq!(settled.len(), 1, "only the latest query may settle");
        assert_eq!(settled[0].query.raw, "a/bc");
        assert_eq!(settled[0].verdict, Verdict::Valid);
        assert_eq!(settled[0].candidates, vec!["bc"]);
    }

    #[test]
    fn double_expand_issues_exactly_one_probe_call() {
        let tmp = TempDir::new().unwrap();
        let runtime = Runtime::new().unwrap();
        let probe = Arc::new(CountingProbe {
            inner: OsProbe,
            listings: AtomicUsize::new(0),
        });
        let (fs_dispatcher, mut rx) = FsDispatcher::with_probe(&runtime, probe.clone());
        let mut nav = Navigator::new(fs_dispatcher, tmp.path().to_path_buf());

        // Navigator::new already asked for the root listing; toggling twice
        // more while it is in flight must not add probe calls.
        nav.toggle(tmp.path());
        nav.toggle(tmp.path());
        pump(&mut nav, &mut rx, 1);

        assert_eq!(probe.listings.load(Ordering::SeqCst), 1);
        assert!(matches!(
            nav.node_state(tmp.path()),
            Some(NodeState::Loaded)
        ));
    }

    #[test]
    fn navigate_reveals_the_ancestor_chain_and_moves_selection() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("d1/d2")).unwrap();

        let runtime = Runtime::new().unwrap();
        let (fs_dispatcher, mut rx) = FsDispatcher::new(&runtime);
        let mut nav = Navigator::new(fs_dispatcher, tmp.path().to_path_buf());

        nav.navigate_to("d1/d2");
        // Root listing, then d1 (prefix walk), then d2 (reveal).
        pump(&mut nav, &mut rx, 3);

        assert_eq!(nav.selection(), tmp.path().join("d1/d2"));
        let events = drain(&mut nav);
        assert!(events.iter().any(|event| matches!(
            event,
            NavEvent::SelectionChanged(path) if path == &tmp.path().join("d1/d2")
        )));
        let rows = nav.visible_rows(false);
        assert!(rows.iter().any(|row| row.path == tmp.path().join("d1")));
        assert!(rows.iter().any(|row| row.path == tmp.path().join("d1/d2")));
    }

    #[test]
    fn navigate_to_a_missing_path_reports_invalid_and_keeps_selection() {
        let tmp = TempDir::new().unwrap();
        let runtime = Runtime::new().unwrap();
        let (fs_dispatcher, mut rx) = FsDispatcher::new(&runtime);
        let mut nav = Navigator::new(fs_dispatcher, tmp.path().to_path_buf());

        nav.navigate_to("nowhere/at/all");
        pump(&mut nav, &mut rx, 1);

        assert_eq!(nav.selection(), tmp.path());
        let settled = drain(&mut nav).into_iter().find_map(|event| match event {
            NavEvent::CompletionUpdated(result) if result.verdict == Verdict::Invalid => {
                Some(result)
            }
            _ => None,
        });
        let settled = settled.expect("invalid verdict surfaced");
        assert!(matches!(settled.reason, Some(FsError::NotFound(_))));
    }

    #[test]
    fn refresh_picks_up_new_entries() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("old.txt"), b"x").unwrap();

        let runtime = Runtime::new().unwrap();
        let (fs_dispatcher, mut rx) = FsDispatcher::new(&runtime);
        let mut nav = Navigator::new(fs_dispatcher, tmp.path().to_path_buf());
        pump(&mut nav, &mut rx, 1);
        assert_eq!(nav.visible_rows(false).len(), 1);

        fs::write(tmp.path().join("new.txt"), b"x").unwrap();
        nav.refresh(tmp.path());
        pump(&mut nav, &mut rx, 1);

        let names: Vec<String> = nav
            .visible_rows(false)
            .into_iter()
            .map(|row| row.entry.name)
            .collect();
        assert_eq!(names, vec!["new.txt", "old.txt"]);
    }

    #[test]
    fn file_content_rejects_directories() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("body.txt"), b"hello").unwrap();

        let runtime = Runtime::new().unwrap();
        let (fs_dispatcher, _rx) = FsDispatcher::new(&runtime);
        let nav = Navigator::new(fs_dispatcher, tmp.path().to_path_buf());

        assert_eq!(
            nav.current_file_content(&tmp.path().join("body.txt")),
            Ok(b"hello".to_vec())
        );
        assert_eq!(
            nav.current_file_content(tmp.path()),
            Err(FsError::NotAFile(tmp.path().to_path_buf()))
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_content_rejects_non_regular_files_without_opening() {
        let tmp = TempDir::new().unwrap();
        let fifo = tmp.path().join("pipe");
        let status = std::process::Command::new("mkfifo")
            .arg(&fifo)
            .status()
            .expect("mkfifo");
        assert!(status.success());

        let runtime = Runtime::new().unwrap();
        let (fs_dispatcher, _rx) = FsDispatcher::new(&runtime);
        let nav = Navigator::new(fs_dispatcher, tmp.path().to_path_buf());

        // Must return instead of blocking on a pipe with no writer.
        assert_eq!(
            nav.current_file_content(&fifo),
            Err(FsError::NotAFile(fifo.clone()))
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_content_follows_symlinks_to_regular_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("real.txt"), b"linked").unwrap();
        let link = tmp.path().join("link.txt");
        std::os::unix::fs::symlink(tmp.path().join("real.txt"), &link).unwrap();

        let runtime = Runtime::new().unwrap();
        let (fs_dispatcher, _rx) = FsDispatcher::new(&runtime);
        let nav = Navigator::new(fs_dispatcher, tmp.path().to_path_buf());

        assert_eq!(nav.current_file_content(&link), Ok(b"linked".to_vec()));
    }

    #[test]
    fn errored_node_recovers_only_on_explicit_retry() {
        let tmp = TempDir::new().unwrap();
        let runtime = Runtime::new().unwrap();
        let (fs_dispatcher, mut rx) = FsDispatcher::new(&runtime);
        let mut nav = Navigator::new(fs_dispatcher, tmp.path().to_path_buf());
        pump(&mut nav, &mut rx, 1);

        let gone = tmp.path().join("gone");
        nav.toggle(&gone);
        pump(&mut nav, &mut rx, 1);
        assert!(matches!(
            nav.node_state(&gone),
            Some(NodeState::Errored(FsError::NotFound(_)))
        ));

        // Toggling again must not probe; the error sticks.
        nav.toggle(&gone);
        assert!(matches!(
            nav.node_state(&gone),
            Some(NodeState::Errored(_))
        ));

        fs::create_dir(&gone).unwrap();
        nav.retry(&gone);
        pump(&mut nav, &mut rx, 1);
        assert!(matches!(nav.node_state(&gone), Some(NodeState::Loaded)));
    }
}
