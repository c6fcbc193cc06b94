//! Lazily-materialized mirror of a filesystem subtree.
//!
//! The cache is the sole writer of node state. Everything else observes nodes
//! through shared references and asks the cache to change them. Disk is never
//! touched here: `expand` hands out a [`ProbeRequest`] and the listing comes
//! back later through [`NodeCache::apply_listing`] on the owner thread.

use std::{
    cmp,
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::probe::{DirEntry, EntryKind, FsError, Listing, ProbeRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Unloaded,
    Loading { token: u64 },
    Loaded,
    Errored(FsError),
}

/// One materialized node of the tree. Children are sorted by the probe
/// (directories first, case-insensitive) and owned exclusively by the cache.
#[derive(Debug)]
pub struct DirNode {
    path: PathBuf,
    real_path: Option<PathBuf>,
    state: NodeState,
    expanded: bool,
    children: Vec<DirEntry>,
}

impl DirNode {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            real_path: None,
            state: NodeState::Unloaded,
            expanded: false,
            children: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == NodeState::Loaded
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    pub fn children(&self) -> &[DirEntry] {
        &self.children
    }
}

/// Outcome of an expand request. A node with a probe already in flight
/// reports `AlreadyLoading` so the caller attaches to the pending listing
/// instead of issuing a duplicate.
#[derive(Debug, PartialEq, Eq)]
pub enum ExpandOutcome {
    Expanded,
    Requested(ProbeRequest),
    AlreadyLoading,
    Errored(FsError),
}

/// One row of the flattened, UI-visible tree.
#[derive(Debug, Clone)]
pub struct TreeRow {
    pub path: PathBuf,
    pub depth: usize,
    pub entry: DirEntry,
    pub expanded: bool,
    pub loading: bool,
    pub error: Option<FsError>,
}

pub struct NodeCache {
    index: HashMap<PathBuf, DirNode>,
    next_token: u64,
}

impl NodeCache {
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            next_token: 0,
        }
    }

    /// Returns the existing node or an unloaded placeholder. Never probes.
    pub fn get_or_create(&mut self, path: &Path) -> &DirNode {
        self.index
            .entry(path.to_path_buf())
            .or_insert_with(|| DirNode::new(path.to_path_buf()))
    }

    pub fn node(&self, path: &Path) -> Option<&DirNode> {
        self.index.get(path)
    }

    pub fn children(&self, path: &Path) -> Option<&[DirEntry]> {
        self.index
            .get(path)
            .filter(|node| node.is_loaded())
            .map(|node| node.children.as_slice())
    }

    pub fn expand(&mut self, path: &Path) -> ExpandOutcome {
        let token = self.next_token;
        let node = self
            .index
            .entry(path.to_path_buf())
            .or_insert_with(|| DirNode::new(path.to_path_buf()));

        // An unloaded node holding children means a state transition went
        // wrong somewhere. Fatal in debug, degraded to a re-fetch in release.
        if node.state == NodeState::Unloaded && !node.children.is_empty() {
            debug_assert!(
                false,
                "unloaded node with cached children: {}",
                node.path.display()
            );
            tracing::warn!(
                "dropping orphaned children of {}",
                node.path.display()
            );
            node.children.clear();
            node.expanded = false;
        }

        let outcome = match &node.state {
            NodeState::Loaded => {
                node.expanded = true;
                ExpandOutcome::Expanded
            }
            NodeState::Loading { .. } => ExpandOutcome::AlreadyLoading,
            NodeState::Errored(err) => ExpandOutcome::Errored(err.clone()),
            NodeState::Unloaded => {
                node.state = NodeState::Loading { token };
                ExpandOutcome::Requested(ProbeRequest {
                    path: node.path.clone(),
                    token,
                })
            }
        };
        if matches!(outcome, ExpandOutcome::Requested(_)) {
            self.next_token += 1;
        }
        outcome
    }

    /// Deliver a probe result. Returns false when the result was stale (the
    /// node was invalidated or re-requested since) and nothing changed.
    pub fn apply_listing(
        &mut self,
        path: &Path,
        token: u64,
        result: Result<Listing, FsError>,
    ) -> bool {
        match self.index.get(path).map(DirNode::state) {
            Some(NodeState::Loading { token: current }) if *current == token => {}
            _ => {
                tracing::debug!(
                    "discarding stale listing for {} (token {token})",
                    path.display()
                );
                return false;
            }
        }
        match result {
            Err(err) => {
                tracing::warn!("listing {} failed: {err}", path.display());
                if let Some(node) = self.index.get_mut(path) {
                    node.state = NodeState::Errored(err);
                    node.expanded = false;
                }
            }
            Ok(listing) => {
                if self.ancestor_real_path_matches(path, &listing.real_path) {
                    tracing::warn!("symlink cycle at {}", path.display());
                    self.mark_entry_other(path);
                    if let Some(node) = self.index.get_mut(path) {
                        node.state =
                            NodeState::Errored(FsError::SymlinkLoop(path.to_path_buf()));
                        node.expanded = false;
                    }
                    return true;
                }
                let child_dirs: Vec<PathBuf> = listing
                    .entries
                    .iter()
                    .filter(|entry| entry.is_dir_like())
                    .map(|entry| path.join(&entry.name))
                    .collect();
                if let Some(node) = self.index.get_mut(path) {
                    node.real_path = Some(listing.real_path);
                    node.children = listing.entries;
                    node.state = NodeState::Loaded;
                    node.expanded = true;
                }
                for child in child_dirs {
                    self.get_or_create(&child);
                }
            }
        }
        true
    }

    pub fn collapse(&mut self, path: &Path) {
        if let Some(node) = self.index.get_mut(path) {
            node.expanded = false;
        }
    }

    /// Drop the node and its whole subtree. The next access re-probes.
    pub fn invalidate(&mut self, path: &Path) {
        self.index.retain(|cached, _| !cached.starts_with(path));
    }

    /// The only way out of `Errored`: reset to `Unloaded` and expand again.
    pub fn retry(&mut self, path: &Path) -> ExpandOutcome {
        if let Some(node) = self.index.get_mut(path) {
            if matches!(node.state, NodeState::Errored(_)) {
                node.state = NodeState::Unloaded;
                node.children.clear();
            }
        }
        self.expand(path)
    }

    /// Size-pressure eviction: drop collapsed subtrees off the `keep`
    /// ancestor chain until the index fits the budget again.
    pub fn trim(&mut self, keep: &Path, budget: usize) {
        if self.index.len() <= budget {
            return;
        }
        let mut victims: Vec<PathBuf> = self
            .index
            .values()
            .filter(|node| !node.expanded && !keep.starts_with(&node.path))
            .map(|node| node.path.clone())
            .collect();
        victims.sort_by_key(|path| cmp::Reverse(path.components().count()));
        for path in victims {
            if self.index.len() <= budget {
                break;
            }
            self.index.retain(|cached, _| !cached.starts_with(&path));
        }
    }

    /// Flatten the expanded subtree under `root` into renderable rows,
    /// pre-order depth-first without recursion.
    pub fn visible_rows(&self, root: &Path, show_hidden: bool) -> Vec<TreeRow> {
        let mut rows = Vec::new();
        let mut stack: Vec<(PathBuf, usize, DirEntry)> = Vec::new();
        self.push_children(root, 0, show_hidden, &mut stack);
        while let Some((path, depth, entry)) = stack.pop() {
            let node = self.index.get(&path);
            let expanded = node.map(|n| n.expanded).unwrap_or(false);
            let loading = matches!(
                node.map(DirNode::state),
                Some(NodeState::Loading { .. })
            );
            let error = match node.map(DirNode::state) {
                Some(NodeState::Errored(err)) => Some(err.clone()),
                _ => None,
            };
            rows.push(TreeRow {
                path: path.clone(),
                depth,
                entry,
                expanded,
                loading,
                error,
            });
            if expanded {
                self.push_children(&path, depth + 1, show_hidden, &mut stack);
            }
        }
        rows
    }

    /// Push a loaded, expanded directory's children in reverse so the stack
    /// pops them in display order.
    fn push_children(
        &self,
        dir: &Path,
        depth: usize,
        show_hidden: bool,
        stack: &mut Vec<(PathBuf, usize, DirEntry)>,
    ) {
        let Some(node) = self.index.get(dir) else { return };
        if !node.is_loaded() || !node.expanded {
            return;
        }
        for entry in node.children.iter().rev() {
            if entry.hidden && !show_hidden {
                continue;
            }
            stack.push((dir.join(&entry.name), depth, entry.clone()));
        }
    }

    fn ancestor_real_path_matches(&self, path: &Path, real: &Path) -> bool {
        path.ancestors()
            .skip(1)
            .filter_map(|ancestor| self.index.get(ancestor))
            .any(|node| node.real_path.as_deref() == Some(real))
    }

    /// A cyclic symlinked directory is demoted to `Other` in its parent's
    /// entry list so the UI stops offering it for expansion.
    fn mark_entry_other(&mut self, path: &Path) {
        let Some(parent) = path.parent() else { return };
        let Some(name) = path.file_name() else { return };
        if let Some(node) = self.index.get_mut(parent) {
            if let Some(entry) = node
                .children
                .iter_mut()
                .find(|entry| entry.name.as_str() == name.to_string_lossy())
            {
                entry.kind = EntryKind::Other;
                entry.link_target = None;
            }
        }
    }
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new()
    }
}
