//! # httpfs-tree
//!
//! In-memory index of the remote filesystem described by a metadata
//! document.
//!
//! The tree is an arena of [`Node`]s rooted at a permanent root entry
//! (index 0, its own parent), plus an optional open-addressed hash index
//! for O(1) average path resolution. Trees are built wholesale from a
//! metadata document and replaced wholesale on reload; they are never
//! patched in place.

mod hash;
mod parse;

use std::io;

use thiserror::Error;

pub use parse::dirname;

use hash::PathIndex;

/// Errors that can occur while building or probing the tree.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed metadata (line {line}): {reason}")]
    Malformed { line: usize, reason: String },

    /// The path index ran out of slots. Given the 1.9x sizing rule this
    /// cannot happen for a well-formed document; it indicates a
    /// configuration error, not a transient failure.
    #[error("path index full ({capacity} slots for {entries} entries)")]
    IndexFull { capacity: usize, entries: usize },
}

pub type Result<T> = std::result::Result<T, TreeError>;

/// Handle to a node inside a [`Tree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Kind of a filesystem entry. Symlinks and special files are served as
/// regular files by the byte-range layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    RegularFile,
    Symlink,
}

/// Three-digit permission classes (owner/group/other, each 0-7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub owner: u8,
    pub group: u8,
    pub other: u8,
}

impl Mode {
    /// Parse the last three characters of a mode field. Each digit must
    /// be in 0..=7.
    pub fn from_digits(field: &str) -> Option<Mode> {
        let digits = field.as_bytes();
        if digits.len() < 3 {
            return None;
        }
        let tail = &digits[digits.len() - 3..];
        let mut out = [0u8; 3];
        for (i, b) in tail.iter().enumerate() {
            if !(b'0'..=b'7').contains(b) {
                return None;
            }
            out[i] = b - b'0';
        }
        Some(Mode {
            owner: out[0],
            group: out[1],
            other: out[2],
        })
    }

    /// Classic octal permission bits (e.g. 7,5,5 -> 0o755).
    pub fn bits(&self) -> u32 {
        (self.owner as u32) << 6 | (self.group as u32) << 3 | self.other as u32
    }
}

/// One filesystem entry.
#[derive(Debug, Clone)]
pub struct Node {
    /// Enclosing directory; the root is its own parent.
    pub parent: NodeId,
    /// Absolute path, always with a leading '/'.
    pub full_path: String,
    /// Path component under the parent ("/" for the root).
    pub leaf_name: String,
    pub kind: NodeKind,
    /// Symlink target, present iff `kind == Symlink`.
    pub symlink_target: Option<String>,
    /// Virtual-content tag; 0 for normal entries. The tree only stores
    /// the tag, the adapter owns its meaning.
    pub special: u32,
    pub size: u64,
    pub mtime: u64,
    pub links: u32,
    pub inode: u64,
    pub mode: Mode,
    /// Child nodes (directories only).
    pub children: Vec<NodeId>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind != NodeKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == NodeKind::Symlink
    }
}

/// The tree index: node arena plus the optional path hash index and the
/// generation timestamp of the document it was built from.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    index: Option<PathIndex>,
    generation: u64,
}

impl Tree {
    pub const ROOT: NodeId = NodeId(0);

    /// A tree holding only the permanent root. Used as the pre-load
    /// placeholder; `generation` is 0 so any real document is newer.
    pub fn empty() -> Tree {
        Tree {
            nodes: vec![Node {
                parent: Self::ROOT,
                full_path: "/".to_string(),
                leaf_name: "/".to_string(),
                kind: NodeKind::Directory,
                symlink_target: None,
                special: 0,
                size: 0,
                mtime: 0,
                links: 2,
                inode: 1,
                mode: Mode {
                    owner: 7,
                    group: 5,
                    other: 5,
                },
                children: Vec::new(),
            }],
            index: None,
            generation: 0,
        }
    }

    /// Number of entries, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Generation timestamp of the source document.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    /// Resolve an absolute path to a node.
    ///
    /// "/" always resolves to the root without touching the index. With
    /// a hash index present this is an O(1) average probe; without one it
    /// falls back to component-wise descent. Both strategies agree on
    /// every input.
    pub fn resolve(&self, path: &str) -> Option<NodeId> {
        if path == "/" {
            return Some(Self::ROOT);
        }
        match &self.index {
            Some(index) => index.lookup(path, &self.nodes),
            None => self.resolve_linear(path),
        }
    }

    /// Component-wise descent, matching child names linearly at each
    /// level. Public so the two resolution strategies can be compared.
    pub fn resolve_linear(&self, path: &str) -> Option<NodeId> {
        if path == "/" {
            return Some(Self::ROOT);
        }
        let mut cur = Self::ROOT;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let node = self.node(cur);
            cur = *node
                .children
                .iter()
                .find(|&&c| self.node(c).leaf_name == component)?;
        }
        Some(cur)
    }

    /// Search the whole tree for an inode number. Linear cost; not for
    /// the request hot path.
    pub fn resolve_by_inode(&self, inode: u64) -> Option<NodeId> {
        self.inode_search(Self::ROOT, inode)
    }

    fn inode_search(&self, at: NodeId, inode: u64) -> Option<NodeId> {
        let node = self.node(at);
        if node.inode == inode {
            return Some(at);
        }
        node.children
            .iter()
            .find_map(|&child| self.inode_search(child, inode))
    }

    /// Iterate all nodes with their ids, root first.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    /// Recompute directory link counts bottom-up: every directory gets
    /// 2 + number of immediate subdirectories. Returns the number of
    /// corrected entries.
    pub(crate) fn recompute_links(&mut self) -> usize {
        self.recompute_links_at(Self::ROOT)
    }

    fn recompute_links_at(&mut self, at: NodeId) -> usize {
        let children = self.node(at).children.clone();
        let mut fixed = 0;
        let mut subdirs = 0u32;
        for child in children {
            if self.node(child).is_dir() {
                subdirs += 1;
                fixed += self.recompute_links_at(child);
            }
        }
        let node = &mut self.nodes[at.index()];
        if node.links != subdirs + 2 {
            node.links = subdirs + 2;
            fixed += 1;
        }
        fixed
    }
}

impl Default for Tree {
    fn default() -> Self {
        Tree::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tree_resolves_root() {
        let tree = Tree::empty();
        assert_eq!(tree.resolve("/"), Some(Tree::ROOT));
        assert_eq!(tree.len(), 1);
        assert!(tree.is_empty());
        assert_eq!(tree.generation(), 0);
    }

    #[test]
    fn test_mode_digits() {
        let mode = Mode::from_digits("755").unwrap();
        assert_eq!((mode.owner, mode.group, mode.other), (7, 5, 5));
        assert_eq!(mode.bits(), 0o755);

        // Longer fields keep the last three digits.
        let mode = Mode::from_digits("100644").unwrap();
        assert_eq!(mode.bits(), 0o644);

        assert!(Mode::from_digits("75").is_none());
        assert!(Mode::from_digits("758").is_none());
        assert!(Mode::from_digits("7a5").is_none());
    }

    #[test]
    fn test_root_is_own_parent() {
        let tree = Tree::empty();
        assert_eq!(tree.root().parent, Tree::ROOT);
    }
}
