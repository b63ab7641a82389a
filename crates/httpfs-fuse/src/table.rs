//! Kernel-facing inode table.
//!
//! The tree index identifies entries by path; the kernel speaks inodes.
//! This table assigns each tree node the stable inode `arena index + 1`
//! (so the root is always inode 1) and snapshots the fields every
//! filesystem operation needs. It is rebuilt whenever the store swaps in
//! a newer tree generation.

use std::collections::HashMap;

use tracing::debug;

use httpfs_runtime::Store;
use httpfs_tree::NodeKind;

/// Advertised size of virtual files. Their content is generated at read
/// time, so the metadata size (usually 0) would make the kernel clamp
/// every read to nothing.
pub const SPECIAL_SIZE: u64 = 4096;

pub const ROOT_INO: u64 = 1;

#[derive(Debug, Clone)]
pub struct Entry {
    pub ino: u64,
    pub parent: u64,
    pub path: String,
    pub kind: NodeKind,
    pub size: u64,
    pub mtime: u64,
    pub perm: u16,
    pub nlink: u32,
    pub special: u32,
    pub target: Option<String>,
    /// Leaf name -> child inode, in tree order.
    pub children: Vec<(String, u64)>,
}

#[derive(Debug)]
pub struct InodeTable {
    generation: u64,
    entries: HashMap<u64, Entry>,
}

impl InodeTable {
    pub fn build(store: &Store, exec_files: bool) -> InodeTable {
        store.with_tree(|tree| {
            let mut entries = HashMap::with_capacity(tree.len());
            for (id, node) in tree.iter() {
                let ino = id.index() as u64 + 1;
                let mut perm = node.mode.bits() as u16;
                if exec_files && node.kind == NodeKind::RegularFile {
                    perm |= 0o111;
                }
                let size = if node.special != 0 {
                    SPECIAL_SIZE
                } else {
                    node.size
                };
                entries.insert(
                    ino,
                    Entry {
                        ino,
                        parent: node.parent.index() as u64 + 1,
                        path: node.full_path.clone(),
                        kind: node.kind,
                        size,
                        mtime: node.mtime,
                        perm,
                        nlink: node.links,
                        special: node.special,
                        target: node.symlink_target.clone(),
                        children: node
                            .children
                            .iter()
                            .map(|&child| {
                                (tree.node(child).leaf_name.clone(), child.index() as u64 + 1)
                            })
                            .collect(),
                    },
                );
            }
            debug!(
                entries = entries.len(),
                generation = tree.generation(),
                "inode table built"
            );
            InodeTable {
                generation: tree.generation(),
                entries,
            }
        })
    }

    /// Rebuild when the store has swapped in a newer tree. Returns
    /// whether a rebuild happened.
    pub fn refresh(&mut self, store: &Store, exec_files: bool) -> bool {
        if store.generation() == self.generation {
            return false;
        }
        *self = InodeTable::build(store, exec_files);
        true
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, ino: u64) -> Option<&Entry> {
        self.entries.get(&ino)
    }

    pub fn child(&self, parent: u64, name: &str) -> Option<&Entry> {
        let parent = self.entries.get(&parent)?;
        let (_, ino) = parent.children.iter().find(|(child, _)| child == name)?;
        self.entries.get(ino)
    }

    /// Directory rows strictly after `offset`, resumable mid-stream when
    /// the kernel buffer fills. "." sits at offset 1, ".." at offset 2,
    /// children start at 3.
    pub fn listing(&self, ino: u64, offset: i64) -> Option<Vec<DirRow>> {
        let entry = self.entries.get(&ino)?;
        let mut rows = Vec::new();
        if offset < 1 {
            rows.push(DirRow {
                ino,
                offset: 1,
                kind: NodeKind::Directory,
                name: ".".to_string(),
            });
        }
        if offset < 2 {
            rows.push(DirRow {
                ino: entry.parent,
                offset: 2,
                kind: NodeKind::Directory,
                name: "..".to_string(),
            });
        }
        let skip = (offset - 2).max(0) as usize;
        for (i, (name, child_ino)) in entry.children.iter().enumerate().skip(skip) {
            let kind = self
                .entries
                .get(child_ino)
                .map(|child| child.kind)
                .unwrap_or(NodeKind::RegularFile);
            rows.push(DirRow {
                ino: *child_ino,
                offset: (i + 3) as i64,
                kind,
                name: name.clone(),
            });
        }
        Some(rows)
    }
}

/// One row of a directory stream: the offset is what a resumed listing
/// passes back to continue after this row.
#[derive(Debug, Clone)]
pub struct DirRow {
    pub ino: u64,
    pub offset: i64,
    pub kind: NodeKind,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpfs_runtime::{MetadataSource, StoreOptions};

    struct FixedDoc(String);

    impl MetadataSource for FixedDoc {
        fn fetch(&self) -> httpfs_fetch::Result<String> {
            Ok(self.0.clone())
        }
    }

    const DOC: &str = "\
7
8
0 0 1 1000 2 755
/
0 0 2 1000 2 755
/docs
1 1200 3 1001 1 644
/docs/readme.txt
2 0 4 1002 1 777
/docs/latest
readme.txt
103 0 5 1003 1 444
/.mount
";

    fn store() -> Store {
        let tree = httpfs_tree::Tree::parse(DOC.as_bytes()).unwrap();
        Store::new(
            tree,
            Box::new(FixedDoc(DOC.to_string())),
            Box::new(httpfs_fetch::memory::MemorySource::new()),
            StoreOptions::default(),
        )
    }

    #[test]
    fn test_root_is_inode_one() {
        let table = InodeTable::build(&store(), false);
        let root = table.get(ROOT_INO).unwrap();
        assert_eq!(root.path, "/");
        assert_eq!(root.parent, ROOT_INO);
        assert_eq!(root.kind, NodeKind::Directory);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_child_lookup_by_name() {
        let table = InodeTable::build(&store(), false);
        let docs = table.child(ROOT_INO, "docs").unwrap();
        assert_eq!(docs.path, "/docs");
        let readme = table.child(docs.ino, "readme.txt").unwrap();
        assert_eq!(readme.size, 1200);
        assert_eq!(readme.perm, 0o644);
        assert!(table.child(ROOT_INO, "missing").is_none());
    }

    #[test]
    fn test_symlink_carries_target() {
        let table = InodeTable::build(&store(), false);
        let link = table.child(table.child(ROOT_INO, "docs").unwrap().ino, "latest");
        assert_eq!(link.unwrap().target.as_deref(), Some("readme.txt"));
    }

    #[test]
    fn test_special_file_advertises_page_size() {
        let table = InodeTable::build(&store(), false);
        let mount = table.child(ROOT_INO, ".mount").unwrap();
        assert_eq!(mount.special, 3);
        assert_eq!(mount.size, SPECIAL_SIZE);
    }

    #[test]
    fn test_exec_files_adds_execute_bits() {
        let table = InodeTable::build(&store(), true);
        let readme = table.child(table.child(ROOT_INO, "docs").unwrap().ino, "readme.txt");
        assert_eq!(readme.unwrap().perm, 0o755);
        // Directories keep their declared mode.
        assert_eq!(table.child(ROOT_INO, "docs").unwrap().perm, 0o755);
    }

    #[test]
    fn test_listing_starts_with_dot_entries() {
        let table = InodeTable::build(&store(), false);
        let rows = table.listing(ROOT_INO, 0).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, [".", "..", "docs", ".mount"]);
        assert_eq!(rows[0].ino, ROOT_INO);
        assert_eq!(rows[1].ino, ROOT_INO); // the root is its own parent
        assert!(table.listing(99, 0).is_none());
    }

    #[test]
    fn test_listing_resumed_after_dot_still_emits_dot_dot() {
        // A buffer that filled after "." resumes at offset 1; ".." must
        // not be dropped from the stream.
        let table = InodeTable::build(&store(), false);
        let rows = table.listing(ROOT_INO, 1).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["..", "docs", ".mount"]);
    }

    #[test]
    fn test_listing_resumes_at_any_row() {
        // Resuming at each row's offset yields exactly the rows after
        // it, so a stream chopped anywhere reassembles without gaps.
        let table = InodeTable::build(&store(), false);
        let full = table.listing(ROOT_INO, 0).unwrap();
        for (i, row) in full.iter().enumerate() {
            let rest = table.listing(ROOT_INO, row.offset).unwrap();
            let names: Vec<&str> = rest.iter().map(|r| r.name.as_str()).collect();
            let expected: Vec<&str> = full[i + 1..].iter().map(|r| r.name.as_str()).collect();
            assert_eq!(names, expected, "resume at offset {}", row.offset);
        }
        assert!(table
            .listing(ROOT_INO, full.last().unwrap().offset)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_refresh_only_on_generation_change() {
        let store = store();
        let mut table = InodeTable::build(&store, false);
        assert_eq!(table.generation(), 7);
        assert!(!table.refresh(&store, false));
    }
}
