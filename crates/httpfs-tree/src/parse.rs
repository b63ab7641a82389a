//! Metadata document parsing.
//!
//! The document is line oriented: a generation timestamp, an entry-count
//! hint, then one record per entry. A record is six whitespace-separated
//! fields (`kind size inode mtime links mode`) followed by the full path
//! on the next line, and for symlinks one further line with the target.
//! Kind codes >= 100 denote special virtual files tagged `code - 100`.

use std::io::BufRead;

use tracing::{debug, warn};

use crate::hash::PathIndex;
use crate::{Mode, Node, NodeId, NodeKind, Result, Tree, TreeError};

/// Kind code for a directory record.
const KIND_DIR: u32 = 0;
/// Kind code for a symlink record (target line follows the path line).
const KIND_SYMLINK: u32 = 2;
/// Kind codes at or above this denote special virtual files.
const KIND_SPECIAL_BASE: u32 = 100;

/// Strip the last path component. Returns "/" when no separator is found
/// after the leading '/', and for inputs without one (nothing below the
/// root has a relative parent).
pub fn dirname(path: &str) -> &str {
    match path.strip_prefix('/') {
        Some(rest) => match rest.rfind('/') {
            Some(pos) => &path[..pos + 1],
            None => "/",
        },
        None => "/",
    }
}

struct Lines<R> {
    reader: R,
    line: usize,
}

impl<R: BufRead> Lines<R> {
    fn next(&mut self) -> Result<Option<String>> {
        let mut buf = String::new();
        self.line += 1;
        if self.reader.read_line(&mut buf)? == 0 {
            return Ok(None);
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    fn expect(&mut self, what: &str) -> Result<String> {
        self.next()?.ok_or(TreeError::Malformed {
            line: self.line,
            reason: format!("unexpected end of document, expected {what}"),
        })
    }

    fn malformed(&self, reason: impl Into<String>) -> TreeError {
        TreeError::Malformed {
            line: self.line,
            reason: reason.into(),
        }
    }
}

struct Record {
    kind: u32,
    size: u64,
    inode: u64,
    mtime: u64,
    links: u32,
    mode: Mode,
}

impl Record {
    fn parse<R: BufRead>(lines: &Lines<R>, text: &str) -> Result<Record> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(lines.malformed(format!(
                "expected 6 record fields, found {}",
                fields.len()
            )));
        }
        let parse_num = |field: &str, what: &str| {
            field
                .parse::<u64>()
                .map_err(|_| lines.malformed(format!("invalid {what} field '{field}'")))
        };
        Ok(Record {
            kind: parse_num(fields[0], "kind")? as u32,
            size: parse_num(fields[1], "size")?,
            inode: parse_num(fields[2], "inode")?,
            mtime: parse_num(fields[3], "mtime")?,
            links: parse_num(fields[4], "links")? as u32,
            mode: Mode::from_digits(fields[5])
                .ok_or_else(|| lines.malformed(format!("invalid mode field '{}'", fields[5])))?,
        })
    }

    /// Split the on-disk kind code into (kind, special tag).
    fn classify(&self) -> (NodeKind, u32) {
        if self.kind >= KIND_SPECIAL_BASE {
            (NodeKind::RegularFile, self.kind - KIND_SPECIAL_BASE)
        } else if self.kind == KIND_DIR {
            (NodeKind::Directory, 0)
        } else if self.kind == KIND_SYMLINK {
            (NodeKind::Symlink, 0)
        } else {
            (NodeKind::RegularFile, 0)
        }
    }
}

fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

impl Tree {
    /// Build a tree from a metadata document.
    ///
    /// Any malformed record, missing path line or missing symlink target
    /// aborts the build; the partially-built tree is discarded by
    /// construction since nothing is published until this returns.
    /// `len()` of the result is the created-entry count, root included.
    pub fn parse<R: BufRead>(reader: R) -> Result<Tree> {
        let mut lines = Lines { reader, line: 0 };

        let generation: u64 = {
            let text = lines.expect("generation timestamp")?;
            text.trim()
                .parse()
                .map_err(|_| lines.malformed(format!("invalid generation timestamp '{text}'")))?
        };
        let expected: usize = {
            let text = lines.expect("entry-count hint")?;
            text.trim()
                .parse()
                .map_err(|_| lines.malformed(format!("invalid entry-count hint '{text}'")))?
        };

        let mut tree = Tree::empty();
        tree.generation = generation;
        let mut index = PathIndex::with_expected(expected);

        // Root record: attributes apply to the permanent root, the mode
        // is ignored (the root stays 755).
        let text = lines.expect("root record")?;
        let record = Record::parse(&lines, &text)?;
        lines.expect("root path")?;
        {
            let root = &mut tree.nodes[0];
            root.size = record.size;
            root.inode = record.inode;
            root.mtime = record.mtime;
            root.links = record.links;
        }
        index.insert("/", Tree::ROOT)?;

        while let Some(text) = lines.next()? {
            if text.trim().is_empty() {
                continue;
            }
            let record = Record::parse(&lines, &text)?;
            let full_path = normalize(&lines.expect("entry path")?);
            let (kind, special) = record.classify();
            let target = if kind == NodeKind::Symlink {
                Some(lines.expect("symlink target")?)
            } else {
                None
            };

            let parent_path = dirname(&full_path);
            let parent = match tree
                .resolve_with(&index, parent_path)
                .filter(|&id| tree.node(id).is_dir())
            {
                Some(id) => id,
                None => {
                    // The original skips orphaned records rather than
                    // failing the whole document.
                    warn!(path = %full_path, parent = %parent_path, "skipping entry without parent directory");
                    continue;
                }
            };

            let leaf_name = full_path[parent_path.len()..]
                .trim_start_matches('/')
                .to_string();
            let id = NodeId(tree.nodes.len() as u32);
            tree.nodes.push(Node {
                parent,
                leaf_name,
                kind,
                special,
                // A symlink's size is its target length.
                size: match &target {
                    Some(t) => t.len() as u64,
                    None => record.size,
                },
                mtime: record.mtime,
                links: record.links,
                inode: record.inode,
                mode: record.mode,
                symlink_target: target,
                children: Vec::new(),
                full_path: full_path.clone(),
            });
            tree.nodes[parent.index()].children.push(id);
            index.insert(&full_path, id)?;
        }

        let fixed = tree.recompute_links();
        if fixed > 0 {
            debug!(fixed, "corrected directory link counts");
        }
        tree.index = Some(index);
        debug!(entries = tree.len(), generation, "tree built");
        Ok(tree)
    }

    /// Resolution against a not-yet-published index, used while the tree
    /// is still under construction.
    fn resolve_with(&self, index: &PathIndex, path: &str) -> Option<NodeId> {
        if path == "/" {
            return Some(Tree::ROOT);
        }
        index.lookup(path, &self.nodes)
    }

    /// Read only the leading generation timestamp of a document. Used to
    /// decide whether a full reload is warranted.
    pub fn peek_generation(document: &str) -> Result<u64> {
        let first = document.lines().next().unwrap_or("");
        first.trim().parse().map_err(|_| TreeError::Malformed {
            line: 1,
            reason: format!("invalid generation timestamp '{first}'"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
42
6
0 0 1 1000 2 755
/
0 0 2 1000 2 755
/docs
1 1200 3 1001 1 644
/docs/readme.txt
2 0 4 1002 1 777
/docs/latest
readme.txt
101 0 5 1003 1 444
/.status
1 64 6 1004 1 600
/notes.txt
";

    #[test]
    fn test_parse_counts_entries() {
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        assert_eq!(tree.len(), 6);
        assert_eq!(tree.generation(), 42);
    }

    #[test]
    fn test_resolve_returns_matching_full_path() {
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        for path in ["/docs", "/docs/readme.txt", "/docs/latest", "/notes.txt"] {
            let id = tree.resolve(path).unwrap();
            assert_eq!(tree.node(id).full_path, path);
        }
        assert!(tree.resolve("/missing").is_none());
        assert!(tree.resolve("/docs/missing").is_none());
    }

    #[test]
    fn test_hash_and_linear_resolution_agree() {
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        for path in [
            "/",
            "/docs",
            "/docs/readme.txt",
            "/docs/latest",
            "/.status",
            "/notes.txt",
            "/missing",
            "/docs/none",
            "/docs/readme.txt/deeper",
        ] {
            assert_eq!(tree.resolve(path), tree.resolve_linear(path), "{path}");
        }
    }

    #[test]
    fn test_symlink_target_and_size() {
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        let node = tree.node(tree.resolve("/docs/latest").unwrap());
        assert_eq!(node.kind, NodeKind::Symlink);
        assert_eq!(node.symlink_target.as_deref(), Some("readme.txt"));
        assert_eq!(node.size, "readme.txt".len() as u64);
    }

    #[test]
    fn test_special_tag() {
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        let node = tree.node(tree.resolve("/.status").unwrap());
        assert_eq!(node.kind, NodeKind::RegularFile);
        assert_eq!(node.special, 1);
        assert_eq!(tree.node(tree.resolve("/notes.txt").unwrap()).special, 0);
    }

    #[test]
    fn test_link_counts_recomputed() {
        // Declared link counts in DOC are wrong on purpose for /; after
        // the build every directory holds 2 + its subdirectory count.
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        assert_eq!(tree.root().links, 3); // one subdirectory
        let docs = tree.node(tree.resolve("/docs").unwrap());
        assert_eq!(docs.links, 2);
    }

    #[test]
    fn test_parent_and_leaf_names() {
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        let readme = tree.node(tree.resolve("/docs/readme.txt").unwrap());
        assert_eq!(readme.leaf_name, "readme.txt");
        assert_eq!(tree.node(readme.parent).full_path, "/docs");
        let notes = tree.node(tree.resolve("/notes.txt").unwrap());
        assert_eq!(notes.leaf_name, "notes.txt");
        assert_eq!(notes.parent, Tree::ROOT);
    }

    #[test]
    fn test_children_consistent_with_parent() {
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        for (id, node) in tree.iter() {
            for &child in &node.children {
                assert_eq!(tree.node(child).parent, id);
            }
            if id != Tree::ROOT {
                assert!(tree.node(node.parent).children.contains(&id));
            }
        }
    }

    #[test]
    fn test_resolve_by_inode() {
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        let id = tree.resolve_by_inode(3).unwrap();
        assert_eq!(tree.node(id).full_path, "/docs/readme.txt");
        assert!(tree.resolve_by_inode(999).is_none());
    }

    #[test]
    fn test_malformed_record_line() {
        let doc = "42\n2\n0 0 1 1000 2 755\n/\n1 1200 3\n/short.txt\n";
        let err = Tree::parse(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, TreeError::Malformed { .. }));
    }

    #[test]
    fn test_missing_path_line() {
        let doc = "42\n2\n0 0 1 1000 2 755\n/\n1 1200 3 1001 1 644\n";
        let err = Tree::parse(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, TreeError::Malformed { .. }));
    }

    #[test]
    fn test_missing_symlink_target() {
        let doc = "42\n2\n0 0 1 1000 2 755\n/\n2 0 3 1001 1 777\n/link\n";
        let err = Tree::parse(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, TreeError::Malformed { .. }));
    }

    #[test]
    fn test_bad_mode_digits() {
        let doc = "42\n2\n0 0 1 1000 2 755\n/\n1 10 3 1001 1 999\n/f\n";
        assert!(Tree::parse(doc.as_bytes()).is_err());
    }

    #[test]
    fn test_orphan_record_is_skipped() {
        let doc = "42\n2\n0 0 1 1000 2 755\n/\n1 10 3 1001 1 644\n/no/such/dir/f\n";
        let tree = Tree::parse(doc.as_bytes()).unwrap();
        assert_eq!(tree.len(), 1); // root only
        assert!(tree.resolve("/no/such/dir/f").is_none());
    }

    #[test]
    fn test_dirname() {
        assert_eq!(dirname("/a.txt"), "/");
        assert_eq!(dirname("/a/b.txt"), "/a");
        assert_eq!(dirname("/a/b/c"), "/a/b");
        assert_eq!(dirname("/x"), "/");
        // Rootless and empty inputs fold to the root, whatever their
        // first character's width.
        assert_eq!(dirname(""), "/");
        assert_eq!(dirname("a/b"), "/");
        assert_eq!(dirname("é/x"), "/");
    }

    #[test]
    fn test_peek_generation() {
        assert_eq!(Tree::peek_generation(DOC).unwrap(), 42);
        assert!(Tree::peek_generation("not a number\n").is_err());
        assert!(Tree::peek_generation("").is_err());
    }
}
