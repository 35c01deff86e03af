//! File tree presentation
//!
//! Turns a flat file listing plus a status result into the nested tree the UI
//! renders. This derivation is what the repo cache saves callers from redoing.

use crate::git::{ChangeType, RepoStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn file(path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        Self { name, path: path.to_string(), is_dir: false, change: None, children: Vec::new() }
    }

    fn dir(name: &str, path: String, children: Vec<TreeNode>) -> Self {
        Self { name: name.to_string(), path, is_dir: true, change: None, children }
    }
}

#[derive(Default)]
struct DirBuilder {
    dirs: BTreeMap<String, DirBuilder>,
    files: BTreeMap<String, String>,
}

impl DirBuilder {
    fn insert(&mut self, path: &str) {
        let mut node = self;
        let mut parts = path.split('/').filter(|p| !p.is_empty()).peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                node.files.insert(part.to_string(), path.to_string());
            } else {
                node = node.dirs.entry(part.to_string()).or_default();
            }
        }
    }

    fn build(self, prefix: &str, changes: &HashMap<&str, ChangeType>) -> Vec<TreeNode> {
        let mut out = Vec::with_capacity(self.dirs.len() + self.files.len());
        for (name, sub) in self.dirs {
            let path = if prefix.is_empty() { name.clone() } else { format!("{}/{}", prefix, name) };
            let children = sub.build(&path, changes);
            out.push(TreeNode::dir(&name, path, children));
        }
        for (_, path) in self.files {
            let mut node = TreeNode::file(&path);
            node.change = changes.get(path.as_str()).copied();
            out.push(node);
        }
        out
    }
}

/// Nested tree of `files` annotated with changes from `status`.
///
/// Paths only present in `status` (deleted files, untracked files missing
/// from the listing) are added.
pub fn build_tree(files: &[String], status: &RepoStatus) -> Vec<TreeNode> {
    let mut changes: HashMap<&str, ChangeType> = HashMap::new();
    // Unstaged wins over staged for a path changed on both sides
    for entry in status.untracked.iter().chain(&status.staged).chain(&status.unstaged) {
        changes.insert(entry.path.as_str(), entry.change);
    }

    let mut root = DirBuilder::default();
    for file in files {
        root.insert(file);
    }
    for path in changes.keys() {
        root.insert(path);
    }

    root.build("", &changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::StatusEntry;

    fn entry(path: &str, change: ChangeType) -> StatusEntry {
        StatusEntry { path: path.to_string(), change, orig_path: None }
    }

    fn files(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_nested_tree_dirs_first() {
        let tree = build_tree(&files(&["README.md", "src/lib.rs", "src/db/mod.rs"]), &RepoStatus::default());

        assert_eq!(tree.len(), 2);
        assert!(tree[0].is_dir);
        assert_eq!(tree[0].path, "src");
        assert_eq!(tree[0].children[0].path, "src/db");
        assert_eq!(tree[0].children[0].children[0].path, "src/db/mod.rs");
        assert_eq!(tree[0].children[1].name, "lib.rs");
        assert_eq!(tree[1].name, "README.md");
    }

    #[test]
    fn test_changes_annotated_and_deleted_paths_added() {
        let status = RepoStatus {
            staged: vec![entry("src/lib.rs", ChangeType::Modified)],
            unstaged: vec![entry("gone.rs", ChangeType::Deleted)],
            untracked: vec![],
        };
        let tree = build_tree(&files(&["src/lib.rs"]), &status);

        let gone = tree.iter().find(|n| n.path == "gone.rs").unwrap();
        assert_eq!(gone.change, Some(ChangeType::Deleted));
        assert_eq!(tree[0].children[0].change, Some(ChangeType::Modified));
    }

    #[test]
    fn test_listed_and_status_paths_merge() {
        let status = RepoStatus {
            untracked: vec![entry("docs/new.md", ChangeType::Untracked)],
            ..Default::default()
        };
        // Untracked path both listed and in status appears once
        let tree = build_tree(&files(&["README.md", "docs/new.md"]), &status);

        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].path, "docs");
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].change, Some(ChangeType::Untracked));
        assert_eq!(tree[1].change, None);
    }
}
