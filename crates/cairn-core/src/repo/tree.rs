use serde::{Deserialize, Serialize};

use crate::blob::BlobType;
use crate::crypto::id::Id;
use crate::error::{CairnError, Result};

use super::{BlobLoader, BlobSaver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
}

/// A single named entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub mode: u32,
    /// Modification time in nanoseconds since Unix epoch.
    pub mtime: i64,
    pub size: u64,
    /// For regular files: the data blobs making up the content.
    pub content: Vec<Id>,
    /// For directories: the tree blob of the subdirectory.
    pub subtree: Option<Id>,
    /// For symlinks: the link target.
    pub link_target: Option<String>,
}

impl Node {
    pub fn file(name: impl Into<String>, mode: u32, mtime: i64, size: u64, content: Vec<Id>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::File,
            mode,
            mtime,
            size,
            content,
            subtree: None,
            link_target: None,
        }
    }

    pub fn dir(name: impl Into<String>, mode: u32, mtime: i64, subtree: Id) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Dir,
            mode,
            mtime,
            size: 0,
            content: Vec::new(),
            subtree: Some(subtree),
            link_target: None,
        }
    }

    pub fn symlink(name: impl Into<String>, mode: u32, mtime: i64, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Symlink,
            mode,
            mtime,
            size: 0,
            content: Vec::new(),
            subtree: None,
            link_target: Some(target.into()),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.name.is_empty() || self.name == "." || self.name == ".." {
            return Err(format!("invalid entry name '{}'", self.name));
        }
        if self.name.contains('/') || self.name.contains('\0') {
            return Err(format!("entry name '{}' contains a separator", self.name));
        }
        let consistent = match self.kind {
            NodeKind::File => self.subtree.is_none() && self.link_target.is_none(),
            NodeKind::Dir => {
                self.subtree.is_some() && self.content.is_empty() && self.link_target.is_none()
            }
            NodeKind::Symlink => {
                self.link_target.is_some() && self.content.is_empty() && self.subtree.is_none()
            }
        };
        if !consistent {
            return Err(format!(
                "entry '{}' has fields inconsistent with kind {:?}",
                self.name, self.kind
            ));
        }
        Ok(())
    }
}

/// A directory listing. Nodes are kept sorted by name with no duplicates,
/// so equal trees always encode to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from unordered nodes. Fails on a duplicate or invalid name.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Result<Self> {
        let mut tree = Self::new();
        for node in nodes {
            tree.insert(node)?;
        }
        Ok(tree)
    }

    /// Insert `node` at its sorted position.
    pub fn insert(&mut self, node: Node) -> Result<()> {
        node.validate().map_err(CairnError::InvalidFormat)?;
        match self
            .nodes
            .binary_search_by(|n| n.name.as_str().cmp(node.name.as_str()))
        {
            Ok(_) => Err(CairnError::InvalidFormat(format!(
                "duplicate tree entry '{}'",
                node.name
            ))),
            Err(pos) => {
                self.nodes.insert(pos, node);
                Ok(())
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes
            .binary_search_by(|n| n.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tree blob ids of all subdirectories, in name order.
    pub fn subtrees(&self) -> impl Iterator<Item = Id> + '_ {
        self.nodes.iter().filter_map(|n| n.subtree)
    }

    /// Canonical msgpack encoding (positional fields, sorted nodes).
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Decode and validate a tree loaded under `id`.
    pub fn decode(id: Id, bytes: &[u8]) -> Result<Self> {
        let tree: Tree = rmp_serde::from_slice(bytes)
            .map_err(|e| CairnError::InvalidTree(id, format!("decode: {e}")))?;
        for node in &tree.nodes {
            node.validate().map_err(|e| CairnError::InvalidTree(id, e))?;
        }
        if tree.nodes.windows(2).any(|w| w[0].name >= w[1].name) {
            return Err(CairnError::InvalidTree(
                id,
                "entries are not sorted by unique name".into(),
            ));
        }
        Ok(tree)
    }
}

/// Encode `tree` and store it as a tree blob.
pub fn save_tree<S: BlobSaver + ?Sized>(saver: &S, tree: &Tree) -> Result<Id> {
    let bytes = tree.encode()?;
    saver.save_blob(BlobType::Tree, &bytes, None)
}

/// Load and decode the tree blob `id`.
pub fn load_tree<L: BlobLoader + ?Sized>(loader: &L, id: Id) -> Result<Tree> {
    let mut buf = Vec::new();
    loader.load_blob(BlobType::Tree, id, &mut buf)?;
    Tree::decode(id, &buf)
}
