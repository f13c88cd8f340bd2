//! Rebuilds the remote file hierarchy from put.io's flat, parent-linked listing.
//!
//! Pages arrive in arbitrary order, so a child may be seen before its parent.
//! Such records wait in an orphan buffer keyed by the missing parent id and are
//! attached as soon as that parent shows up. Whatever is still buffered after
//! the last page is reported and left out of the tree.

use std::collections::{BTreeMap, HashMap};

use putio_core::{FileRecord, ROOT_FOLDER_ID};
use thiserror::Error;

pub type FileId = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("no remote file at path: {0}")]
    PathNotFound(String),
    #[error("no remote file with id: {0}")]
    IdNotFound(FileId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub record: FileRecord,
    children: BTreeMap<String, FileId>,
}

impl FileNode {
    fn new(record: FileRecord) -> Self {
        Self {
            record,
            children: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> FileId {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn is_folder(&self) -> bool {
        self.record.is_folder()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

/// A leaf file together with its `/`-joined path from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafFile {
    pub path: String,
    pub file_id: FileId,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct FileTree {
    root: BTreeMap<String, FileId>,
    nodes: HashMap<FileId, FileNode>,
    orphaned: Vec<FileRecord>,
}

impl FileTree {
    pub fn from_pages<I>(pages: I) -> Self
    where
        I: IntoIterator<Item = Vec<FileRecord>>,
    {
        let mut builder = FileTreeBuilder::default();
        for page in pages {
            builder.ingest_page(page);
        }
        builder.finish()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records dropped because their parent never arrived.
    pub fn orphaned(&self) -> &[FileRecord] {
        &self.orphaned
    }

    pub fn root_names(&self) -> impl Iterator<Item = &str> {
        self.root.keys().map(String::as_str)
    }

    pub fn get(&self, id: FileId) -> Option<&FileNode> {
        self.nodes.get(&id)
    }

    pub fn child(&self, parent: Option<FileId>, name: &str) -> Option<&FileNode> {
        let id = match parent {
            None => self.root.get(name)?,
            Some(parent) => self.nodes.get(&parent)?.children.get(name)?,
        };
        self.nodes.get(id)
    }

    pub fn lookup_path(&self, path: &str) -> Result<&FileNode, TreeError> {
        let mut current: Option<&FileNode> = None;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let next = self.child(current.map(FileNode::id), segment);
            current = Some(next.ok_or_else(|| TreeError::PathNotFound(path.to_string()))?);
        }
        current.ok_or_else(|| TreeError::PathNotFound(path.to_string()))
    }

    /// Parent chain of `id`, starting with the node itself and ending at a top-level node.
    pub fn ancestry(&self, id: FileId) -> Result<Vec<&FileNode>, TreeError> {
        let mut chain = Vec::new();
        let mut next = Some(id);
        while let Some(id) = next {
            let node = self.nodes.get(&id).ok_or(TreeError::IdNotFound(id))?;
            chain.push(node);
            next = parent_of(&node.record);
            if chain.len() > self.nodes.len() {
                break;
            }
        }
        Ok(chain)
    }

    pub fn path_of(&self, id: FileId) -> Result<String, TreeError> {
        let chain = self.ancestry(id)?;
        Ok(chain
            .iter()
            .rev()
            .map(|node| node.name())
            .collect::<Vec<_>>()
            .join("/"))
    }

    /// Depth-first walk below `id` returning every non-folder node with its full path.
    /// A leaf passed directly is returned on its own.
    pub fn leaves_under(&self, id: FileId) -> Result<Vec<LeafFile>, TreeError> {
        let start = self.nodes.get(&id).ok_or(TreeError::IdNotFound(id))?;
        let base = self.path_of(id)?;
        let mut out = Vec::new();
        self.collect_leaves(start, base, &mut out);
        Ok(out)
    }

    /// Folder ids at and below `id`, children before their parent.
    pub fn folders_bottom_up(&self, id: FileId) -> Result<Vec<FileId>, TreeError> {
        let start = self.nodes.get(&id).ok_or(TreeError::IdNotFound(id))?;
        let mut out = Vec::new();
        self.collect_folders(start, &mut out);
        Ok(out)
    }

    fn collect_folders(&self, node: &FileNode, out: &mut Vec<FileId>) {
        if !node.is_folder() {
            return;
        }
        for child_id in node.children.values() {
            if let Some(child) = self.nodes.get(child_id) {
                self.collect_folders(child, out);
            }
        }
        out.push(node.id());
    }

    fn collect_leaves(&self, node: &FileNode, path: String, out: &mut Vec<LeafFile>) {
        if !node.is_folder() {
            out.push(LeafFile {
                path,
                file_id: node.id(),
                size: node.record.size,
            });
            return;
        }
        for (name, child_id) in &node.children {
            if let Some(child) = self.nodes.get(child_id) {
                self.collect_leaves(child, format!("{path}/{name}"), out);
            }
        }
    }
}

fn parent_of(record: &FileRecord) -> Option<FileId> {
    record.parent_id.filter(|id| *id != ROOT_FOLDER_ID)
}

#[derive(Debug, Default)]
pub struct FileTreeBuilder {
    root: BTreeMap<String, FileId>,
    nodes: HashMap<FileId, FileNode>,
    orphans: HashMap<FileId, Vec<FileId>>,
}

impl FileTreeBuilder {
    pub fn ingest_page(&mut self, records: Vec<FileRecord>) {
        for record in records {
            self.ingest(record);
        }
    }

    fn ingest(&mut self, record: FileRecord) {
        let id = record.id;
        let name = record.name.clone();
        let parent = parent_of(&record);
        let mut node = FileNode::new(record);

        if let Some(waiting) = self.orphans.remove(&id) {
            for child_id in waiting {
                if let Some(child) = self.nodes.get(&child_id) {
                    node.children.insert(child.record.name.clone(), child_id);
                }
            }
        }
        self.nodes.insert(id, node);

        match parent {
            None => {
                self.root.insert(name, id);
            }
            Some(parent_id) => match self.nodes.get_mut(&parent_id).filter(|_| parent_id != id) {
                Some(parent) => {
                    parent.children.insert(name, id);
                }
                None => self.orphans.entry(parent_id).or_default().push(id),
            },
        }
    }

    pub fn finish(mut self) -> FileTree {
        let mut orphaned = Vec::new();
        if !self.orphans.is_empty() {
            let mut stack: Vec<FileId> = self.orphans.drain().flat_map(|(_, ids)| ids).collect();
            while let Some(id) = stack.pop() {
                if let Some(node) = self.nodes.remove(&id) {
                    stack.extend(node.children.values().copied());
                    orphaned.push(node.record);
                }
            }
            orphaned.sort_by_key(|record| record.id);
            tracing::warn!(
                count = orphaned.len(),
                ids = ?orphaned.iter().map(|r| r.id).collect::<Vec<_>>(),
                "remote files without a reachable parent were left out of the tree"
            );
        }
        FileTree {
            root: self.root,
            nodes: self.nodes,
            orphaned,
        }
    }
}
