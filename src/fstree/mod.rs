//! The in-memory directory tree that filesystems are built from.

use crate::volume::VolumeRef;
use std::io;
use std::io::Error;
use std::io::ErrorKind;

mod file;
mod file_volume;

pub use file_volume::FstreeFileVolume;

/// Index of a node within its tree.
pub type NodeId = usize;

/// Number of distinct node types.
pub const NODE_TYPE_COUNT: usize = 8;

/// The type tag of a tree node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeType {
    Dir = 0,
    File,
    Fifo,
    Socket,
    CharDev,
    BlockDev,
    Symlink,
    HardLink,
}

/// A run of logical file blocks that is not stored on the volume and reads
/// back as zeros.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SparseRegion {
    /// First logical block of the hole.
    pub start: u64,
    /// Number of blocks in the hole.
    pub count: u64,
}

/// Type-specific payload of a tree node.
#[derive(Debug)]
pub enum NodeData {
    Dir {
        children: Vec<NodeId>,
        /// Set when the directory was auto-created during path resolution,
        /// cleared when the same path is later created explicitly.
        created_implicitly: bool,
        /// Byte offset of the serialized directory (used by FAT).
        start: u64,
        /// Serialized size in bytes (used by FAT).
        size: u64,
    },
    File {
        /// Logical size in bytes.
        size: u64,
        /// First payload block on the volume.
        start_index: u64,
        /// Sorted, merged list of holes.
        sparse: Vec<SparseRegion>,
    },
    Fifo,
    Socket,
    CharDev {
        devno: u32,
    },
    BlockDev {
        devno: u32,
    },
    Symlink {
        target: String,
    },
    HardLink {
        target: String,
        resolved: Option<NodeId>,
    },
}

impl NodeData {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeData::Dir { .. } => NodeType::Dir,
            NodeData::File { .. } => NodeType::File,
            NodeData::Fifo => NodeType::Fifo,
            NodeData::Socket => NodeType::Socket,
            NodeData::CharDev { .. } => NodeType::CharDev,
            NodeData::BlockDev { .. } => NodeType::BlockDev,
            NodeData::Symlink { .. } => NodeType::Symlink,
            NodeData::HardLink { .. } => NodeType::HardLink,
        }
    }
}

/// A single entry of the tree.
#[derive(Debug)]
pub struct TreeNode {
    pub name: String,

    pub ctime: u64,
    pub mtime: u64,
    pub uid: u32,
    pub gid: u32,
    pub permissions: u16,

    pub inode_num: u32,
    pub link_count: u32,

    pub parent: Option<NodeId>,
    pub data: NodeData,
}

impl TreeNode {
    pub fn node_type(&self) -> NodeType {
        self.data.node_type()
    }

    /// Child list of a directory node.
    pub fn children(&self) -> &[NodeId] {
        match &self.data {
            NodeData::Dir { children, .. } => children,
            _ => &[],
        }
    }

    /// Logical size of a file node.
    pub fn file_size(&self) -> u64 {
        match &self.data {
            NodeData::File { size, .. } => *size,
            _ => 0,
        }
    }

    /// First payload block of a file node.
    pub fn file_start_index(&self) -> u64 {
        match &self.data {
            NodeData::File { start_index, .. } => *start_index,
            _ => 0,
        }
    }
}

/// Default attributes given to implicitly created directories.
pub struct NodeDefaults {
    pub ctime: u64,
    pub mtime: u64,
    pub uid: u32,
    pub gid: u32,
    pub permissions: u16,
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self {
            ctime: 0,
            mtime: 0,
            uid: 0,
            gid: 0,
            permissions: 0o755,
        }
    }
}

/// An in-memory filesystem tree backed by a block volume.
///
/// File payloads are stored contiguously on the volume below `data_offset`;
/// everything above it is free. The format serializers later punch metadata
/// gaps into that region and shift the payloads around.
pub struct FsTree {
    nodes: Vec<TreeNode>,
    nodes_by_type: [Vec<NodeId>; NODE_TYPE_COUNT],

    pub volume: VolumeRef,

    /// High-water mark of used payload blocks.
    pub data_offset: u64,
    /// Reserved block region at the start that payloads never occupy.
    pub data_lead_in: u64,

    /// Set by formats that cannot represent holes. Appending zeros then
    /// materializes real blocks instead of sparse regions.
    pub no_sparse: bool,

    pub defaults: NodeDefaults,

    pub inode_table: Vec<NodeId>,
}

impl FsTree {
    /// Creates a tree holding only the root directory.
    pub fn new(volume: VolumeRef, data_lead_in: u64) -> Self {
        let root = TreeNode {
            name: String::new(),
            ctime: 0,
            mtime: 0,
            uid: 0,
            gid: 0,
            permissions: 0o755,
            inode_num: 0,
            link_count: 0,
            parent: None,
            data: NodeData::Dir {
                children: Vec::new(),
                created_implicitly: true,
                start: 0,
                size: 0,
            },
        };

        let mut nodes_by_type: [Vec<NodeId>; NODE_TYPE_COUNT] = Default::default();
        nodes_by_type[NodeType::Dir as usize].push(0);

        Self {
            nodes: vec![root],
            nodes_by_type,
            volume,
            data_offset: data_lead_in,
            data_lead_in,
            no_sparse: false,
            defaults: NodeDefaults::default(),
            inode_table: Vec::new(),
        }
    }

    /// The root directory.
    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id]
    }

    /// All nodes of the given type, in creation order (possibly re-sorted
    /// via `sort_type_list`).
    pub fn by_type(&self, ntype: NodeType) -> &[NodeId] {
        &self.nodes_by_type[ntype as usize]
    }

    /// Sorts the by-type list of `ntype` with the given comparison.
    pub fn sort_type_list<F>(&mut self, ntype: NodeType, mut cmp: F)
    where
        F: FnMut(&TreeNode, &TreeNode) -> std::cmp::Ordering,
    {
        let mut list = std::mem::take(&mut self.nodes_by_type[ntype as usize]);
        list.sort_by(|a, b| cmp(&self.nodes[*a], &self.nodes[*b]));
        self.nodes_by_type[ntype as usize] = list;
    }

    /// Rebuilds the full path of a node, starting with a `/`.
    pub fn get_path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut it = Some(id);

        while let Some(cur) = it {
            if self.nodes[cur].parent.is_none() {
                break;
            }
            parts.push(self.nodes[cur].name.as_str());
            it = self.nodes[cur].parent;
        }

        if parts.is_empty() {
            return "/".to_owned();
        }

        let mut path = String::new();
        for part in parts.iter().rev() {
            path.push('/');
            path.push_str(part);
        }
        path
    }

    /// Resolves a path to a node, walking from the root.
    ///
    /// `.` and `..` components are resolved in place. Missing components are
    /// either reported as not-found or created as implicit directories
    /// carrying the tree defaults.
    pub fn node_from_path(&mut self, path: &str, create_implicit: bool) -> io::Result<NodeId> {
        let mut cur = self.root();

        for comp in path.split(['/', '\\']) {
            if comp.is_empty() || comp == "." {
                continue;
            }

            if comp == ".." {
                if let Some(parent) = self.nodes[cur].parent {
                    cur = parent;
                }
                continue;
            }

            let children = match &self.nodes[cur].data {
                NodeData::Dir { children, .. } => children,
                _ => return Err(Error::new(ErrorKind::NotADirectory, path.to_owned())),
            };

            let found = children
                .iter()
                .copied()
                .find(|c| self.nodes[*c].name == comp);

            match found {
                Some(child) => cur = child,
                None => {
                    if !create_implicit {
                        return Err(Error::new(ErrorKind::NotFound, path.to_owned()));
                    }

                    cur = self.attach_node(
                        cur,
                        comp,
                        NodeData::Dir {
                            children: Vec::new(),
                            created_implicitly: true,
                            start: 0,
                            size: 0,
                        },
                    );
                }
            }
        }

        Ok(cur)
    }

    fn attach_node(&mut self, parent: NodeId, name: &str, data: NodeData) -> NodeId {
        let id = self.nodes.len();
        let ntype = data.node_type();

        self.nodes.push(TreeNode {
            name: name.to_owned(),
            ctime: self.defaults.ctime,
            mtime: self.defaults.mtime,
            uid: self.defaults.uid,
            gid: self.defaults.gid,
            permissions: self.defaults.permissions,
            inode_num: 0,
            link_count: 0,
            parent: Some(parent),
            data,
        });

        match &mut self.nodes[parent].data {
            NodeData::Dir { children, .. } => children.push(id),
            _ => unreachable!(),
        }

        self.nodes_by_type[ntype as usize].push(id);
        id
    }

    fn mknode_at(&mut self, path: &str, data: NodeData) -> io::Result<NodeId> {
        let path = canonicalize_path(path);

        let (prefix, name) = match path.rfind('/') {
            Some(pos) => (&path[..pos], &path[pos + 1..]),
            None => ("", path.as_str()),
        };

        if name.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "empty file name"));
        }

        let parent = self.node_from_path(prefix, true)?;

        if !matches!(self.nodes[parent].data, NodeData::Dir { .. }) {
            return Err(Error::new(ErrorKind::NotADirectory, path.clone()));
        }

        let existing = self.nodes[parent]
            .children()
            .iter()
            .copied()
            .find(|c| self.nodes[*c].name == name);

        if let Some(id) = existing {
            // only an explicit mkdir on a previously implicit directory is
            // allowed to collide
            if let (
                NodeData::Dir { .. },
                NodeData::Dir {
                    created_implicitly, ..
                },
            ) = (&data, &mut self.nodes[id].data)
            {
                if *created_implicitly {
                    *created_implicitly = false;
                    return Ok(id);
                }
            }

            return Err(Error::new(ErrorKind::AlreadyExists, path.clone()));
        }

        Ok(self.attach_node(parent, name, data))
    }

    /// Creates a directory, or makes a previously implicit one explicit.
    pub fn add_directory(&mut self, path: &str) -> io::Result<NodeId> {
        self.mknode_at(
            path,
            NodeData::Dir {
                children: Vec::new(),
                created_implicitly: false,
                start: 0,
                size: 0,
            },
        )
    }

    pub fn add_file(&mut self, path: &str) -> io::Result<NodeId> {
        let id = self.mknode_at(
            path,
            NodeData::File {
                size: 0,
                start_index: 0,
                sparse: Vec::new(),
            },
        )?;
        self.nodes[id].permissions &= 0o666;
        Ok(id)
    }

    pub fn add_fifo(&mut self, path: &str) -> io::Result<NodeId> {
        let id = self.mknode_at(path, NodeData::Fifo)?;
        self.nodes[id].permissions &= 0o666;
        Ok(id)
    }

    pub fn add_socket(&mut self, path: &str) -> io::Result<NodeId> {
        let id = self.mknode_at(path, NodeData::Socket)?;
        self.nodes[id].permissions &= 0o666;
        Ok(id)
    }

    pub fn add_character_device(&mut self, path: &str, devno: u32) -> io::Result<NodeId> {
        let id = self.mknode_at(path, NodeData::CharDev { devno })?;
        self.nodes[id].permissions &= 0o666;
        Ok(id)
    }

    pub fn add_block_device(&mut self, path: &str, devno: u32) -> io::Result<NodeId> {
        let id = self.mknode_at(path, NodeData::BlockDev { devno })?;
        self.nodes[id].permissions &= 0o666;
        Ok(id)
    }

    /// Creates a symlink. The target is stored verbatim.
    pub fn add_symlink(&mut self, path: &str, target: &str) -> io::Result<NodeId> {
        let id = self.mknode_at(
            path,
            NodeData::Symlink {
                target: target.to_owned(),
            },
        )?;
        self.nodes[id].permissions = 0o777;
        Ok(id)
    }

    /// Creates a hard link. The target path is canonicalized.
    pub fn add_hard_link(&mut self, path: &str, target: &str) -> io::Result<NodeId> {
        let id = self.mknode_at(
            path,
            NodeData::HardLink {
                target: canonicalize_path(target),
                resolved: None,
            },
        )?;
        self.nodes[id].permissions = 0o777;
        Ok(id)
    }

    /// Recursively sorts every child list by name.
    pub fn sort(&mut self) {
        let mut stack = vec![self.root()];

        while let Some(id) = stack.pop() {
            let mut children = match &mut self.nodes[id].data {
                NodeData::Dir { children, .. } => std::mem::take(children),
                _ => continue,
            };

            children.sort_by(|a, b| self.nodes[*a].name.cmp(&self.nodes[*b].name));
            stack.extend(children.iter().copied());

            match &mut self.nodes[id].data {
                NodeData::Dir { children: c, .. } => *c = children,
                _ => unreachable!(),
            }
        }
    }

    /// Binds every hard-link node to its target and bumps the target's link
    /// count. Dangling targets are an error.
    pub fn resolve_hard_links(&mut self) -> io::Result<()> {
        for id in 0..self.nodes.len() {
            let target = match &self.nodes[id].data {
                NodeData::HardLink { target, .. } => target.clone(),
                _ => continue,
            };

            let tgt = self.node_from_path(&target, false).map_err(|err| {
                Error::new(
                    err.kind(),
                    format!(
                        "resolving hardlink {} -> {}: {}",
                        self.nodes[id].name, target, err
                    ),
                )
            })?;

            self.nodes[tgt].link_count += 1;

            match &mut self.nodes[id].data {
                NodeData::HardLink { resolved, .. } => *resolved = Some(tgt),
                _ => unreachable!(),
            }
        }

        Ok(())
    }

    /// Numbers all inodes and builds the inode lookup table.
    ///
    /// The root gets inode 0; within each directory all direct children are
    /// numbered before any grandchild, so parents always carry a smaller
    /// number than their children and siblings are contiguous. Hard-link
    /// nodes share their target's number and get none of their own.
    pub fn create_inode_table(&mut self) {
        self.inode_table.clear();

        self.nodes[0].inode_num = 0;
        self.inode_table.push(0);

        self.map_inodes(self.root());
    }

    fn map_inodes(&mut self, dir: NodeId) {
        let children: Vec<NodeId> = self.nodes[dir].children().to_vec();

        for child in &children {
            if self.nodes[*child].node_type() != NodeType::HardLink {
                self.nodes[*child].inode_num = self.inode_table.len() as u32;
                self.inode_table.push(*child);
            }
        }

        for child in children {
            if matches!(self.nodes[child].data, NodeData::Dir { .. }) {
                self.map_inodes(child);
            }
        }
    }

    /// Number of inodes after `create_inode_table`.
    pub fn num_inodes(&self) -> usize {
        self.inode_table.len()
    }
}

/// Normalizes a path: both separators become `/`, duplicate and leading
/// separators are dropped, `.` components are removed and `..` is kept.
pub fn canonicalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());

    for comp in path.split(['/', '\\']) {
        if comp.is_empty() || comp == "." {
            continue;
        }

        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(comp);
    }

    out
}
