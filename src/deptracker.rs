//! Tracks which volumes and filesystems are stacked on which, and commits
//! them leaf first.

use crate::fs::{Filesystem, FilesystemRef};
use crate::volume::{Volume, VolumeRef};
use std::io;
use std::io::Error;
use std::rc::Rc;

enum DepObject {
    Volume(VolumeRef),
    Filesystem(FilesystemRef),
}

impl DepObject {
    fn is_same(&self, other: &DepObject) -> bool {
        match (self, other) {
            (DepObject::Volume(a), DepObject::Volume(b)) => Rc::ptr_eq(a, b),
            (DepObject::Filesystem(a), DepObject::Filesystem(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

struct DepNode {
    object: DepObject,
    name: String,

    /// How many other nodes depend on this one.
    dep_count: usize,
}

/// The dependency graph over all live volumes and filesystems.
///
/// An edge records that one node depends on another; the dependent node is
/// committed first, so a filesystem is serialized before the volume it
/// writes to is flushed.
#[derive(Default)]
pub struct DepTracker {
    nodes: Vec<DepNode>,
    /// `(node, depends_on)` index pairs.
    edges: Vec<(usize, usize)>,
}

impl DepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_node(&mut self, object: DepObject, name: &str) -> usize {
        for (i, node) in self.nodes.iter().enumerate() {
            if node.object.is_same(&object) {
                return i;
            }
        }

        self.nodes.push(DepNode {
            object,
            name: name.to_owned(),
            dep_count: 0,
        });
        self.nodes.len() - 1
    }

    fn add_edge(&mut self, node: usize, depends_on: usize) {
        if !self.edges.contains(&(node, depends_on)) {
            self.edges.push((node, depends_on));
        }
    }

    /// Registers a volume and the volume it is derived from, if any.
    pub fn add_volume(&mut self, volume: &VolumeRef, parent: Option<&VolumeRef>) {
        let node = self.get_node(DepObject::Volume(volume.clone()), "");

        if let Some(parent) = parent {
            let parent = self.get_node(DepObject::Volume(parent.clone()), "");
            self.add_edge(node, parent);
        }
    }

    /// Registers a volume that is backed by a file inside a filesystem.
    pub fn add_volume_file(&mut self, volume: &VolumeRef, parent: &FilesystemRef) {
        let node = self.get_node(DepObject::Volume(volume.clone()), "");
        let parent = self.get_node(DepObject::Filesystem(parent.clone()), "");
        self.add_edge(node, parent);
    }

    /// Registers a named filesystem and the volume it writes to.
    pub fn add_fs(&mut self, fs: &FilesystemRef, parent: &VolumeRef, name: &str) {
        let node = self.get_node(DepObject::Filesystem(fs.clone()), name);
        let parent = self.get_node(DepObject::Volume(parent.clone()), "");
        self.add_edge(node, parent);
    }

    /// Looks up a filesystem by the name it was registered under.
    pub fn get_fs_by_name(&self, name: &str) -> Option<FilesystemRef> {
        for node in self.nodes.iter().rev() {
            if node.name == name {
                if let DepObject::Filesystem(fs) = &node.object {
                    return Some(fs.clone());
                }
            }
        }

        None
    }

    /// Commits every node exactly once, leaves first.
    ///
    /// Repeatedly picks a node nothing depends on (newest first), builds it
    /// if it is a filesystem and flushes the underlying volume, then drops
    /// its outgoing edges. A remaining node with dependents on every
    /// candidate means the graph has a cycle.
    pub fn commit(&mut self) -> io::Result<()> {
        for node in self.nodes.iter_mut() {
            node.dep_count = 0;
        }

        for (_, depends_on) in &self.edges {
            self.nodes[*depends_on].dep_count += 1;
        }

        let mut alive: Vec<usize> = (0..self.nodes.len()).collect();

        while !alive.is_empty() {
            let pos = alive
                .iter()
                .rposition(|i| self.nodes[*i].dep_count == 0)
                .ok_or_else(|| Error::other("dependency cycle detected"))?;
            let current = alive.remove(pos);

            match &self.nodes[current].object {
                DepObject::Volume(vol) => {
                    vol.borrow_mut().commit()?;
                }
                DepObject::Filesystem(fs) => {
                    fs.borrow_mut().build_format()?;

                    let volume = fs.borrow().fstree().borrow().volume.clone();
                    volume.borrow_mut().commit()?;
                }
            }

            let nodes = &mut self.nodes;
            self.edges.retain(|(node, depends_on)| {
                if *node == current {
                    nodes[*depends_on].dep_count -= 1;
                    false
                } else {
                    true
                }
            });
        }

        Ok(())
    }
}
