//! Routes file records from a source into bound filesystem trees.

use crate::fs::{Filesystem, FilesystemRef};
use crate::fstree::{canonicalize_path, FsTree, NodeId};
use crate::source::{FileSource, FileSourceRecord, RecordStream, RecordType};
use std::io;
use std::io::Error;
use std::io::Read;

struct Bind {
    prefix: String,
    target: FilesystemRef,
}

/// A set of `(path prefix, filesystem)` bindings.
///
/// Records are dispatched to the longest matching prefix, with the prefix
/// stripped off; records matching no binding are silently dropped.
#[derive(Default)]
pub struct FileSink {
    binds: Vec<Bind>,
}

/// Records appended to a file are drained from the source stream in chunks
/// of this size.
const COPY_CHUNK: usize = 256;

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }

    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn strip_prefix<'a>(prefix: &str, path: &'a str) -> &'a str {
    if prefix.is_empty() {
        return path;
    }

    match path.strip_prefix(prefix) {
        Some(rest) => rest.strip_prefix('/').unwrap_or(rest),
        None => path,
    }
}

impl FileSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a path prefix to a filesystem. Rebinding an existing prefix
    /// replaces its target.
    pub fn bind(&mut self, prefix: &str, target: FilesystemRef) {
        let prefix = canonicalize_path(prefix);

        for bind in self.binds.iter_mut() {
            if bind.prefix == prefix {
                bind.target = target;
                return;
            }
        }

        self.binds.push(Bind { prefix, target });
    }

    fn bind_for_path(&self, path: &str) -> Option<&Bind> {
        self.binds
            .iter()
            .filter(|b| prefix_matches(&b.prefix, path))
            .max_by_key(|b| b.prefix.len())
    }

    fn create_node(
        fs: &mut FsTree,
        record: &FileSourceRecord,
        name: &str,
        target: Option<&str>,
    ) -> io::Result<NodeId> {
        let require_target = || {
            target
                .filter(|t| !t.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| {
                    Error::other(format!("{}: missing link target", record.full_path))
                })
        };

        let id = match record.record_type {
            RecordType::Dir => fs.add_directory(name),
            RecordType::File => fs.add_file(name),
            RecordType::Fifo => fs.add_fifo(name),
            RecordType::Socket => fs.add_socket(name),
            RecordType::CharDev => fs.add_character_device(name, record.devno),
            RecordType::BlockDev => fs.add_block_device(name, record.devno),
            RecordType::Symlink => {
                let target = require_target()?;
                fs.add_symlink(name, &target)
            }
            RecordType::HardLink => {
                let target = require_target()?;
                fs.add_hard_link(name, &target)
            }
        };

        let id = id.map_err(|err| {
            Error::new(err.kind(), format!("adding {}: {}", record.full_path, err))
        })?;

        let node = fs.node_mut(id);
        node.uid = record.uid;
        node.gid = record.gid;
        node.ctime = record.ctime;
        node.mtime = record.mtime;

        node.permissions = match record.record_type {
            RecordType::Symlink | RecordType::HardLink => 0o777,
            _ => record.permissions,
        };

        Ok(id)
    }

    fn append_file_data(
        fs: &mut FsTree,
        node: NodeId,
        stream: &mut RecordStream,
    ) -> io::Result<()> {
        let mut buffer = [0u8; COPY_CHUNK];

        loop {
            let ret = stream.read(&mut buffer)?;
            if ret == 0 {
                return Ok(());
            }

            fs.file_append(node, Some(&buffer[..ret]), ret)?;
        }
    }

    /// Drains `source`, dispatching every record to the filesystem bound
    /// for it.
    pub fn add_data(&mut self, source: &mut dyn FileSource) -> io::Result<()> {
        while let Some((record, stream)) = source.next_record()? {
            let Some(bind) = self.bind_for_path(&record.full_path) else {
                continue;
            };

            let name = strip_prefix(&bind.prefix, &record.full_path);
            if name.is_empty() {
                continue;
            }

            // hard link targets live in the same filesystem and are
            // retargeted the same way
            let target = record.link_target.as_deref().map(|t| {
                if record.record_type == RecordType::HardLink {
                    strip_prefix(&bind.prefix, t)
                } else {
                    t
                }
            });

            let fstree = bind.target.borrow().fstree();
            let mut fs = fstree.borrow_mut();

            let node = Self::create_node(&mut fs, &record, name, target)?;

            if record.record_type == RecordType::File {
                if let Some(mut stream) = stream {
                    Self::append_file_data(&mut fs, node, &mut stream)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::CpioFilesystem;
    use crate::source::ListingSource;
    use crate::volume::test_volume::MemVolume;
    use crate::volume::VolumeRef;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn cpio_fs() -> FilesystemRef {
        let vol = Rc::new(RefCell::new(MemVolume::new(512, 64)));
        Rc::new(RefCell::new(CpioFilesystem::new(vol as VolumeRef)))
    }

    fn names_of(fs: &FilesystemRef) -> Vec<String> {
        let fstree = fs.borrow().fstree();
        let fstree = fstree.borrow();
        let mut out = Vec::new();
        collect_paths(&fstree, fstree.root(), &mut out);
        out
    }

    fn collect_paths(fs: &crate::fstree::FsTree, id: crate::fstree::NodeId, out: &mut Vec<String>) {
        for child in fs.node(id).children() {
            out.push(fs.get_path(*child));
            collect_paths(fs, *child, out);
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let usr = cpio_fs();
        let root = cpio_fs();

        let mut sink = FileSink::new();
        sink.bind("/", root.clone());
        sink.bind("/usr", usr.clone());

        let mut listing = ListingSource::new("/nonexistent");
        listing.add_line("dir /usr/bin 0755 0 0", "t").unwrap();
        listing.add_line("dir /var/log 0755 0 0", "t").unwrap();
        listing.add_line("slink /usr/lib64 0777 0 0 lib", "t").unwrap();

        sink.add_data(&mut listing).unwrap();

        let usr_paths = names_of(&usr);
        assert!(usr_paths.contains(&"/bin".to_owned()));
        assert!(usr_paths.contains(&"/lib64".to_owned()));

        let root_paths = names_of(&root);
        assert!(root_paths.contains(&"/var/log".to_owned()));
        assert!(!root_paths.contains(&"/usr/bin".to_owned()));
    }

    #[test]
    fn unbound_records_are_dropped() {
        let usr = cpio_fs();

        let mut sink = FileSink::new();
        sink.bind("/usr", usr.clone());

        let mut listing = ListingSource::new("/nonexistent");
        listing.add_line("dir /etc 0755 0 0", "t").unwrap();
        // the bare bind point itself strips to nothing and is dropped too
        listing.add_line("dir /usr 0755 0 0", "t").unwrap();
        listing.add_line("dir /usrlocal 0755 0 0", "t").unwrap();
        listing.add_line("dir /usr/share 0755 0 0", "t").unwrap();

        sink.add_data(&mut listing).unwrap();

        assert_eq!(names_of(&usr), ["/share"]);
    }

    #[test]
    fn hard_link_targets_are_retargeted() {
        let usr = cpio_fs();

        let mut sink = FileSink::new();
        sink.bind("/usr", usr.clone());

        let mut listing = ListingSource::new("/nonexistent");
        listing.add_line("dir /usr/bin 0755 0 0", "t").unwrap();
        listing
            .add_line("link /usr/bin/vi 0777 0 0 /usr/bin/vim", "t")
            .unwrap();

        sink.add_data(&mut listing).unwrap();

        let fstree = usr.borrow().fstree();
        let mut fstree = fstree.borrow_mut();
        let link = fstree.node_from_path("bin/vi", false).unwrap();
        match &fstree.node(link).data {
            crate::fstree::NodeData::HardLink { target, .. } => {
                assert_eq!(target, "bin/vim");
            }
            _ => panic!(),
        }
    }

    #[test]
    fn record_attributes_are_applied() {
        let root = cpio_fs();

        let mut sink = FileSink::new();
        sink.bind("", root.clone());

        let mut listing = ListingSource::new("/nonexistent");
        listing
            .add_line("nod /dev/console 0600 6 7 c 13 37", "t")
            .unwrap();

        sink.add_data(&mut listing).unwrap();

        let fstree = root.borrow().fstree();
        let mut fstree = fstree.borrow_mut();
        let node = fstree.node_from_path("dev/console", false).unwrap();
        let node = fstree.node(node);
        assert_eq!(node.uid, 6);
        assert_eq!(node.gid, 7);
        assert_eq!(node.permissions, 0o600);
    }
}
