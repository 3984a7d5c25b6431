//! Serializes a tree into a CPIO archive in the `newc` format.

use crate::fstree::{FsTree, NodeData, NodeId, NodeType};
use crate::fs::Filesystem;
use crate::stream::{NullOstream, OStream, VolumeOstream};
use crate::util::{major, minor};
use crate::volume::{BlocksizeAdapter, Volume, VolumeRef};
use std::cell::RefCell;
use std::io;
use std::io::Error;
use std::rc::Rc;

const CPIO_MAGIC: &str = "070701";
const CPIO_TRAILER: &str = "TRAILER!!!";

/// Header and payload are aligned to this many bytes.
const CPIO_ALIGN: u32 = 4;

/// A cpio archive being built on a volume.
pub struct CpioFilesystem {
    fstree: Rc<RefCell<FsTree>>,
}

impl CpioFilesystem {
    /// Creates a cpio filesystem on top of `volume`, wrapped to the 4-byte
    /// alignment granularity of the format.
    pub fn new(volume: VolumeRef) -> Self {
        let volume = Rc::new(RefCell::new(BlocksizeAdapter::new(volume, CPIO_ALIGN, 0)))
            as VolumeRef;

        let mut fstree = FsTree::new(volume, 0);
        fstree.no_sparse = true;

        Self {
            fstree: Rc::new(RefCell::new(fstree)),
        }
    }
}

struct HeaderSpec<'a> {
    path: &'a str,
    inode: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    mtime: u64,
    size: u64,
    rdev_major: u32,
    rdev_minor: u32,
    symlink_target: Option<&'a str>,
}

fn write_padding(out: &mut dyn OStream, written: u32) -> io::Result<()> {
    if written % CPIO_ALIGN != 0 {
        out.append_sparse((CPIO_ALIGN - written % CPIO_ALIGN) as u64)?;
    }
    Ok(())
}

fn write_header(out: &mut dyn OStream, spec: &HeaderSpec) -> io::Result<()> {
    let text = format!(
        "{}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
        CPIO_MAGIC,
        spec.inode,
        spec.mode,
        spec.uid,
        spec.gid,
        spec.nlink,
        spec.mtime as u32,
        spec.size as u32,
        3u32,
        1u32,
        spec.rdev_major,
        spec.rdev_minor,
        spec.path.len() as u32 + 1,
        0u32,
    );

    out.append(text.as_bytes())?;
    out.append(spec.path.as_bytes())?;
    out.append(&[0])?;

    write_padding(out, text.len() as u32 + spec.path.len() as u32 + 1)?;

    if let Some(target) = spec.symlink_target {
        out.append(target.as_bytes())?;
        out.append(&[0])?;
        write_padding(out, target.len() as u32 + 1)?;
    }

    Ok(())
}

/// File mode bits for one node, combining the type and the permissions.
fn node_mode(node_data: &NodeData, permissions: u16) -> u32 {
    let type_bits = match node_data {
        NodeData::Dir { .. } => libc::S_IFDIR,
        NodeData::File { .. } => libc::S_IFREG,
        NodeData::Fifo => libc::S_IFIFO,
        NodeData::Socket => libc::S_IFSOCK,
        NodeData::CharDev { .. } => libc::S_IFCHR,
        NodeData::BlockDev { .. } => libc::S_IFBLK,
        NodeData::Symlink { .. } => libc::S_IFLNK,
        NodeData::HardLink { .. } => 0,
    };

    type_bits | permissions as u32
}

/// Writes the header of a single node. For `hardlink_to`, the target's
/// metadata is emitted under the link's path with a zero payload size.
fn write_node_header(
    out: &mut dyn OStream,
    fs: &FsTree,
    id: NodeId,
    hardlink_to: Option<NodeId>,
) -> io::Result<()> {
    let meta = hardlink_to.unwrap_or(id);
    let node = fs.node(meta);

    let mut path = fs.get_path(id);
    if path.starts_with('/') {
        path.remove(0);
    }

    let mut size = 0;
    let mut rdev_major = 0;
    let mut rdev_minor = 0;
    let mut symlink_target = None;

    match &node.data {
        NodeData::File { size: fsize, .. } => {
            if hardlink_to.is_none() {
                size = *fsize;
            }
        }
        NodeData::CharDev { devno } | NodeData::BlockDev { devno } => {
            rdev_major = major(*devno);
            rdev_minor = minor(*devno);
        }
        NodeData::Symlink { target } => {
            size = target.len() as u64 + 1;
            symlink_target = Some(target.as_str());
        }
        _ => {}
    }

    write_header(
        out,
        &HeaderSpec {
            path: &path,
            inode: node.inode_num,
            mode: node_mode(&node.data, node.permissions),
            uid: node.uid,
            gid: node.gid,
            nlink: node.link_count,
            mtime: node.mtime,
            size,
            rdev_major,
            rdev_minor,
            symlink_target,
        },
    )
}

/// Writes every non-file inode in inode order, then one record per hard
/// link. Hard links to anything but a regular file cannot be stored.
fn write_tree(out: &mut dyn OStream, fs: &FsTree) -> io::Result<()> {
    for i in 0..fs.num_inodes() {
        let id = fs.inode_table[i];

        if fs.node(id).node_type() != NodeType::File {
            write_node_header(out, fs, id, None)?;
        }
    }

    for id in fs.by_type(NodeType::HardLink) {
        let target = match &fs.node(*id).data {
            NodeData::HardLink { resolved, .. } => resolved.expect("hard links resolved"),
            _ => unreachable!(),
        };

        if fs.node(target).node_type() != NodeType::File {
            return Err(Error::other(format!(
                "{}: cpio cannot store hardlinks to something not a file",
                fs.get_path(*id)
            )));
        }

        write_node_header(out, fs, *id, Some(target))?;
    }

    Ok(())
}

/// Appends the terminating record and pads the archive to a 512 byte
/// boundary relative to the start of the trailer region.
fn write_trailer(out: &mut dyn OStream, offset: u64) -> io::Result<()> {
    let text = format!(
        "{}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
        CPIO_MAGIC,
        0u32,
        0u32,
        0u32,
        0u32,
        1u32,
        0u32,
        0u32,
        0u32,
        0u32,
        0u32,
        0u32,
        CPIO_TRAILER.len() as u32 + 1,
        0u32,
    );

    out.append(text.as_bytes())?;
    out.append(CPIO_TRAILER.as_bytes())?;
    out.append(&[0])?;

    let end = offset + text.len() as u64 + CPIO_TRAILER.len() as u64 + 1;
    if end % 512 != 0 {
        out.append_sparse(512 - end % 512)?;
    }

    Ok(())
}

impl Filesystem for CpioFilesystem {
    fn fstree(&self) -> Rc<RefCell<FsTree>> {
        self.fstree.clone()
    }

    fn build_format(&mut self) -> io::Result<()> {
        let fstree = self.fstree.clone();

        fstree.borrow_mut().sort();
        fstree.borrow_mut().resolve_hard_links().map_err(|err| {
            Error::new(
                err.kind(),
                format!("error resolving hard links for cpio filesystem: {}", err),
            )
        })?;
        fstree.borrow_mut().create_inode_table();

        let volume = fstree.borrow().volume.clone();
        let blocksize = fstree.borrow().volume.borrow().blocksize() as u64;

        // serialize everything except the files, reserving room up front
        let tree_size = {
            let fs = fstree.borrow();
            let mut null = NullOstream::default();
            write_tree(&mut null, &fs)?;
            null.bytes_written
        };

        fstree.borrow_mut().add_gap(0, tree_size)?;

        {
            let fs = fstree.borrow();
            let mut vstrm = VolumeOstream::new(volume.clone(), "cpio filesystem", 0, tree_size);
            write_tree(&mut vstrm, &fs)?;
        }

        // add headers in front of the file payloads
        let files: Vec<NodeId> = fstree.borrow().by_type(NodeType::File).to_vec();

        for id in files.iter().copied() {
            if fstree.borrow().file_physical_size(id) == 0 {
                continue;
            }

            let hdr_size = {
                let fs = fstree.borrow();
                let mut null = NullOstream::default();
                write_node_header(&mut null, &fs, id, None)?;
                null.bytes_written
            };

            let start_blk = fstree.borrow().node(id).file_start_index();
            fstree.borrow_mut().add_gap(start_blk, hdr_size)?;

            let mut vstrm = VolumeOstream::new(
                volume.clone(),
                "cpio filesystem",
                start_blk * blocksize,
                hdr_size,
            );
            let fs = fstree.borrow();
            write_node_header(&mut vstrm, &fs, id, None)?;
        }

        // zero size files and the trailer follow the data region
        let start = fstree.borrow().data_offset * blocksize;
        let mut vstrm = VolumeOstream::new(volume.clone(), "cpio filesystem", start, u64::MAX);

        for id in files {
            if fstree.borrow().file_physical_size(id) != 0 {
                continue;
            }

            let fs = fstree.borrow();
            write_node_header(&mut vstrm, &fs, id, None)?;
        }

        write_trailer(&mut vstrm, start)
    }
}
