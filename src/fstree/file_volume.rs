//! Exposes a regular file inside a tree as a block volume, so filesystems
//! can nest inside filesystems.

use crate::fstree::{FsTree, NodeId};
use crate::util::ceil_division;
use crate::volume::Volume;
use std::cell::RefCell;
use std::io;
use std::io::Error;
use std::rc::Rc;

/// A volume view onto a file node of an [`FsTree`].
///
/// The adapter borrows the tree per operation; it never keeps the tree
/// borrowed across calls, so the owning filesystem can keep using it.
pub struct FstreeFileVolume {
    fstree: Rc<RefCell<FsTree>>,
    node: NodeId,

    blocksize: u32,
    min_block_count: u64,
    max_block_count: u64,
}

impl FstreeFileVolume {
    /// Creates a volume of `blocksize` blocks over the given file node.
    ///
    /// If the file is shorter than `min_size` bytes it is grown right away.
    pub fn new(
        fstree: Rc<RefCell<FsTree>>,
        node: NodeId,
        blocksize: u32,
        min_size: u64,
        max_size: u64,
    ) -> io::Result<Self> {
        let min_block_count = ceil_division(min_size, blocksize as u64);
        let max_block_count = max_size / blocksize as u64;

        let blk_used = {
            let fs = fstree.borrow();
            ceil_division(fs.node(node).file_size(), blocksize as u64)
        };

        if min_block_count > 0 && blk_used < min_block_count {
            fstree
                .borrow_mut()
                .file_truncate(node, min_block_count * blocksize as u64)?;
        }

        Ok(Self {
            fstree,
            node,
            blocksize,
            min_block_count,
            max_block_count,
        })
    }

    fn check_bounds(&self, index: u64, offset: u32, size: u32) -> io::Result<()> {
        if index >= self.max_block_count
            || offset > self.blocksize
            || size > self.blocksize - offset
        {
            let path = self.fstree.borrow().get_path(self.node);
            return Err(Error::other(format!(
                "{}: out-of-bounds access on file based volume",
                path
            )));
        }
        Ok(())
    }
}

impl Volume for FstreeFileVolume {
    fn blocksize(&self) -> u32 {
        self.blocksize
    }

    fn min_block_count(&self) -> u64 {
        self.min_block_count
    }

    fn max_block_count(&self) -> u64 {
        self.max_block_count
    }

    fn block_count(&self) -> u64 {
        let fs = self.fstree.borrow();
        ceil_division(fs.node(self.node).file_size(), self.blocksize as u64)
    }

    fn read_block(&mut self, index: u64, buffer: &mut [u8]) -> io::Result<()> {
        self.read_partial_block(index, buffer, 0)
    }

    fn read_partial_block(
        &mut self,
        index: u64,
        buffer: &mut [u8],
        offset: u32,
    ) -> io::Result<()> {
        self.check_bounds(index, offset, buffer.len() as u32)?;

        self.fstree.borrow_mut().file_read(
            self.node,
            index * self.blocksize as u64 + offset as u64,
            buffer,
        )
    }

    fn write_block(&mut self, index: u64, data: Option<&[u8]>) -> io::Result<()> {
        self.write_partial_block(index, data, 0, self.blocksize)
    }

    fn write_partial_block(
        &mut self,
        index: u64,
        data: Option<&[u8]>,
        offset: u32,
        size: u32,
    ) -> io::Result<()> {
        self.check_bounds(index, offset, size)?;

        self.fstree.borrow_mut().file_write(
            self.node,
            index * self.blocksize as u64 + offset as u64,
            data,
            size as usize,
        )
    }

    fn move_block(&mut self, src: u64, dst: u64) -> io::Result<()> {
        let mut scratch = vec![0u8; self.blocksize as usize];

        self.read_block(src, &mut scratch)?;
        self.write_block(dst, Some(&scratch))
    }

    fn move_block_partial(
        &mut self,
        src: u64,
        dst: u64,
        src_offset: u32,
        dst_offset: u32,
        size: u32,
    ) -> io::Result<()> {
        let mut scratch = vec![0u8; size as usize];

        self.read_partial_block(src, &mut scratch, src_offset)?;
        self.write_partial_block(dst, Some(&scratch), dst_offset, size)
    }

    fn discard_blocks(&mut self, index: u64, count: u64) -> io::Result<()> {
        let blocksize = self.blocksize as u64;
        let blk_count = self.block_count();

        if index >= blk_count {
            return Ok(());
        }

        if count < blk_count - index {
            return self.fstree.borrow_mut().file_write(
                self.node,
                index * blocksize,
                None,
                (count * blocksize) as usize,
            );
        }

        self.fstree
            .borrow_mut()
            .file_truncate(self.node, index * blocksize)?;

        if index < self.min_block_count {
            self.fstree
                .borrow_mut()
                .file_truncate(self.node, self.min_block_count * blocksize)?;
        }

        Ok(())
    }

    fn commit(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.fstree.borrow_mut().file_truncate(self.node, size)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::volume::test_volume::MemVolume;
    use crate::volume::{volume_read, volume_write, VolumeRef};

    fn nested_setup() -> (Rc<RefCell<FsTree>>, NodeId) {
        let vol: VolumeRef = Rc::new(RefCell::new(MemVolume::new(4, 1024)));
        let fs = Rc::new(RefCell::new(FsTree::new(vol, 0)));
        let node = fs.borrow_mut().add_file("nested.img").unwrap();
        (fs, node)
    }

    #[test]
    fn grows_to_min_size() {
        let (fs, node) = nested_setup();
        let vol = FstreeFileVolume::new(fs.clone(), node, 8, 30, 4096).unwrap();

        assert_eq!(vol.block_count(), 4);
        assert_eq!(fs.borrow().node(node).file_size(), 32);
    }

    #[test]
    fn io_lands_in_file() {
        let (fs, node) = nested_setup();
        let mut vol = FstreeFileVolume::new(fs.clone(), node, 8, 0, 4096).unwrap();

        volume_write(&mut vol, 5, b"payload").unwrap();

        let mut buf = [0u8; 7];
        fs.borrow_mut().file_read(node, 5, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");

        let mut buf = [0u8; 7];
        volume_read(&mut vol, 5, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn discard_tail_truncates_file() {
        let (fs, node) = nested_setup();
        let mut vol = FstreeFileVolume::new(fs.clone(), node, 8, 0, 4096).unwrap();

        volume_write(&mut vol, 0, &[1u8; 32]).unwrap();
        vol.discard_blocks(2, 2).unwrap();

        assert_eq!(fs.borrow().node(node).file_size(), 16);
    }

    #[test]
    fn bounds_checked() {
        let (fs, node) = nested_setup();
        let mut vol = FstreeFileVolume::new(fs, node, 8, 0, 64).unwrap();

        let mut buf = [0u8; 8];
        assert!(vol.read_block(8, &mut buf).is_err());
        assert!(vol.write_block(8, Some(&buf)).is_err());
    }
}
