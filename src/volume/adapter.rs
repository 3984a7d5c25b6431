//! Re-exposes a volume with a different block size.

use crate::volume::{volume_memmove, volume_read, volume_write, volume_write_zeros};
use crate::volume::{Volume, VolumeRef};
use std::io;
use std::io::Error;

/// A volume of blocksize B on top of a volume of blocksize A, with an
/// optional reserved byte offset.
///
/// Block `i` of the adapter maps to the byte range starting at
/// `offset + i * B` on the wrapped volume.
pub struct BlocksizeAdapter {
    wrapped: VolumeRef,
    blocksize: u32,
    offset: u64,
}

impl BlocksizeAdapter {
    pub fn new(wrapped: VolumeRef, blocksize: u32, offset: u64) -> Self {
        Self {
            wrapped,
            blocksize,
            offset,
        }
    }

    fn conv_blk_count(&self, count: u64) -> u64 {
        let bytes = match count.checked_mul(self.wrapped.borrow().blocksize() as u64) {
            Some(bytes) => bytes,
            None => u64::MAX,
        };

        if bytes < self.offset {
            return 0;
        }

        (bytes - self.offset) / self.blocksize as u64
    }

    fn check_bounds(&self, index: u64, blk_offset: u32, size: u32) -> io::Result<()> {
        if index >= self.max_block_count()
            || blk_offset > self.blocksize
            || size > self.blocksize - blk_offset
        {
            return Err(Error::other(
                "out of bounds access on block size adapter",
            ));
        }
        Ok(())
    }
}

impl Volume for BlocksizeAdapter {
    fn blocksize(&self) -> u32 {
        self.blocksize
    }

    fn min_block_count(&self) -> u64 {
        let count = self.wrapped.borrow().min_block_count();
        self.conv_blk_count(count)
    }

    fn max_block_count(&self) -> u64 {
        let count = self.wrapped.borrow().max_block_count();
        self.conv_blk_count(count)
    }

    fn block_count(&self) -> u64 {
        let count = self.wrapped.borrow().block_count();
        self.conv_blk_count(count)
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

        let pos = self.offset + index * self.blocksize as u64 + offset as u64;
        volume_read(&mut *self.wrapped.borrow_mut(), pos, buffer)
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

        let pos = self.offset + index * self.blocksize as u64 + offset as u64;
        let wrapped = &mut *self.wrapped.borrow_mut();

        match data {
            Some(data) => volume_write(wrapped, pos, &data[..size as usize]),
            None => volume_write_zeros(wrapped, pos, size as u64),
        }
    }

    fn move_block(&mut self, src: u64, dst: u64) -> io::Result<()> {
        let blocksize = self.blocksize as u64;

        volume_memmove(
            &mut *self.wrapped.borrow_mut(),
            self.offset + dst * blocksize,
            self.offset + src * blocksize,
            blocksize,
        )
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

    fn discard_blocks(&mut self, index: u64, mut count: u64) -> io::Result<()> {
        let max = self.max_block_count();

        if index >= max {
            return Ok(());
        }

        if count > max - index {
            count = max - index;
        }

        let pos = self.offset + index * self.blocksize as u64;
        volume_write_zeros(
            &mut *self.wrapped.borrow_mut(),
            pos,
            count * self.blocksize as u64,
        )
    }

    fn commit(&mut self) -> io::Result<()> {
        self.wrapped.borrow_mut().commit()
    }

    fn truncate(&mut self, size: u64) -> io::Result<()> {
        let mut count = size / self.blocksize as u64;
        if size % self.blocksize as u64 != 0 {
            count += 1;
        }

        if count <= self.min_block_count() {
            return Ok(());
        }

        let bytes = count
            .saturating_mul(self.wrapped.borrow().blocksize() as u64)
            .saturating_add(self.offset);

        self.wrapped.borrow_mut().truncate(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::volume::test_volume::MemVolume;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn mapping_with_offset() {
        let wrapped = Rc::new(RefCell::new(MemVolume::new(8, 16)));
        let mut adapter = BlocksizeAdapter::new(wrapped.clone(), 3, 2);

        assert_eq!(adapter.max_block_count(), (16 * 8 - 2) / 3);

        adapter.write_block(0, Some(b"abc")).unwrap();
        adapter.write_block(2, Some(b"xyz")).unwrap();

        let mut buf = [0u8; 11];
        volume_read(&mut *wrapped.borrow_mut(), 0, &mut buf).unwrap();
        assert_eq!(&buf, b"\x00\x00abc\x00\x00\x00xyz");

        let mut buf = [0u8; 3];
        adapter.read_block(2, &mut buf).unwrap();
        assert_eq!(&buf, b"xyz");
    }

    #[test]
    fn same_bytes_as_wrapped() {
        let wrapped = Rc::new(RefCell::new(MemVolume::new(8, 16)));
        volume_write(&mut *wrapped.borrow_mut(), 0, b"ABCDEFGHIJKLMNOP").unwrap();

        let mut adapter = BlocksizeAdapter::new(wrapped.clone(), 5, 0);

        let mut via_adapter = [0u8; 13];
        volume_read(&mut adapter, 2, &mut via_adapter).unwrap();

        let mut direct = [0u8; 13];
        volume_read(&mut *wrapped.borrow_mut(), 2, &mut direct).unwrap();

        assert_eq!(via_adapter, direct);
    }

    #[test]
    fn out_of_bounds_rejected() {
        let wrapped = Rc::new(RefCell::new(MemVolume::new(8, 4)));
        let mut adapter = BlocksizeAdapter::new(wrapped, 8, 0);

        let mut buf = [0u8; 8];
        assert!(adapter.read_block(4, &mut buf).is_err());
        assert!(adapter.write_block(17, Some(&buf)).is_err());
    }
}
