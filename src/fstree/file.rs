//! Byte-level file I/O against the tree's backing volume.
//!
//! Files occupy contiguous block runs below `data_offset`. Sparse regions
//! are accounted per file and take up no blocks; writing into one first
//! makes the file contiguous at the end of the data region, then opens a
//! real block in place.

use crate::fstree::{FsTree, NodeData, NodeId, NodeType, SparseRegion};
use crate::util::{ceil_division, is_memory_zero};
use crate::volume::{volume_memmove, Volume};
use std::io;

impl FsTree {
    fn file_fields(&self, id: NodeId) -> (u64, u64, &Vec<SparseRegion>) {
        match &self.nodes[id].data {
            NodeData::File {
                size,
                start_index,
                sparse,
            } => (*size, *start_index, sparse),
            _ => panic!("node is not a file"),
        }
    }

    fn file_sparse_mut(&mut self, id: NodeId) -> &mut Vec<SparseRegion> {
        match &mut self.nodes[id].data {
            NodeData::File { sparse, .. } => sparse,
            _ => panic!("node is not a file"),
        }
    }

    fn set_file_size(&mut self, id: NodeId, new: u64) {
        match &mut self.nodes[id].data {
            NodeData::File { size, .. } => *size = new,
            _ => panic!("node is not a file"),
        }
    }

    fn set_file_start(&mut self, id: NodeId, new: u64) {
        match &mut self.nodes[id].data {
            NodeData::File { start_index, .. } => *start_index = new,
            _ => panic!("node is not a file"),
        }
    }

    /// Number of bytes of the file covered by sparse regions, clipped to the
    /// file size.
    pub fn file_sparse_bytes(&self, id: NodeId) -> u64 {
        let blocksize = self.volume.borrow().blocksize() as u64;
        let (size, _, sparse) = self.file_fields(id);
        let mut count = 0;

        for region in sparse {
            let start = region.start * blocksize;
            if start >= size {
                continue;
            }

            count += (region.count * blocksize).min(size - start);
        }

        count
    }

    /// Number of bytes of the file actually stored on the volume.
    pub fn file_physical_size(&self, id: NodeId) -> u64 {
        let (size, _, _) = self.file_fields(id);
        let sparse = self.file_sparse_bytes(id);

        if sparse >= size {
            0
        } else {
            size - sparse
        }
    }

    fn file_physical_blocks(&self, id: NodeId) -> u64 {
        let blocksize = self.volume.borrow().blocksize() as u64;
        ceil_division(self.file_physical_size(id), blocksize)
    }

    /// Records block `index` of the file as a hole, merging with adjacent
    /// regions where possible.
    pub fn file_mark_sparse(&mut self, id: NodeId, index: u64) {
        let sparse = self.file_sparse_mut(id);

        for i in 0..sparse.len() {
            if index >= sparse[i].start {
                if sparse[i].count > index - sparse[i].start {
                    return;
                }

                if sparse[i].count == index - sparse[i].start {
                    sparse[i].count += 1;

                    if i + 1 < sparse.len()
                        && sparse[i + 1].start == sparse[i].start + sparse[i].count
                    {
                        sparse[i].count += sparse[i + 1].count;
                        sparse.remove(i + 1);
                    }
                    return;
                }
            } else if index + 1 == sparse[i].start {
                sparse[i].start -= 1;
                sparse[i].count += 1;

                if i > 0 && sparse[i].start == sparse[i - 1].start + sparse[i - 1].count {
                    sparse[i - 1].count += sparse[i].count;
                    sparse.remove(i);
                }
                return;
            }
        }

        let pos = sparse
            .iter()
            .position(|r| r.start > index)
            .unwrap_or(sparse.len());
        sparse.insert(pos, SparseRegion { start: index, count: 1 });
    }

    /// Removes block `index` from the hole list, splitting its region if it
    /// sits in the middle.
    pub fn file_mark_not_sparse(&mut self, id: NodeId, index: u64) {
        let sparse = self.file_sparse_mut(id);

        for i in 0..sparse.len() {
            if index < sparse[i].start {
                continue;
            }

            let rel = index - sparse[i].start;
            if rel >= sparse[i].count {
                continue;
            }

            if rel == 0 {
                sparse[i].start += 1;
                sparse[i].count -= 1;
                if sparse[i].count == 0 {
                    sparse.remove(i);
                }
                return;
            }

            if rel == sparse[i].count - 1 {
                sparse[i].count -= 1;
                return;
            }

            let split = SparseRegion {
                start: sparse[i].start + rel + 1,
                count: sparse[i].count - rel - 1,
            };
            sparse[i].count = rel;
            sparse.insert(i + 1, split);
            return;
        }
    }

    /// Reads a byte range of the file. Bytes past the end read as zeros.
    pub fn file_read(&mut self, id: NodeId, offset: u64, data: &mut [u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let blocksize = self.volume.borrow().blocksize() as u64;
        let (size, _, _) = self.file_fields(id);

        if offset >= size {
            data.fill(0);
            return Ok(());
        }

        let available = size - offset;
        let data = if (data.len() as u64) > available {
            let (head, tail) = data.split_at_mut(available as usize);
            tail.fill(0);
            head
        } else {
            data
        };

        let mut blk_index = offset / blocksize;
        let mut blk_offset = (offset % blocksize) as u32;
        let mut data = data;

        while !data.is_empty() {
            let diff = ((blocksize as u32 - blk_offset) as usize).min(data.len());
            let (cur, rest) = data.split_at_mut(diff);

            self.read_file_block_range(id, blk_index, cur, blk_offset)?;

            data = rest;
            blk_index += 1;
            blk_offset = 0;
        }

        Ok(())
    }

    fn read_file_block_range(
        &mut self,
        id: NodeId,
        index: u64,
        data: &mut [u8],
        offset: u32,
    ) -> io::Result<()> {
        let blocksize = self.volume.borrow().blocksize();
        let (_, start_index, sparse) = self.file_fields(id);
        let mut start = start_index + index;

        for region in sparse {
            if index >= region.start && index - region.start < region.count {
                data.fill(0);
                return Ok(());
            }

            if region.start < index {
                start -= region.count;
            }
        }

        let volume = self.volume.clone();
        let mut volume = volume.borrow_mut();

        if offset == 0 && data.len() == blocksize as usize {
            volume.read_block(start, data)
        } else {
            volume.read_partial_block(start, data, offset)
        }
    }

    /// Appends `size` bytes to the end of the file. `None` appends zeros,
    /// which become sparse regions unless the tree forbids holes.
    pub fn file_append(&mut self, id: NodeId, data: Option<&[u8]>, size: usize) -> io::Result<()> {
        let blocksize = self.volume.borrow().blocksize() as u64;

        let (file_size, _, _) = self.file_fields(id);
        let mut tail_index = file_size / blocksize;
        let mut tail_size = (file_size % blocksize) as u32;

        let mut remaining = size;
        let mut consumed = 0usize;

        while remaining > 0 {
            let diff = ((blocksize as u32 - tail_size) as usize).min(remaining);
            let chunk = data.map(|d| &d[consumed..consumed + diff]);
            let chunk_zero = chunk.map(is_memory_zero).unwrap_or(true);

            if tail_size > 0 {
                self.append_to_tail(id, tail_index, tail_size, chunk, chunk_zero, diff as u32)?;
            } else if chunk_zero && !self.no_sparse {
                self.file_mark_sparse(id, tail_index);
            } else {
                self.append_block(id, chunk)?;
            }

            consumed += diff;
            remaining -= diff;

            let (file_size, _, _) = self.file_fields(id);
            self.set_file_size(id, file_size + diff as u64);

            tail_index += 1;
            tail_size = 0;
        }

        Ok(())
    }

    fn append_to_tail(
        &mut self,
        id: NodeId,
        tail_index: u64,
        tail_size: u32,
        data: Option<&[u8]>,
        data_zero: bool,
        size: u32,
    ) -> io::Result<()> {
        let (_, start_index, sparse) = self.file_fields(id);
        let mut real_index = start_index + tail_index;
        let mut in_hole = false;

        for region in sparse {
            if region.start + region.count <= tail_index {
                real_index -= region.count;
                continue;
            }

            if region.start <= tail_index {
                in_hole = true;
            }
            break;
        }

        if in_hole {
            // the tail block is a hole; zeros can stay sparse, data first
            // materializes the block at the end of the data region
            if data_zero {
                return Ok(());
            }

            self.file_move_to_end(id)?;

            self.volume
                .borrow_mut()
                .write_partial_block(self.data_offset, None, 0, tail_size)?;

            real_index = self.data_offset;
            self.data_offset += 1;

            let sparse = self.file_sparse_mut(id);
            let pos = sparse
                .iter()
                .position(|r| r.start <= tail_index && tail_index - r.start < r.count)
                .unwrap();
            sparse[pos].count -= 1;
            if sparse[pos].count == 0 {
                sparse.remove(pos);
            }
        }

        let volume = self.volume.clone();
        let mut volume = volume.borrow_mut();
        volume.write_partial_block(real_index, data, tail_size, size)
    }

    fn append_block(&mut self, id: NodeId, data: Option<&[u8]>) -> io::Result<()> {
        let blocksize = self.volume.borrow().blocksize();

        self.file_move_to_end(id)?;

        let volume = self.volume.clone();
        let mut volume = volume.borrow_mut();

        match data {
            Some(data) if data.len() == blocksize as usize => {
                volume.write_block(self.data_offset, Some(data))?;
            }
            Some(data) => {
                volume.write_partial_block(self.data_offset, Some(data), 0, data.len() as u32)?;
                volume.write_partial_block(
                    self.data_offset,
                    None,
                    data.len() as u32,
                    blocksize - data.len() as u32,
                )?;
            }
            None => {
                volume.write_block(self.data_offset, None)?;
            }
        }

        drop(volume);
        self.data_offset += 1;
        Ok(())
    }

    /// Writes a byte range of the file, growing it when the range extends
    /// past the end. `None` writes zeros.
    pub fn file_write(
        &mut self,
        id: NodeId,
        offset: u64,
        data: Option<&[u8]>,
        size: usize,
    ) -> io::Result<()> {
        if size == 0 {
            return Ok(());
        }

        if let Some(data) = data {
            debug_assert_eq!(data.len(), size);
        }

        let blocksize = self.volume.borrow().blocksize() as u64;
        let (file_size, _, _) = self.file_fields(id);

        if offset > file_size {
            self.file_append(id, None, (offset - file_size) as usize)?;
        }

        let (file_size, _, _) = self.file_fields(id);
        let available = file_size - offset.min(file_size);

        let mut size = size;
        if size as u64 > available {
            let extra = size - available as usize;
            self.file_append(id, data.map(|d| &d[available as usize..]), extra)?;
            size = available as usize;
        }

        if size == 0 {
            return Ok(());
        }

        let mut blk_index = offset / blocksize;
        let mut blk_offset = (offset % blocksize) as u32;
        let mut consumed = 0usize;

        while consumed < size {
            let diff = ((blocksize as u32 - blk_offset) as usize).min(size - consumed);
            let chunk = data.map(|d| &d[consumed..consumed + diff]);

            self.write_file_block_range(id, blk_index, chunk, blk_offset, diff as u32)?;

            consumed += diff;
            blk_index += 1;
            blk_offset = 0;
        }

        Ok(())
    }

    fn write_file_block_range(
        &mut self,
        id: NodeId,
        index: u64,
        data: Option<&[u8]>,
        offset: u32,
        size: u32,
    ) -> io::Result<()> {
        let blocksize = self.volume.borrow().blocksize();
        let data_zero = data.map(is_memory_zero).unwrap_or(true);

        let (file_size, start_index, sparse) = self.file_fields(id);
        let mut start = start_index + index;
        let mut in_hole = false;

        for region in sparse {
            if index >= region.start && index - region.start < region.count {
                in_hole = true;
                start -= index - region.start;
                break;
            }

            if region.start < index {
                start -= region.count;
            }
        }

        if in_hole {
            // writing zeros into a hole is a no-op; anything else opens a
            // real block in place
            if data_zero {
                return Ok(());
            }

            let rel = start - self.file_fields(id).1;
            self.file_move_to_end(id)?;
            start = self.file_fields(id).1 + rel;

            self.insert_sparse_block(id, start, index)?;
        }

        if offset == 0 && size == blocksize {
            if !self.no_sparse && data_zero {
                let rel = start - self.file_fields(id).1;
                self.file_move_to_end(id)?;
                start = self.file_fields(id).1 + rel;

                return self.remove_file_block(id, start, index);
            }

            return self.volume.borrow_mut().write_block(start, data);
        }

        let blocksize = blocksize as u64;
        if !self.no_sparse
            && offset == 0
            && index == file_size / blocksize
            && size as u64 == file_size % blocksize
            && data_zero
        {
            let rel = start - self.file_fields(id).1;
            self.file_move_to_end(id)?;
            start = self.file_fields(id).1 + rel;

            return self.remove_file_block(id, start, index);
        }

        self.volume
            .borrow_mut()
            .write_partial_block(start, data, offset, size)
    }

    /// Shifts all data from `real_index` one block up and opens a cleared
    /// block there for logical block `index` of the file.
    fn insert_sparse_block(&mut self, id: NodeId, real_index: u64, index: u64) -> io::Result<()> {
        let blocksize = self.volume.borrow().blocksize() as u64;

        let src = real_index * blocksize;
        let dst = src + blocksize;
        let size = (self.data_offset - real_index) * blocksize;

        volume_memmove(&mut *self.volume.borrow_mut(), dst, src, size)?;
        self.data_offset += 1;

        self.file_mark_not_sparse(id, index);

        self.volume.borrow_mut().discard_blocks(real_index, 1)
    }

    /// Removes the physical block at `real_index`, closing the gap, and
    /// marks logical block `index` of the file as a hole.
    fn remove_file_block(&mut self, id: NodeId, real_index: u64, index: u64) -> io::Result<()> {
        let blocksize = self.volume.borrow().blocksize() as u64;

        let dst = real_index * blocksize;
        let src = dst + blocksize;
        let size = (self.data_offset - real_index - 1) * blocksize;

        volume_memmove(&mut *self.volume.borrow_mut(), dst, src, size)?;
        self.data_offset -= 1;

        self.file_mark_sparse(id, index);

        self.volume.borrow_mut().discard_blocks(self.data_offset, 1)
    }

    /// Moves the file's physical blocks to the end of the data region.
    ///
    /// All other files whose blocks sit above the vacated range slide down;
    /// the data region keeps its size. A file that is already last or has no
    /// physical blocks only gets its start index refreshed.
    pub fn file_move_to_end(&mut self, id: NodeId) -> io::Result<()> {
        let blocksize = self.volume.borrow().blocksize() as u64;

        let phys_size = self.file_physical_size(id);
        if phys_size == 0 {
            self.set_file_start(id, self.data_offset);
            return Ok(());
        }

        let blk_count = ceil_division(phys_size, blocksize);
        let (_, start_index, _) = self.file_fields(id);

        if blk_count >= self.data_offset - start_index {
            return Ok(());
        }

        // stash the file past the end, slide everything else down over it
        volume_memmove(
            &mut *self.volume.borrow_mut(),
            self.data_offset * blocksize,
            start_index * blocksize,
            blk_count * blocksize,
        )?;

        volume_memmove(
            &mut *self.volume.borrow_mut(),
            start_index * blocksize,
            (start_index + blk_count) * blocksize,
            (self.data_offset - start_index) * blocksize,
        )?;

        self.volume
            .borrow_mut()
            .discard_blocks(self.data_offset, blk_count)?;

        let old_start = start_index;
        self.set_file_start(id, self.data_offset);

        for fid in self.nodes_by_type[NodeType::File as usize].clone() {
            if self.file_physical_size(fid) == 0 {
                continue;
            }

            let (_, start, _) = self.file_fields(fid);
            if start >= old_start {
                self.set_file_start(fid, start - blk_count);
            }
        }

        Ok(())
    }

    /// Shrinks or grows the file to `size` bytes.
    pub fn file_truncate(&mut self, id: NodeId, size: u64) -> io::Result<()> {
        let blocksize = self.volume.borrow().blocksize() as u64;
        let (file_size, _, _) = self.file_fields(id);

        if size > file_size {
            return self.file_append(id, None, (size - file_size) as usize);
        }

        if size == file_size {
            return Ok(());
        }

        let old_count = self.file_physical_blocks(id);

        // trim the hole list to the new block count
        let keep = ceil_division(size, blocksize);
        let sparse = self.file_sparse_mut(id);
        sparse.retain(|r| r.start < keep);
        for region in sparse.iter_mut() {
            if region.count > keep - region.start {
                region.count = keep - region.start;
            }
        }

        self.set_file_size(id, size);

        let new_count = self.file_physical_blocks(id);
        let (_, start_index, _) = self.file_fields(id);

        if new_count < old_count {
            let src = start_index + old_count;
            let dst = start_index + new_count;
            let diff = self.data_offset - src;

            volume_memmove(
                &mut *self.volume.borrow_mut(),
                dst * blocksize,
                src * blocksize,
                diff * blocksize,
            )?;

            let removed = old_count - new_count;
            self.volume
                .borrow_mut()
                .discard_blocks(self.data_offset - removed, removed)?;
            self.data_offset -= removed;

            for fid in self.nodes_by_type[NodeType::File as usize].clone() {
                if self.file_physical_size(fid) == 0 {
                    continue;
                }

                let (_, start, _) = self.file_fields(fid);
                if start > start_index {
                    self.set_file_start(fid, start - removed);
                }
            }
        }

        let new_phys = self.file_physical_size(id);
        let tail_size = (new_phys % blocksize) as u32;

        if tail_size > 0 {
            let (_, start, _) = self.file_fields(id);
            let blk = start + new_count - 1;

            self.volume.borrow_mut().write_partial_block(
                blk,
                None,
                tail_size,
                blocksize as u32 - tail_size,
            )?;
        }

        Ok(())
    }

    /// Reserves `size` bytes worth of blocks starting at block `index`,
    /// shifting existing payload data upward and adjusting every affected
    /// file's start index. The reserved blocks are cleared.
    pub fn add_gap(&mut self, index: u64, size: u64) -> io::Result<()> {
        if size == 0 {
            return Ok(());
        }

        let blocksize = self.volume.borrow().blocksize() as u64;
        let count = ceil_division(size, blocksize);

        if index < self.data_offset {
            volume_memmove(
                &mut *self.volume.borrow_mut(),
                (index + count) * blocksize,
                index * blocksize,
                (self.data_offset - index) * blocksize,
            )?;

            for fid in self.nodes_by_type[NodeType::File as usize].clone() {
                let (_, start, _) = self.file_fields(fid);
                if start >= index {
                    self.set_file_start(fid, start + count);
                }
            }

            self.data_offset += count;
        } else {
            self.data_offset = index + count;
        }

        self.volume.borrow_mut().discard_blocks(index, count)
    }

    /// Verifies that the file's accounting invariants hold, for tests.
    #[cfg(test)]
    pub fn assert_file_invariants(&self, id: NodeId) {
        let (size, _, sparse) = self.file_fields(id);

        for pair in sparse.windows(2) {
            assert!(pair[0].start + pair[0].count < pair[1].start, "unmerged or unsorted");
        }

        if self.file_sparse_bytes(id) <= size {
            assert_eq!(
                self.file_physical_size(id) + self.file_sparse_bytes(id),
                size
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::volume::test_volume::MemVolume;
    use crate::volume::{volume_read, VolumeRef};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn tree(blocksize: u32, blocks: u64) -> (FsTree, Rc<RefCell<MemVolume>>) {
        let vol = Rc::new(RefCell::new(MemVolume::new(blocksize, blocks)));
        let fs = FsTree::new(vol.clone() as VolumeRef, 0);
        (fs, vol)
    }

    fn volume_string(vol: &Rc<RefCell<MemVolume>>, len: usize) -> String {
        let mut buf = vec![0u8; len];
        volume_read(&mut *vol.borrow_mut(), 0, &mut buf).unwrap();
        buf.iter()
            .map(|b| if *b == 0 { '_' } else { *b as char })
            .collect()
    }

    fn set_file(fs: &mut FsTree, id: usize, size: u64, start: u64, sparse: &[(u64, u64)]) {
        match &mut fs.node_mut(id).data {
            NodeData::File {
                size: s,
                start_index,
                sparse: sp,
            } => {
                *s = size;
                *start_index = start;
                *sp = sparse
                    .iter()
                    .map(|(start, count)| SparseRegion {
                        start: *start,
                        count: *count,
                    })
                    .collect();
            }
            _ => panic!(),
        }
    }

    fn file_state(fs: &FsTree, id: usize) -> (u64, u64, Vec<(u64, u64)>) {
        match &fs.node(id).data {
            NodeData::File {
                size,
                start_index,
                sparse,
            } => (
                *size,
                *start_index,
                sparse.iter().map(|r| (r.start, r.count)).collect(),
            ),
            _ => panic!(),
        }
    }

    #[test]
    fn append_read_roundtrip() {
        let (mut fs, _) = tree(4, 64);
        let f = fs.add_file("foo").unwrap();

        fs.file_append(f, Some(b"Hello, world!\n"), 14).unwrap();
        fs.assert_file_invariants(f);

        for n in [0usize, 1, 4, 13, 14, 20] {
            let mut buf = vec![0xAAu8; n];
            fs.file_read(f, 0, &mut buf).unwrap();

            let mut expect = b"Hello, world!\n".to_vec();
            expect.resize(20, 0);
            assert_eq!(buf, expect[..n], "length {}", n);
        }

        let mut buf = [0u8; 4];
        fs.file_read(f, 6, &mut buf).unwrap();
        assert_eq!(&buf, b" wor");
    }

    #[test]
    fn zero_append_is_sparse() {
        let (mut fs, _) = tree(4, 64);
        let f = fs.add_file("foo").unwrap();

        fs.file_append(f, None, 2048).unwrap();
        fs.assert_file_invariants(f);

        assert_eq!(fs.node(f).file_size(), 2048);
        assert_eq!(fs.file_physical_size(f), 0);
        assert_eq!(fs.file_sparse_bytes(f), 2048);
        assert_eq!(fs.data_offset, 0);

        let mut buf = [0xAAu8; 8];
        fs.file_read(f, 1000, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn zero_append_materializes_without_sparse() {
        let (mut fs, _) = tree(4, 64);
        fs.no_sparse = true;
        let f = fs.add_file("foo").unwrap();

        fs.file_append(f, None, 20).unwrap();

        assert_eq!(fs.file_physical_size(f), 20);
        assert_eq!(fs.file_sparse_bytes(f), 0);
        assert_eq!(fs.data_offset, 5);
    }

    #[test]
    fn mark_sparse_merging() {
        let (mut fs, _) = tree(4, 64);
        let f = fs.add_file("foo").unwrap();
        set_file(&mut fs, f, 64, 0, &[]);

        fs.file_mark_sparse(f, 5);
        fs.file_mark_sparse(f, 9);
        assert_eq!(file_state(&fs, f).2, [(5, 1), (9, 1)]);

        // extend tail
        fs.file_mark_sparse(f, 6);
        assert_eq!(file_state(&fs, f).2, [(5, 2), (9, 1)]);

        // extend head
        fs.file_mark_sparse(f, 8);
        assert_eq!(file_state(&fs, f).2, [(5, 2), (8, 2)]);

        // bridge the two regions
        fs.file_mark_sparse(f, 7);
        assert_eq!(file_state(&fs, f).2, [(5, 5)]);

        // no-op inside a region
        fs.file_mark_sparse(f, 6);
        assert_eq!(file_state(&fs, f).2, [(5, 5)]);
    }

    #[test]
    fn mark_not_sparse_head_tail_split() {
        let (mut fs, _) = tree(4, 64);
        let f = fs.add_file("foo").unwrap();
        set_file(&mut fs, f, 64, 0, &[(2, 5)]);

        fs.file_mark_not_sparse(f, 2);
        assert_eq!(file_state(&fs, f).2, [(3, 4)]);

        fs.file_mark_not_sparse(f, 6);
        assert_eq!(file_state(&fs, f).2, [(3, 3)]);

        fs.file_mark_not_sparse(f, 4);
        assert_eq!(file_state(&fs, f).2, [(3, 1), (5, 1)]);

        fs.file_mark_not_sparse(f, 3);
        fs.file_mark_not_sparse(f, 5);
        assert_eq!(file_state(&fs, f).2, []);
    }

    // Port of the historical move-to-end layout fixture: 18 blocks of 3
    // bytes, four files with holes and tails.
    #[test]
    fn move_to_end_layouts() {
        let (mut fs, vol) = tree(3, 18);

        let data = b"X__AAABBBCCCDDDAA_EEEFFFB__";
        {
            let mut v = vol.borrow_mut();
            v.data[..data.len()].copy_from_slice(data);
            for (i, b) in v.data.iter_mut().enumerate() {
                if i < data.len() && data[i] == b'_' {
                    *b = 0;
                }
            }
        }
        fs.data_offset = 9;

        let f0 = fs.add_file("afile").unwrap();
        let f1 = fs.add_file("bfile").unwrap();
        let f2 = fs.add_file("cfile").unwrap();
        let f3 = fs.add_file("dfile").unwrap();

        set_file(&mut fs, f0, 14, 1, &[]);
        set_file(&mut fs, f1, 16, 6, &[(0, 2), (3, 1)]);
        set_file(&mut fs, f2, 1, 0, &[]);
        set_file(&mut fs, f3, 4, 0, &[(0, 2)]);

        // already at the end: no-op
        fs.file_move_to_end(f1).unwrap();
        assert_eq!(fs.data_offset, 9);
        assert_eq!(volume_string(&vol, 27), "X__AAABBBCCCDDDAA_EEEFFFB__");
        assert_eq!(file_state(&fs, f1), (16, 6, vec![(0, 2), (3, 1)]));

        // fully sparse: only the start index moves
        fs.file_move_to_end(f3).unwrap();
        assert_eq!(volume_string(&vol, 27), "X__AAABBBCCCDDDAA_EEEFFFB__");
        assert_eq!(file_state(&fs, f3), (4, 9, vec![(0, 2)]));

        // sub-block file from the front to the end
        fs.file_move_to_end(f2).unwrap();
        assert_eq!(fs.data_offset, 9);
        assert_eq!(volume_string(&vol, 27), "AAABBBCCCDDDAA_EEEFFFB__X__");
        assert_eq!(file_state(&fs, f0), (14, 0, vec![]));
        assert_eq!(file_state(&fs, f1), (16, 5, vec![(0, 2), (3, 1)]));
        assert_eq!(file_state(&fs, f2), (1, 8, vec![]));
        assert_eq!(file_state(&fs, f3), (4, 9, vec![(0, 2)]));

        // big file to the end
        fs.file_move_to_end(f0).unwrap();
        assert_eq!(fs.data_offset, 9);
        assert_eq!(volume_string(&vol, 27), "EEEFFFB__X__AAABBBCCCDDDAA_");
        assert_eq!(file_state(&fs, f0), (14, 4, vec![]));
        assert_eq!(file_state(&fs, f1), (16, 0, vec![(0, 2), (3, 1)]));
        assert_eq!(file_state(&fs, f2), (1, 3, vec![]));
        assert_eq!(file_state(&fs, f3), (4, 9, vec![(0, 2)]));

        // and the holed file back to the end
        fs.file_move_to_end(f1).unwrap();
        assert_eq!(fs.data_offset, 9);
        assert_eq!(volume_string(&vol, 27), "X__AAABBBCCCDDDAA_EEEFFFB__");
        assert_eq!(file_state(&fs, f0), (14, 1, vec![]));
        assert_eq!(file_state(&fs, f1), (16, 6, vec![(0, 2), (3, 1)]));
        assert_eq!(file_state(&fs, f2), (1, 0, vec![]));
    }

    #[test]
    fn gap_shifts_files_and_clears() {
        let (mut fs, vol) = tree(4, 64);

        let f0 = fs.add_file("a").unwrap();
        let f1 = fs.add_file("b").unwrap();
        fs.file_append(f0, Some(b"AAAA"), 4).unwrap();
        fs.file_append(f1, Some(b"BBBB"), 4).unwrap();

        fs.add_gap(1, 6).unwrap();

        assert_eq!(fs.data_offset, 4);
        assert_eq!(file_state(&fs, f0).1, 0);
        assert_eq!(file_state(&fs, f1).1, 3);
        assert_eq!(volume_string(&vol, 16), "AAAA________BBBB");

        // gap past the end just extends the data region
        fs.add_gap(10, 4).unwrap();
        assert_eq!(fs.data_offset, 11);
    }

    #[test]
    fn write_into_hole() {
        let (mut fs, _) = tree(4, 64);
        let f = fs.add_file("foo").unwrap();

        fs.file_append(f, None, 12).unwrap();
        fs.file_append(f, Some(b"TAIL"), 4).unwrap();
        assert_eq!(file_state(&fs, f).2, [(0, 3)]);

        // zero write into the hole is a no-op
        fs.file_write(f, 4, None, 4).unwrap();
        assert_eq!(file_state(&fs, f).2, [(0, 3)]);

        fs.file_write(f, 4, Some(b"DATA"), 4).unwrap();
        fs.assert_file_invariants(f);
        assert_eq!(file_state(&fs, f).2, [(0, 1), (2, 1)]);

        let mut buf = [0u8; 16];
        fs.file_read(f, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0\0\0DATA\0\0\0\0TAIL");
    }

    #[test]
    fn overwrite_with_zeros_turns_sparse() {
        let (mut fs, _) = tree(4, 64);
        let f = fs.add_file("foo").unwrap();

        fs.file_append(f, Some(b"AAAABBBBCCCC"), 12).unwrap();
        fs.file_write(f, 4, None, 4).unwrap();
        fs.assert_file_invariants(f);

        assert_eq!(file_state(&fs, f).2, [(1, 1)]);
        assert_eq!(fs.file_physical_size(f), 8);
        assert_eq!(fs.data_offset, 2);

        let mut buf = [0u8; 12];
        fs.file_read(f, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"AAAA\0\0\0\0CCCC");
    }

    #[test]
    fn truncate_shrinks_and_zero_fills() {
        let (mut fs, vol) = tree(4, 64);
        let f0 = fs.add_file("a").unwrap();
        let f1 = fs.add_file("b").unwrap();

        fs.file_append(f0, Some(b"AAAABBBBCC"), 10).unwrap();
        fs.file_append(f1, Some(b"ZZZZ"), 4).unwrap();

        fs.file_truncate(f0, 5).unwrap();
        fs.assert_file_invariants(f0);

        assert_eq!(fs.node(f0).file_size(), 5);
        assert_eq!(fs.file_physical_blocks(f0), 2);
        assert_eq!(file_state(&fs, f1).1, 2);
        assert_eq!(fs.data_offset, 3);

        let mut buf = [0u8; 8];
        fs.file_read(f0, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"AAAAB\0\0\0");

        let mut buf = [0u8; 4];
        fs.file_read(f1, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"ZZZZ");

        // the zero-filled tail is real on the volume
        assert_eq!(volume_string(&vol, 12), "AAAAB___ZZZZ");
    }

    #[test]
    fn truncate_grow_appends_zeros() {
        let (mut fs, _) = tree(4, 64);
        let f = fs.add_file("a").unwrap();

        fs.file_append(f, Some(b"AB"), 2).unwrap();
        fs.file_truncate(f, 10).unwrap();

        assert_eq!(fs.node(f).file_size(), 10);

        let mut buf = [0u8; 10];
        fs.file_read(f, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"AB\0\0\0\0\0\0\0\0");
    }
}
