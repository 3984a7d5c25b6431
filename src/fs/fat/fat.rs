//! Writes the file allocation tables through a small sliding window.

use crate::fs::fat::{FatParameters, FatType};
use crate::fstree::{FsTree, NodeData, NodeType};
use crate::volume::{volume_write, volume_write_zeros, VolumeRef};
use std::io;

const FAT_WINDOW_SIZE: usize = 4096;

/// The in-flight window over the FAT being generated.
///
/// Cluster chains are written in ascending order; whenever the write
/// position passes the middle of the window, the lower half is flushed to
/// both FAT copies and the window slides forward.
struct FatWindow<'a> {
    params: &'a FatParameters,
    volume: VolumeRef,

    buffer: Vec<u8>,
    window_offset: usize,
}

impl<'a> FatWindow<'a> {
    fn new(params: &'a FatParameters, volume: VolumeRef) -> Self {
        let size = (params.fat_size as usize).min(FAT_WINDOW_SIZE);

        Self {
            params,
            volume,
            buffer: vec![0; size],
            window_offset: 0,
        }
    }

    fn slide(&mut self, next_wr_offset: &mut usize) -> io::Result<()> {
        if self.params.fat_size as usize <= FAT_WINDOW_SIZE {
            return Ok(());
        }

        if *next_wr_offset <= FAT_WINDOW_SIZE / 2 {
            return Ok(());
        }

        let diff = FAT_WINDOW_SIZE / 2;
        let offset = self.params.fat_start + self.window_offset as u64;

        let mut volume = self.volume.borrow_mut();
        volume_write(&mut *volume, offset, &self.buffer[..diff])?;
        volume_write(
            &mut *volume,
            offset + self.params.fat_size,
            &self.buffer[..diff],
        )?;
        drop(volume);

        self.buffer.copy_within(diff..*next_wr_offset, 0);

        self.window_offset += diff;
        *next_wr_offset -= diff;

        let used = *next_wr_offset;
        self.buffer[used..].fill(0);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        let offset = self.params.fat_start + self.window_offset as u64;
        let size = (self.params.fat_size as usize - self.window_offset).min(FAT_WINDOW_SIZE);

        let mut volume = self.volume.borrow_mut();
        volume_write(&mut *volume, offset, &self.buffer[..size])?;
        volume_write(
            &mut *volume,
            offset + self.params.fat_size,
            &self.buffer[..size],
        )
    }

    fn write_chain_12(&mut self, index: usize, count: usize) -> io::Result<()> {
        for i in 0..count {
            let cluster = index + i;
            let mut fat_offset = cluster + cluster / 2 - self.window_offset;

            self.slide(&mut fat_offset)?;

            let next: u16 = if i + 1 < count {
                (index + i + 1) as u16 & 0x0FFF
            } else {
                0x0FFF
            };

            let mut value =
                u16::from_le_bytes([self.buffer[fat_offset], self.buffer[fat_offset + 1]]);

            if cluster & 1 != 0 {
                value |= next << 4;
            } else {
                value |= next;
            }

            self.buffer[fat_offset..fat_offset + 2].copy_from_slice(&value.to_le_bytes());
        }

        Ok(())
    }

    fn write_chain_16(&mut self, index: usize, count: usize) -> io::Result<()> {
        let mut fat_offset = index * 2 - self.window_offset;

        for i in 0..count {
            self.slide(&mut fat_offset)?;

            let next: u16 = if i + 1 < count {
                (index + i + 1) as u16
            } else {
                0xFFFF
            };

            self.buffer[fat_offset..fat_offset + 2].copy_from_slice(&next.to_le_bytes());
            fat_offset += 2;
        }

        Ok(())
    }

    fn write_chain_32(&mut self, index: usize, count: usize) -> io::Result<()> {
        let mut fat_offset = index * 4 - self.window_offset;

        for i in 0..count {
            self.slide(&mut fat_offset)?;

            let next: u32 = if i + 1 < count {
                (index + i + 1) as u32 & 0x0FFF_FFFF
            } else {
                0x0FFF_FFFF
            };

            self.buffer[fat_offset..fat_offset + 4].copy_from_slice(&next.to_le_bytes());
            fat_offset += 4;
        }

        Ok(())
    }

    fn write_chain(&mut self, index: usize, count: usize) -> io::Result<()> {
        if count == 0 {
            return Ok(());
        }

        match self.params.fat_type {
            FatType::Fat12 => self.write_chain_12(index, count),
            FatType::Fat16 => self.write_chain_16(index, count),
            FatType::Fat32 => self.write_chain_32(index, count),
        }
    }
}

/// Builds both FAT copies for the directory and file cluster chains.
pub fn build_fats(
    params: &FatParameters,
    fs: &mut FsTree,
    orig_volume: VolumeRef,
) -> io::Result<()> {
    let cluster_size = params.cluster_size() as u64;

    volume_write_zeros(
        &mut *orig_volume.borrow_mut(),
        params.fat_start,
        params.fat_size,
    )?;

    let mut window = FatWindow::new(params, orig_volume.clone());

    // media descriptor and end-of-chain markers for the reserved clusters
    match params.fat_type {
        FatType::Fat12 => window.buffer[..3].copy_from_slice(b"\xF0\xFF\xFF"),
        FatType::Fat16 => window.buffer[..4].copy_from_slice(b"\xF0\xFF\xFF\xFF"),
        FatType::Fat32 => window.buffer[..8].copy_from_slice(b"\xF0\xFF\xFF\x0F\xFF\xFF\xFF\x0F"),
    }

    // chains for the serialized directories, in location order
    fs.sort_type_list(NodeType::Dir, |a, b| {
        let sa = match &a.data {
            NodeData::Dir { start, .. } => *start,
            _ => 0,
        };
        let sb = match &b.data {
            NodeData::Dir { start, .. } => *start,
            _ => 0,
        };
        sa.cmp(&sb)
    });

    for id in fs.by_type(NodeType::Dir) {
        let (start, size) = match &fs.node(*id).data {
            NodeData::Dir { start, size, .. } => (*start, *size),
            _ => unreachable!(),
        };

        let index = (start / cluster_size) as usize + 2;
        let mut count = (size / cluster_size) as usize;
        if size % cluster_size != 0 || size == 0 {
            count += 1;
        }

        window.write_chain(index, count)?;
    }

    // chains for the file payloads, in location order
    fs.sort_type_list(NodeType::File, |a, b| {
        a.file_start_index().cmp(&b.file_start_index())
    });

    for id in fs.by_type(NodeType::File) {
        let node = fs.node(*id);
        let index = node.file_start_index() as usize + 2;
        let size = node.file_size();

        let mut count = (size / cluster_size) as usize;
        if size % cluster_size != 0 {
            count += 1;
        }

        window.write_chain(index, count)?;
    }

    window.flush()
}
