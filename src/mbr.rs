//! An MBR partitioned disk: slices a parent volume into up to four
//! partitions exposed as volumes of their own.

use crate::util::reinterpret;
use crate::volume::{volume_memmove, volume_write_zeros, BlocksizeAdapter, Volume, VolumeRef};
use std::cell::RefCell;
use std::io;
use std::io::Error;
use std::rc::Rc;

const SECTOR_SIZE: u32 = 512;
const MAX_MBR_PARTITIONS: usize = 4;
const IBM_BOOT_MAGIC: u16 = 0xAA55;

/// Partitions are created and grown in units of this many sectors (1 MiB).
const MBR_PART_ALIGN: u64 = 1024 * 1024 / SECTOR_SIZE as u64;

/// (63 sectors) * (254 heads) * (1023 cylinders); everything above
/// saturates the CHS encoding.
const MAX_LBA: u32 = 16_370_046;

/// The partition may grow when written past its end.
pub const PARTITION_FLAG_GROW: u64 = 1 << 0;
/// The partition takes all remaining space at commit time.
pub const PARTITION_FLAG_FILL: u64 = 1 << 1;
/// The partition is marked bootable in the partition table.
pub const PARTITION_FLAG_BOOTABLE: u64 = 1 << 16;

/// Bit position of the partition type byte within the flag word.
pub const PARTITION_TYPE_SHIFT: u64 = 20;

/// Well-known MBR partition type bytes, exposed by name in the layout
/// grammar.
pub const MBR_PARTITION_TYPES: [(&str, u8); 8] = [
    ("LinuxSwap", 0x82),
    ("Linux", 0x83),
    ("FreeBSD", 0xA5),
    ("OpenBSD", 0xA6),
    ("NetBSD", 0xA9),
    ("BSDI", 0xB7),
    ("Minix", 0x81),
    ("UnixWare", 0x63),
];

struct PartitionDesc {
    index: u64,
    blk_count_min: u64,
    blk_count: u64,
    blk_used: u64,
    flags: u64,
}

/// The shared disk state: the sector-sized parent volume plus the
/// partition descriptors.
pub struct MbrDisk {
    volume: VolumeRef,
    partitions: Vec<PartitionDesc>,
}

/// One 512-byte boot sector: NOP filler, four partition records and the
/// boot signature.
#[repr(C, packed)]
struct MbrHeader {
    boot_code: [u8; 446],
    partitions: [MbrPartitionRecord; MAX_MBR_PARTITIONS],
    boot_magic: u16,
}

#[derive(Clone, Copy, Default)]
#[repr(C, packed)]
struct MbrPartitionRecord {
    flags: u8,
    first_sector_chs: [u8; 3],
    part_type: u8,
    last_sector_chs: [u8; 3],
    first_sector_lba: u32,
    num_sectors: u32,
}

/// Encodes an LBA into the three CHS bytes using the UEFI-recommended
/// geometry of 63 sectors per track and 254 heads per cylinder.
fn lba_to_chs(lba: u32, chs: &mut [u8; 3]) {
    const SECTORS_PER_TRACK: u32 = 63;
    const HEADS_PER_CYLINDER: u32 = 254;

    let (c, h, s) = if lba >= MAX_LBA {
        (1023u32, 254u8, 63u8)
    } else {
        (
            lba / (HEADS_PER_CYLINDER * SECTORS_PER_TRACK),
            ((lba / SECTORS_PER_TRACK) % HEADS_PER_CYLINDER) as u8,
            (1 + lba % SECTORS_PER_TRACK) as u8,
        )
    };

    chs[0] = h;
    chs[1] = (((c >> 2) & 0xC0) as u8) | (s & 0x3F);
    chs[2] = (c & 0xFF) as u8;
}

impl MbrDisk {
    fn shrink_partition(&mut self, index: usize, mut diff: u64) -> io::Result<()> {
        let start = self.partitions[index].index;
        let count = self.partitions[index].blk_count;

        diff -= diff % MBR_PART_ALIGN;

        if diff > count {
            diff = count;
        }
        if count - diff < MBR_PART_ALIGN {
            diff = count - MBR_PART_ALIGN;
        }
        if count - diff < self.partitions[index].blk_count_min {
            diff = count - self.partitions[index].blk_count_min;
        }

        if diff == 0 {
            return Ok(());
        }

        let max = self
            .partitions
            .iter()
            .map(|p| p.index + p.blk_count - 1)
            .max()
            .unwrap_or(0);

        self.volume.borrow_mut().discard_blocks(max - diff, diff)?;

        for p in self.partitions.iter_mut() {
            if p.index > start {
                p.index -= diff;
            }
        }

        self.partitions[index].blk_count -= diff;
        Ok(())
    }

    fn shrink_to_fit(&mut self, index: usize) -> io::Result<()> {
        if self.partitions[index].blk_used < self.partitions[index].blk_count {
            let diff = self.partitions[index].blk_count - self.partitions[index].blk_used;
            self.shrink_partition(index, diff)?;
        }

        Ok(())
    }

    /// Extends the partition by at least `diff` blocks, aligned up. All
    /// partitions behind it are first shrunk to their used size, then
    /// shifted upward.
    fn grow_partition(&mut self, index: usize, mut diff: u64) -> io::Result<()> {
        let start = self.partitions[index].index;

        let behind: Vec<usize> = (0..self.partitions.len())
            .filter(|i| self.partitions[*i].index > start)
            .collect();
        for i in behind {
            self.shrink_to_fit(i)?;
        }

        if diff % MBR_PART_ALIGN != 0 || diff == 0 {
            diff += MBR_PART_ALIGN - diff % MBR_PART_ALIGN;
        }

        let start = self.partitions[index].index;
        let count = self.partitions[index].blk_count;
        let max = self
            .partitions
            .iter()
            .map(|p| p.index + p.blk_count - 1)
            .max()
            .unwrap_or(0);

        volume_memmove(
            &mut *self.volume.borrow_mut(),
            (start + count + diff) * SECTOR_SIZE as u64,
            (start + count) * SECTOR_SIZE as u64,
            (max - (start + count - 1)) * SECTOR_SIZE as u64,
        )?;

        volume_write_zeros(
            &mut *self.volume.borrow_mut(),
            (start + count) * SECTOR_SIZE as u64,
            diff * SECTOR_SIZE as u64,
        )?;

        for p in self.partitions.iter_mut() {
            if p.index > start {
                p.index += diff;
            }
        }

        self.partitions[index].blk_count += diff;
        Ok(())
    }
}

/// The partition manager over a shared [`MbrDisk`].
pub struct MbrPartitionManager {
    disk: Rc<RefCell<MbrDisk>>,
}

impl MbrPartitionManager {
    /// Creates an MBR disk on top of `volume`, wrapping it in a
    /// sector-sized block adapter if needed.
    pub fn new(volume: VolumeRef) -> Self {
        let volume = if volume.borrow().blocksize() == SECTOR_SIZE {
            volume
        } else {
            Rc::new(RefCell::new(BlocksizeAdapter::new(volume, SECTOR_SIZE, 0))) as VolumeRef
        };

        Self {
            disk: Rc::new(RefCell::new(MbrDisk {
                volume,
                partitions: Vec::new(),
            })),
        }
    }

    /// Creates the next partition with at least `blk_count` sectors,
    /// aligned up to 1 MiB, placed after all existing partitions.
    pub fn create_partition(&mut self, blk_count: u64, flags: u64) -> io::Result<VolumeRef> {
        let mut disk = self.disk.borrow_mut();

        if disk.partitions.len() == MAX_MBR_PARTITIONS {
            return Err(Error::other(format!(
                "cannot create more than {} partitions on an MBR disk",
                MAX_MBR_PARTITIONS
            )));
        }

        let mut blk_count = if blk_count == 0 {
            MBR_PART_ALIGN
        } else {
            blk_count
        };
        if blk_count % MBR_PART_ALIGN != 0 {
            blk_count += MBR_PART_ALIGN - blk_count % MBR_PART_ALIGN;
        }

        // the first alignment unit holds the partition table
        let mut index = MBR_PART_ALIGN;
        for p in &disk.partitions {
            if p.index + p.blk_count > index {
                index = p.index + p.blk_count;
            }
        }

        disk.partitions.push(PartitionDesc {
            index,
            blk_count_min: blk_count,
            blk_count,
            blk_used: 0,
            flags,
        });

        {
            let volume = disk.volume.clone();
            let mut volume = volume.borrow_mut();
            for blk in index..index + blk_count {
                volume.write_block(blk, None)?;
            }
        }

        let part_index = disk.partitions.len() - 1;
        drop(disk);

        Ok(Rc::new(RefCell::new(MbrPartition {
            disk: self.disk.clone(),
            index: part_index,
        })) as VolumeRef)
    }

    /// Applies the shrink and fill policies, writes the partition table and
    /// flushes the parent volume.
    pub fn commit(&mut self) -> io::Result<()> {
        let mut disk = self.disk.borrow_mut();

        for i in 0..disk.partitions.len() {
            disk.shrink_to_fit(i)?;
        }

        // fill policy: claim whatever the disk still has to offer
        for i in 0..disk.partitions.len() {
            if disk.partitions[i].flags & PARTITION_FLAG_FILL == 0 {
                continue;
            }

            let used: u64 = MBR_PART_ALIGN
                + disk.partitions.iter().map(|p| p.blk_count).sum::<u64>();
            let max = disk.volume.borrow().max_block_count();

            if max > used {
                let free = (max - used) - (max - used) % MBR_PART_ALIGN;
                if free > 0 {
                    disk.grow_partition(i, free)?;
                }
            }
        }

        let mut header = MbrHeader {
            boot_code: [0x90; 446],
            partitions: [MbrPartitionRecord::default(); MAX_MBR_PARTITIONS],
            boot_magic: IBM_BOOT_MAGIC.to_le(),
        };

        for (i, p) in disk.partitions.iter().enumerate() {
            let record = &mut header.partitions[i];

            record.first_sector_lba = (p.index as u32).to_le();
            record.num_sectors = (p.blk_count as u32).to_le();

            lba_to_chs(p.index as u32, &mut record.first_sector_chs);
            lba_to_chs(
                if p.blk_count > 0 {
                    (p.index + p.blk_count - 1) as u32
                } else {
                    p.index as u32
                },
                &mut record.last_sector_chs,
            );

            if p.flags & PARTITION_FLAG_BOOTABLE != 0 {
                record.flags = 0x80;
            }

            record.part_type = ((p.flags >> PARTITION_TYPE_SHIFT) & 0xFF) as u8;
        }

        let volume = disk.volume.clone();
        volume.borrow_mut().write_block(0, Some(reinterpret(&header)))?;
        let result = volume.borrow_mut().commit();
        result
    }
}

/// A single partition, exposed as a volume over the parent disk.
pub struct MbrPartition {
    disk: Rc<RefCell<MbrDisk>>,
    index: usize,
}

impl MbrPartition {
    fn out_of_bounds(&self, what: &str) -> Error {
        Error::other(format!(
            "out-of-bounds {} on MBR partition {}",
            what, self.index
        ))
    }
}

impl Volume for MbrPartition {
    fn blocksize(&self) -> u32 {
        SECTOR_SIZE
    }

    fn min_block_count(&self) -> u64 {
        self.disk.borrow().partitions[self.index].blk_count_min
    }

    fn max_block_count(&self) -> u64 {
        let disk = self.disk.borrow();
        let p = &disk.partitions[self.index];
        let mut count = p.blk_count;

        if p.flags & PARTITION_FLAG_GROW != 0 {
            let total = disk.volume.borrow().max_block_count();
            let used: u64 = disk.partitions.iter().map(|p| p.blk_count).sum();
            count += total.saturating_sub(used);
        }

        count
    }

    fn block_count(&self) -> u64 {
        self.disk.borrow().partitions[self.index].blk_used
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
        let disk = self.disk.borrow();
        let p = &disk.partitions[self.index];

        if index >= p.blk_count {
            if p.flags & PARTITION_FLAG_GROW == 0 {
                return Err(self.out_of_bounds("read"));
            }

            buffer.fill(0);
            return Ok(());
        }

        let volume = disk.volume.clone();
        let start = p.index;
        drop(disk);

        let result = volume
            .borrow_mut()
            .read_partial_block(start + index, buffer, offset);
        result
    }

    fn write_block(&mut self, index: u64, data: Option<&[u8]>) -> io::Result<()> {
        self.write_partial_block(index, data, 0, SECTOR_SIZE)
    }

    fn write_partial_block(
        &mut self,
        index: u64,
        data: Option<&[u8]>,
        offset: u32,
        size: u32,
    ) -> io::Result<()> {
        let mut disk = self.disk.borrow_mut();

        if index >= disk.partitions[self.index].blk_count {
            if disk.partitions[self.index].flags & PARTITION_FLAG_GROW == 0 {
                return Err(self.out_of_bounds("write"));
            }

            let diff = index - disk.partitions[self.index].blk_count + 1;
            disk.grow_partition(self.index, diff)?;
        }

        if index >= disk.partitions[self.index].blk_used {
            disk.partitions[self.index].blk_used = index + 1;
        }

        let start = disk.partitions[self.index].index;
        let volume = disk.volume.clone();
        drop(disk);

        let result = volume
            .borrow_mut()
            .write_partial_block(start + index, data, offset, size);
        result
    }

    fn move_block(&mut self, src: u64, dst: u64) -> io::Result<()> {
        self.move_block_partial(src, dst, 0, 0, SECTOR_SIZE)
    }

    fn move_block_partial(
        &mut self,
        src: u64,
        dst: u64,
        src_offset: u32,
        dst_offset: u32,
        size: u32,
    ) -> io::Result<()> {
        let mut disk = self.disk.borrow_mut();
        let p = &disk.partitions[self.index];
        let blk_count = p.blk_count;
        let blk_used = p.blk_used;
        let flags = p.flags;

        if (src >= blk_count || dst >= blk_count) && flags & PARTITION_FLAG_GROW == 0 {
            return Err(self.out_of_bounds("block move"));
        }

        if src >= blk_used && dst >= blk_used {
            return Ok(());
        }

        if src >= blk_used {
            drop(disk);
            return self.discard_blocks(dst, 1);
        }

        if dst >= blk_count {
            let diff = dst - blk_count + 1;
            disk.grow_partition(self.index, diff)?;
        }

        if dst >= disk.partitions[self.index].blk_used {
            disk.partitions[self.index].blk_used = dst;
        }

        let start = disk.partitions[self.index].index;
        let volume = disk.volume.clone();
        drop(disk);

        let mut volume = volume.borrow_mut();
        if src_offset == 0 && dst_offset == 0 && size == SECTOR_SIZE {
            volume.move_block(start + src, start + dst)
        } else {
            volume.move_block_partial(start + src, start + dst, src_offset, dst_offset, size)
        }
    }

    fn discard_blocks(&mut self, index: u64, mut count: u64) -> io::Result<()> {
        let mut disk = self.disk.borrow_mut();
        let blk_used = disk.partitions[self.index].blk_used;

        if index >= blk_used {
            return Ok(());
        }

        if count > blk_used - index {
            count = blk_used - index;
        }

        if count == 0 {
            return Ok(());
        }

        if index + count == blk_used {
            disk.partitions[self.index].blk_used = index;
        }

        let start = disk.partitions[self.index].index;
        let volume = disk.volume.clone();
        drop(disk);

        let result = volume.borrow_mut().discard_blocks(start + index, count);
        result
    }

    fn commit(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::volume::test_volume::SparseMemVolume;
    use crate::volume::volume_read;

    fn sector(text: &[u8]) -> Vec<u8> {
        let mut block = vec![0u8; 512];
        block[..text.len()].copy_from_slice(text);
        block
    }

    fn read_sector(vol: &Rc<RefCell<SparseMemVolume>>, lba: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        volume_read(&mut *vol.borrow_mut(), lba * 512, &mut buf).unwrap();
        buf
    }

    struct PartRecord {
        bootable: bool,
        lba: u32,
        sectors: u32,
        chs_first: [u8; 3],
        chs_last: [u8; 3],
    }

    fn parse_table(sector: &[u8]) -> Vec<PartRecord> {
        assert_eq!(&sector[510..512], &[0x55, 0xAA]);
        assert!(sector[0..446].iter().all(|b| *b == 0x90));

        (0..4)
            .map(|i| {
                let e = &sector[446 + i * 16..446 + (i + 1) * 16];
                PartRecord {
                    bootable: e[0] == 0x80,
                    lba: u32::from_le_bytes([e[8], e[9], e[10], e[11]]),
                    sectors: u32::from_le_bytes([e[12], e[13], e[14], e[15]]),
                    chs_first: [e[1], e[2], e[3]],
                    chs_last: [e[5], e[6], e[7]],
                }
            })
            .collect()
    }

    // The four-partition scenario: 5, 10, 42 and 3072 sectors, the first
    // partition growable, with a write that forces it to grow.
    #[test]
    fn four_partitions_with_growth() {
        let vol = Rc::new(RefCell::new(SparseMemVolume::new(512, 40960)));
        let mut mbr = MbrPartitionManager::new(vol.clone() as VolumeRef);

        let p0 = mbr.create_partition(5, PARTITION_FLAG_GROW).unwrap();
        let p1 = mbr.create_partition(10, 0).unwrap();
        let p2 = mbr.create_partition(42, 0).unwrap();
        let p3 = mbr.create_partition(3072, 0).unwrap();

        assert_eq!(p0.borrow().min_block_count(), 2048);
        assert_eq!(p1.borrow().min_block_count(), 2048);
        assert_eq!(p2.borrow().min_block_count(), 2048);
        assert_eq!(p3.borrow().min_block_count(), 4096);

        p0.borrow_mut()
            .write_block(0, Some(&sector(b"Hello, World!")))
            .unwrap();
        p1.borrow_mut()
            .write_block(0, Some(&sector(b"A different string")))
            .unwrap();

        // partition payloads land at their 1 MiB aligned offsets
        assert_eq!(&read_sector(&vol, 2048)[..13], b"Hello, World!");
        assert_eq!(&read_sector(&vol, 4096)[..18], b"A different string");

        // this write is one sector past the end of partition 0
        p0.borrow_mut()
            .write_block(2048, Some(&sector(b"Foo")))
            .unwrap();

        let mut buf = vec![0u8; 512];
        p0.borrow_mut().read_block(0, &mut buf).unwrap();
        assert_eq!(&buf[..13], b"Hello, World!");
        p0.borrow_mut().read_block(2048, &mut buf).unwrap();
        assert_eq!(&buf[..3], b"Foo");
        p1.borrow_mut().read_block(0, &mut buf).unwrap();
        assert_eq!(&buf[..18], b"A different string");

        // everything behind partition 0 moved up by one alignment unit
        assert_eq!(&read_sector(&vol, 2048)[..13], b"Hello, World!");
        assert_eq!(&read_sector(&vol, 4096)[..3], b"Foo");
        assert_eq!(&read_sector(&vol, 6144)[..18], b"A different string");

        mbr.commit().unwrap();

        let table = parse_table(&read_sector(&vol, 0));
        assert_eq!(table[0].lba, 2048);
        assert_eq!(table[0].sectors, 4096);
        assert_eq!(table[1].lba, 6144);
        assert_eq!(table[1].sectors, 2048);
        assert_eq!(table[2].lba, 8192);
        assert_eq!(table[2].sectors, 2048);
        assert_eq!(table[3].lba, 10240);
        assert_eq!(table[3].sectors, 4096);
        assert!(!table[0].bootable);

        // CHS of the first partition: lba 2048 -> h 32, s 33, c 0 and
        // lba 6143 -> h 97, s 33, c 0
        assert_eq!(table[0].chs_first, [32, 33, 0]);
        assert_eq!(table[0].chs_last, [97, 33, 0]);
    }

    #[test]
    fn partition_count_limit() {
        let vol = Rc::new(RefCell::new(SparseMemVolume::new(512, 40960)));
        let mut mbr = MbrPartitionManager::new(vol as VolumeRef);

        for _ in 0..4 {
            mbr.create_partition(1, 0).unwrap();
        }
        assert!(mbr.create_partition(1, 0).is_err());
    }

    #[test]
    fn out_of_bounds_without_grow() {
        let vol = Rc::new(RefCell::new(SparseMemVolume::new(512, 40960)));
        let mut mbr = MbrPartitionManager::new(vol as VolumeRef);

        let p = mbr.create_partition(5, 0).unwrap();
        let mut buf = vec![0u8; 512];
        assert!(p.borrow_mut().read_block(2048, &mut buf).is_err());
        assert!(p.borrow_mut().write_block(2048, Some(&buf)).is_err());
    }

    #[test]
    fn chs_saturates() {
        let mut chs = [0u8; 3];
        lba_to_chs(MAX_LBA, &mut chs);
        assert_eq!(chs, [254, 0xFF, 0xFF]);

        lba_to_chs(u32::MAX, &mut chs);
        // c = 1023, h = 254, s = 63
        assert_eq!(chs[0], 254);
        assert_eq!(chs[1], ((1023 >> 2) & 0xC0) as u8 | 63);
        assert_eq!(chs[2], (1023 & 0xFF) as u8);
    }
}
