//! Serializes a tree into a FAT filesystem image.

use crate::fstree::{FsTree, NodeData, NodeId, NodeType};
use crate::fs::Filesystem;
use crate::stream::{NullOstream, VolumeOstream};
use crate::volume::{BlocksizeAdapter, Volume, VolumeRef};
use std::cell::RefCell;
use std::io;
use std::io::Error;
use std::rc::Rc;

mod conv;
mod dirent;
mod fat;
mod super_block;

pub use conv::{convert_timestamp, mk_shortname, ShortName};

/// Sector size in bytes; everything FAT is built from these.
pub const SECTOR_SIZE: u32 = 512;

/// Reserved sectors in front of the first FAT on FAT32.
const FAT32_RESERVED_COUNT: u32 = 32;

/// Disks larger than this are treated as having exactly this size.
pub const MAX_DISK_SIZE: u64 = 1024 * 1024 * 1024 * 1024;

/// Up to this size the disk is formatted as FAT12.
const MAX_FLOPPY_SIZE: u64 = 4 * 1024 * 1024;
/// Up to this many sectors the disk is formatted as FAT16.
const FAT16_SECTOR_THRESHOLD: u64 = 0x0010_0000;

/// Payload clusters are numbered starting here.
const CLUSTER_OFFSET: u32 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

/// Geometry of the filesystem, derived from the disk size.
pub struct FatParameters {
    pub fat_type: FatType,
    pub secs_per_cluster: u32,
    pub secs_per_fat: u32,
    pub total_sectors: u32,
    pub total_clusters: u32,

    /// Byte offset of the first FAT.
    pub fat_start: u64,
    /// Size of one FAT in bytes.
    pub fat_size: u64,
}

impl FatParameters {
    /// Picks the FAT type and cluster geometry for a disk of `disk_size`
    /// bytes, keeping the cluster count within the bounds of the chosen
    /// type.
    pub fn compute(disk_size: u64) -> Self {
        let disk_size = disk_size.min(MAX_DISK_SIZE);
        let total_sectors = (disk_size / SECTOR_SIZE as u64) as u32;

        let (fat_type, secs_per_cluster, total_clusters, secs_per_fat);

        if disk_size <= MAX_FLOPPY_SIZE {
            fat_type = FatType::Fat12;

            let mut spc = 1u32;
            let mut clusters = total_sectors;
            while clusters > 4000 {
                spc *= 2;
                clusters = total_sectors / spc;
            }

            let fat_bytes = 3 * clusters as u64;
            secs_per_cluster = spc;
            total_clusters = clusters;
            secs_per_fat = (fat_bytes / (2 * SECTOR_SIZE as u64)) as u32
                + if fat_bytes % (2 * SECTOR_SIZE as u64) != 0 { 1 } else { 0 };
        } else if (total_sectors as u64) <= FAT16_SECTOR_THRESHOLD {
            fat_type = FatType::Fat16;

            let mut spc = 8u32;
            let mut clusters = total_sectors / spc;
            while clusters < 5000 && spc > 1 {
                spc /= 2;
                clusters = total_sectors / spc;
            }

            let slots_per_sec = SECTOR_SIZE / 2;
            secs_per_cluster = spc;
            total_clusters = clusters;
            secs_per_fat = clusters / slots_per_sec
                + if clusters % slots_per_sec != 0 { 1 } else { 0 };
        } else {
            fat_type = FatType::Fat32;

            let mut spc = 8u32;
            let mut clusters = total_sectors / spc;
            while clusters < 66000 && spc > 1 {
                spc /= 2;
                clusters = total_sectors / spc;
            }

            let slots_per_sec = SECTOR_SIZE / 4;
            secs_per_cluster = spc;
            total_clusters = clusters;
            secs_per_fat = clusters / slots_per_sec
                + if clusters % slots_per_sec != 0 { 1 } else { 0 };
        }

        let fat_start = if fat_type == FatType::Fat32 {
            FAT32_RESERVED_COUNT as u64 * SECTOR_SIZE as u64
        } else {
            SECTOR_SIZE as u64
        };

        Self {
            fat_type,
            secs_per_cluster,
            secs_per_fat,
            total_sectors,
            total_clusters,
            fat_start,
            fat_size: secs_per_fat as u64 * SECTOR_SIZE as u64,
        }
    }

    /// Size of one cluster in bytes.
    pub fn cluster_size(&self) -> u32 {
        self.secs_per_cluster * SECTOR_SIZE
    }

    /// Cluster number of the data located at byte offset `location` within
    /// the cluster region.
    pub fn cluster_index(&self, location: u64) -> u32 {
        (location / self.cluster_size() as u64) as u32 + CLUSTER_OFFSET
    }
}

/// A FAT filesystem being built on a volume.
pub struct FatFilesystem {
    fstree: Rc<RefCell<FsTree>>,
    orig_volume: VolumeRef,
    params: FatParameters,

    oem: String,
    label: String,
}

impl FatFilesystem {
    /// Creates a FAT filesystem on top of `volume`.
    ///
    /// The tree operates on a cluster-sized adapter whose byte offset skips
    /// the reserved sectors and both FATs, so cluster 2 is adapter block 0.
    pub fn new(volume: VolumeRef) -> Self {
        let size = {
            let vol = volume.borrow();
            (vol.blocksize() as u64)
                .checked_mul(vol.max_block_count())
                .unwrap_or(MAX_DISK_SIZE)
        };

        let params = FatParameters::compute(size);
        let reserved = params.fat_start + 2 * params.fat_size;

        let adapter = Rc::new(RefCell::new(BlocksizeAdapter::new(
            volume.clone(),
            params.cluster_size(),
            reserved,
        ))) as VolumeRef;

        let mut fstree = FsTree::new(adapter, 0);
        fstree.no_sparse = true;

        Self {
            fstree: Rc::new(RefCell::new(fstree)),
            orig_volume: volume,
            params,
            oem: String::new(),
            label: String::new(),
        }
    }

    /// Sets the OEM name stored in the boot sector (at most 8 characters).
    pub fn set_oem(&mut self, oem: &str) -> io::Result<()> {
        if oem.len() >= 8 {
            return Err(Error::other(
                "FAT OEM name can be at most 8 characters long",
            ));
        }
        self.oem = oem.to_owned();
        Ok(())
    }

    /// Sets the volume label stored in the boot sector (at most 11
    /// characters).
    pub fn set_label(&mut self, label: &str) -> io::Result<()> {
        if label.len() >= 11 {
            return Err(Error::other(
                "FAT filesystem label can be at most 11 characters long",
            ));
        }
        self.label = label.to_owned();
        Ok(())
    }

    /// Measures every directory, then assigns each one a cluster aligned
    /// byte location: the root first, the rest in creation order. Returns
    /// the total size of the directory region in bytes.
    fn compute_dir_sizes(&self) -> io::Result<u64> {
        let fstree = self.fstree.clone();
        let cluster_size = self.params.cluster_size() as u64;

        // an empty root has no dot entries and still takes one cluster
        if fstree.borrow().node(0).children().is_empty() {
            let mut fs = fstree.borrow_mut();
            match &mut fs.node_mut(0).data {
                NodeData::Dir { start, size, .. } => {
                    *start = 0;
                    *size = 0;
                }
                _ => unreachable!(),
            }
            return Ok(cluster_size);
        }

        let dirs: Vec<NodeId> = fstree.borrow().by_type(NodeType::Dir).to_vec();
        let mut total = 0u64;

        for id in dirs.iter().copied() {
            let size = {
                let fs = fstree.borrow();
                let mut null = NullOstream::default();
                dirent::serialize_directory(&self.params, &fs, id, &mut null)?;
                null.bytes_written
            };

            let mut fs = fstree.borrow_mut();
            match &mut fs.node_mut(id).data {
                NodeData::Dir { size: s, .. } => *s = size,
                _ => unreachable!(),
            }

            total += size / cluster_size;
            if size % cluster_size != 0 {
                total += 1;
            }
        }

        let mut offset = 0u64;
        let mut fs = fstree.borrow_mut();

        for id in std::iter::once(0).chain(dirs.into_iter().filter(|id| *id != 0)) {
            let size = match &mut fs.node_mut(id).data {
                NodeData::Dir { start, size, .. } => {
                    *start = offset;
                    *size
                }
                _ => unreachable!(),
            };

            offset += size;
            if offset % cluster_size != 0 {
                offset += cluster_size - offset % cluster_size;
            }
        }

        Ok(total * cluster_size)
    }

    fn write_directory_contents(&self) -> io::Result<()> {
        let fstree = self.fstree.clone();
        let volume = fstree.borrow().volume.clone();
        let dirs: Vec<NodeId> = fstree.borrow().by_type(NodeType::Dir).to_vec();

        for id in dirs {
            let fs = fstree.borrow();
            let (start, size) = match &fs.node(id).data {
                NodeData::Dir { start, size, .. } => (*start, *size),
                _ => unreachable!(),
            };

            let mut vstrm = VolumeOstream::new(volume.clone(), &fs.node(id).name, start, size);
            dirent::serialize_directory(&self.params, &fs, id, &mut vstrm)?;
        }

        Ok(())
    }
}

impl Filesystem for FatFilesystem {
    fn fstree(&self) -> Rc<RefCell<FsTree>> {
        self.fstree.clone()
    }

    fn build_format(&mut self) -> io::Result<()> {
        let fstree = self.fstree.clone();

        fstree.borrow_mut().sort();

        let dir_size = self.compute_dir_sizes()?;
        fstree.borrow_mut().add_gap(0, dir_size)?;

        self.write_directory_contents()?;

        let data_offset = fstree.borrow().data_offset;
        super_block::write_super_block(
            &self.params,
            &self.orig_volume,
            &self.oem,
            &self.label,
            data_offset,
        )?;

        let mut fs = fstree.borrow_mut();
        fat::build_fats(&self.params, &mut fs, self.orig_volume.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::volume::test_volume::SparseMemVolume;
    use crate::volume::volume_read;

    const DISK_SIZE: u64 = 10 * 1024 * 1024 * 1024;

    fn disk_volume() -> Rc<RefCell<SparseMemVolume>> {
        Rc::new(RefCell::new(SparseMemVolume::new(512, DISK_SIZE / 512)))
    }

    #[test]
    fn parameter_selection() {
        let params = FatParameters::compute(DISK_SIZE);
        assert_eq!(params.fat_type, FatType::Fat32);
        assert_eq!(params.secs_per_cluster, 8);
        assert_eq!(params.total_clusters, 2_621_440);
        assert_eq!(params.secs_per_fat, 20_480);
        assert_eq!(params.fat_start, 32 * 512);

        let params = FatParameters::compute(1024 * 1024);
        assert_eq!(params.fat_type, FatType::Fat12);

        let params = FatParameters::compute(256 * 1024 * 1024);
        assert_eq!(params.fat_type, FatType::Fat16);
    }

    fn read_image(vol: &Rc<RefCell<SparseMemVolume>>, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        volume_read(&mut *vol.borrow_mut(), offset, &mut buf).unwrap();
        buf
    }

    #[test]
    fn empty_volume_layout() {
        let vol = disk_volume();
        let mut fatfs = FatFilesystem::new(vol.clone() as VolumeRef);
        fatfs.build_format().unwrap();

        let boot = read_image(&vol, 0, 512);
        assert_eq!(&boot[0..3], &[0xEB, 0xFE, 0x90]);
        assert_eq!(u16::from_le_bytes([boot[11], boot[12]]), 512);
        assert_eq!(boot[13], 8); // sectors per cluster
        assert_eq!(u16::from_le_bytes([boot[14], boot[15]]), 32);
        assert_eq!(boot[16], 2); // FAT copies
        assert_eq!(
            u32::from_le_bytes([boot[32], boot[33], boot[34], boot[35]]),
            (DISK_SIZE / 512) as u32
        );
        assert_eq!(
            u32::from_le_bytes([boot[36], boot[37], boot[38], boot[39]]),
            20_480
        );
        assert_eq!(&boot[82..90], b"FAT32   ");
        assert_eq!(&boot[510..512], &[0x55, 0xAA]);

        // backup copy at sector 6
        assert_eq!(read_image(&vol, 6 * 512, 512), boot);

        // FSInfo sector
        let info = read_image(&vol, 512, 512);
        assert_eq!(&info[0..4], &0x41615252u32.to_le_bytes());
        assert_eq!(&info[484..488], &0x61417272u32.to_le_bytes());
        // one cluster in use by the empty root
        assert_eq!(&info[492..496], &3u32.to_le_bytes());

        // FAT starts with media descriptor and two end markers, then the
        // root directory chain terminator
        let fat = read_image(&vol, 32 * 512, 16);
        assert_eq!(&fat[0..4], &[0xF0, 0xFF, 0xFF, 0x0F]);
        assert_eq!(&fat[4..8], &[0xFF, 0xFF, 0xFF, 0x0F]);
        assert_eq!(&fat[8..12], &0x0FFFFFFFu32.to_le_bytes());
        assert_eq!(&fat[12..16], &[0, 0, 0, 0]);

        // second FAT copy
        let fat2 = read_image(&vol, 32 * 512 + 20_480 * 512, 16);
        assert_eq!(fat, fat2);
    }

    #[test]
    fn directory_and_file_layout() {
        let vol = disk_volume();
        let mut fatfs = FatFilesystem::new(vol.clone() as VolumeRef);

        {
            let fstree = fatfs.fstree();
            let mut fs = fstree.borrow_mut();
            fs.add_directory("/dev").unwrap();
            fs.add_directory("/usr/bin").unwrap();
            fs.add_directory("/usr/lib").unwrap();

            let f = fs.add_file("/home/hello.txt").unwrap();
            fs.file_append(f, Some(b"Hello, world!\n"), 14).unwrap();
            fs.node_mut(f).ctime = 1057318662;
            fs.node_mut(f).mtime = 1175378400;

            fs.add_file("/home/really-long-filename-for-dos.txt").unwrap();

            let f = fs.add_file("/tmp/bye.txt").unwrap();
            fs.file_append(f, Some("再见!\n".as_bytes()), 8).unwrap();

            fs.add_file("/etc/empty.cfg").unwrap();

            let f = fs.add_file("/tmp/sparse.bin").unwrap();
            fs.file_append(f, None, 16384).unwrap();
        }

        fatfs.build_format().unwrap();

        let data_region = (32 + 2 * 20_480) * 512u64;
        let cluster = 8 * 512u64;

        let entry_cluster = |ent: &[u8]| -> u64 {
            let lo = u16::from_le_bytes([ent[26], ent[27]]) as u64;
            let hi = u16::from_le_bytes([ent[20], ent[21]]) as u64;
            (hi << 16) | lo
        };

        // root directory in cluster 2, sorted, every lowercase name gets a
        // long entry followed by its 8.3 entry
        let root = read_image(&vol, data_region, 512);
        assert_eq!(root[0], 0x41);
        assert_eq!(root[11], 0x0F);
        assert_eq!(&root[32..40], b"DEV     ");
        assert_eq!(root[32 + 11], 0x10);
        assert_eq!(&root[96..104], b"ETC     ");
        assert_eq!(&root[160..168], b"HOME    ");
        assert_eq!(&root[224..232], b"TMP     ");
        assert_eq!(&root[288..296], b"USR     ");
        assert!(root[320..352].iter().all(|b| *b == 0));

        // every non-root directory starts with dot entries pointing at
        // itself and its parent
        let dev_cluster = entry_cluster(&root[32..64]);
        let dev = read_image(&vol, data_region + (dev_cluster - 2) * cluster, 64);
        assert_eq!(&dev[0..2], b". ");
        assert_eq!(dev[11], 0x10);
        assert_eq!(entry_cluster(&dev[0..32]), dev_cluster);
        assert_eq!(&dev[32..34], b"..");
        assert_eq!(entry_cluster(&dev[32..64]), 0);

        let home_cluster = entry_cluster(&root[160..192]);
        let home = read_image(&vol, data_region + (home_cluster - 2) * cluster, 512);

        // first child after the dot entries: hello.txt, converted to upper
        // case, so one long entry precedes the short one
        assert_eq!(home[64], 0x41);
        assert_eq!(home[64 + 11], 0x0F);
        assert_eq!(&home[96..107], b"HELLO   TXT");

        // timestamps of hello.txt: packed DOS date and time
        let ctime =
            u32::from_le_bytes([home[96 + 14], home[96 + 15], home[96 + 16], home[96 + 17]]);
        assert_eq!(ctime, 0x2EE45CB5);
        let mtime_hms = u16::from_le_bytes([home[96 + 22], home[96 + 23]]);
        let mtime_ymd = u16::from_le_bytes([home[96 + 24], home[96 + 25]]);
        assert_eq!(mtime_hms, 0xB000);
        assert_eq!(mtime_ymd, 0x367F);

        // second child: 33 name characters make three long entries, the
        // first carrying the last-entry flag
        assert_eq!(home[128], 0x43);
        assert_eq!(home[160], 0x02);
        assert_eq!(home[192], 0x01);
        assert_eq!(&home[224..235], b"REALLY~1TXT");

        // the hello.txt payload lives where its entry points
        let hello_cluster = entry_cluster(&home[96..128]);
        let payload = read_image(&vol, data_region + (hello_cluster - 2) * cluster, 14);
        assert_eq!(&payload, b"Hello, world!\n");

        let size = u32::from_le_bytes([
            home[96 + 28],
            home[96 + 29],
            home[96 + 30],
            home[96 + 31],
        ]);
        assert_eq!(size, 14);

        // FAT chain of sparse.bin: four clusters, terminator at the end
        let fat = read_image(&vol, 32 * 512, 4096);
        let fat_entry = |cluster: u64| -> u32 {
            let off = cluster as usize * 4;
            u32::from_le_bytes([fat[off], fat[off + 1], fat[off + 2], fat[off + 3]])
        };

        // eight directory clusters (2..=9), then hello, bye, sparse
        for dir_cluster in 2..10 {
            assert_eq!(fat_entry(dir_cluster), 0x0FFF_FFFF);
        }
        assert_eq!(fat_entry(10), 0x0FFF_FFFF); // hello.txt
        assert_eq!(fat_entry(11), 0x0FFF_FFFF); // bye.txt
        assert_eq!(fat_entry(12), 13);
        assert_eq!(fat_entry(13), 14);
        assert_eq!(fat_entry(14), 15);
        assert_eq!(fat_entry(15), 0x0FFF_FFFF);
    }
}
