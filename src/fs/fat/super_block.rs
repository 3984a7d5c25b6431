//! The FAT32 boot sector, its backup copy and the FSInfo sector.

use crate::fs::fat::{FatParameters, SECTOR_SIZE};
use crate::util::reinterpret;
use crate::volume::{volume_write, Volume, VolumeRef};
use std::io;

const IBM_BOOT_MAGIC: u16 = 0xAA55;
const MAGIC_VOLUME_ID: u32 = 0xDECAFBAD;
const FAT_BOOT_SIG_MAGIC: u8 = 0x29;
const FAT_DRIVE_NUMBER: u8 = 0x80;

const INFO_MAGIC_1: u32 = 0x41615252;
const INFO_MAGIC_2: u32 = 0x61417272;
const INFO_MAGIC_3: u32 = 0xAA550000;

const FAT_BS_COPY_INDEX: u16 = 6;
const FAT_FS_INFO_INDEX: u16 = 1;
const FAT_MEDIA_DESCRIPTOR_DISK: u8 = 0xF8;

/// The boot sector with DOS 2.0/3.31 and FAT32 BPB fields.
#[repr(C, packed)]
struct Fat32Super {
    jump: [u8; 3],
    oem_name: [u8; 8],

    // DOS 2.0 BPB
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    num_reserved_sectors: u16,
    num_fats: u8,
    unused0: [u8; 4],
    media_descriptor: u8,
    unused1: [u8; 2],

    // DOS 3.31 BPB
    sectors_per_track: u16,
    heads_per_disk: u16,
    unused2: [u8; 4],
    total_sector_count: u32,

    // FAT32 BPB
    sectors_per_fat: u32,
    mirror_flags: u16,
    version: u16,
    root_dir_index: u32,
    fs_info_index: u16,
    boot_sec_copy_index: u16,
    unused3: [u8; 12],
    phys_drive_num: u8,
    reserved: u8,
    ext_boot_signature: u8,
    volume_id: u32,
    label: [u8; 11],
    fs_name: [u8; 8],

    boot_code: [u8; 420],

    boot_signature: u16,
}

#[repr(C, packed)]
struct Fat32InfoSector {
    magic1: u32,
    reserved0: [u8; 480],
    magic2: u32,
    num_free_clusters: u32,
    next_free_cluster: u32,
    reserved1: [u8; 12],
    magic3: u32,
}

fn space_padded<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [b' '; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

fn write_boot_sector(
    params: &FatParameters,
    volume: &VolumeRef,
    oem: &str,
    label: &str,
    sector_count: u32,
) -> io::Result<()> {
    let super_block = Fat32Super {
        jump: [0xEB, 0xFE, 0x90],
        oem_name: space_padded(oem),
        bytes_per_sector: (SECTOR_SIZE as u16).to_le(),
        sectors_per_cluster: params.secs_per_cluster as u8,
        num_reserved_sectors: ((params.fat_start / SECTOR_SIZE as u64) as u16).to_le(),
        num_fats: 2,
        unused0: [0; 4],
        media_descriptor: FAT_MEDIA_DESCRIPTOR_DISK,
        unused1: [0; 2],
        sectors_per_track: 1u16.to_le(),
        heads_per_disk: 1u16.to_le(),
        unused2: [0; 4],
        total_sector_count: sector_count.to_le(),
        sectors_per_fat: params.secs_per_fat.to_le(),
        mirror_flags: 0,
        version: 0,
        root_dir_index: 2u32.to_le(),
        fs_info_index: FAT_FS_INFO_INDEX.to_le(),
        boot_sec_copy_index: FAT_BS_COPY_INDEX.to_le(),
        unused3: [0; 12],
        phys_drive_num: FAT_DRIVE_NUMBER,
        reserved: 0,
        ext_boot_signature: FAT_BOOT_SIG_MAGIC,
        volume_id: MAGIC_VOLUME_ID.to_le(),
        label: space_padded(label),
        fs_name: *b"FAT32   ",
        boot_code: [0x90; 420],
        boot_signature: IBM_BOOT_MAGIC.to_le(),
    };

    let mut volume = volume.borrow_mut();
    volume_write(&mut *volume, 0, reinterpret(&super_block))?;
    volume_write(
        &mut *volume,
        FAT_BS_COPY_INDEX as u64 * SECTOR_SIZE as u64,
        reinterpret(&super_block),
    )
}

fn write_fs_info(
    params: &FatParameters,
    volume: &VolumeRef,
    data_offset: u64,
    sector_count: u32,
) -> io::Result<()> {
    let mut cluster_count = sector_count - (params.fat_start / SECTOR_SIZE as u64) as u32;
    cluster_count -= params.secs_per_fat * 2;
    cluster_count /= params.secs_per_cluster;

    let info = Fat32InfoSector {
        magic1: INFO_MAGIC_1.to_le(),
        reserved0: [0; 480],
        magic2: INFO_MAGIC_2.to_le(),
        num_free_clusters: (cluster_count - data_offset as u32).to_le(),
        next_free_cluster: (data_offset as u32 + 2).to_le(),
        reserved1: [0; 12],
        magic3: INFO_MAGIC_3.to_le(),
    };

    volume_write(
        &mut *volume.borrow_mut(),
        FAT_FS_INFO_INDEX as u64 * SECTOR_SIZE as u64,
        reinterpret(&info),
    )
}

/// Writes the boot sector, its backup and the FSInfo sector.
///
/// `data_offset` is the number of clusters in use by the tree.
pub fn write_super_block(
    params: &FatParameters,
    volume: &VolumeRef,
    oem: &str,
    label: &str,
    data_offset: u64,
) -> io::Result<()> {
    let size = {
        let vol = volume.borrow();
        vol.blocksize() as u64 * vol.max_block_count()
    };
    let size = size.min(crate::fs::fat::MAX_DISK_SIZE);
    let sector_count = (size / SECTOR_SIZE as u64) as u32;

    write_boot_sector(params, volume, oem, label, sector_count)?;
    write_fs_info(params, volume, data_offset, sector_count)
}
