//! Serialization of FAT directory entries, including VFAT long names.

use crate::fs::fat::conv::{convert_timestamp, mk_shortname, ShortName};
use crate::fs::fat::FatParameters;
use crate::fstree::{FsTree, NodeData, NodeId};
use crate::stream::OStream;
use std::io;
use std::io::Error;

const DIR_ENT_DIRECTORY: u8 = 0x10;
const DIR_ENT_LFN: u8 = 0x0F;

/// Characters per VFAT long entry.
const CHARS_PER_LONG_ENT: usize = 13;
const SEQ_NUMBER_LAST_FLAG: u8 = 0x40;

fn short_name_checksum(shortname: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;

    for byte in shortname {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(*byte);
    }

    sum
}

/// One 32-byte directory entry.
fn write_short_entry(
    params: &FatParameters,
    fs: &FsTree,
    id: NodeId,
    out: &mut dyn OStream,
    shortname: &[u8; 11],
) -> io::Result<()> {
    let node = fs.node(id);

    let (location, size, flags) = match &node.data {
        NodeData::Dir { start, size, .. } => (
            params.cluster_index(*start),
            *size as u32,
            DIR_ENT_DIRECTORY,
        ),
        NodeData::File {
            size, start_index, ..
        } => (*start_index as u32 + 2, *size as u32, 0),
        _ => {
            return Err(Error::other(format!(
                "{}: cannot store non-file entry on FAT filesystem",
                fs.get_path(id)
            )));
        }
    };

    let ctime = convert_timestamp(node.ctime as i64);
    let mtime = convert_timestamp(node.mtime as i64);

    let mut ent = [0u8; 32];
    ent[0..8].copy_from_slice(&shortname[0..8]);
    ent[8..11].copy_from_slice(&shortname[8..11]);
    ent[11] = flags;
    ent[14..16].copy_from_slice(&(ctime as u16).to_le_bytes());
    ent[16..18].copy_from_slice(&((ctime >> 16) as u16).to_le_bytes());
    ent[18..20].copy_from_slice(&((mtime >> 16) as u16).to_le_bytes());
    ent[20..22].copy_from_slice(&((location >> 16) as u16).to_le_bytes());
    ent[22..24].copy_from_slice(&(mtime as u16).to_le_bytes());
    ent[24..26].copy_from_slice(&((mtime >> 16) as u16).to_le_bytes());
    ent[26..28].copy_from_slice(&(location as u16).to_le_bytes());
    ent[28..32].copy_from_slice(&size.to_le_bytes());

    out.append(&ent)
}

/// The chain of VFAT long-name entries for one name, highest sequence
/// number first, carrying the UTF-16 form of the name.
fn write_long_entry(
    out: &mut dyn OStream,
    name: &str,
    shortname: &[u8; 11],
) -> io::Result<()> {
    let checksum = short_name_checksum(shortname);

    let mut units: Vec<u16> = name.encode_utf16().collect();
    units.push(0);

    let count = units.len().div_ceil(CHARS_PER_LONG_ENT);

    for i in 0..count {
        let offset = (count - 1 - i) * CHARS_PER_LONG_ENT;
        let avail = (units.len() - offset).min(CHARS_PER_LONG_ENT);

        let mut ent = [0u8; 32];
        ent[0] = (count - i) as u8;
        if i == 0 {
            ent[0] |= SEQ_NUMBER_LAST_FLAG;
        }
        ent[11] = DIR_ENT_LFN;
        ent[13] = checksum;

        // 5 + 6 + 2 slots, unused ones filled with 0xFFFF
        for j in 0..CHARS_PER_LONG_ENT {
            let slot = match j {
                0..=4 => 1 + j * 2,
                5..=10 => 14 + (j - 5) * 2,
                _ => 28 + (j - 11) * 2,
            };

            let unit = if j < avail { units[offset + j] } else { 0xFFFF };
            ent[slot..slot + 2].copy_from_slice(&unit.to_le_bytes());
        }

        out.append(&ent)?;
    }

    Ok(())
}

/// Writes the `.` and `..` entries of a non-root directory.
fn init_directory(
    params: &FatParameters,
    fs: &FsTree,
    id: NodeId,
    out: &mut dyn OStream,
) -> io::Result<()> {
    let node = fs.node(id);
    let Some(parent) = node.parent else {
        return Ok(());
    };

    let self_start = match &node.data {
        NodeData::Dir { start, .. } => *start,
        _ => unreachable!(),
    };

    let mut ent = [0u8; 32];
    ent[0..11].fill(b' ');
    ent[11] = DIR_ENT_DIRECTORY;

    // dot entry
    ent[0] = b'.';
    let location = params.cluster_index(self_start);
    ent[20..22].copy_from_slice(&((location >> 16) as u16).to_le_bytes());
    ent[26..28].copy_from_slice(&(location as u16).to_le_bytes());
    out.append(&ent)?;

    // dot-dot entry
    ent[1] = b'.';
    let location = if fs.node(parent).parent.is_none() {
        0
    } else {
        match &fs.node(parent).data {
            NodeData::Dir { start, .. } => params.cluster_index(*start),
            _ => unreachable!(),
        }
    };
    ent[20..22].copy_from_slice(&((location >> 16) as u16).to_le_bytes());
    ent[26..28].copy_from_slice(&(location as u16).to_le_bytes());
    out.append(&ent)
}

/// Serializes the contents of one directory.
///
/// Short names are deduplicated per directory via `~N` generation suffixes;
/// converted or suffixed names additionally get a long-entry chain.
pub fn serialize_directory(
    params: &FatParameters,
    fs: &FsTree,
    id: NodeId,
    out: &mut dyn OStream,
) -> io::Result<()> {
    init_directory(params, fs, id, out)?;

    let mut used_names: Vec<[u8; 11]> = Vec::new();

    for child in fs.node(id).children() {
        let name = fs.node(*child).name.clone();
        let mut shortname = [0u8; 11];
        let mut gen = 1;

        let conv = loop {
            let conv = mk_shortname(&name, &mut shortname, gen).ok_or_else(|| {
                Error::other(format!("{}: cannot convert to a FAT filename", name))
            })?;

            if !used_names.contains(&shortname) {
                break conv;
            }
            gen += 1;
        };

        used_names.push(shortname);

        if conv != ShortName::Same {
            write_long_entry(out, &name, &shortname)?;
        }

        write_short_entry(params, fs, *child, out, &shortname)?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::NullOstream;

    #[test]
    fn checksum_reference() {
        // classic reference value for an all-space name with 'A'
        let name = *b"A          ";
        let sum = short_name_checksum(&name);

        let mut expect: u8 = 0;
        for b in name {
            expect = ((expect & 1) << 7).wrapping_add(expect >> 1).wrapping_add(b);
        }
        assert_eq!(sum, expect);
    }

    #[test]
    fn long_entry_sequence() {
        let mut strm = NullOstream::default();
        let shortname = *b"REALLY~1TXT";

        // 32 chars + NUL -> 3 entries
        write_long_entry(
            &mut strm,
            "really-long-filename-for-dos.txt",
            &shortname,
        )
        .unwrap();
        assert_eq!(strm.bytes_written, 3 * 32);
    }
}
