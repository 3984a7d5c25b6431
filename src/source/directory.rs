//! Scans a host directory tree, emitting records in depth-first order.

use crate::source::{FileSource, FileSourceRecord, RecordStream, RecordType};
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

struct DirLevel {
    iter: fs::ReadDir,
    /// Relative path prefix of this level, ending in `/` except at the top.
    prefix: String,
}

/// A source that walks a directory on the build host.
pub struct DirectorySource {
    base: PathBuf,
    stack: Vec<DirLevel>,
}

impl DirectorySource {
    pub fn new(path: &str) -> io::Result<Self> {
        let base = PathBuf::from(path);
        let iter = fs::read_dir(&base)?;

        Ok(Self {
            base,
            stack: vec![DirLevel {
                iter,
                prefix: String::new(),
            }],
        })
    }

    fn create_record(
        &self,
        full_path: String,
        meta: &fs::Metadata,
    ) -> io::Result<FileSourceRecord> {
        let file_type = meta.file_type();

        let record_type = if file_type.is_block_device() {
            RecordType::BlockDev
        } else if file_type.is_char_device() {
            RecordType::CharDev
        } else if file_type.is_file() {
            RecordType::File
        } else if file_type.is_symlink() {
            RecordType::Symlink
        } else if file_type.is_dir() {
            RecordType::Dir
        } else if file_type.is_fifo() {
            RecordType::Fifo
        } else if file_type.is_socket() {
            RecordType::Socket
        } else {
            return Err(io::Error::other(format!(
                "{}: unknown file type",
                full_path
            )));
        };

        let link_target = if record_type == RecordType::Symlink {
            let target = fs::read_link(self.base.join(&full_path))?;
            Some(target.to_string_lossy().into_owned())
        } else {
            None
        };

        Ok(FileSourceRecord {
            record_type,
            permissions: (meta.mode() & 0o7777) as u16,
            uid: meta.uid(),
            gid: meta.gid(),
            devno: meta.rdev() as u32,
            ctime: meta.ctime().max(0) as u64,
            mtime: meta.mtime().max(0) as u64,
            size: meta.len(),
            full_path,
            link_target,
        })
    }
}

impl FileSource for DirectorySource {
    fn next_record(
        &mut self,
    ) -> io::Result<Option<(FileSourceRecord, Option<RecordStream>)>> {
        loop {
            let Some(level) = self.stack.last_mut() else {
                return Ok(None);
            };

            let Some(entry) = level.iter.next() else {
                self.stack.pop();
                continue;
            };
            let entry = entry?;

            let name = entry.file_name();
            let name = name.to_string_lossy();
            let full_path = format!("{}{}", level.prefix, name);

            let meta = fs::symlink_metadata(entry.path())?;
            let record = self.create_record(full_path.clone(), &meta)?;

            let mut stream: Option<RecordStream> = None;

            if meta.file_type().is_file() {
                stream = Some(Box::new(fs::File::open(entry.path())?));
            } else if meta.file_type().is_dir() {
                let iter = fs::read_dir(entry.path())?;
                self.stack.push(DirLevel {
                    iter,
                    prefix: format!("{}/", full_path),
                });
            }

            return Ok(Some((record, stream)));
        }
    }
}
