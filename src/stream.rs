//! Append-only output streams used while serializing filesystem metadata.

use crate::volume::{volume_write, volume_write_zeros, VolumeRef};
use std::io;
use std::io::Error;

/// An append-only byte sink.
pub trait OStream {
    /// Appends a block of data.
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Appends `size` zero bytes.
    fn append_sparse(&mut self, size: u64) -> io::Result<()>;
}

/// A sink that discards everything and only counts the bytes written.
///
/// Serializers run their output through this first to learn how much room to
/// reserve before writing for real.
#[derive(Default)]
pub struct NullOstream {
    pub bytes_written: u64,
}

impl OStream for NullOstream {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn append_sparse(&mut self, size: u64) -> io::Result<()> {
        self.bytes_written += size;
        Ok(())
    }
}

/// A write-only view onto a fixed byte range of a volume.
///
/// Writing past the end of the range fails.
pub struct VolumeOstream {
    volume: VolumeRef,
    name: String,

    offset: u64,
    written: u64,
    max_size: u64,
}

impl VolumeOstream {
    /// Binds the byte range `[offset, offset + max_size)` of `volume`.
    ///
    /// `name` is used in error messages.
    pub fn new(volume: VolumeRef, name: &str, offset: u64, max_size: u64) -> Self {
        Self {
            volume,
            name: name.to_owned(),
            offset,
            written: 0,
            max_size,
        }
    }

    fn grab_range(&mut self, size: u64) -> io::Result<u64> {
        if self.written >= self.max_size || size > self.max_size - self.written {
            return Err(Error::other(format!(
                "{}: no space left on the underlying volume",
                self.name
            )));
        }

        let pos = self.offset + self.written;
        self.written += size;
        Ok(pos)
    }
}

impl OStream for VolumeOstream {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let pos = self.grab_range(data.len() as u64)?;
        volume_write(&mut *self.volume.borrow_mut(), pos, data)
    }

    fn append_sparse(&mut self, size: u64) -> io::Result<()> {
        if size == 0 {
            return Ok(());
        }

        let pos = self.grab_range(size)?;
        volume_write_zeros(&mut *self.volume.borrow_mut(), pos, size)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::volume::test_volume::MemVolume;
    use crate::volume::volume_read;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn null_counts() {
        let mut strm = NullOstream::default();

        strm.append(b"abc").unwrap();
        strm.append_sparse(5).unwrap();
        assert_eq!(strm.bytes_written, 8);
    }

    #[test]
    fn volume_stream_bounded() {
        let vol: VolumeRef = Rc::new(RefCell::new(MemVolume::new(4, 8)));
        let mut strm = VolumeOstream::new(vol.clone(), "test", 2, 6);

        strm.append(b"abcd").unwrap();
        strm.append(b"ef").unwrap();
        assert!(strm.append(b"g").is_err());

        let mut buf = [0u8; 8];
        volume_read(&mut *vol.borrow_mut(), 1, &mut buf).unwrap();
        assert_eq!(&buf[1..7], b"abcdef");
    }
}
