//! The top level build state: output volume, dependency tracker and mount
//! groups.

use crate::deptracker::DepTracker;
use crate::mbr::MbrPartitionManager;
use crate::sink::FileSink;
use crate::source::{AggregateSource, FileSource};
use crate::volume::{FileVolume, VolumeRef};
use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io;
use std::rc::Rc;

/// A pair of data source(s) and a dispatching sink.
///
/// A group with a single source streams it directly; additional sources are
/// transparently concatenated.
#[derive(Default)]
pub struct MountGroup {
    pub sink: FileSink,
    sources: Vec<Box<dyn FileSource>>,
}

impl MountGroup {
    pub fn add_source(&mut self, source: Box<dyn FileSource>) {
        self.sources.push(source);
    }

    fn process(&mut self) -> io::Result<()> {
        let mut sources = std::mem::take(&mut self.sources);

        match sources.len() {
            0 => Ok(()),
            1 => self.sink.add_data(sources[0].as_mut()),
            _ => {
                let mut aggregate = AggregateSource::new();
                for source in sources {
                    aggregate.add_nested(source);
                }
                self.sink.add_data(&mut aggregate)
            }
        }
    }
}

/// Everything a build accumulates before committing.
pub struct BuildState {
    pub tracker: DepTracker,

    /// The output file, typed for size-bound configuration.
    pub out_file: Rc<RefCell<FileVolume>>,
    /// The same volume as the root of the stacking hierarchy.
    pub out_volume: VolumeRef,

    pub mount_groups: Vec<MountGroup>,
    pub partition_managers: Vec<MbrPartitionManager>,
}

impl BuildState {
    /// Creates the output file (it must not exist yet) and registers it as
    /// the bottom of the volume hierarchy.
    pub fn new(out_path: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(out_path)
            .map_err(|err| io::Error::new(err.kind(), format!("{}: {}", out_path, err)))?;

        let out_file = Rc::new(RefCell::new(FileVolume::new(out_path, file, u64::MAX)?));
        let out_volume = out_file.clone() as VolumeRef;

        let mut tracker = DepTracker::new();
        tracker.add_volume(&out_volume, None);

        Ok(Self {
            tracker,
            out_file,
            out_volume,
            mount_groups: Vec::new(),
            partition_managers: Vec::new(),
        })
    }

    pub fn add_mount_group(&mut self) -> &mut MountGroup {
        self.mount_groups.push(MountGroup::default());
        self.mount_groups.last_mut().unwrap()
    }

    /// Streams every mount group through its sink, then commits the whole
    /// dependency graph and finally the partition tables.
    pub fn process(&mut self) -> io::Result<()> {
        for group in self.mount_groups.iter_mut() {
            group.process()?;
        }

        self.tracker.commit()?;

        for mgr in self.partition_managers.iter_mut() {
            mgr.commit()?;
        }

        Ok(())
    }
}
