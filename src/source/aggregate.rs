//! A stackable source that concatenates the streams of its children.

use crate::source::{FileSource, FileSourceRecord, RecordStream};
use std::io;

/// Emits the records of every nested source, in insertion order.
#[derive(Default)]
pub struct AggregateSource {
    sources: Vec<Box<dyn FileSource>>,
    current: usize,
}

impl AggregateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_nested(&mut self, source: Box<dyn FileSource>) {
        self.sources.push(source);
    }
}

impl FileSource for AggregateSource {
    fn next_record(
        &mut self,
    ) -> io::Result<Option<(FileSourceRecord, Option<RecordStream>)>> {
        while self.current < self.sources.len() {
            if let Some(entry) = self.sources[self.current].next_record()? {
                return Ok(Some(entry));
            }

            self.current += 1;
        }

        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::ListingSource;

    #[test]
    fn concatenates_in_order() {
        let mut first = ListingSource::new("/nonexistent");
        first.add_line("dir /a 0755 0 0", "t").unwrap();
        first.add_line("dir /b 0755 0 0", "t").unwrap();

        let mut second = ListingSource::new("/nonexistent");
        second.add_line("dir /c 0755 0 0", "t").unwrap();

        let mut aggregate = AggregateSource::new();
        aggregate.add_nested(Box::new(first));
        aggregate.add_nested(Box::new(second));

        let mut paths = Vec::new();
        while let Some((rec, _)) = aggregate.next_record().unwrap() {
            paths.push(rec.full_path);
        }

        assert_eq!(paths, ["a", "b", "c"]);
    }

    #[test]
    fn empty_aggregate() {
        let mut aggregate = AggregateSource::new();
        assert!(aggregate.next_record().unwrap().is_none());
    }
}
