//! A stackable source that filters records by glob patterns.

use crate::source::{FileSource, FileSourceRecord, RecordStream};
use std::ffi::CString;
use std::io;

/// What to do with a record whose path matches a rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterRule {
    Allow,
    Discard,
}

struct Rule {
    pattern: CString,
    target: FilterRule,
}

/// Wraps nested sources and applies an ordered list of glob rules to every
/// record. The first matching rule decides; records matching no rule are
/// dropped.
#[derive(Default)]
pub struct FilterSource {
    sources: Vec<Box<dyn FileSource>>,
    current: usize,
    rules: Vec<Rule>,
}

impl FilterSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_nested(&mut self, source: Box<dyn FileSource>) {
        self.sources.push(source);
    }

    pub fn add_glob_rule(&mut self, pattern: &str, target: FilterRule) -> io::Result<()> {
        let pattern = CString::new(pattern)
            .map_err(|_| io::Error::other("glob pattern contains a NUL byte"))?;

        self.rules.push(Rule { pattern, target });
        Ok(())
    }

    fn matches(&self, path: &str) -> Option<FilterRule> {
        let path = CString::new(path).ok()?;

        for rule in &self.rules {
            let ret = unsafe { libc::fnmatch(rule.pattern.as_ptr(), path.as_ptr(), 0) };
            if ret == 0 {
                return Some(rule.target);
            }
        }

        None
    }
}

impl FileSource for FilterSource {
    fn next_record(
        &mut self,
    ) -> io::Result<Option<(FileSourceRecord, Option<RecordStream>)>> {
        while self.current < self.sources.len() {
            let Some((record, stream)) = self.sources[self.current].next_record()? else {
                self.current += 1;
                continue;
            };

            if self.matches(&record.full_path) == Some(FilterRule::Allow) {
                return Ok(Some((record, stream)));
            }

            // discarded and unmatched records are dropped along with their
            // stream
            drop(stream);
        }

        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::ListingSource;

    fn listing() -> ListingSource {
        let mut listing = ListingSource::new("/nonexistent");
        listing.add_line("dir /usr/bin 0755 0 0", "t").unwrap();
        listing.add_line("dir /usr/share/doc 0755 0 0", "t").unwrap();
        listing.add_line("dir /var/log 0755 0 0", "t").unwrap();
        listing
    }

    fn drain(filter: &mut FilterSource) -> Vec<String> {
        let mut out = Vec::new();
        while let Some((rec, _)) = filter.next_record().unwrap() {
            out.push(rec.full_path);
        }
        out
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut filter = FilterSource::new();
        filter.add_nested(Box::new(listing()));
        filter.add_glob_rule("usr/share/*", FilterRule::Discard).unwrap();
        filter.add_glob_rule("usr*", FilterRule::Allow).unwrap();
        filter.add_glob_rule("*", FilterRule::Allow).unwrap();

        assert_eq!(drain(&mut filter), ["usr/bin", "var/log"]);
    }

    #[test]
    fn unmatched_records_are_dropped() {
        let mut filter = FilterSource::new();
        filter.add_nested(Box::new(listing()));
        filter.add_glob_rule("var*", FilterRule::Allow).unwrap();

        assert_eq!(drain(&mut filter), ["var/log"]);
    }
}
