//! Parses the layout description and wires up the build state.
//!
//! The grammar is line oriented: a keyword, an optional (possibly quoted)
//! argument and an optional `{` opening a nested block that a lone `}`
//! closes. `#` starts a comment line.

use crate::fs::{CpioFilesystem, FatFilesystem, Filesystem, FilesystemRef, TarFilesystem};
use crate::fstree::FstreeFileVolume;
use crate::mbr::{
    MbrPartitionManager, MBR_PARTITION_TYPES, PARTITION_FLAG_BOOTABLE, PARTITION_FLAG_FILL,
    PARTITION_FLAG_GROW, PARTITION_TYPE_SHIFT,
};
use crate::source::{
    DirectorySource, FilterRule, FilterSource, ListingSource, TarSource,
};
use crate::state::{BuildState, MountGroup};
use crate::volume::{Volume, VolumeRef};
use std::cell::RefCell;
use std::io;
use std::io::Error;
use std::rc::Rc;

/// A parsed configuration line: keyword, optional argument, block opener.
struct Line<'a> {
    keyword: &'a str,
    arg: Option<String>,
    opens_block: bool,
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    pos: usize,
}

/// A concrete filesystem handle, kept typed so format specific keywords can
/// reach their driver.
enum FsHandle {
    Tar(Rc<RefCell<TarFilesystem>>),
    Cpio(Rc<RefCell<CpioFilesystem>>),
    Fat(Rc<RefCell<FatFilesystem>>),
}

impl FsHandle {
    fn as_filesystem(&self) -> FilesystemRef {
        match self {
            FsHandle::Tar(fs) => fs.clone(),
            FsHandle::Cpio(fs) => fs.clone(),
            FsHandle::Fat(fs) => fs.clone(),
        }
    }
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().collect(),
            pos: 0,
        }
    }

    fn error(&self, msg: &str) -> Error {
        Error::other(format!("line {}: {}", self.pos, msg))
    }

    /// Returns the next line of interest, skipping blanks and comments.
    /// `None` means end of input.
    fn next_raw(&mut self) -> Option<&'a str> {
        while self.pos < self.lines.len() {
            let line = self.lines[self.pos].trim();
            self.pos += 1;

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            return Some(line);
        }

        None
    }

    fn parse_line(&self, raw: &'a str) -> io::Result<Line<'a>> {
        let mut rest = raw;

        let end = rest
            .find(|c: char| c.is_whitespace() || c == '{')
            .unwrap_or(rest.len());
        let keyword = &rest[..end];
        rest = rest[end..].trim_start();

        let mut arg = None;

        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(close) = stripped.find('"') else {
                return Err(self.error("missing '\"'"));
            };
            arg = Some(stripped[..close].to_owned());
            rest = stripped[close + 1..].trim_start();
        } else if !rest.is_empty() && !rest.starts_with('{') {
            let end = rest
                .find(|c: char| c.is_whitespace() || c == '{')
                .unwrap_or(rest.len());
            arg = Some(rest[..end].to_owned());
            rest = rest[end..].trim_start();
        }

        let opens_block = match rest {
            "" => false,
            "{" => true,
            _ => return Err(self.error("unexpected trailing input")),
        };

        Ok(Line {
            keyword,
            arg,
            opens_block,
        })
    }
}

/// Parses a size with an optional `K`/`M`/`G`/`T` suffix.
fn parse_size(text: &str) -> Option<u64> {
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    if digits_end == 0 {
        return None;
    }

    let value: u64 = text[..digits_end].parse().ok()?;

    let shift = match &text[digits_end..] {
        "" => 0,
        "K" | "k" => 10,
        "M" | "m" => 20,
        "G" | "g" => 30,
        "T" | "t" => 40,
        _ => return None,
    };

    value.checked_shl(shift)
}

fn require_arg(parser: &Parser, line: &Line) -> io::Result<String> {
    line.arg
        .clone()
        .ok_or_else(|| parser.error(&format!("`{}` expects an argument", line.keyword)))
}

fn create_filesystem(
    parser: &Parser,
    state: &mut BuildState,
    keyword: &str,
    name: &str,
    volume: &VolumeRef,
) -> io::Result<FsHandle> {
    let handle = match keyword {
        "tar" => FsHandle::Tar(Rc::new(RefCell::new(TarFilesystem::new(volume.clone())))),
        "cpio" => FsHandle::Cpio(Rc::new(RefCell::new(CpioFilesystem::new(volume.clone())))),
        "fat" => FsHandle::Fat(Rc::new(RefCell::new(FatFilesystem::new(volume.clone())))),
        _ => return Err(parser.error(&format!("unknown filesystem `{}`", keyword))),
    };

    state
        .tracker
        .add_fs(&handle.as_filesystem(), volume, name);
    Ok(handle)
}

fn is_fs_keyword(keyword: &str) -> bool {
    matches!(keyword, "tar" | "cpio" | "fat")
}

/// Parses the body of a `<fs-type> "<name>" { ... }` block: `volumefile`
/// entries that nest further filesystems, plus format specific options.
fn parse_fs_block(parser: &mut Parser, state: &mut BuildState, fs: &FsHandle) -> io::Result<()> {
    while let Some(raw) = parser.next_raw() {
        if raw == "}" {
            return Ok(());
        }

        let line = parser.parse_line(raw)?;

        match line.keyword {
            "volumefile" => {
                let path = require_arg(parser, &line)?;

                let fstree = fs.as_filesystem().borrow().fstree();
                let node = fstree
                    .borrow_mut()
                    .add_file(&path)
                    .map_err(|err| parser.error(&format!("{}: {}", path, err)))?;

                let blocksize = fstree.borrow().volume.borrow().blocksize();
                let volume = Rc::new(RefCell::new(
                    FstreeFileVolume::new(fstree, node, blocksize, 0, u64::MAX)
                        .map_err(|err| parser.error(&format!("{}: {}", path, err)))?,
                )) as VolumeRef;

                state
                    .tracker
                    .add_volume_file(&volume, &fs.as_filesystem());

                if line.opens_block {
                    parse_volume_body(parser, state, &volume)?;
                }
            }
            "label" => {
                let label = require_arg(parser, &line)?;
                match fs {
                    FsHandle::Fat(fat) => fat
                        .borrow_mut()
                        .set_label(&label)
                        .map_err(|err| parser.error(&err.to_string()))?,
                    _ => return Err(parser.error("`label` is only valid on fat filesystems")),
                }
            }
            "oem" => {
                let oem = require_arg(parser, &line)?;
                match fs {
                    FsHandle::Fat(fat) => fat
                        .borrow_mut()
                        .set_oem(&oem)
                        .map_err(|err| parser.error(&err.to_string()))?,
                    _ => return Err(parser.error("`oem` is only valid on fat filesystems")),
                }
            }
            other => return Err(parser.error(&format!("unknown keyword `{}`", other))),
        }
    }

    Err(parser.error("missing '}'"))
}

/// Parses filesystem declarations on a volume.
fn parse_volume_body(
    parser: &mut Parser,
    state: &mut BuildState,
    volume: &VolumeRef,
) -> io::Result<()> {
    while let Some(raw) = parser.next_raw() {
        if raw == "}" {
            return Ok(());
        }

        let line = parser.parse_line(raw)?;

        if !is_fs_keyword(line.keyword) {
            return Err(parser.error(&format!("unknown keyword `{}`", line.keyword)));
        }

        let name = require_arg(parser, &line)?;
        let fs = create_filesystem(parser, state, line.keyword, &name, volume)?;

        if line.opens_block {
            parse_fs_block(parser, state, &fs)?;
        }
    }

    Err(parser.error("missing '}'"))
}

/// Parses the body of the `raw { ... }` output volume block: optional size
/// bounds plus filesystem declarations.
fn parse_raw_volume(parser: &mut Parser, state: &mut BuildState) -> io::Result<()> {
    while let Some(raw) = parser.next_raw() {
        if raw == "}" {
            return Ok(());
        }

        let line = parser.parse_line(raw)?;

        match line.keyword {
            "minsize" => {
                let arg = require_arg(parser, &line)?;
                let size = parse_size(&arg)
                    .ok_or_else(|| parser.error(&format!("invalid size `{}`", arg)))?;
                state.out_file.borrow_mut().set_min_size(size);
            }
            "maxsize" => {
                let arg = require_arg(parser, &line)?;
                let size = parse_size(&arg)
                    .ok_or_else(|| parser.error(&format!("invalid size `{}`", arg)))?;
                state.out_file.borrow_mut().set_max_size(size);
            }
            keyword if is_fs_keyword(keyword) => {
                let name = require_arg(parser, &line)?;
                let volume = state.out_volume.clone();
                let fs = create_filesystem(parser, state, keyword, &name, &volume)?;

                if line.opens_block {
                    parse_fs_block(parser, state, &fs)?;
                }
            }
            other => return Err(parser.error(&format!("unknown keyword `{}`", other))),
        }
    }

    Err(parser.error("missing '}'"))
}

/// Parses a `partition { ... }` block of a `dosmbr` disk.
fn parse_partition(
    parser: &mut Parser,
    state: &mut BuildState,
    mgr: &mut MbrPartitionManager,
) -> io::Result<()> {
    let mut size = 0u64;
    let mut flags = 0u64;
    let mut volume: Option<VolumeRef> = None;

    while let Some(raw) = parser.next_raw() {
        if raw == "}" {
            if volume.is_none() {
                let part = mgr
                    .create_partition(size / 512, flags)
                    .map_err(|err| parser.error(&err.to_string()))?;
                let parent = state.out_volume.clone();
                state.tracker.add_volume(&part, Some(&parent));
            }
            return Ok(());
        }

        let line = parser.parse_line(raw)?;

        if is_fs_keyword(line.keyword) {
            if volume.is_none() {
                let part = mgr
                    .create_partition(size / 512, flags)
                    .map_err(|err| parser.error(&err.to_string()))?;
                let parent = state.out_volume.clone();
                state.tracker.add_volume(&part, Some(&parent));
                volume = Some(part);
            }
            let part = volume.clone().unwrap();

            let name = require_arg(parser, &line)?;
            let fs = create_filesystem(parser, state, line.keyword, &name, &part)?;

            if line.opens_block {
                parse_fs_block(parser, state, &fs)?;
            }
            continue;
        }

        if volume.is_some() {
            return Err(parser.error("partition properties must precede filesystems"));
        }

        match line.keyword {
            "size" => {
                let arg = require_arg(parser, &line)?;
                size = parse_size(&arg)
                    .ok_or_else(|| parser.error(&format!("invalid size `{}`", arg)))?;
            }
            "grow" => flags |= PARTITION_FLAG_GROW,
            "fill" => flags |= PARTITION_FLAG_FILL,
            "bootable" => flags |= PARTITION_FLAG_BOOTABLE,
            "type" => {
                let arg = require_arg(parser, &line)?;
                let value = MBR_PARTITION_TYPES
                    .iter()
                    .find(|(name, _)| *name == arg)
                    .map(|(_, value)| *value)
                    .ok_or_else(|| {
                        parser.error(&format!("unknown partition type `{}`", arg))
                    })?;
                flags |= (value as u64) << PARTITION_TYPE_SHIFT;
            }
            other => return Err(parser.error(&format!("unknown keyword `{}`", other))),
        }
    }

    Err(parser.error("missing '}'"))
}

fn parse_dosmbr(parser: &mut Parser, state: &mut BuildState) -> io::Result<()> {
    let mut mgr = MbrPartitionManager::new(state.out_volume.clone());

    while let Some(raw) = parser.next_raw() {
        if raw == "}" {
            state.partition_managers.push(mgr);
            return Ok(());
        }

        let line = parser.parse_line(raw)?;

        match line.keyword {
            "partition" if line.opens_block => parse_partition(parser, state, &mut mgr)?,
            other => return Err(parser.error(&format!("unknown keyword `{}`", other))),
        }
    }

    Err(parser.error("missing '}'"))
}

/// Parses the raw lines of a `listing "<dir>" { ... }` block.
fn parse_listing_block(parser: &mut Parser, listing: &mut ListingSource) -> io::Result<()> {
    while parser.pos < parser.lines.len() {
        let raw = parser.lines[parser.pos].trim();
        parser.pos += 1;

        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        if raw == "}" {
            return Ok(());
        }

        listing.add_line(raw, &format!("line {}", parser.pos))?;
    }

    Err(parser.error("missing '}'"))
}

fn parse_filter_block(parser: &mut Parser, filter: &mut FilterSource) -> io::Result<()> {
    while let Some(raw) = parser.next_raw() {
        if raw == "}" {
            return Ok(());
        }

        let line = parser.parse_line(raw)?;

        match line.keyword {
            "allow" => {
                let pattern = require_arg(parser, &line)?;
                filter
                    .add_glob_rule(&pattern, FilterRule::Allow)
                    .map_err(|err| parser.error(&err.to_string()))?;
            }
            "discard" => {
                let pattern = require_arg(parser, &line)?;
                filter
                    .add_glob_rule(&pattern, FilterRule::Discard)
                    .map_err(|err| parser.error(&err.to_string()))?;
            }
            _ => {
                if let Some(source) = parse_source_line(parser, &line)? {
                    filter.add_nested(source);
                } else {
                    return Err(
                        parser.error(&format!("unknown keyword `{}`", line.keyword))
                    );
                }
            }
        }
    }

    Err(parser.error("missing '}'"))
}

/// Creates a source from one configuration line, recursing into nested
/// blocks. Returns `None` if the keyword is not a source.
fn parse_source_line(
    parser: &mut Parser,
    line: &Line,
) -> io::Result<Option<Box<dyn crate::source::FileSource>>> {
    match line.keyword {
        "listing" => {
            let dir = line.arg.clone().unwrap_or_else(|| ".".to_owned());
            let mut listing = ListingSource::new(&dir);

            if line.opens_block {
                parse_listing_block(parser, &mut listing)?;
            }

            Ok(Some(Box::new(listing)))
        }
        "dirscan" => {
            let path = require_arg(parser, line)?;
            let source = DirectorySource::new(&path)
                .map_err(|err| parser.error(&format!("{}: {}", path, err)))?;
            Ok(Some(Box::new(source)))
        }
        "tarunpack" => {
            let path = require_arg(parser, line)?;
            let source = TarSource::new(&path)
                .map_err(|err| parser.error(&format!("{}: {}", path, err)))?;
            Ok(Some(Box::new(source)))
        }
        "filter" => {
            let mut filter = FilterSource::new();
            if line.opens_block {
                parse_filter_block(parser, &mut filter)?;
            }
            Ok(Some(Box::new(filter)))
        }
        _ => Ok(None),
    }
}

fn parse_mountgroup(parser: &mut Parser, state: &mut BuildState) -> io::Result<()> {
    // split the group off the state so sources can be parsed while the
    // tracker is borrowed for bind lookups
    let mut group = MountGroup::default();

    let result = parse_mountgroup_body(parser, state, &mut group);
    state.mount_groups.push(group);
    result
}

fn parse_mountgroup_body(
    parser: &mut Parser,
    state: &mut BuildState,
    group: &mut MountGroup,
) -> io::Result<()> {
    while let Some(raw) = parser.next_raw() {
        if raw == "}" {
            return Ok(());
        }

        let line = parser.parse_line(raw)?;

        match line.keyword {
            "bind" => {
                let arg = require_arg(parser, &line)?;

                let Some((path, fs_name)) = arg.rsplit_once(':') else {
                    return Err(parser.error("expected \"<path>:<filesystem>\""));
                };
                if fs_name.is_empty() {
                    return Err(parser.error("expected \"<path>:<filesystem>\""));
                }

                let fs = state.tracker.get_fs_by_name(fs_name).ok_or_else(|| {
                    parser.error(&format!("cannot find filesystem '{}'", fs_name))
                })?;

                group.sink.bind(path, fs);
            }
            _ => match parse_source_line(parser, &line)? {
                Some(source) => group.add_source(source),
                None => {
                    return Err(parser.error(&format!("unknown keyword `{}`", line.keyword)))
                }
            },
        }
    }

    Err(parser.error("missing '}'"))
}

/// Parses a complete layout file into the build state.
pub fn parse_layout(text: &str, state: &mut BuildState) -> io::Result<()> {
    let mut parser = Parser::new(text);

    while let Some(raw) = parser.next_raw() {
        let line = parser.parse_line(raw)?;

        match line.keyword {
            "raw" if line.opens_block => parse_raw_volume(&mut parser, state)?,
            "dosmbr" if line.opens_block => parse_dosmbr(&mut parser, state)?,
            "mountgroup" if line.opens_block => parse_mountgroup(&mut parser, state)?,
            other => return Err(parser.error(&format!("unknown keyword `{}`", other))),
        }
    }

    Ok(())
}
