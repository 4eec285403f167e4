//! tar.gz reading and writing, archive naming and exclusion rules.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use chrono::NaiveDateTime;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, Header};
use walkdir::WalkDir;

use crate::manifest::{BackupKind, BackupManifest, MANIFEST_NAME};

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const ARCHIVE_SUFFIX: &str = ".tar.gz";

const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", "logs"];
const EXCLUDED_SUFFIXES: &[&str] = &[".log", ".lock", ".sock", ".pid"];

/// True for paths that never go into a backup.
pub fn is_excluded(name: &str, is_dir: bool) -> bool {
    if is_dir {
        EXCLUDED_DIRS.contains(&name)
    } else {
        EXCLUDED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    }
}

/// `<app>-<kind>-<YYYYMMDD>-<HHMMSS>[-<seq>].tar.gz`
pub fn archive_name(app: &str, kind: BackupKind, stamp: NaiveDateTime, seq: u32) -> String {
    let stamp = stamp.format(STAMP_FORMAT);
    if seq == 0 {
        format!("{app}-{}-{stamp}{ARCHIVE_SUFFIX}", kind.label())
    } else {
        format!("{app}-{}-{stamp}-{seq}{ARCHIVE_SUFFIX}", kind.label())
    }
}

/// Parsed form of an archive file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArchiveStamp {
    pub timestamp: NaiveDateTime,
    pub seq: u32,
}

pub fn parse_archive_name(app: &str, file_name: &str) -> Option<(BackupKind, ArchiveStamp)> {
    let rest = file_name
        .strip_prefix(app)?
        .strip_prefix('-')?
        .strip_suffix(ARCHIVE_SUFFIX)?;
    let (kind, rest) = [
        BackupKind::PreRestore,
        BackupKind::PreUpgrade,
        BackupKind::Regular,
    ]
        .into_iter()
        .find_map(|kind| {
            rest.strip_prefix(kind.label())
                .and_then(|r| r.strip_prefix('-'))
                .map(|r| (kind, r))
        })?;

    // "YYYYMMDD-HHMMSS" is 15 bytes; anything after is "-<seq>".
    let stamp = rest.get(..15)?;
    let timestamp = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    let seq = match &rest[15..] {
        "" => 0,
        tail => tail.strip_prefix('-')?.parse().ok()?,
    };
    Some((kind, ArchiveStamp { timestamp, seq }))
}

/// Write a gzip'd tar with the manifest first, then each present item.
pub fn write_archive<W: Write>(
    out: W,
    app_home: &Path,
    manifest: &BackupManifest,
) -> io::Result<W> {
    let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
    builder.follow_symlinks(false);

    let manifest_json = serde_json::to_vec_pretty(manifest).map_err(io::Error::other)?;
    let mut header = Header::new_gnu();
    header.set_path(MANIFEST_NAME)?;
    header.set_size(manifest_json.len() as u64);
    header.set_mode(0o600);
    header.set_mtime(manifest.created_at.timestamp().max(0) as u64);
    header.set_cksum();
    builder.append(&header, manifest_json.as_slice())?;

    for item in &manifest.files {
        let root = app_home.join(item);
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                // The item itself is always included; exclusions apply below it.
                entry.depth() == 0
                    || !is_excluded(
                        &entry.file_name().to_string_lossy(),
                        entry.file_type().is_dir(),
                    )
            });
        for entry in walker {
            let entry = entry.map_err(io::Error::other)?;
            let file_type = entry.file_type();
            if !(file_type.is_file() || file_type.is_dir() || file_type.is_symlink()) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(app_home)
                .map_err(io::Error::other)?;
            if file_type.is_dir() {
                builder.append_dir(relative, entry.path())?;
            } else {
                builder.append_path_with_name(entry.path(), relative)?;
            }
        }
    }

    builder.into_inner()?.finish()
}

/// The embedded manifest, or `None` when the archive has none.
pub fn read_manifest(path: &Path) -> io::Result<Option<BackupManifest>> {
    let mut archive = Archive::new(GzDecoder::new(File::open(path)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == MANIFEST_NAME {
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            let manifest = serde_json::from_str(&contents)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            return Ok(Some(manifest));
        }
    }
    Ok(None)
}

/// Unpack every entry under `dest`. Entries escaping `dest` are rejected by `tar`.
pub fn unpack(path: &Path, dest: &Path) -> io::Result<()> {
    let mut archive = Archive::new(GzDecoder::new(File::open(path)?));
    archive.set_preserve_permissions(true);
    archive.unpack(dest)
}
