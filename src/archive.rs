//! Archive creation, naming, and extraction

use crate::config::CompressionConfig;
use crate::{Error, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info, warn};

pub const ARTIFACT_PREFIX: &str = "homeserver_backup";
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";
pub const ENCRYPTED_SUFFIX: &str = ".encrypted";
/// Entry describing the archive contents, stored first in every archive
pub const METADATA_ENTRY: &str = "backup_metadata.json";

/// `homeserver_backup_<timestamp>.tar.gz`
pub fn artifact_name(timestamp: &str) -> String {
    format!("{}_{}{}", ARTIFACT_PREFIX, timestamp, ARCHIVE_EXTENSION)
}

pub fn encrypted_name(name: &str) -> String {
    format!("{}{}", name, ENCRYPTED_SUFFIX)
}

pub fn is_encrypted_name(name: &str) -> bool {
    name.ends_with(ENCRYPTED_SUFFIX)
}

/// Whether `name` looks like an artifact produced by this tool
pub fn is_artifact_name(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    let base = base.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(base);
    base.starts_with(ARTIFACT_PREFIX)
        && base[ARTIFACT_PREFIX.len()..].starts_with('_')
        && base.ends_with(ARCHIVE_EXTENSION)
}

/// Timestamp embedded in an artifact name
pub fn parse_artifact_timestamp(name: &str, format: &str) -> Option<NaiveDateTime> {
    if !is_artifact_name(name) {
        return None;
    }
    let base = name.rsplit('/').next().unwrap_or(name);
    let base = base.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(base);
    let stamp = base
        .strip_prefix(ARTIFACT_PREFIX)?
        .strip_prefix('_')?
        .strip_suffix(ARCHIVE_EXTENSION)?;
    NaiveDateTime::parse_from_str(stamp, format).ok()
}

pub fn format_timestamp(at: DateTime<Local>, format: &str) -> String {
    at.format(format).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Directory,
}

/// One configured path captured in an archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub source_path: PathBuf,
    pub backup_name: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub size: u64,
    pub permissions: Option<u32>,
    pub mtime: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub timestamp: String,
    pub backup_name: String,
    pub created_at: DateTime<Utc>,
    pub items: Vec<ItemMetadata>,
}

/// Result of a successful build
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub metadata: ArchiveMetadata,
    pub skipped: Vec<PathBuf>,
}

/// Builds a single gzip-compressed tarball from configured paths
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    level: u32,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new(9)
    }
}

impl ArchiveBuilder {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }

    pub fn from_config(config: &CompressionConfig) -> Self {
        Self::new(config.effective_level())
    }

    /// Archive `items` into `<output_dir>/homeserver_backup_<timestamp>.tar.gz`.
    ///
    /// Each item is stored under its base name. Missing items are skipped with
    /// a warning; when none remain the build fails with `NoBackupItems`.
    pub fn build(&self, items: &[PathBuf], timestamp: &str, output_dir: &Path) -> Result<BuiltArchive> {
        let name = artifact_name(timestamp);
        let path = output_dir.join(&name);

        let mut skipped = Vec::new();
        let mut present = Vec::new();
        for item in items {
            match fs::symlink_metadata(item) {
                Ok(meta) => present.push((item.clone(), meta)),
                Err(e) => {
                    warn!("Backup item {} not available, skipping: {}", item.display(), e);
                    skipped.push(item.clone());
                }
            }
        }
        if present.is_empty() {
            return Err(Error::NoBackupItems);
        }

        fs::create_dir_all(output_dir)?;

        let mut used_names = HashSet::new();
        used_names.insert(METADATA_ENTRY.to_string());
        let mut entries = Vec::with_capacity(present.len());
        for (source, meta) in present {
            let backup_name = unique_name(&source, &mut used_names);
            entries.push((source, backup_name, meta));
        }

        let metadata = ArchiveMetadata {
            timestamp: timestamp.to_string(),
            backup_name: name.clone(),
            created_at: Utc::now(),
            items: entries
                .iter()
                .map(|(source, backup_name, meta)| item_metadata(source, backup_name, meta))
                .collect(),
        };

        let result = self.write_archive(&path, &metadata, &entries);
        if let Err(e) = result {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        let size = fs::metadata(&path)?.len();
        info!(
            archive = %name,
            items = metadata.items.len(),
            skipped = skipped.len(),
            bytes = size,
            "Archive created"
        );

        Ok(BuiltArchive {
            path,
            name,
            size,
            metadata,
            skipped,
        })
    }

    fn write_archive(
        &self,
        path: &Path,
        metadata: &ArchiveMetadata,
        entries: &[(PathBuf, String, fs::Metadata)],
    ) -> Result<()> {
        let file = File::create(path)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::new(self.level));
        let mut builder = Builder::new(encoder);
        builder.follow_symlinks(false);

        let manifest = serde_json::to_vec_pretty(metadata)?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(metadata.created_at.timestamp().max(0) as u64);
        header.set_cksum();
        builder.append_data(&mut header, METADATA_ENTRY, manifest.as_slice())?;

        for (source, backup_name, meta) in entries {
            debug!("Adding {} as {}", source.display(), backup_name);
            if meta.is_dir() {
                builder.append_dir_all(backup_name, source).map_err(|e| Error::Archive {
                    reason: format!("failed to add {}: {}", source.display(), e),
                })?;
            } else {
                builder
                    .append_path_with_name(source, backup_name)
                    .map_err(|e| Error::Archive {
                        reason: format!("failed to add {}: {}", source.display(), e),
                    })?;
            }
        }

        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        std::io::Write::flush(&mut writer)?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;
        Ok(())
    }
}

fn unique_name(source: &Path, used: &mut HashSet<String>) -> String {
    let base = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "root".to_string());

    let mut candidate = base.clone();
    let mut n = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
    candidate
}

fn item_metadata(source: &Path, backup_name: &str, meta: &fs::Metadata) -> ItemMetadata {
    let item_type = if meta.is_dir() {
        ItemType::Directory
    } else {
        ItemType::File
    };
    let size = if meta.is_dir() {
        directory_size(source)
    } else {
        meta.len()
    };

    ItemMetadata {
        source_path: source.to_path_buf(),
        backup_name: backup_name.to_string(),
        item_type,
        size,
        permissions: mode(meta),
        mtime: meta.modified().ok().map(DateTime::<Utc>::from),
    }
}

fn directory_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(unix)]
fn mode(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode(_meta: &fs::Metadata) -> Option<u32> {
    None
}

/// One entry of an archive listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub entries: usize,
    pub bytes: u64,
}

fn open_archive(path: &Path) -> Result<Archive<GzDecoder<BufReader<File>>>> {
    let file = File::open(path)?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn archive_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Archive {
        reason: format!("{}: {}", path.display(), e),
    }
}

/// Unpack every entry except the metadata file into `target`
pub fn extract_archive(archive_path: &Path, target: &Path) -> Result<ExtractSummary> {
    fs::create_dir_all(target)?;
    let mut archive = open_archive(archive_path)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    let mut summary = ExtractSummary::default();
    for entry in archive.entries().map_err(|e| archive_error(archive_path, e))? {
        let mut entry = entry.map_err(|e| archive_error(archive_path, e))?;
        let entry_path = entry
            .path()
            .map_err(|e| archive_error(archive_path, e))?
            .into_owned();
        if entry_path == Path::new(METADATA_ENTRY) {
            continue;
        }

        let size = entry.header().size().unwrap_or(0);
        let unpacked = entry
            .unpack_in(target)
            .map_err(|e| archive_error(archive_path, e))?;
        if unpacked {
            summary.entries += 1;
            summary.bytes += size;
        } else {
            warn!("Skipped unsafe archive entry {}", entry_path.display());
        }
    }

    info!(
        entries = summary.entries,
        bytes = summary.bytes,
        "Extracted {} into {}",
        archive_path.display(),
        target.display()
    );
    Ok(summary)
}

/// List archive entries without extracting
pub fn list_archive(archive_path: &Path) -> Result<Vec<ArchiveEntry>> {
    let mut archive = open_archive(archive_path)?;
    let mut listing = Vec::new();
    for entry in archive.entries().map_err(|e| archive_error(archive_path, e))? {
        let entry = entry.map_err(|e| archive_error(archive_path, e))?;
        let header = entry.header();
        listing.push(ArchiveEntry {
            path: entry
                .path()
                .map_err(|e| archive_error(archive_path, e))?
                .into_owned(),
            size: header.size().unwrap_or(0),
            is_dir: header.entry_type().is_dir(),
        });
    }
    Ok(listing)
}

/// Embedded metadata, if the archive carries it
pub fn read_metadata(archive_path: &Path) -> Result<Option<ArchiveMetadata>> {
    let mut archive = open_archive(archive_path)?;
    for entry in archive.entries().map_err(|e| archive_error(archive_path, e))? {
        let mut entry = entry.map_err(|e| archive_error(archive_path, e))?;
        let is_metadata = entry
            .path()
            .map(|p| p.as_ref() == Path::new(METADATA_ENTRY))
            .unwrap_or(false);
        if is_metadata {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            return Ok(Some(serde_json::from_str(&content)?));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_naming() {
        let name = artifact_name("20240310_020000");
        assert_eq!(name, "homeserver_backup_20240310_020000.tar.gz");
        assert!(is_artifact_name(&name));
        assert!(is_artifact_name(&encrypted_name(&name)));
        assert!(!is_artifact_name("other_20240310.tar.gz"));
        assert!(!is_artifact_name("homeserver_backupX.tar.gz"));

        let ts = parse_artifact_timestamp(&encrypted_name(&name), "%Y%m%d_%H%M%S").unwrap();
        assert_eq!(ts.to_string(), "2024-03-10 02:00:00");
    }

    #[test]
    fn test_build_and_extract() -> Result<()> {
        let temp = TempDir::new()?;
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("etc/nested"))?;
        fs::write(src.join("a.txt"), "hello")?;
        fs::write(src.join("etc/nested/conf"), "key=value")?;

        let items = vec![
            src.join("a.txt"),
            src.join("etc"),
            src.join("missing"),
        ];
        let out = temp.path().join("out");
        let built = ArchiveBuilder::new(9).build(&items, "20240101_000000", &out)?;

        assert_eq!(built.name, "homeserver_backup_20240101_000000.tar.gz");
        assert_eq!(built.skipped, vec![src.join("missing")]);
        assert_eq!(built.metadata.items.len(), 2);
        assert_eq!(built.metadata.items[1].item_type, ItemType::Directory);

        let listing = list_archive(&built.path)?;
        assert_eq!(listing[0].path, PathBuf::from(METADATA_ENTRY));
        assert!(listing.iter().any(|e| e.path == Path::new("etc/nested/conf")));
        // base names only, never absolute source paths
        assert!(listing.iter().all(|e| e.path.is_relative()));

        let restore = temp.path().join("restore");
        let summary = extract_archive(&built.path, &restore)?;
        assert!(summary.entries >= 3);
        assert_eq!(fs::read_to_string(restore.join("a.txt"))?, "hello");
        assert_eq!(fs::read_to_string(restore.join("etc/nested/conf"))?, "key=value");
        assert!(!restore.join(METADATA_ENTRY).exists());

        let metadata = read_metadata(&built.path)?.unwrap();
        assert_eq!(metadata, built.metadata);
        Ok(())
    }

    #[test]
    fn test_no_valid_items() -> Result<()> {
        let temp = TempDir::new()?;
        let err = ArchiveBuilder::default()
            .build(&[temp.path().join("nope")], "20240101_000000", temp.path())
            .unwrap_err();
        assert!(matches!(err, Error::NoBackupItems));
        Ok(())
    }

    #[test]
    fn test_duplicate_base_names() -> Result<()> {
        let temp = TempDir::new()?;
        for dir in ["one", "two"] {
            fs::create_dir_all(temp.path().join(dir).join("data"))?;
            fs::write(temp.path().join(dir).join("data/file"), dir)?;
        }

        let items = vec![temp.path().join("one/data"), temp.path().join("two/data")];
        let built = ArchiveBuilder::new(1).build(&items, "20240101_000000", temp.path())?;
        let names: Vec<_> = built.metadata.items.iter().map(|i| i.backup_name.as_str()).collect();
        assert_eq!(names, vec!["data", "data_2"]);
        Ok(())
    }
}
