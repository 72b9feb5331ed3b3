//! Self-describing artifact archives.
//!
//! An archive is a gzip-compressed tar whose first entry is
//! `.dbwarden-header.json`, followed by the artifact itself (a single file or a
//! directory tree under the artifact's original name).

use crate::checksum::{combine_entries, relative_name, sha256_reader};
use crate::guard::{GuardedReader, StepGuard};
use crate::{with_suffix, Artifact, BackupError, Engine, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType, Header};
use walkdir::WalkDir;

pub const HEADER_NAME: &str = ".dbwarden-header.json";
pub const FORMAT_VERSION: u32 = 1;
const MAX_HEADER_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub format_version: u32,
    pub engine: Engine,
    /// Checksum of the payload, as carried by the uncompressed artifact
    pub checksum: String,
    pub original_name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub is_dir: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactCodec {
    level: u32,
}

impl Default for ArtifactCodec {
    fn default() -> Self {
        Self::new(6)
    }
}

impl ArtifactCodec {
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9) }
    }

    /// Writes `<artifact>.archive` and returns it as a new artifact. The input
    /// is left untouched.
    pub async fn compress(&self, artifact: &Artifact, guard: &StepGuard) -> Result<Artifact> {
        if artifact.compressed {
            debug!("{} is already compressed", artifact.path.display());
            return Ok(artifact.clone());
        }
        let artifact = artifact.clone();
        let level = self.level;
        let guard = guard.clone();
        tokio::task::spawn_blocking(move || compress_blocking(&artifact, level, &guard))
            .await
            .map_err(|e| BackupError::Io(io::Error::other(e)))?
    }

    /// Verifies the archive's payload checksum, then extracts it into
    /// `dest_dir`. Nothing is written when verification fails.
    pub async fn decompress(&self, archive: &Artifact, dest_dir: &Path, guard: &StepGuard) -> Result<Artifact> {
        let path = archive.path.clone();
        let dest_dir = dest_dir.to_path_buf();
        let guard = guard.clone();
        tokio::task::spawn_blocking(move || decompress_blocking(&path, &dest_dir, &guard))
            .await
            .map_err(|e| BackupError::Io(io::Error::other(e)))?
    }

    /// Reads only the header entry of an archive.
    pub fn read_header(path: &Path) -> Result<ArchiveHeader> {
        let mut archive = open_archive(path, &StepGuard::unbounded("read header"))?;
        let mut entries = archive.entries().map_err(|e| as_corrupt(path, e))?;
        read_header_entry(&mut entries, path)
    }
}

/// Passes writes through while hashing them.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        (self.inner, format!("{:x}", self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn compress_blocking(artifact: &Artifact, level: u32, guard: &StepGuard) -> Result<Artifact> {
    let output = with_suffix(&artifact.path, ".archive");
    let partial = with_suffix(&output, ".partial");
    info!(
        "Compressing {} into {}",
        artifact.path.display(),
        output.display()
    );

    let written = write_archive(artifact, &partial, level, guard)
        .and_then(|written| fs::rename(&partial, &output).map(|_| written).map_err(Into::into));
    let (checksum, size_bytes) = match written {
        Ok(written) => written,
        Err(e) => {
            if let Err(rm) = fs::remove_file(&partial) {
                if rm.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {rm}", partial.display());
                }
            }
            return Err(e);
        }
    };

    info!(
        "Compressed {} ({} bytes) to {} bytes",
        artifact.path.display(),
        artifact.size_bytes,
        size_bytes
    );
    Ok(Artifact {
        path: output,
        engine: artifact.engine,
        created_at: Utc::now(),
        size_bytes,
        compressed: true,
        checksum,
    })
}

fn write_archive(artifact: &Artifact, partial: &Path, level: u32, guard: &StepGuard) -> Result<(String, u64)> {
    let original_name = artifact
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            BackupError::ConfigValidation(format!("{} has no file name", artifact.path.display()))
        })?;
    let is_dir = artifact.path.is_dir();
    let header = ArchiveHeader {
        format_version: FORMAT_VERSION,
        engine: artifact.engine,
        checksum: artifact.checksum.clone(),
        original_name: original_name.clone(),
        size_bytes: artifact.size_bytes,
        created_at: artifact.created_at,
        is_dir,
    };
    let json = serde_json::to_vec_pretty(&header)
        .map_err(|e| BackupError::Io(io::Error::other(e)))?;

    let file = File::create(partial)?;
    let encoder = GzEncoder::new(HashingWriter::new(BufWriter::new(file)), Compression::new(level));
    let mut builder = tar::Builder::new(encoder);

    let mut entry = Header::new_gnu();
    entry.set_size(json.len() as u64);
    entry.set_mode(0o644);
    entry.set_mtime(Utc::now().timestamp().max(0) as u64);
    builder.append_data(&mut entry, HEADER_NAME, json.as_slice())?;

    if is_dir {
        for item in WalkDir::new(&artifact.path).sort_by_file_name() {
            let item = item.map_err(|e| BackupError::Io(io::Error::other(e)))?;
            let relative = relative_name(&artifact.path, item.path())?;
            if relative.is_empty() {
                continue;
            }
            let name = format!("{original_name}/{relative}");
            if item.file_type().is_dir() {
                builder.append_dir(&name, item.path())?;
            } else if item.file_type().is_file() {
                append_file(&mut builder, item.path(), &name, guard)?;
            } else {
                warn!("Skipping non-regular file {}", item.path().display());
            }
        }
    } else {
        append_file(&mut builder, &artifact.path, &original_name, guard)?;
    }

    let encoder = builder.into_inner()?;
    let (writer, checksum, size) = encoder.finish()?.finish();
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok((checksum, size))
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, path: &Path, name: &str, guard: &StepGuard) -> Result<()> {
    let file = File::open(path)?;
    let mut entry = Header::new_gnu();
    entry.set_metadata(&file.metadata()?);
    builder.append_data(&mut entry, name, GuardedReader::new(BufReader::new(file), guard.clone()))?;
    Ok(())
}

type ArchiveReader = Archive<GzDecoder<GuardedReader<BufReader<File>>>>;

fn open_archive(path: &Path, guard: &StepGuard) -> Result<ArchiveReader> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => BackupError::NotFound(path.display().to_string()),
        _ => e.into(),
    })?;
    let reader = GuardedReader::new(BufReader::new(file), guard.clone());
    Ok(Archive::new(GzDecoder::new(reader)))
}

/// Read failures while walking an archive mean the archive is damaged, unless
/// the guard tripped.
fn as_corrupt(path: &Path, err: impl Into<BackupError>) -> BackupError {
    match err.into() {
        BackupError::Io(e) => BackupError::CorruptArtifact(format!("{}: {e}", path.display())),
        other => other,
    }
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>, archive: &Path) -> Result<String> {
    let name = entry.path().map_err(|e| as_corrupt(archive, e))?;
    Ok(name.to_string_lossy().trim_end_matches('/').to_string())
}

fn read_header_entry<R: Read>(entries: &mut tar::Entries<'_, R>, path: &Path) -> Result<ArchiveHeader> {
    let first = entries
        .next()
        .ok_or_else(|| BackupError::CorruptArtifact(format!("{} is empty", path.display())))?;
    let entry = first.map_err(|e| as_corrupt(path, e))?;
    if entry_name(&entry, path)? != HEADER_NAME {
        return Err(BackupError::CorruptArtifact(format!(
            "{} does not start with {HEADER_NAME}",
            path.display()
        )));
    }
    let mut json = Vec::new();
    entry
        .take(MAX_HEADER_BYTES)
        .read_to_end(&mut json)
        .map_err(|e| as_corrupt(path, e))?;
    let header: ArchiveHeader = serde_json::from_slice(&json).map_err(|e| {
        BackupError::CorruptArtifact(format!("{}: unreadable header: {e}", path.display()))
    })?;

    if header.format_version > FORMAT_VERSION {
        return Err(BackupError::CorruptArtifact(format!(
            "{}: unsupported archive format version {}",
            path.display(),
            header.format_version
        )));
    }
    let name = &header.original_name;
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(BackupError::CorruptArtifact(format!(
            "{}: invalid payload name {name:?}",
            path.display()
        )));
    }
    Ok(header)
}

/// First pass: recompute the payload checksum without writing anything.
fn verify_archive(path: &Path, guard: &StepGuard) -> Result<ArchiveHeader> {
    let mut archive = open_archive(path, guard)?;
    let mut entries = archive.entries().map_err(|e| as_corrupt(path, e))?;
    let header = read_header_entry(&mut entries, path)?;
    let dir_prefix = format!("{}/", header.original_name);

    let mut file_digests = Vec::new();
    let mut single = None;
    for entry in entries {
        let mut entry = entry.map_err(|e| as_corrupt(path, e))?;
        let name = entry_name(&entry, path)?;
        match entry.header().entry_type() {
            EntryType::Directory if header.is_dir => continue,
            EntryType::Regular | EntryType::Continuous => {}
            other => {
                return Err(BackupError::CorruptArtifact(format!(
                    "{}: unexpected {other:?} entry {name}",
                    path.display()
                )))
            }
        }
        let (digest, _) = sha256_reader(&mut entry, guard).map_err(|e| as_corrupt(path, e))?;
        if header.is_dir {
            let relative = name.strip_prefix(&dir_prefix).ok_or_else(|| {
                BackupError::CorruptArtifact(format!("{}: stray entry {name}", path.display()))
            })?;
            file_digests.push((relative.to_string(), digest));
        } else if name == header.original_name && single.is_none() {
            single = Some(digest);
        } else {
            return Err(BackupError::CorruptArtifact(format!(
                "{}: stray entry {name}",
                path.display()
            )));
        }
    }

    let actual = if header.is_dir {
        combine_entries(&mut file_digests)
    } else {
        single.ok_or_else(|| {
            BackupError::CorruptArtifact(format!("{}: archive has no payload", path.display()))
        })?
    };
    if actual != header.checksum {
        return Err(BackupError::CorruptArtifact(format!(
            "{}: checksum mismatch (header {}, content {actual})",
            path.display(),
            header.checksum
        )));
    }
    Ok(header)
}

/// Extraction runs after verification, so failures here are environmental.
fn unpack_error(err: io::Error, guard: &StepGuard) -> BackupError {
    if let Err(e) = guard.check() {
        return e;
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if io_err.raw_os_error() == Some(nix::errno::Errno::ENOSPC as i32) {
                return BackupError::DiskFull(err.to_string());
            }
        }
        source = current.source();
    }
    BackupError::Io(err)
}

fn decompress_blocking(path: &Path, dest_dir: &Path, guard: &StepGuard) -> Result<Artifact> {
    let header = verify_archive(path, guard)?;
    debug!("Verified {} ({})", path.display(), header.checksum);

    fs::create_dir_all(dest_dir)?;
    let target: PathBuf = dest_dir.join(&header.original_name);
    if target.is_dir() {
        fs::remove_dir_all(&target)?;
    } else if target.exists() {
        fs::remove_file(&target)?;
    }

    let mut archive = open_archive(path, guard)?;
    let entries = archive.entries().map_err(|e| unpack_error(e, guard))?;
    for entry in entries.skip(1) {
        let mut entry = entry.map_err(|e| unpack_error(e, guard))?;
        if !entry.unpack_in(dest_dir).map_err(|e| unpack_error(e, guard))? {
            let name = entry_name(&entry, path)?;
            return Err(BackupError::CorruptArtifact(format!(
                "{}: entry {name} escapes the destination",
                path.display()
            )));
        }
    }

    info!("Extracted {} into {}", path.display(), target.display());
    Ok(Artifact {
        path: target,
        engine: header.engine,
        created_at: header.created_at,
        size_bytes: header.size_bytes,
        compressed: false,
        checksum: header.checksum,
    })
}
