//! Content digests and artifact inspection.

use crate::guard::{StepGuard, CHUNK_SIZE};
use crate::{Artifact, BackupError, Engine, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const PG_CUSTOM_MAGIC: &[u8] = b"PGDMP";
const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";
const MONGO_ARCHIVE_MAGIC: [u8; 4] = 0x8199e26du32.to_le_bytes();
const MARIADB_SANDBOX_PREFIX: &[u8] = b"/*M!999999";

/// SHA-256 of everything `reader` yields, with the byte count.
pub fn sha256_reader<R: Read>(reader: &mut R, guard: &StepGuard) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        guard.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

pub fn sha256_file(path: &Path, guard: &StepGuard) -> Result<(String, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    sha256_reader(&mut file, guard)
}

/// Digest over `relative/path\0<file digest>\n` lines sorted by path.
pub fn combine_entries(entries: &mut [(String, String)]) -> String {
    entries.sort();
    let mut hasher = Sha256::new();
    for (path, digest) in entries.iter() {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Checksum and total size of a file, or of every regular file under a
/// directory.
pub fn checksum_path(path: &Path, guard: &StepGuard) -> Result<(String, u64)> {
    if !path.is_dir() {
        return sha256_file(path, guard);
    }
    let mut entries = Vec::new();
    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| BackupError::Io(io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = relative_name(path, entry.path())?;
        let (digest, size) = sha256_file(entry.path(), guard)?;
        total += size;
        entries.push((relative, digest));
    }
    Ok((combine_entries(&mut entries), total))
}

/// `/`-separated path of `path` below `root`.
pub fn relative_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|e| BackupError::Io(io::Error::other(e)))?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

fn read_prefix(path: &Path, len: usize) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut buf = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// True when the artifact is one of our archives: a `.archive` name or gzip
/// magic bytes.
pub fn is_compressed(path: &Path) -> Result<bool> {
    if path.extension().is_some_and(|e| e == "archive") {
        return Ok(true);
    }
    if path.is_dir() {
        return Ok(false);
    }
    Ok(read_prefix(path, GZIP_MAGIC.len())? == GZIP_MAGIC)
}

/// Recognises the engine of an uncompressed dump from its leading bytes.
pub fn sniff_bytes(head: &[u8]) -> Option<Engine> {
    if head.starts_with(PG_CUSTOM_MAGIC) {
        return Some(Engine::PostgreSql);
    }
    if head.starts_with(SQLITE_MAGIC) {
        return Some(Engine::Sqlite);
    }
    if head.starts_with(&MONGO_ARCHIVE_MAGIC) {
        return Some(Engine::MongoDb);
    }
    // Recent mariadb-dump prepends a sandbox-mode comment line
    let text = if head.starts_with(MARIADB_SANDBOX_PREFIX) {
        head.iter()
            .position(|b| *b == b'\n')
            .map(|i| &head[i + 1..])
            .unwrap_or_default()
    } else {
        head
    };
    if text.starts_with(b"-- MySQL dump") || text.starts_with(b"-- MariaDB dump") {
        return Some(Engine::MySql);
    }
    None
}

/// Engine of an uncompressed artifact, if recognisable. Directories are not
/// sniffed.
pub fn sniff_engine(path: &Path) -> Result<Option<Engine>> {
    if path.is_dir() {
        return Ok(None);
    }
    Ok(sniff_bytes(&read_prefix(path, 128)?))
}

/// Builds an [`Artifact`] for `path`, hashing it on the blocking pool.
pub async fn describe(path: PathBuf, engine: Engine, compressed: bool, guard: &StepGuard) -> Result<Artifact> {
    let guard = guard.clone();
    tokio::task::spawn_blocking(move || {
        let (checksum, size_bytes) = checksum_path(&path, &guard)?;
        Ok(Artifact {
            path,
            engine,
            created_at: Utc::now(),
            size_bytes,
            compressed,
            checksum,
        })
    })
    .await
    .map_err(|e| BackupError::Io(io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn sniffs_known_dump_headers() {
        assert_eq!(sniff_bytes(b"PGDMP\x01\x0e"), Some(Engine::PostgreSql));
        assert_eq!(sniff_bytes(b"SQLite format 3\0\x10\x00"), Some(Engine::Sqlite));
        assert_eq!(sniff_bytes(&[0x6d, 0xe2, 0x99, 0x81, 1, 0]), Some(Engine::MongoDb));
        assert_eq!(
            sniff_bytes(b"-- MySQL dump 10.13  Distrib 8.0.36"),
            Some(Engine::MySql)
        );
        assert_eq!(
            sniff_bytes(b"/*M!999999\\- enable the sandbox mode */ \n-- MariaDB dump 10.19"),
            Some(Engine::MySql)
        );
        assert_eq!(sniff_bytes(b"CREATE TABLE t"), None);
    }

    #[test]
    fn directory_checksum_ignores_walk_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dump");
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("a.bson"), b"one").unwrap();
        fs::write(root.join("b").join("c.bson"), b"two").unwrap();

        let guard = StepGuard::unbounded("test");
        let (digest, size) = checksum_path(&root, &guard).unwrap();
        assert_eq!(size, 6);

        let mut entries = vec![
            ("b/c.bson".to_string(), sha256_reader(&mut &b"two"[..], &guard).unwrap().0),
            ("a.bson".to_string(), sha256_reader(&mut &b"one"[..], &guard).unwrap().0),
        ];
        assert_eq!(combine_entries(&mut entries), digest);
    }

    #[test]
    fn detects_compression_by_name_or_magic() {
        let dir = tempfile::tempdir().unwrap();
        let gz = dir.path().join("dump.bin");
        fs::write(&gz, [0x1f, 0x8b, 0x08, 0x00]).unwrap();
        let plain = dir.path().join("dump.sql");
        fs::write(&plain, b"-- MySQL dump").unwrap();

        assert!(is_compressed(&gz).unwrap());
        assert!(!is_compressed(&plain).unwrap());
        assert!(is_compressed(Path::new("/nonexistent/app.archive")).unwrap());
        assert_eq!(sniff_engine(&plain).unwrap(), Some(Engine::MySql));
    }

    #[test]
    fn known_digest() {
        let guard = StepGuard::unbounded("test");
        let (digest, size) = sha256_reader(&mut &b"abc"[..], &guard).unwrap();
        assert_eq!(size, 3);
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
