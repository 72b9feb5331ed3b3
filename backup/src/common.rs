use crate::{BackupError, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use storage::StorageProviderType;

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    MySql,
    PostgreSql,
    MongoDb,
    Sqlite,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::MySql => "mysql",
            Engine::PostgreSql => "postgresql",
            Engine::MongoDb => "mongodb",
            Engine::Sqlite => "sqlite",
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            Engine::MySql => Some(3306),
            Engine::PostgreSql => Some(5432),
            Engine::MongoDb => Some(27017),
            Engine::Sqlite => None,
        }
    }

    /// Whether the engine is reached over the network rather than a local file.
    pub fn is_network(&self) -> bool {
        !matches!(self, Engine::Sqlite)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Engine::MySql),
            "postgresql" | "postgres" => Ok(Engine::PostgreSql),
            "mongodb" | "mongo" => Ok(Engine::MongoDb),
            "sqlite" | "sqlite3" => Ok(Engine::Sqlite),
            other => Err(BackupError::UnsupportedEngine(other.to_string())),
        }
    }
}

/// Validated connection details for one database.
///
/// Only constructible through [`ConnectionSpec::new`] or
/// [`ConnectionSpec::sqlite`]; the password never appears in `Debug` or
/// `Display` output.
#[derive(Clone)]
pub struct ConnectionSpec {
    engine: Engine,
    host: String,
    port: u16,
    user: String,
    password: String,
    database: String,
}

impl ConnectionSpec {
    pub fn new(
        engine: Engine,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Result<Self> {
        if engine == Engine::Sqlite {
            return Self::sqlite(database);
        }
        let spec = Self {
            engine,
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            database: database.into(),
        };

        let mut missing = Vec::new();
        if spec.host.trim().is_empty() {
            missing.push("host");
        }
        if spec.port == 0 {
            missing.push("port");
        }
        if spec.user.trim().is_empty() {
            missing.push("user");
        }
        if spec.database.trim().is_empty() {
            missing.push("database");
        }
        if !missing.is_empty() {
            return Err(BackupError::ConfigValidation(format!(
                "{engine} connection requires non-empty {}",
                missing.join(", ")
            )));
        }
        Ok(spec)
    }

    /// SQLite connection: `path` is the database file.
    pub fn sqlite(path: impl Into<String>) -> Result<Self> {
        let database = path.into();
        if database.trim().is_empty() {
            return Err(BackupError::ConfigValidation(
                "sqlite connection requires a database path".to_string(),
            ));
        }
        Ok(Self {
            engine: Engine::Sqlite,
            host: String::new(),
            port: 0,
            user: String::new(),
            password: String::new(),
            database,
        })
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Filesystem path of a SQLite database.
    pub fn sqlite_path(&self) -> &Path {
        Path::new(&self.database)
    }

    /// Short database name for artifact names and lock files: the file stem
    /// for SQLite, the database name otherwise.
    pub fn label(&self) -> String {
        match self.engine {
            Engine::Sqlite => self
                .sqlite_path()
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.database.clone()),
            _ => self.database.clone(),
        }
    }
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSpec")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.engine {
            Engine::Sqlite => write!(f, "sqlite:{}", self.database),
            engine => write!(
                f,
                "{engine}://{}@{}:{}/{}",
                self.user, self.host, self.port, self.database
            ),
        }
    }
}

/// A dump or archive file on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub engine: Engine,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub compressed: bool,
    /// Lowercase hex SHA-256 of the content
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Connect,
    Dump,
    Compress,
    Upload,
    Download,
    Decompress,
    Restore,
}

/// How safely a step can be repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotence {
    Idempotent,
    OneShot,
    Destructive,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Connect => "connect",
            Step::Dump => "dump",
            Step::Compress => "compress",
            Step::Upload => "upload",
            Step::Download => "download",
            Step::Decompress => "decompress",
            Step::Restore => "restore",
        }
    }

    pub fn idempotence(&self) -> Idempotence {
        match self {
            Step::Dump => Idempotence::OneShot,
            Step::Restore => Idempotence::Destructive,
            _ => Idempotence::Idempotent,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Succeeded,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: Step,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
    pub outcome: StepOutcome,
}

impl StepRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == StepOutcome::Succeeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Success => "success",
            Status::Partial => "partial",
            Status::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Backup,
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
        })
    }
}

/// Object in a cloud bucket, rendered as `s3://bucket/key`, `gs://bucket/key`
/// or `azure://container/key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudRef {
    pub provider: StorageProviderType,
    pub bucket: String,
    /// Defaults to prefix + artifact file name on upload
    pub key: Option<String>,
}

impl CloudRef {
    pub fn new(provider: StorageProviderType, bucket: impl Into<String>, key: Option<String>) -> Self {
        Self {
            provider,
            bucket: bucket.into(),
            key,
        }
    }
}

impl fmt::Display for CloudRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.provider.scheme(), self.bucket)?;
        if let Some(key) = &self.key {
            write!(f, "/{key}")?;
        }
        Ok(())
    }
}

/// Where the artifact of a run ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    Local(PathBuf),
    Remote(CloudRef),
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactRef::Local(path) => write!(f, "{}", path.display()),
            ArtifactRef::Remote(remote) => remote.fmt(f),
        }
    }
}

impl Serialize for ArtifactRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Error as surfaced on an [`OperationResult`].
#[derive(Debug, Clone, Serialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    /// None when the run failed before its first step
    pub step: Option<Step>,
    pub engine: Engine,
    pub message: String,
}

impl OperationError {
    pub fn new(error: &BackupError, step: Option<Step>, engine: Engine) -> Self {
        Self {
            kind: error.kind(),
            step,
            engine,
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub operation: Operation,
    pub status: Status,
    pub artifact_ref: Option<ArtifactRef>,
    pub error: Option<OperationError>,
    pub steps_completed: Vec<StepRecord>,
    pub warnings: Vec<String>,
}

impl OperationResult {
    /// Names of every attempted step, in order.
    pub fn step_names(&self) -> Vec<Step> {
        self.steps_completed.iter().map(|r| r.step).collect()
    }
}

/// `<database>-<engine>-<YYYYmmddTHHMMSSZ>`
pub fn default_artifact_name(spec: &ConnectionSpec, now: DateTime<Utc>) -> String {
    let label: String = spec
        .label()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{label}-{}-{}", spec.engine(), now.format("%Y%m%dT%H%M%SZ"))
}

/// Appends `suffix` to the final path component (`a/b.db` + `.archive`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
