use crate::{ConnectionSpec, Result};
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::process::Command;

const AUTH_DATABASE: &str = "admin";

/// A MongoDB client invocation and the owner-only file holding its password.
/// The file is deleted on drop, so keep the whole value alive until the
/// child has exited.
pub struct MongoCommand {
    command: Command,
    secrets: NamedTempFile,
}

impl MongoCommand {
    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn secrets_path(&self) -> &Path {
        self.secrets.path()
    }

    pub fn into_parts(self) -> (Command, NamedTempFile) {
        (self.command, self.secrets)
    }
}

/// Writes `contents` to a fresh temp file readable only by this user.
fn secret_file(suffix: &str, contents: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("dbwarden-mongo-")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// A JSON string literal, which is also a valid YAML and JavaScript string.
fn quoted(value: &str) -> Result<String> {
    Ok(serde_json::to_string(value).map_err(io::Error::other)?)
}

/// Connection flags for the database tools. The password goes through a
/// `--config` YAML file instead of argv.
fn tool(program: &str, spec: &ConnectionSpec) -> Result<MongoCommand> {
    let secrets = secret_file(".yaml", &format!("password: {}\n", quoted(spec.password())?))?;
    let mut cmd = Command::new(program);
    cmd.arg(format!("--host={}", spec.host()))
        .arg(format!("--port={}", spec.port()))
        .arg(format!("--username={}", spec.user()))
        .arg(format!("--authenticationDatabase={AUTH_DATABASE}"))
        .arg(format!("--config={}", secrets.path().display()));
    Ok(MongoCommand {
        command: cmd,
        secrets,
    })
}

/// Wrapper for mongodump
pub struct MongoDump;

impl MongoDump {
    /// Single-file archive of one database.
    pub fn command(spec: &ConnectionSpec, archive: &Path) -> Result<MongoCommand> {
        let mut mongo = tool("mongodump", spec)?;
        mongo
            .command
            .arg(format!("--db={}", spec.database()))
            .arg(format!("--archive={}", archive.display()));
        Ok(mongo)
    }
}

/// Wrapper for mongorestore
pub struct MongoRestore;

impl MongoRestore {
    /// Restores an archive file, or a dump directory when `source` is one.
    /// Every namespace is renamed into the spec's database, whatever database
    /// it was dumped from.
    pub fn command(spec: &ConnectionSpec, source: &Path, drop: bool) -> Result<MongoCommand> {
        let mut mongo = tool("mongorestore", spec)?;
        let cmd = &mut mongo.command;
        if source.is_dir() {
            cmd.arg(format!("--dir={}", source.display()));
        } else {
            cmd.arg(format!("--archive={}", source.display()));
        }
        cmd.arg("--nsFrom=$db$.$coll$")
            .arg(format!("--nsTo={}.$coll$", spec.database()));
        if drop {
            cmd.arg("--drop");
        }
        Ok(mongo)
    }
}

/// Wrapper for mongosh
pub struct MongoShell;

impl MongoShell {
    /// Runs `script` against the spec's database and prints its value.
    ///
    /// mongosh has no config file for credentials, so the script is written
    /// to a private file that authenticates first.
    pub fn eval(spec: &ConnectionSpec, script: &str) -> Result<MongoCommand> {
        let body = format!(
            "db.getSiblingDB({}).auth({}, {});\nprint({script});\n",
            quoted(AUTH_DATABASE)?,
            quoted(spec.user())?,
            quoted(spec.password())?,
        );
        let secrets = secret_file(".js", &body)?;
        let mut cmd = Command::new("mongosh");
        cmd.arg(format!("--host={}", spec.host()))
            .arg(format!("--port={}", spec.port()))
            .arg("--quiet")
            .arg(spec.database())
            .arg(secrets.path());
        Ok(MongoCommand {
            command: cmd,
            secrets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::process::describe;
    use crate::Engine;
    use std::fs;

    fn spec(database: &str) -> ConnectionSpec {
        ConnectionSpec::new(Engine::MongoDb, "mongo", 27017, "root", "p\"w:#", database).unwrap()
    }

    #[test]
    fn restore_renames_into_target_and_drops_only_when_forced() {
        let archive = Path::new("/tmp/shop.archive");
        let mongo = MongoRestore::command(&spec("shop_copy"), archive, false).unwrap();
        let text = describe(mongo.command());
        assert!(text.contains("--archive=/tmp/shop.archive"));
        assert!(text.contains("--nsFrom=$db$.$coll$"));
        assert!(text.contains("--nsTo=shop_copy.$coll$"));
        assert!(!text.contains("--nsInclude"));
        assert!(!text.contains("--drop"));

        let forced = MongoRestore::command(&spec("shop"), archive, true).unwrap();
        assert!(describe(forced.command()).ends_with("--drop"));
    }

    #[test]
    fn password_travels_in_a_private_config_file() {
        let mongo = MongoDump::command(&spec("shop"), Path::new("/tmp/shop.partial")).unwrap();
        let args: Vec<String> = mongo
            .command()
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.iter().all(|a| !a.starts_with("--password") && !a.contains("p\"w")));
        assert!(args.contains(&format!("--config={}", mongo.secrets_path().display())));

        let yaml = fs::read_to_string(mongo.secrets_path()).unwrap();
        assert_eq!(yaml, "password: \"p\\\"w:#\"\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(mongo.secrets_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0);
        }

        let path = mongo.secrets_path().to_path_buf();
        drop(mongo);
        assert!(!path.exists());
    }

    #[test]
    fn shell_authenticates_from_a_script_file() {
        let mongo = MongoShell::eval(&spec("shop"), "db.getCollectionNames().length").unwrap();
        let text = describe(mongo.command());
        assert!(!text.contains("p\"w"));
        assert!(!text.contains("--username"));
        assert!(text.ends_with(&mongo.secrets_path().display().to_string()));

        let script = fs::read_to_string(mongo.secrets_path()).unwrap();
        assert!(script.starts_with("db.getSiblingDB(\"admin\").auth(\"root\", \"p\\\"w:#\");"));
        assert!(script.contains("print(db.getCollectionNames().length);"));
    }
}
