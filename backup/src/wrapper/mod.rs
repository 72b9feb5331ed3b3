//! Command builders for the native client tools, plus the supervisor that
//! runs them.

pub mod mongo;
pub mod mysql;
pub mod pg_dump;
pub mod pg_restore;
pub mod process;

pub use mongo::{MongoDump, MongoRestore, MongoShell};
pub use mysql::{MySqlClient, MySqlDump};
pub use pg_dump::{PgDump, PgDumpOptions};
pub use pg_restore::{PgRestore, PgRestoreOptions};
pub use process::{run_supervised, ProcessError, ProcessOutput};
