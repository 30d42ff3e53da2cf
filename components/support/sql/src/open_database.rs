/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/// Use this module to open a new SQLite database connection.
///
/// Usage:
///    - Define a struct that implements ConnectionInitializer.  This handles:
///      - Initializing the schema for a new database
///      - Upgrading the schema for an existing database
///      - Extra preparation/finishing steps, for example setting up SQLite
///        functions
///
///    - Call open_database() in your database constructor:
///      - The first method called is `prepare()`.  This is executed outside
///        of a transaction.
///      - If the schema version is 0, `init()` is called inside a
///        transaction to create the schema at END_VERSION.
///      - Otherwise `upgrade_from()` is called once per version, inside a
///        single transaction, until the schema is at END_VERSION.
///      - The last method called is `finish()`.  This is executed outside of
///        a transaction.
use crate::ConnExt;
use rusqlite::{Connection, OpenFlags, Transaction};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Incompatible database version: {0}")]
    IncompatibleVersion(u32),
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait ConnectionInitializer {
    // Name to display in the logs.
    const NAME: &'static str;

    // The version that the last upgrade function upgrades to.
    const END_VERSION: u32;

    // Runs immediately after creation of the connection and before any
    // initialization/upgrade steps.  This is executed outside the
    // transaction, so pragmas and SQL function definitions go here.
    fn prepare(&self, _conn: &Connection, _db_empty: bool) -> Result<()> {
        Ok(())
    }

    // Initialize a newly created database to END_VERSION.
    fn init(&self, db: &Transaction<'_>) -> Result<()>;

    // Upgrade schema from version to version + 1.
    fn upgrade_from(&self, db: &Transaction<'_>, version: u32) -> Result<()>;

    // Runs once the schema is up to date, outside the transaction.
    fn finish(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

pub fn open_database<CI: ConnectionInitializer, P: AsRef<Path>>(
    path: P,
    connection_initializer: &CI,
) -> Result<Connection> {
    open_database_with_flags(path, OpenFlags::default(), connection_initializer)
}

pub fn open_memory_database<CI: ConnectionInitializer>(
    connection_initializer: &CI,
) -> Result<Connection> {
    open_memory_database_with_flags(OpenFlags::default(), connection_initializer)
}

pub fn open_database_with_flags<CI: ConnectionInitializer, P: AsRef<Path>>(
    path: P,
    open_flags: OpenFlags,
    connection_initializer: &CI,
) -> Result<Connection> {
    let mut conn = Connection::open_with_flags(path, open_flags)?;
    init_connection(&mut conn, connection_initializer)?;
    Ok(conn)
}

pub fn open_memory_database_with_flags<CI: ConnectionInitializer>(
    flags: OpenFlags,
    connection_initializer: &CI,
) -> Result<Connection> {
    let mut conn = Connection::open_in_memory_with_flags(flags)?;
    init_connection(&mut conn, connection_initializer)?;
    Ok(conn)
}

fn init_connection<CI: ConnectionInitializer>(
    conn: &mut Connection,
    connection_initializer: &CI,
) -> Result<()> {
    log::debug!("{}: opening database", CI::NAME);
    let db_empty = is_db_empty(conn)?;

    log::debug!("{}: preparing", CI::NAME);
    connection_initializer.prepare(conn, db_empty)?;

    let mut current_version = get_schema_version(conn)?;
    if current_version > CI::END_VERSION {
        return Err(Error::IncompatibleVersion(current_version));
    }
    if current_version == 0 {
        log::debug!("{}: initializing new database", CI::NAME);
        let tx = conn.transaction()?;
        connection_initializer.init(&tx)?;
        set_schema_version(&tx, CI::END_VERSION)?;
        tx.commit()?;
    } else if current_version < CI::END_VERSION {
        let tx = conn.transaction()?;
        while current_version < CI::END_VERSION {
            log::debug!(
                "{}: upgrading database to {}",
                CI::NAME,
                current_version + 1
            );
            connection_initializer.upgrade_from(&tx, current_version)?;
            current_version += 1;
        }
        set_schema_version(&tx, CI::END_VERSION)?;
        tx.commit()?;
    }

    log::debug!("{}: finishing", CI::NAME);
    connection_initializer.finish(conn)?;
    log::debug!("{}: database open successful", CI::NAME);
    Ok(())
}

fn is_db_empty(conn: &Connection) -> Result<bool> {
    Ok(conn.query_one::<u32>("SELECT COUNT(*) FROM sqlite_master")? == 0)
}

fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version = conn.query_row_and_then("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.set_pragma("user_version", version)?;
    Ok(())
}

// It would be nice for this to be #[cfg(test)], but that doesn't allow it to
// be used in tests for our other crates.
pub mod test_utils {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Database file that we can programmatically run upgrades on.
    ///
    /// We purposefully don't keep a connection to the database around to
    /// force upgrades to always run against a newly opened DB, like they
    /// would in the real world.
    pub struct MigratedDatabaseFile<CI: ConnectionInitializer> {
        // Keep around a TempDir to ensure the database file stays around
        // until this struct is dropped.
        _tempdir: TempDir,
        pub connection_initializer: CI,
        pub path: PathBuf,
    }

    impl<CI: ConnectionInitializer> MigratedDatabaseFile<CI> {
        pub fn new(connection_initializer: CI, init_sql: &str) -> Self {
            let tempdir = tempfile::tempdir().unwrap();
            let path = tempdir.path().join(Path::new("db.sql"));
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(init_sql).unwrap();
            Self {
                _tempdir: tempdir,
                connection_initializer,
                path,
            }
        }

        pub fn upgrade_to(&self, version: u32) {
            let mut conn = self.open();
            let mut current_version = get_schema_version(&conn).unwrap();
            let tx = conn.transaction().unwrap();
            while current_version < version {
                self.connection_initializer
                    .upgrade_from(&tx, current_version)
                    .unwrap();
                current_version += 1;
            }
            set_schema_version(&tx, current_version).unwrap();
            tx.commit().unwrap();
        }

        pub fn run_all_upgrades(&self) {
            let current_version = get_schema_version(&self.open()).unwrap();
            for version in current_version..CI::END_VERSION {
                self.upgrade_to(version + 1);
            }
        }

        pub fn open(&self) -> Connection {
            Connection::open(&self.path).unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::MigratedDatabaseFile;
    use super::*;

    struct TestConnectionInitializer;

    impl ConnectionInitializer for TestConnectionInitializer {
        const NAME: &'static str = "test db";
        const END_VERSION: u32 = 4;

        fn prepare(&self, conn: &Connection, _: bool) -> Result<()> {
            conn.execute_batch("PRAGMA journal_mode = wal;")?;
            Ok(())
        }

        fn init(&self, db: &Transaction<'_>) -> Result<()> {
            db.execute_batch("CREATE TABLE prep_table(col); CREATE TABLE my_table(col);")?;
            Ok(())
        }

        fn upgrade_from(&self, db: &Transaction<'_>, version: u32) -> Result<()> {
            match version {
                2 => {
                    db.execute_batch("ALTER TABLE my_old_table_name RENAME TO my_table;")?;
                    Ok(())
                }
                3 => {
                    db.execute_batch("ALTER TABLE my_table RENAME COLUMN old_col TO col;")?;
                    Ok(())
                }
                _ => Err(Error::IncompatibleVersion(version)),
            }
        }
    }

    const INIT_V2: &str = "
        CREATE TABLE prep_table(col);
        CREATE TABLE my_old_table_name(old_col);
        PRAGMA user_version=2;
    ";

    #[test]
    fn test_init() {
        let conn = open_memory_database(&TestConnectionInitializer).unwrap();
        conn.execute("INSERT INTO my_table(col) VALUES (1)", [])
            .unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 4);
    }

    #[test]
    fn test_upgrades() {
        let db_file = MigratedDatabaseFile::new(TestConnectionInitializer, INIT_V2);
        db_file.run_all_upgrades();
        let conn = open_database(&db_file.path, &TestConnectionInitializer).unwrap();
        conn.execute("INSERT INTO my_table(col) VALUES (1)", [])
            .unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 4);
    }

    #[test]
    fn test_version_too_new() {
        let db_file = MigratedDatabaseFile::new(
            TestConnectionInitializer,
            "CREATE TABLE my_table(col); PRAGMA user_version=5;",
        );
        assert!(matches!(
            open_database(&db_file.path, &TestConnectionInitializer),
            Err(Error::IncompatibleVersion(5))
        ));
    }

    #[test]
    fn test_open_current_version() {
        let db_file = MigratedDatabaseFile::new(TestConnectionInitializer, INIT_V2);
        db_file.run_all_upgrades();
        let conn = open_database(&db_file.path, &TestConnectionInitializer).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 4);
    }
}
