//! Connection handling for the SQLite stores.
//!
//! A file-backed store gives every operation its own connection, taken from
//! a small idle pool, so operations on unrelated rows only meet inside
//! SQLite's own locking. In-memory databases live on the connection that
//! created them, so they keep a single connection behind a mutex.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;

/// Idle connections kept per file-backed store.
const MAX_IDLE: usize = 8;

/// Per-connection setup, run on every connection the store opens.
pub(crate) type Configure = fn(&Connection) -> rusqlite::Result<()>;

/// WAL, busy timeout. Shared by all stores.
pub(crate) fn configure_default(conn: &Connection) -> rusqlite::Result<()> {
    // WAL mode for file-backed DBs (no-op for in-memory)
    let _ = conn.execute("PRAGMA journal_mode = WAL", []);
    // Wait for other connections instead of failing with SQLITE_BUSY
    let _ = conn.execute("PRAGMA busy_timeout = 5000", []);
    Ok(())
}

enum Source {
    Single(Mutex<Connection>),
    File {
        path: PathBuf,
        idle: Mutex<Vec<Connection>>,
    },
}

pub(crate) struct Db {
    source: Source,
    configure: Configure,
}

impl Db {
    /// Open `path`, apply the schema once, and pool connections to it.
    pub(crate) fn open(path: &Path, configure: Configure, schema: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        conn.execute_batch(schema)?;
        Ok(Self {
            source: Source::File {
                path: path.to_path_buf(),
                idle: Mutex::new(vec![conn]),
            },
            configure,
        })
    }

    /// Wrap one caller-supplied connection (in-memory or custom).
    pub(crate) fn single(conn: Connection, configure: Configure, schema: &str) -> rusqlite::Result<Self> {
        configure(&conn)?;
        conn.execute_batch(schema)?;
        Ok(Self {
            source: Source::Single(Mutex::new(conn)),
            configure,
        })
    }

    /// Run `f` on a connection. `f` must end any transaction it opens.
    pub(crate) fn with<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        match &self.source {
            Source::Single(conn) => {
                let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
                // A panic inside an earlier `f` can leave a transaction open.
                if !conn.is_autocommit() {
                    let _ = conn.execute_batch("ROLLBACK");
                }
                f(&*conn)
            }
            Source::File { path, idle } => {
                let pooled = lock(idle).pop();
                let conn = match pooled {
                    Some(conn) => conn,
                    None => {
                        let conn = Connection::open(path)?;
                        (self.configure)(&conn)?;
                        conn
                    }
                };
                let result = f(&conn);
                // Dropping a connection still inside a transaction rolls it back.
                if conn.is_autocommit() {
                    let mut idle = lock(idle);
                    if idle.len() < MAX_IDLE {
                        idle.push(conn);
                    }
                }
                result
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
