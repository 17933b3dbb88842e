use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::session::{CredentialBackend, Credentials};

/// Local SQLite state: the credential pair and user preferences.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        Self::from_connection(conn)
    }

    /// A throwaway store, handy when nothing should touch the disk.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("storage: open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn credentials(&self) -> Result<Option<(Credentials, DateTime<Utc>)>> {
        let conn = self.conn.lock();
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT access_token, refresh_token, updated_at FROM credentials WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("storage: query credentials")?;

        let Some((access, refresh, updated_at)) = row else {
            return Ok(None);
        };
        let credentials =
            Credentials::new(access, refresh).context("storage: stored credentials are invalid")?;
        let updated_at = Utc
            .timestamp_opt(updated_at, 0)
            .single()
            .unwrap_or_default();
        Ok(Some((credentials, updated_at)))
    }

    pub fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO credentials (id, access_token, refresh_token, updated_at)
VALUES (1, ?1, ?2, ?3)
ON CONFLICT(id) DO UPDATE SET
  access_token = excluded.access_token,
  refresh_token = excluded.refresh_token,
  updated_at = excluded.updated_at
"#,
            params![
                credentials.access_token(),
                credentials.refresh_token(),
                Utc::now().timestamp(),
            ],
        )
        .context("storage: save credentials")?;
        Ok(())
    }

    pub fn clear_credentials(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM credentials", [])
            .context("storage: clear credentials")?;
        Ok(())
    }

    pub fn preference(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM preferences WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("storage: query preference {key}"))
    }

    pub fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO preferences (key, value, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET
  value = excluded.value,
  updated_at = excluded.updated_at
"#,
            params![key, value, Utc::now().timestamp()],
        )
        .with_context(|| format!("storage: save preference {key}"))?;
        Ok(())
    }

    pub fn remove_preference(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM preferences WHERE key = ?1", params![key])
            .with_context(|| format!("storage: remove preference {key}"))?;
        Ok(())
    }
}

impl CredentialBackend for Store {
    fn load_credentials(&self) -> Result<Option<Credentials>> {
        Ok(self.credentials()?.map(|(credentials, _)| credentials))
    }

    fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        Store::save_credentials(self, credentials)
    }

    fn clear_credentials(&self) -> Result<()> {
        Store::clear_credentials(self)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, sql) in migrations().iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)
            .with_context(|| format!("storage: apply migration {version}"))?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp()],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS credentials (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  access_token TEXT NOT NULL,
  refresh_token TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);
"#,
        r#"
CREATE TABLE IF NOT EXISTS preferences (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("confession-board").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn credentials_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = Store::open(Options {
            path: Some(path.clone()),
        })
        .unwrap();
        assert!(path.exists());
        assert!(store.credentials().unwrap().is_none());

        let creds = Credentials::new("a1", "r1").unwrap();
        store.save_credentials(&creds).unwrap();
        store
            .save_credentials(&Credentials::new("a2", "r2").unwrap())
            .unwrap();
        store.close().unwrap();

        let store = Store::open(Options { path: Some(path) }).unwrap();
        let (loaded, _) = store.credentials().unwrap().unwrap();
        assert_eq!(loaded.access_token(), "a2");
        assert_eq!(loaded.refresh_token(), "r2");

        store.clear_credentials().unwrap();
        assert!(store.load_credentials().unwrap().is_none());
    }

    #[test]
    fn preferences_round_trip_and_remove() {
        let store = Store::in_memory().unwrap();
        assert_eq!(store.preference("font_size").unwrap(), None);
        store.set_preference("font_size", "large").unwrap();
        store.set_preference("font_size", "small").unwrap();
        assert_eq!(
            store.preference("font_size").unwrap().as_deref(),
            Some("small")
        );
        store.remove_preference("font_size").unwrap();
        assert_eq!(store.preference("font_size").unwrap(), None);
    }

    #[test]
    fn migrations_are_not_reapplied() {
        let store = Store::in_memory().unwrap();
        let conn = store.conn.lock();
        migrate(&conn).unwrap();
        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, migrations().len() as i64);
    }
}
