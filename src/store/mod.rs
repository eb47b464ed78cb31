pub mod merge;
pub mod migrations;
pub mod queries;

pub use merge::*;
pub use migrations::{LATEST_SCHEMA_VERSION, MIGRATIONS};
pub use queries::*;

use crate::config::{Config, QueryConfig};
use crate::error::{SqliteContext, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Campaign scoped, schema versioned SQLite store.
/// Every write of a scan session runs in one transaction while holding the
/// connection lock, so readers only ever see committed sessions.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    query: QueryConfig,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open database {}", path.display()))?;
        info!("Opened store {}", path.display());
        Self::init(conn)
    }

    /// Opens the configured database with the configured query limits.
    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        Ok(Self::open(&config.database.path)?.with_query_config(config.query.clone()))
    }

    pub fn with_query_config(mut self, query: QueryConfig) -> Self {
        self.query = query;
        self
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("enable foreign keys")?;
        migrations::apply_migrations(&mut conn, &MIGRATIONS, LATEST_SCHEMA_VERSION)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            query: QueryConfig::default(),
        })
    }

    pub(crate) fn connection(&self) -> &Mutex<Connection> {
        &self.conn
    }

    // A zero limit means the configured page size
    pub(crate) fn page_limit(&self, limit: u32) -> u32 {
        if limit == 0 {
            self.query.page_size.max(1)
        } else {
            limit
        }
    }

    // Exports never exceed the configured cap, zero asks for the cap itself
    pub(crate) fn export_limit(&self, limit: u32) -> u32 {
        if limit == 0 {
            self.query.export_limit
        } else {
            limit.min(self.query.export_limit)
        }
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        migrations::schema_version(&self.conn.lock())
    }

    /// Looks a campaign up by name and creates it on first reference.
    pub fn get_or_create_campaign(&self, name: &str) -> Result<i64, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("campaign name is empty".to_string()));
        }
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM campaigns WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("query campaign '{}'", name))?;

        if let Some(id) = existing {
            info!("Found existing campaign '{}' ({}), new data will be added to it", name, id);
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO campaigns (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("create campaign '{}'", name))?;
        let id = conn.last_insert_rowid();
        info!("Created campaign '{}' ({})", name, id);
        Ok(id)
    }

    pub fn list_campaigns(&self) -> Result<Vec<Campaign>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, name, created_at FROM campaigns ORDER BY created_at DESC, id DESC")
            .context("prepare campaign listing")?;
        let rows = stmt
            .query_map([], campaign_from_row)
            .context("list campaigns")?;
        rows.collect::<Result<Vec<_>, _>>().context("read campaign row")
    }

    pub fn get_campaign(&self, id: i64) -> Result<Campaign, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, created_at FROM campaigns WHERE id = ?1",
            params![id],
            campaign_from_row,
        )
        .optional()
        .with_context(|| format!("query campaign {}", id))?
        .ok_or_else(|| StoreError::NotFound(format!("campaign {}", id)))
    }

    /// Removes a campaign and, through cascading keys, everything recorded under it.
    pub fn delete_campaign(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute("DELETE FROM campaigns WHERE id = ?1", params![id])
            .with_context(|| format!("delete campaign {}", id))?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("campaign {}", id)));
        }
        info!("Deleted campaign {}", id);
        Ok(())
    }
}

fn campaign_from_row(row: &rusqlite::Row) -> rusqlite::Result<Campaign> {
    let created_at: String = row.get(2)?;
    Ok(Campaign {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_timestamp(&created_at),
    })
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_is_migrated() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), LATEST_SCHEMA_VERSION);
    }

    #[test]
    fn test_campaign_is_reused_by_name() {
        let store = Store::open_in_memory().unwrap();
        let first = store.get_or_create_campaign("site-A").unwrap();
        let again = store.get_or_create_campaign(" site-A ").unwrap();
        let other = store.get_or_create_campaign("site-B").unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);

        let campaigns = store.list_campaigns().unwrap();
        assert_eq!(campaigns.len(), 2);
        assert_eq!(store.get_campaign(first).unwrap().name, "site-A");
        assert!(matches!(
            store.get_or_create_campaign("  "),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn test_delete_campaign() {
        let store = Store::open_in_memory().unwrap();
        let id = store.get_or_create_campaign("gone").unwrap();
        store.delete_campaign(id).unwrap();
        assert!(matches!(store.get_campaign(id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete_campaign(id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_query_limits_follow_config() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.page_limit(0), 50, "Zero falls back to the default page size");
        assert_eq!(store.page_limit(7), 7);
        assert_eq!(store.export_limit(0), 10000);

        let store = store.with_query_config(QueryConfig {
            page_size: 2,
            export_limit: 5,
        });
        assert_eq!(store.page_limit(0), 2);
        assert_eq!(store.export_limit(0), 5);
        assert_eq!(store.export_limit(100), 5, "Export requests are capped");
        assert_eq!(store.export_limit(3), 3);
    }

    #[test]
    fn test_from_config_applies_query_section() {
        let dir = std::env::temp_dir().join(format!("snailshell-config-{}", std::process::id()));
        let mut config = Config::from_toml("[query]\npage_size = 3\nexport_limit = 4\n").unwrap();
        config.database.path = dir.join("configured.db");

        let store = Store::from_config(&config).unwrap();
        assert_eq!(store.page_limit(0), 3);
        assert_eq!(store.export_limit(0), 4);
        assert_eq!(store.schema_version().unwrap(), LATEST_SCHEMA_VERSION);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_open_on_disk_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("snailshell-store-{}", std::process::id()));
        let path = dir.join("campaigns.db");
        let _ = std::fs::remove_file(&path);
        {
            let store = Store::open(&path).unwrap();
            store.get_or_create_campaign("persisted").unwrap();
        }
        let store = Store::open(&path).unwrap();
        let campaigns = store.list_campaigns().unwrap();
        assert_eq!(campaigns.len(), 1);
        assert_eq!(campaigns[0].name, "persisted");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
