use crate::error::{SqliteContext, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

pub const LATEST_SCHEMA_VERSION: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub script: &'static str,
}

const V1_CORE: &str = r#"
CREATE TABLE IF NOT EXISTS campaigns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS hosts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
    mac_address TEXT NOT NULL DEFAULT '',
    ip_address TEXT NOT NULL DEFAULT '',
    os_guess TEXT NOT NULL DEFAULT '',
    vendor TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT '',
    discovered_by TEXT NOT NULL DEFAULT '',
    device_type TEXT NOT NULL DEFAULT '',
    behavioral_clues TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS ports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    port_number INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT '',
    service TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL DEFAULT '',
    UNIQUE(host_id, port_number, protocol)
);

CREATE TABLE IF NOT EXISTS vulnerabilities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    port_id INTEGER REFERENCES ports(id) ON DELETE CASCADE,
    cve TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS communications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    counterpart_ip TEXT NOT NULL,
    packet_count INTEGER NOT NULL DEFAULT 0,
    geo_country TEXT,
    geo_city TEXT,
    geo_isp TEXT
);

CREATE TABLE IF NOT EXISTS dns_lookups (
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    domain TEXT NOT NULL,
    UNIQUE(host_id, domain)
);
"#;

const V2_HARVEST: &str = r#"
CREATE TABLE IF NOT EXISTS handshakes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
    ap_mac TEXT NOT NULL,
    client_mac TEXT NOT NULL,
    ssid TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL,
    pcap_file TEXT NOT NULL DEFAULT '',
    key_data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS credentials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    endpoint TEXT NOT NULL,
    type TEXT NOT NULL,
    value TEXT NOT NULL,
    pcap_file TEXT NOT NULL DEFAULT '',
    captured_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

const V3_WEB: &str = r#"
CREATE TABLE IF NOT EXISTS web_responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    port_id INTEGER NOT NULL REFERENCES ports(id) ON DELETE CASCADE,
    method TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    headers TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS screenshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    port_id INTEGER NOT NULL REFERENCES ports(id) ON DELETE CASCADE,
    image_data BLOB NOT NULL,
    capture_time TEXT NOT NULL
);
"#;

const V4_SERVICE_PROBES: &str = r#"
CREATE TABLE IF NOT EXISTS ftp_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    port_id INTEGER NOT NULL REFERENCES ports(id) ON DELETE CASCADE,
    address TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT NOT NULL DEFAULT '',
    anonymous_login_possible INTEGER NOT NULL DEFAULT 0,
    current_dir TEXT NOT NULL DEFAULT '',
    directory_listing TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS ssh_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    port_id INTEGER NOT NULL REFERENCES ports(id) ON DELETE CASCADE,
    address TEXT NOT NULL,
    user TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    error TEXT NOT NULL DEFAULT '',
    successful INTEGER NOT NULL DEFAULT 0,
    output TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS smb_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    port_id INTEGER NOT NULL REFERENCES ports(id) ON DELETE CASCADE,
    address TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT NOT NULL DEFAULT '',
    successful INTEGER NOT NULL DEFAULT 0,
    shares TEXT NOT NULL DEFAULT ''
);
"#;

const V5_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_hosts_campaign_mac ON hosts(campaign_id, mac_address);
CREATE INDEX IF NOT EXISTS idx_hosts_campaign_ip ON hosts(campaign_id, ip_address);
CREATE INDEX IF NOT EXISTS idx_ports_host ON ports(host_id);
CREATE INDEX IF NOT EXISTS idx_vulns_host ON vulnerabilities(host_id);
CREATE INDEX IF NOT EXISTS idx_comms_host ON communications(host_id);
CREATE INDEX IF NOT EXISTS idx_handshakes_campaign ON handshakes(campaign_id);
CREATE INDEX IF NOT EXISTS idx_credentials_campaign ON credentials(campaign_id);
"#;

pub const MIGRATIONS: [Migration; 5] = [
    Migration { version: 1, script: V1_CORE },
    Migration { version: 2, script: V2_HARVEST },
    Migration { version: 3, script: V3_WEB },
    Migration { version: 4, script: V4_SERVICE_PROBES },
    Migration { version: 5, script: V5_INDEXES },
];

pub fn ensure_meta_table(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT);")
        .context("create db_meta table")
}

pub fn schema_version(conn: &Connection) -> Result<u32, StoreError> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM db_meta WHERE key = 'version'", [], |row| {
            row.get(0)
        })
        .optional()
        .context("read schema version")?;
    Ok(value.and_then(|v| v.trim().parse().ok()).unwrap_or(0))
}

/// Brings the schema from its recorded version up to `target`.
/// Pending scripts run in ascending order inside one transaction, so a failure
/// leaves the previously recorded version untouched.
pub fn apply_migrations(
    conn: &mut Connection,
    migrations: &[Migration],
    target: u32,
) -> Result<u32, StoreError> {
    ensure_meta_table(conn)?;
    let current = schema_version(conn)?;
    info!(
        "Store schema version: {}. Required version: {}.",
        current, target
    );

    if current > target {
        return Err(StoreError::SchemaTooNew {
            found: current,
            supported: target,
        });
    }
    if current == target {
        return Ok(current);
    }

    let mut pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| m.version > current && m.version <= target)
        .collect();
    pending.sort_by_key(|m| m.version);

    let tx = conn.transaction().context("begin migration transaction")?;
    for migration in pending {
        info!("Applying schema migration {}", migration.version);
        tx.execute_batch(migration.script)
            .map_err(|source| StoreError::Migration {
                version: migration.version,
                source,
            })?;
    }
    tx.execute(
        "INSERT OR REPLACE INTO db_meta (key, value) VALUES ('version', ?1)",
        params![target.to_string()],
    )
    .context("record schema version")?;
    tx.commit().context("commit migrations")?;

    info!("Store schema migrated to version {}", target);
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_fresh_database_reaches_latest() {
        let mut conn = Connection::open_in_memory().unwrap();
        let version = apply_migrations(&mut conn, &MIGRATIONS, LATEST_SCHEMA_VERSION).unwrap();
        assert_eq!(version, LATEST_SCHEMA_VERSION);
        assert_eq!(schema_version(&conn).unwrap(), LATEST_SCHEMA_VERSION);
        for table in ["campaigns", "hosts", "handshakes", "screenshots", "smb_results"] {
            assert!(table_exists(&conn, table), "missing table {}", table);
        }
        // Second run is a no-op
        assert_eq!(
            apply_migrations(&mut conn, &MIGRATIONS, LATEST_SCHEMA_VERSION).unwrap(),
            LATEST_SCHEMA_VERSION
        );
    }

    #[test]
    fn test_upgrade_from_version_two() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, &MIGRATIONS, 2).unwrap();
        assert!(!table_exists(&conn, "web_responses"));

        apply_migrations(&mut conn, &MIGRATIONS, LATEST_SCHEMA_VERSION).unwrap();
        assert!(table_exists(&conn, "web_responses"));
        assert!(table_exists(&conn, "ftp_results"));
        assert_eq!(schema_version(&conn).unwrap(), 5);
    }

    #[test]
    fn test_failure_at_version_four_keeps_version_two() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, &MIGRATIONS, 2).unwrap();

        let broken = [
            MIGRATIONS[0],
            MIGRATIONS[1],
            MIGRATIONS[2],
            Migration {
                version: 4,
                script: "CREATE TABLE ftp_results (id INTEGER PRIMARY KEY); THIS IS NOT SQL;",
            },
            MIGRATIONS[4],
        ];
        let err = apply_migrations(&mut conn, &broken, LATEST_SCHEMA_VERSION).unwrap_err();
        assert!(matches!(err, StoreError::Migration { version: 4, .. }), "got {:?}", err);

        assert_eq!(schema_version(&conn).unwrap(), 2);
        assert!(!table_exists(&conn, "web_responses"), "Version 3 must be rolled back");
        assert!(!table_exists(&conn, "ftp_results"));
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, &MIGRATIONS, LATEST_SCHEMA_VERSION).unwrap();
        let err = apply_migrations(&mut conn, &MIGRATIONS, 3).unwrap_err();
        assert!(matches!(err, StoreError::SchemaTooNew { found: 5, supported: 3 }));
    }
}
