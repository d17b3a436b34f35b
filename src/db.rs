//! SQLite store for the control plane
//!
//! Durable record of hosts, locations, header rules, streams, access
//! lists, certificates, DNS providers, users, audit events, and settings.
//! The admin API is the only writer; the snapshot publisher reads a
//! consistent view inside one transaction.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// One audit ledger entry, written in the same transaction as the
/// mutation it describes.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub username: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub detail: String,
    pub ip: String,
}

impl AuditEntry {
    pub fn new(
        username: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        detail: impl Into<String>,
        ip: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            detail: detail.into(),
            ip: ip.into(),
        }
    }
}

// ==================== Records ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    #[serde(default)]
    pub id: i64,
    pub domain: String,
    pub targets: Vec<String>,
    pub scheme: String,
    #[serde(default)]
    pub upstream_sni: Option<String>,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub ssl_forced: bool,
    #[serde(default)]
    pub redirect_to: Option<String>,
    #[serde(default = "default_redirect_status")]
    pub redirect_status: u16,
    #[serde(default)]
    pub access_list_id: Option<i64>,
}

fn default_true() -> bool {
    true
}

fn default_redirect_status() -> u16 {
    301
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub host_id: i64,
    pub path: String,
    pub targets: Vec<String>,
    pub scheme: String,
    #[serde(default)]
    pub upstream_sni: Option<String>,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub rewrite: bool,
    #[serde(default)]
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub host_id: i64,
    pub name: String,
    pub value: String,
    /// "request" or "response"
    pub direction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub listen_port: u16,
    /// "tcp" or "udp"
    pub protocol: String,
    pub forward_host: String,
    pub forward_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessListRecord {
    #[serde(default)]
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    #[serde(default)]
    pub list_id: i64,
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpRuleRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub list_id: i64,
    /// CIDR or literal address
    pub ip: String,
    /// "allow" or "deny"
    pub action: String,
    #[serde(default)]
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRecord {
    #[serde(default)]
    pub id: i64,
    pub domain: String,
    pub chain_pem: String,
    pub key_pem: String,
    pub expires_at: i64,
    #[serde(default)]
    pub dns_provider_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsProviderRecord {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// cloudflare, route53, digitalocean, google, ...
    pub provider_type: String,
    /// Opaque INI-format credential blob
    pub credentials: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub password_hash: String,
    pub role: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEventRecord {
    pub id: i64,
    pub ts: i64,
    pub username: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub detail: String,
    pub ip: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TrafficStatRecord {
    pub ts: i64,
    pub requests: u64,
    pub bytes: u64,
    pub status_2xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
}

/// Targets are stored comma-joined; endpoints never contain commas
fn join_targets(targets: &[String]) -> String {
    targets.join(",")
}

fn split_targets(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }

            // Add future migrations here:
            // if current_version < 2 { self.migrate_v2(&conn)?; }
        }

        Ok(())
    }

    /// Migration v1: Initial schema
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            -- Access lists first: hosts reference them
            CREATE TABLE IF NOT EXISTS access_lists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS access_list_clients (
                list_id INTEGER NOT NULL,
                username TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                PRIMARY KEY (list_id, username),
                FOREIGN KEY (list_id) REFERENCES access_lists(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS access_list_ips (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                list_id INTEGER NOT NULL,
                ip TEXT NOT NULL,
                action TEXT NOT NULL CHECK (action IN ('allow', 'deny')),
                position INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (list_id) REFERENCES access_lists(id) ON DELETE CASCADE
            );

            -- Virtual hosts (domain is stored case-folded)
            CREATE TABLE IF NOT EXISTS hosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL UNIQUE,
                targets TEXT NOT NULL,
                scheme TEXT NOT NULL DEFAULT 'http',
                upstream_sni TEXT,
                verify_ssl INTEGER NOT NULL DEFAULT 1,
                ssl_forced INTEGER NOT NULL DEFAULT 0,
                redirect_to TEXT,
                redirect_status INTEGER NOT NULL DEFAULT 301,
                access_list_id INTEGER REFERENCES access_lists(id)
            );

            CREATE TABLE IF NOT EXISTS locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                targets TEXT NOT NULL,
                scheme TEXT NOT NULL DEFAULT 'http',
                upstream_sni TEXT,
                verify_ssl INTEGER NOT NULL DEFAULT 1,
                rewrite INTEGER NOT NULL DEFAULT 0,
                position INTEGER NOT NULL DEFAULT 0,
                UNIQUE (host_id, path),
                FOREIGN KEY (host_id) REFERENCES hosts(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS headers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                direction TEXT NOT NULL CHECK (direction IN ('request', 'response')),
                FOREIGN KEY (host_id) REFERENCES hosts(id) ON DELETE CASCADE
            );

            -- L4 forwards
            CREATE TABLE IF NOT EXISTS streams (
                listen_port INTEGER PRIMARY KEY,
                protocol TEXT NOT NULL CHECK (protocol IN ('tcp', 'udp')),
                forward_host TEXT NOT NULL,
                forward_port INTEGER NOT NULL
            );

            -- DNS providers for DNS-01 challenges
            CREATE TABLE IF NOT EXISTS dns_providers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                provider_type TEXT NOT NULL,
                credentials TEXT NOT NULL
            );

            -- Certificates (PEM material inline; files mirrored on disk)
            CREATE TABLE IF NOT EXISTS certs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL UNIQUE,
                chain_pem TEXT NOT NULL,
                key_pem TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                dns_provider_id INTEGER REFERENCES dns_providers(id) ON DELETE SET NULL
            );

            -- Admin users
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'viewer'
                    CHECK (role IN ('admin', 'operator', 'viewer')),
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Audit ledger
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                username TEXT NOT NULL,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                detail TEXT NOT NULL DEFAULT '',
                ip TEXT NOT NULL DEFAULT ''
            );

            -- Key/value settings (error page template lives here)
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Per-minute traffic history
            CREATE TABLE IF NOT EXISTS traffic_stats (
                ts INTEGER PRIMARY KEY,
                requests INTEGER NOT NULL,
                bytes INTEGER NOT NULL,
                status_2xx INTEGER NOT NULL,
                status_4xx INTEGER NOT NULL,
                status_5xx INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_locations_host ON locations(host_id);
            CREATE INDEX IF NOT EXISTS idx_headers_host ON headers(host_id);
            CREATE INDEX IF NOT EXISTS idx_acl_ips_list ON access_list_ips(list_id);
            CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_events(ts DESC);
            CREATE INDEX IF NOT EXISTS idx_audit_username ON audit_events(username);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    fn audit_in_tx(tx: &Transaction<'_>, entry: &AuditEntry) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO audit_events (ts, username, action, resource_type, resource_id, detail, ip)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                now_unix(),
                entry.username,
                entry.action,
                entry.resource_type,
                entry.resource_id,
                entry.detail,
                entry.ip
            ],
        )?;
        Ok(())
    }

    // ==================== Hosts ====================

    /// Insert or update a host by its case-folded domain
    pub fn upsert_host(&self, host: &HostRecord, audit: &AuditEntry) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let domain = host.domain.to_lowercase();
        tx.execute(
            "INSERT INTO hosts
                (domain, targets, scheme, upstream_sni, verify_ssl, ssl_forced,
                 redirect_to, redirect_status, access_list_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(domain) DO UPDATE SET
                targets = excluded.targets,
                scheme = excluded.scheme,
                upstream_sni = excluded.upstream_sni,
                verify_ssl = excluded.verify_ssl,
                ssl_forced = excluded.ssl_forced,
                redirect_to = excluded.redirect_to,
                redirect_status = excluded.redirect_status,
                access_list_id = excluded.access_list_id",
            params![
                domain,
                join_targets(&host.targets),
                host.scheme,
                host.upstream_sni,
                host.verify_ssl,
                host.ssl_forced,
                host.redirect_to,
                host.redirect_status,
                host.access_list_id
            ],
        )?;

        let id: i64 = tx.query_row(
            "SELECT id FROM hosts WHERE domain = ?1",
            params![domain],
            |row| row.get(0),
        )?;

        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_host(&self, domain: &str) -> Result<Option<HostRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, domain, targets, scheme, upstream_sni, verify_ssl, ssl_forced,
                    redirect_to, redirect_status, access_list_id
             FROM hosts WHERE domain = ?1",
            params![domain.to_lowercase()],
            host_from_row,
        )
        .optional()
        .context("Failed to get host")
    }

    pub fn list_hosts(&self) -> Result<Vec<HostRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, domain, targets, scheme, upstream_sni, verify_ssl, ssl_forced,
                    redirect_to, redirect_status, access_list_id
             FROM hosts ORDER BY domain",
        )?;
        let hosts = stmt
            .query_map([], host_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(hosts)
    }

    /// Delete a host; locations and headers cascade
    pub fn delete_host(&self, domain: &str, audit: &AuditEntry) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "DELETE FROM hosts WHERE domain = ?1",
            params![domain.to_lowercase()],
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    // ==================== Locations ====================

    pub fn upsert_location(&self, loc: &LocationRecord, audit: &AuditEntry) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO locations
                (host_id, path, targets, scheme, upstream_sni, verify_ssl, rewrite, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
                     COALESCE((SELECT MAX(position) + 1 FROM locations WHERE host_id = ?1), 0))
             ON CONFLICT(host_id, path) DO UPDATE SET
                targets = excluded.targets,
                scheme = excluded.scheme,
                upstream_sni = excluded.upstream_sni,
                verify_ssl = excluded.verify_ssl,
                rewrite = excluded.rewrite",
            params![
                loc.host_id,
                loc.path,
                join_targets(&loc.targets),
                loc.scheme,
                loc.upstream_sni,
                loc.verify_ssl,
                loc.rewrite
            ],
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_location(&self, host_id: i64, path: &str, audit: &AuditEntry) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "DELETE FROM locations WHERE host_id = ?1 AND path = ?2",
            params![host_id, path],
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn list_locations(&self) -> Result<Vec<LocationRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, host_id, path, targets, scheme, upstream_sni, verify_ssl, rewrite, position
             FROM locations ORDER BY host_id, position, id",
        )?;
        let locations = stmt
            .query_map([], |row| {
                Ok(LocationRecord {
                    id: row.get(0)?,
                    host_id: row.get(1)?,
                    path: row.get(2)?,
                    targets: split_targets(&row.get::<_, String>(3)?),
                    scheme: row.get(4)?,
                    upstream_sni: row.get(5)?,
                    verify_ssl: row.get(6)?,
                    rewrite: row.get(7)?,
                    position: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(locations)
    }

    // ==================== Header rules ====================

    pub fn add_header(&self, header: &HeaderRecord, audit: &AuditEntry) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO headers (host_id, name, value, direction) VALUES (?1, ?2, ?3, ?4)",
            params![header.host_id, header.name, header.value, header.direction],
        )?;
        let id = tx.last_insert_rowid();
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn delete_header(&self, id: i64, audit: &AuditEntry) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = tx.execute("DELETE FROM headers WHERE id = ?1", params![id])?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn list_headers(&self) -> Result<Vec<HeaderRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, host_id, name, value, direction FROM headers ORDER BY host_id, id",
        )?;
        let headers = stmt
            .query_map([], |row| {
                Ok(HeaderRecord {
                    id: row.get(0)?,
                    host_id: row.get(1)?,
                    name: row.get(2)?,
                    value: row.get(3)?,
                    direction: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(headers)
    }

    // ==================== Streams ====================

    pub fn upsert_stream(&self, stream: &StreamRecord, audit: &AuditEntry) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO streams (listen_port, protocol, forward_host, forward_port)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(listen_port) DO UPDATE SET
                protocol = excluded.protocol,
                forward_host = excluded.forward_host,
                forward_port = excluded.forward_port",
            params![
                stream.listen_port,
                stream.protocol,
                stream.forward_host,
                stream.forward_port
            ],
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_stream(&self, listen_port: u16, audit: &AuditEntry) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "DELETE FROM streams WHERE listen_port = ?1",
            params![listen_port],
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn list_streams(&self) -> Result<Vec<StreamRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT listen_port, protocol, forward_host, forward_port
             FROM streams ORDER BY listen_port",
        )?;
        let streams = stmt
            .query_map([], |row| {
                Ok(StreamRecord {
                    listen_port: row.get(0)?,
                    protocol: row.get(1)?,
                    forward_host: row.get(2)?,
                    forward_port: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(streams)
    }

    // ==================== Access lists ====================

    pub fn create_access_list(&self, name: &str, audit: &AuditEntry) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("INSERT INTO access_lists (name) VALUES (?1)", params![name])?;
        let id = tx.last_insert_rowid();
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(id)
    }

    /// Delete an access list. Refused while any host references it.
    pub fn delete_access_list(&self, id: i64, audit: &AuditEntry) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let referenced: i64 = tx.query_row(
            "SELECT COUNT(*) FROM hosts WHERE access_list_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if referenced > 0 {
            anyhow::bail!("access list {} is referenced by {} host(s)", id, referenced);
        }

        let rows = tx.execute("DELETE FROM access_lists WHERE id = ?1", params![id])?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn list_access_lists(&self) -> Result<Vec<AccessListRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name FROM access_lists ORDER BY id")?;
        let lists = stmt
            .query_map([], |row| {
                Ok(AccessListRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lists)
    }

    pub fn access_list_exists(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM access_lists WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn upsert_client(&self, client: &ClientRecord, audit: &AuditEntry) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO access_list_clients (list_id, username, password_hash)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(list_id, username) DO UPDATE SET
                password_hash = excluded.password_hash",
            params![client.list_id, client.username, client.password_hash],
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_client(&self, list_id: i64, username: &str, audit: &AuditEntry) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "DELETE FROM access_list_clients WHERE list_id = ?1 AND username = ?2",
            params![list_id, username],
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn list_clients(&self) -> Result<Vec<ClientRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT list_id, username, password_hash
             FROM access_list_clients ORDER BY list_id, username",
        )?;
        let clients = stmt
            .query_map([], |row| {
                Ok(ClientRecord {
                    list_id: row.get(0)?,
                    username: row.get(1)?,
                    password_hash: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(clients)
    }

    pub fn add_ip_rule(&self, rule: &IpRuleRecord, audit: &AuditEntry) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO access_list_ips (list_id, ip, action, position)
             VALUES (?1, ?2, ?3,
                     COALESCE((SELECT MAX(position) + 1 FROM access_list_ips WHERE list_id = ?1), 0))",
            params![rule.list_id, rule.ip, rule.action],
        )?;
        let id = tx.last_insert_rowid();
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn delete_ip_rule(&self, list_id: i64, ip: &str, audit: &AuditEntry) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "DELETE FROM access_list_ips WHERE list_id = ?1 AND ip = ?2",
            params![list_id, ip],
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn list_ip_rules(&self) -> Result<Vec<IpRuleRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, list_id, ip, action, position
             FROM access_list_ips ORDER BY list_id, position, id",
        )?;
        let rules = stmt
            .query_map([], |row| {
                Ok(IpRuleRecord {
                    id: row.get(0)?,
                    list_id: row.get(1)?,
                    ip: row.get(2)?,
                    action: row.get(3)?,
                    position: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    // ==================== Certificates ====================

    pub fn upsert_cert(&self, cert: &CertRecord, audit: &AuditEntry) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let domain = cert.domain.to_lowercase();
        tx.execute(
            "INSERT INTO certs (domain, chain_pem, key_pem, expires_at, dns_provider_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(domain) DO UPDATE SET
                chain_pem = excluded.chain_pem,
                key_pem = excluded.key_pem,
                expires_at = excluded.expires_at,
                dns_provider_id = excluded.dns_provider_id",
            params![
                domain,
                cert.chain_pem,
                cert.key_pem,
                cert.expires_at,
                cert.dns_provider_id
            ],
        )?;
        let id: i64 = tx.query_row(
            "SELECT id FROM certs WHERE domain = ?1",
            params![domain],
            |row| row.get(0),
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn delete_cert(&self, id: i64, audit: &AuditEntry) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = tx.execute("DELETE FROM certs WHERE id = ?1", params![id])?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn list_certs(&self) -> Result<Vec<CertRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, domain, chain_pem, key_pem, expires_at, dns_provider_id
             FROM certs ORDER BY domain",
        )?;
        let certs = stmt
            .query_map([], cert_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(certs)
    }

    pub fn get_cert(&self, domain: &str) -> Result<Option<CertRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, domain, chain_pem, key_pem, expires_at, dns_provider_id
             FROM certs WHERE domain = ?1",
            params![domain.to_lowercase()],
            cert_from_row,
        )
        .optional()
        .context("Failed to get certificate")
    }

    /// Certificates expiring before the given UNIX timestamp
    pub fn expiring_certs(&self, before: i64) -> Result<Vec<CertRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, domain, chain_pem, key_pem, expires_at, dns_provider_id
             FROM certs WHERE expires_at < ?1 ORDER BY expires_at",
        )?;
        let certs = stmt
            .query_map(params![before], cert_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(certs)
    }

    // ==================== DNS providers ====================

    pub fn create_dns_provider(
        &self,
        provider: &DnsProviderRecord,
        audit: &AuditEntry,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO dns_providers (name, provider_type, credentials) VALUES (?1, ?2, ?3)",
            params![provider.name, provider.provider_type, provider.credentials],
        )?;
        let id = tx.last_insert_rowid();
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn delete_dns_provider(&self, id: i64, audit: &AuditEntry) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = tx.execute("DELETE FROM dns_providers WHERE id = ?1", params![id])?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn get_dns_provider(&self, id: i64) -> Result<Option<DnsProviderRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, provider_type, credentials FROM dns_providers WHERE id = ?1",
            params![id],
            |row| {
                Ok(DnsProviderRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    provider_type: row.get(2)?,
                    credentials: row.get(3)?,
                })
            },
        )
        .optional()
        .context("Failed to get DNS provider")
    }

    pub fn list_dns_providers(&self) -> Result<Vec<DnsProviderRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, name, provider_type, credentials FROM dns_providers ORDER BY id")?;
        let providers = stmt
            .query_map([], |row| {
                Ok(DnsProviderRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    provider_type: row.get(2)?,
                    credentials: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(providers)
    }

    // ==================== Users ====================

    pub fn create_user(&self, user: &UserRecord, audit: &AuditEntry) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO users (username, password_hash, role) VALUES (?1, ?2, ?3)",
            params![user.username, user.password_hash, user.role],
        )?;
        let id = tx.last_insert_rowid();
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_user(&self, username: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, password_hash, role, created_at, updated_at
             FROM users WHERE username = ?1",
            params![username],
            user_from_row,
        )
        .optional()
        .context("Failed to get user")
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, password_hash, role, created_at, updated_at
             FROM users WHERE id = ?1",
            params![id],
            user_from_row,
        )
        .optional()
        .context("Failed to get user")
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, username, password_hash, role, created_at, updated_at
             FROM users ORDER BY id",
        )?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn update_user_role(&self, id: i64, role: &str, audit: &AuditEntry) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "UPDATE users SET role = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![role, id],
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn update_user_password(
        &self,
        id: i64,
        password_hash: &str,
        audit: &AuditEntry,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "UPDATE users SET password_hash = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![password_hash, id],
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn delete_user(&self, id: i64, audit: &AuditEntry) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = tx.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    /// Seed the bootstrap admin account on an empty users table
    pub fn ensure_default_admin(&self, password_hash: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO users (username, password_hash, role)
             SELECT 'admin', ?1, 'admin'
             WHERE NOT EXISTS (SELECT 1 FROM users)",
            params![password_hash],
        )?;
        Ok(())
    }

    // ==================== Audit ====================

    /// Append an audit event outside any mutation (worker results)
    pub fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_events (ts, username, action, resource_type, resource_id, detail, ip)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                now_unix(),
                entry.username,
                entry.action,
                entry.resource_type,
                entry.resource_id,
                entry.detail,
                entry.ip
            ],
        )?;
        Ok(())
    }

    pub fn list_audit_events(
        &self,
        limit: i64,
        offset: i64,
        username: Option<&str>,
        resource_type: Option<&str>,
    ) -> Result<Vec<AuditEventRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ts, username, action, resource_type, resource_id, detail, ip
             FROM audit_events
             WHERE (?1 IS NULL OR username = ?1)
               AND (?2 IS NULL OR resource_type = ?2)
             ORDER BY ts DESC, id DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let events = stmt
            .query_map(params![username, resource_type, limit, offset], |row| {
                Ok(AuditEventRecord {
                    id: row.get(0)?,
                    ts: row.get(1)?,
                    username: row.get(2)?,
                    action: row.get(3)?,
                    resource_type: row.get(4)?,
                    resource_id: row.get(5)?,
                    detail: row.get(6)?,
                    ip: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ==================== Settings ====================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get setting")
    }

    pub fn set_setting(&self, key: &str, value: &str, audit: &AuditEntry) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Self::audit_in_tx(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }

    // ==================== Traffic history ====================

    pub fn insert_traffic_stat(&self, stat: &TrafficStatRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO traffic_stats (ts, requests, bytes, status_2xx, status_4xx, status_5xx)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(ts) DO UPDATE SET
                requests = requests + excluded.requests,
                bytes = bytes + excluded.bytes,
                status_2xx = status_2xx + excluded.status_2xx,
                status_4xx = status_4xx + excluded.status_4xx,
                status_5xx = status_5xx + excluded.status_5xx",
            params![
                stat.ts,
                stat.requests as i64,
                stat.bytes as i64,
                stat.status_2xx as i64,
                stat.status_4xx as i64,
                stat.status_5xx as i64
            ],
        )?;
        Ok(())
    }

    pub fn traffic_history(&self, since: i64) -> Result<Vec<TrafficStatRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ts, requests, bytes, status_2xx, status_4xx, status_5xx
             FROM traffic_stats WHERE ts >= ?1 ORDER BY ts",
        )?;
        let stats = stmt
            .query_map(params![since], |row| {
                Ok(TrafficStatRecord {
                    ts: row.get(0)?,
                    requests: row.get::<_, i64>(1)? as u64,
                    bytes: row.get::<_, i64>(2)? as u64,
                    status_2xx: row.get::<_, i64>(3)? as u64,
                    status_4xx: row.get::<_, i64>(4)? as u64,
                    status_5xx: row.get::<_, i64>(5)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }
}

/// Everything the snapshot builder needs, read in one pass
#[derive(Debug, Default)]
pub struct ConfigView {
    pub hosts: Vec<HostRecord>,
    pub locations: Vec<LocationRecord>,
    pub headers: Vec<HeaderRecord>,
    pub streams: Vec<StreamRecord>,
    pub access_lists: Vec<AccessListRecord>,
    pub clients: Vec<ClientRecord>,
    pub ip_rules: Vec<IpRuleRecord>,
    pub certs: Vec<CertRecord>,
    pub error_page: String,
}

impl Database {
    /// Read all routing-relevant tables under a single connection lock so
    /// the snapshot builder sees a consistent cross-table view.
    pub fn config_view(&self) -> Result<ConfigView> {
        let conn = self.conn.lock().unwrap();

        let hosts = conn
            .prepare(
                "SELECT id, domain, targets, scheme, upstream_sni, verify_ssl, ssl_forced,
                        redirect_to, redirect_status, access_list_id
                 FROM hosts ORDER BY domain",
            )?
            .query_map([], host_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let locations = conn
            .prepare(
                "SELECT id, host_id, path, targets, scheme, upstream_sni, verify_ssl,
                        rewrite, position
                 FROM locations ORDER BY host_id, position, id",
            )?
            .query_map([], |row| {
                Ok(LocationRecord {
                    id: row.get(0)?,
                    host_id: row.get(1)?,
                    path: row.get(2)?,
                    targets: split_targets(&row.get::<_, String>(3)?),
                    scheme: row.get(4)?,
                    upstream_sni: row.get(5)?,
                    verify_ssl: row.get(6)?,
                    rewrite: row.get(7)?,
                    position: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let headers = conn
            .prepare("SELECT id, host_id, name, value, direction FROM headers ORDER BY host_id, id")?
            .query_map([], |row| {
                Ok(HeaderRecord {
                    id: row.get(0)?,
                    host_id: row.get(1)?,
                    name: row.get(2)?,
                    value: row.get(3)?,
                    direction: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let streams = conn
            .prepare(
                "SELECT listen_port, protocol, forward_host, forward_port
                 FROM streams ORDER BY listen_port",
            )?
            .query_map([], |row| {
                Ok(StreamRecord {
                    listen_port: row.get(0)?,
                    protocol: row.get(1)?,
                    forward_host: row.get(2)?,
                    forward_port: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let access_lists = conn
            .prepare("SELECT id, name FROM access_lists ORDER BY id")?
            .query_map([], |row| {
                Ok(AccessListRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let clients = conn
            .prepare(
                "SELECT list_id, username, password_hash
                 FROM access_list_clients ORDER BY list_id, username",
            )?
            .query_map([], |row| {
                Ok(ClientRecord {
                    list_id: row.get(0)?,
                    username: row.get(1)?,
                    password_hash: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let ip_rules = conn
            .prepare(
                "SELECT id, list_id, ip, action, position
                 FROM access_list_ips ORDER BY list_id, position, id",
            )?
            .query_map([], |row| {
                Ok(IpRuleRecord {
                    id: row.get(0)?,
                    list_id: row.get(1)?,
                    ip: row.get(2)?,
                    action: row.get(3)?,
                    position: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let certs = conn
            .prepare(
                "SELECT id, domain, chain_pem, key_pem, expires_at, dns_provider_id
                 FROM certs ORDER BY domain",
            )?
            .query_map([], cert_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let error_page: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = 'error_page_html'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        Ok(ConfigView {
            hosts,
            locations,
            headers,
            streams,
            access_lists,
            clients,
            ip_rules,
            certs,
            error_page: error_page.unwrap_or_default(),
        })
    }
}

fn host_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HostRecord> {
    Ok(HostRecord {
        id: row.get(0)?,
        domain: row.get(1)?,
        targets: split_targets(&row.get::<_, String>(2)?),
        scheme: row.get(3)?,
        upstream_sni: row.get(4)?,
        verify_ssl: row.get(5)?,
        ssl_forced: row.get(6)?,
        redirect_to: row.get(7)?,
        redirect_status: row.get::<_, i64>(8)? as u16,
        access_list_id: row.get(9)?,
    })
}

fn cert_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CertRecord> {
    Ok(CertRecord {
        id: row.get(0)?,
        domain: row.get(1)?,
        chain_pem: row.get(2)?,
        key_pem: row.get(3)?,
        expires_at: row.get(4)?,
        dns_provider_id: row.get(5)?,
    })
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        role: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Seconds since the UNIX epoch
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit() -> AuditEntry {
        AuditEntry::new("test", "create", "test", "1", "", "127.0.0.1")
    }

    fn sample_host(domain: &str) -> HostRecord {
        HostRecord {
            id: 0,
            domain: domain.to_string(),
            targets: vec!["10.0.0.1:9000".to_string()],
            scheme: "http".to_string(),
            upstream_sni: None,
            verify_ssl: true,
            ssl_forced: false,
            redirect_to: None,
            redirect_status: 301,
            access_list_id: None,
        }
    }

    #[test]
    fn test_upsert_host_case_folds_domain() {
        let db = Database::open_in_memory().unwrap();

        db.upsert_host(&sample_host("Example.COM"), &audit()).unwrap();

        let host = db.get_host("example.com").unwrap().unwrap();
        assert_eq!(host.domain, "example.com");
        assert_eq!(host.targets, vec!["10.0.0.1:9000"]);

        // Lookup via mixed case also folds
        assert!(db.get_host("EXAMPLE.com").unwrap().is_some());
    }

    #[test]
    fn test_upsert_host_is_idempotent_update() {
        let db = Database::open_in_memory().unwrap();

        let id1 = db.upsert_host(&sample_host("a.test"), &audit()).unwrap();

        let mut updated = sample_host("a.test");
        updated.targets = vec!["10.0.0.2:9000".to_string(), "10.0.0.3:9000".to_string()];
        let id2 = db.upsert_host(&updated, &audit()).unwrap();

        assert_eq!(id1, id2);
        let host = db.get_host("a.test").unwrap().unwrap();
        assert_eq!(host.targets.len(), 2);
        assert_eq!(db.list_hosts().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_host_cascades_locations_and_headers() {
        let db = Database::open_in_memory().unwrap();
        let host_id = db.upsert_host(&sample_host("a.test"), &audit()).unwrap();

        db.upsert_location(
            &LocationRecord {
                id: 0,
                host_id,
                path: "/api".to_string(),
                targets: vec!["10.0.0.2:9000".to_string()],
                scheme: "http".to_string(),
                upstream_sni: None,
                verify_ssl: true,
                rewrite: true,
                position: 0,
            },
            &audit(),
        )
        .unwrap();
        db.add_header(
            &HeaderRecord {
                id: 0,
                host_id,
                name: "X-Custom".to_string(),
                value: "1".to_string(),
                direction: "request".to_string(),
            },
            &audit(),
        )
        .unwrap();

        assert!(db.delete_host("a.test", &audit()).unwrap());
        assert!(db.list_locations().unwrap().is_empty());
        assert!(db.list_headers().unwrap().is_empty());
    }

    #[test]
    fn test_location_unique_per_host_path() {
        let db = Database::open_in_memory().unwrap();
        let host_id = db.upsert_host(&sample_host("a.test"), &audit()).unwrap();

        let loc = LocationRecord {
            id: 0,
            host_id,
            path: "/api".to_string(),
            targets: vec!["10.0.0.2:9000".to_string()],
            scheme: "http".to_string(),
            upstream_sni: None,
            verify_ssl: true,
            rewrite: false,
            position: 0,
        };
        db.upsert_location(&loc, &audit()).unwrap();

        let mut replaced = loc.clone();
        replaced.targets = vec!["10.0.0.9:9000".to_string()];
        db.upsert_location(&replaced, &audit()).unwrap();

        let locations = db.list_locations().unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].targets, vec!["10.0.0.9:9000"]);
    }

    #[test]
    fn test_access_list_delete_refused_while_referenced() {
        let db = Database::open_in_memory().unwrap();
        let list_id = db.create_access_list("office", &audit()).unwrap();

        let mut host = sample_host("a.test");
        host.access_list_id = Some(list_id);
        db.upsert_host(&host, &audit()).unwrap();

        assert!(db.delete_access_list(list_id, &audit()).is_err());

        // Unlink the host, then deletion succeeds
        host.access_list_id = None;
        db.upsert_host(&host, &audit()).unwrap();
        assert!(db.delete_access_list(list_id, &audit()).unwrap());
    }

    #[test]
    fn test_access_list_children() {
        let db = Database::open_in_memory().unwrap();
        let list_id = db.create_access_list("office", &audit()).unwrap();

        db.upsert_client(
            &ClientRecord {
                list_id,
                username: "alice".to_string(),
                password_hash: "h".to_string(),
            },
            &audit(),
        )
        .unwrap();
        db.add_ip_rule(
            &IpRuleRecord {
                id: 0,
                list_id,
                ip: "10.0.0.0/8".to_string(),
                action: "allow".to_string(),
                position: 0,
            },
            &audit(),
        )
        .unwrap();
        db.add_ip_rule(
            &IpRuleRecord {
                id: 0,
                list_id,
                ip: "192.0.2.5".to_string(),
                action: "deny".to_string(),
                position: 0,
            },
            &audit(),
        )
        .unwrap();

        let rules = db.list_ip_rules().unwrap();
        assert_eq!(rules.len(), 2);
        // Declaration order preserved via position
        assert_eq!(rules[0].ip, "10.0.0.0/8");
        assert_eq!(rules[1].ip, "192.0.2.5");

        assert_eq!(db.list_clients().unwrap().len(), 1);
    }

    #[test]
    fn test_stream_unique_by_port() {
        let db = Database::open_in_memory().unwrap();

        db.upsert_stream(
            &StreamRecord {
                listen_port: 3307,
                protocol: "tcp".to_string(),
                forward_host: "db".to_string(),
                forward_port: 3306,
            },
            &audit(),
        )
        .unwrap();
        db.upsert_stream(
            &StreamRecord {
                listen_port: 3307,
                protocol: "udp".to_string(),
                forward_host: "db2".to_string(),
                forward_port: 53,
            },
            &audit(),
        )
        .unwrap();

        let streams = db.list_streams().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].protocol, "udp");

        assert!(db.delete_stream(3307, &audit()).unwrap());
        assert!(db.list_streams().unwrap().is_empty());
    }

    #[test]
    fn test_expiring_certs() {
        let db = Database::open_in_memory().unwrap();

        db.upsert_cert(
            &CertRecord {
                id: 0,
                domain: "soon.test".to_string(),
                chain_pem: "chain".to_string(),
                key_pem: "key".to_string(),
                expires_at: 1_000,
                dns_provider_id: None,
            },
            &audit(),
        )
        .unwrap();
        db.upsert_cert(
            &CertRecord {
                id: 0,
                domain: "later.test".to_string(),
                chain_pem: "chain".to_string(),
                key_pem: "key".to_string(),
                expires_at: 2_000_000,
                dns_provider_id: None,
            },
            &audit(),
        )
        .unwrap();

        let expiring = db.expiring_certs(10_000).unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].domain, "soon.test");
    }

    #[test]
    fn test_audit_written_with_mutation() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_host(
            &sample_host("a.test"),
            &AuditEntry::new("admin", "upsert", "host", "a.test", "", "127.0.0.1"),
        )
        .unwrap();

        let events = db.list_audit_events(10, 0, None, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].username, "admin");
        assert_eq!(events[0].resource_type, "host");

        let filtered = db
            .list_audit_events(10, 0, Some("nobody"), None)
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_default_admin_seeded_once() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_default_admin("hash1").unwrap();
        db.ensure_default_admin("hash2").unwrap();

        let admin = db.get_user("admin").unwrap().unwrap();
        assert_eq!(admin.password_hash, "hash1");
        assert_eq!(admin.role, "admin");
        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_settings_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_setting("error_page_html").unwrap().is_none());

        db.set_setting("error_page_html", "<h1>%%STATUS%%</h1>", &audit())
            .unwrap();
        assert_eq!(
            db.get_setting("error_page_html").unwrap().unwrap(),
            "<h1>%%STATUS%%</h1>"
        );
    }

    #[test]
    fn test_traffic_history_window() {
        let db = Database::open_in_memory().unwrap();
        db.insert_traffic_stat(&TrafficStatRecord {
            ts: 60,
            requests: 5,
            bytes: 100,
            status_2xx: 4,
            status_4xx: 1,
            status_5xx: 0,
        })
        .unwrap();
        db.insert_traffic_stat(&TrafficStatRecord {
            ts: 120,
            requests: 2,
            bytes: 10,
            status_2xx: 2,
            status_4xx: 0,
            status_5xx: 0,
        })
        .unwrap();

        let history = db.traffic_history(100).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].ts, 120);
    }
}
