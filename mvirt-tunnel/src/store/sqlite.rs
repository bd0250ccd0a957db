use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Result, StoreError, TunnelStore};
use crate::tunnel::{TunnelDescriptor, TunnelKind, TunnelSpec, TunnelStatus};

const COLUMNS: &str = "id, name, kind, local_ip, remote_ip, assigned_ip, mtu, interface_name, \
                       status, status_message, created_at, updated_at";

/// SQLite-backed tunnel store.
pub struct SqliteStore {
    pool: SqlitePool,
    /// Serializes writers so claim checks and inserts happen atomically.
    write_lock: Mutex<()>,
}

impl SqliteStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(sqlx::Error::Io)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Store backed by a private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        // Every connection to :memory: is its own database, so keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tunnels (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                local_ip TEXT NOT NULL,
                remote_ip TEXT NOT NULL,
                assigned_ip TEXT NOT NULL,
                mtu INTEGER,
                interface_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'inactive',
                status_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS interface_claims (
                interface_name TEXT PRIMARY KEY,
                tunnel_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

async fn check_claim(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    interface_name: &str,
) -> Result<()> {
    let holder: Option<String> =
        sqlx::query_scalar("SELECT tunnel_id FROM interface_claims WHERE interface_name = ?")
            .bind(interface_name)
            .fetch_optional(&mut **tx)
            .await?;

    match holder {
        Some(holder) if holder != id => Err(StoreError::Conflict {
            interface_name: interface_name.to_string(),
            holder,
        }),
        _ => Ok(()),
    }
}

async fn insert_claim(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    interface_name: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO interface_claims (interface_name, tunnel_id) VALUES (?, ?)
        ON CONFLICT(interface_name) DO UPDATE SET tunnel_id = excluded.tunnel_id
        "#,
    )
    .bind(interface_name)
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn corrupt(id: &str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_column<T: FromStr>(id: &str, column: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| corrupt(id, format!("invalid {}: {}", column, value)))
}

fn parse_time(id: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(id, e))
}

fn row_to_tunnel(row: &SqliteRow) -> Result<TunnelDescriptor> {
    let id: String = row.get("id");
    let mtu = match row.get::<Option<i64>, _>("mtu") {
        Some(mtu) => Some(u16::try_from(mtu).map_err(|e| corrupt(&id, e))?),
        None => None,
    };

    Ok(TunnelDescriptor {
        name: row.get("name"),
        kind: parse_column::<TunnelKind>(&id, "kind", row.get("kind"))?,
        local_ip: parse_column(&id, "local_ip", row.get("local_ip"))?,
        remote_ip: parse_column(&id, "remote_ip", row.get("remote_ip"))?,
        assigned_ip: parse_column(&id, "assigned_ip", row.get("assigned_ip"))?,
        mtu,
        interface_name: row.get("interface_name"),
        status: parse_column::<TunnelStatus>(&id, "status", row.get("status"))?,
        status_message: row.get("status_message"),
        created_at: parse_time(&id, row.get("created_at"))?,
        updated_at: parse_time(&id, row.get("updated_at"))?,
        id,
    })
}

#[async_trait]
impl TunnelStore for SqliteStore {
    async fn list(&self) -> Result<Vec<TunnelDescriptor>> {
        let rows = sqlx::query(&format!("SELECT {} FROM tunnels ORDER BY seq", COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_tunnel).collect()
    }

    async fn get(&self, id: &str) -> Result<TunnelDescriptor> {
        let row = sqlx::query(&format!("SELECT {} FROM tunnels WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_tunnel(&row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn reserve(&self, spec: TunnelSpec) -> Result<TunnelDescriptor> {
        let _guard = self.write_lock.lock().await;
        let id = Uuid::new_v4().to_string();

        let mut tx = self.pool.begin().await?;
        check_claim(&mut tx, &id, &spec.interface_name).await?;
        insert_claim(&mut tx, &id, &spec.interface_name).await?;
        tx.commit().await?;

        Ok(TunnelDescriptor::new(id, spec))
    }

    async fn claim(&self, id: &str, interface_name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        check_claim(&mut tx, id, interface_name).await?;
        insert_claim(&mut tx, id, interface_name).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit(&self, tunnel: &TunnelDescriptor) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        check_claim(&mut tx, &tunnel.id, &tunnel.interface_name).await?;

        sqlx::query(
            r#"
            INSERT INTO tunnels (id, name, kind, local_ip, remote_ip, assigned_ip, mtu,
                                 interface_name, status, status_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                local_ip = excluded.local_ip,
                remote_ip = excluded.remote_ip,
                assigned_ip = excluded.assigned_ip,
                mtu = excluded.mtu,
                interface_name = excluded.interface_name,
                status = excluded.status,
                status_message = excluded.status_message,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&tunnel.id)
        .bind(&tunnel.name)
        .bind(tunnel.kind.as_str())
        .bind(tunnel.local_ip.to_string())
        .bind(tunnel.remote_ip.to_string())
        .bind(tunnel.assigned_ip.to_string())
        .bind(tunnel.mtu.map(i64::from))
        .bind(&tunnel.interface_name)
        .bind(tunnel.status.as_str())
        .bind(&tunnel.status_message)
        .bind(tunnel.created_at.to_rfc3339())
        .bind(tunnel.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM interface_claims WHERE tunnel_id = ? AND interface_name != ?")
            .bind(&tunnel.id)
            .bind(&tunnel.interface_name)
            .execute(&mut *tx)
            .await?;
        insert_claim(&mut tx, &tunnel.id, &tunnel.interface_name).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn release(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            r#"
            DELETE FROM interface_claims
            WHERE tunnel_id = ?
              AND interface_name NOT IN (SELECT interface_name FROM tunnels WHERE id = ?)
            "#,
        )
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM tunnels WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        sqlx::query("DELETE FROM interface_claims WHERE tunnel_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
