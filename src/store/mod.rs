//! SQLite-backed keyed collections `devices`, `users`, `groups`.
//!
//! Every device mutation goes through a method here and emits a change
//! event on the broadcast channel, which backs the `/websocket/devicechanges`
//! feed. The only primitive that crosses the `¬using → using` transition is
//! [`Store::try_claim`], an atomic compare-and-set.

mod types;

pub use types::{Device, DeviceEvent, Group, GroupRole, Platform, Source, User};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::collections::BTreeMap;
use std::{path::Path, str::FromStr};
use tokio::sync::broadcast;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

// ─── Row types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
struct DeviceRow {
    udid: String,
    platform: String,
    properties: String,
    sources: String,
    owner: String,
    in_use: i64,
    colding: i64,
    user_id: Option<String>,
    using_began_at: Option<String>,
    last_activated_at: Option<String>,
    idle_timeout: i64,
    using_duration: i64,
    department: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct UserRow {
    email: String,
    username: String,
    admin: i64,
    token: String,
    secret_key: String,
    settings: String,
    created_at: String,
    last_logged_in_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct GroupRow {
    id: String,
    name: String,
    creator: String,
    members: String,
    created_at: String,
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in store: {s}"))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: &Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

impl DeviceRow {
    fn into_device(self) -> Result<Device> {
        Ok(Device {
            platform: Platform::parse(&self.platform),
            properties: serde_json::from_str(&self.properties)
                .context("bad properties JSON in store")?,
            sources: serde_json::from_str(&self.sources).context("bad sources JSON in store")?,
            owner: self.owner,
            using: self.in_use != 0,
            colding: self.colding != 0,
            user_id: self.user_id,
            using_began_at: parse_opt_ts(&self.using_began_at)?,
            last_activated_at: parse_opt_ts(&self.last_activated_at)?,
            idle_timeout: self.idle_timeout,
            using_duration: self.using_duration,
            department: self.department,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            udid: self.udid,
        })
    }
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        Ok(User {
            username: self.username,
            admin: self.admin != 0,
            token: self.token,
            secret_key: self.secret_key,
            settings: serde_json::from_str(&self.settings).context("bad settings JSON")?,
            created_at: parse_ts(&self.created_at)?,
            last_logged_in_at: parse_ts(&self.last_logged_in_at)?,
            email: self.email,
        })
    }
}

impl GroupRow {
    fn into_group(self) -> Result<Group> {
        Ok(Group {
            name: self.name,
            creator: self.creator,
            members: serde_json::from_str(&self.members).context("bad members JSON")?,
            created_at: parse_ts(&self.created_at)?,
            id: self.id,
        })
    }
}

// ─── Query filters ────────────────────────────────────────────────────────────

/// Which devices a principal may observe. Folded into the SQL `WHERE`
/// clause so pagination and counts stay consistent.
#[derive(Debug, Clone)]
pub enum Visibility {
    /// Admins see everything.
    All,
    /// Everyone else sees public devices plus devices owned by their email
    /// or one of their groups.
    Scoped { email: String, groups: Vec<String> },
}

#[derive(Debug, Clone, Default)]
pub struct DeviceQuery {
    pub platform: Option<Platform>,
    /// `present ∧ ¬using ∧ ¬colding`
    pub usable: Option<bool>,
    pub present: Option<bool>,
}

// ─── Store ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    changes: broadcast::Sender<DeviceEvent>,
}

impl Store {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("fleetd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        let (changes, _) = broadcast::channel(1024);
        Ok(Self { pool, changes })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for stmt in [
            "CREATE TABLE IF NOT EXISTS devices (
                udid TEXT PRIMARY KEY,
                platform TEXT NOT NULL DEFAULT 'unknown',
                properties TEXT NOT NULL DEFAULT '{}',
                sources TEXT NOT NULL DEFAULT '{}',
                owner TEXT NOT NULL DEFAULT '',
                in_use INTEGER NOT NULL DEFAULT 0,
                colding INTEGER NOT NULL DEFAULT 0,
                user_id TEXT,
                using_began_at TEXT,
                last_activated_at TEXT,
                idle_timeout INTEGER NOT NULL DEFAULT 600,
                using_duration INTEGER NOT NULL DEFAULT 0,
                department TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS users (
                email TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                admin INTEGER NOT NULL DEFAULT 0,
                token TEXT NOT NULL,
                secret_key TEXT NOT NULL,
                settings TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                last_logged_in_at TEXT NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_token ON users (token)",
            "CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                creator TEXT NOT NULL,
                members TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )",
        ] {
            sqlx::query(stmt).execute(pool).await?;
        }
        Ok(())
    }

    /// Subscribe to the device change feed. Each subscriber gets its own
    /// receiver; slow subscribers lag and skip rather than block writers.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.changes.subscribe()
    }

    fn emit(&self, old: Option<Device>, new: Device) {
        // No subscribers is fine.
        let _ = self.changes.send(DeviceEvent { old, new });
    }

    // ─── Devices ────────────────────────────────────────────────────────────

    pub async fn device(&self, udid: &str) -> Result<Option<Device>> {
        let row: Option<DeviceRow> = sqlx::query_as("SELECT * FROM devices WHERE udid = ?")
            .bind(udid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(DeviceRow::into_device).transpose()
    }

    async fn device_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        udid: &str,
    ) -> Result<Option<Device>> {
        let row: Option<DeviceRow> = sqlx::query_as("SELECT * FROM devices WHERE udid = ?")
            .bind(udid)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(DeviceRow::into_device).transpose()
    }

    /// Upsert merge from a provider `update` frame.
    ///
    /// `source = Some(_)` adds or refreshes this session's entry in
    /// `sources` and stamps the session owner; `source = None` removes the
    /// entry for `provider_id`. A device drained to zero sources is reset to
    /// `using:false, colding:false, userId:null`.
    pub async fn apply_provider_update(
        &self,
        udid: &str,
        platform: Option<Platform>,
        properties: Option<Map<String, Value>>,
        source: Option<Source>,
        owner: &str,
        provider_id: &str,
    ) -> Result<Device> {
        with_timeout(async {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;
            let old = Self::device_tx(&mut tx, udid).await?;

            let mut sources: BTreeMap<String, Source> =
                old.as_ref().map(|d| d.sources.clone()).unwrap_or_default();
            let adding = source.is_some();
            match source {
                Some(s) => {
                    sources.insert(s.id.clone(), s);
                }
                None => {
                    sources.remove(provider_id);
                }
            }
            let drained = sources.is_empty();

            let mut props = old
                .as_ref()
                .map(|d| d.properties.clone())
                .unwrap_or_default();
            if let Some(p) = properties {
                // Last-writer-wins per field.
                props.extend(p);
            }

            let platform = platform
                .or(old.as_ref().map(|d| d.platform))
                .unwrap_or(Platform::Unknown);
            let owner = if adding {
                owner.to_string()
            } else {
                old.as_ref().map(|d| d.owner.clone()).unwrap_or_default()
            };

            let sources_json = serde_json::to_string(&sources)?;
            let props_json = serde_json::to_string(&props)?;

            if old.is_some() {
                if drained {
                    sqlx::query(
                        "UPDATE devices SET platform = ?, properties = ?, sources = ?, owner = ?, \
                         in_use = 0, colding = 0, user_id = NULL, updated_at = ? WHERE udid = ?",
                    )
                    .bind(platform.as_str())
                    .bind(&props_json)
                    .bind(&sources_json)
                    .bind(&owner)
                    .bind(now.to_rfc3339())
                    .bind(udid)
                    .execute(&mut *tx)
                    .await?;
                } else {
                    sqlx::query(
                        "UPDATE devices SET platform = ?, properties = ?, sources = ?, owner = ?, \
                         updated_at = ? WHERE udid = ?",
                    )
                    .bind(platform.as_str())
                    .bind(&props_json)
                    .bind(&sources_json)
                    .bind(&owner)
                    .bind(now.to_rfc3339())
                    .bind(udid)
                    .execute(&mut *tx)
                    .await?;
                }
            } else {
                sqlx::query(
                    "INSERT INTO devices (udid, platform, properties, sources, owner, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(udid)
                .bind(platform.as_str())
                .bind(&props_json)
                .bind(&sources_json)
                .bind(&owner)
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .execute(&mut *tx)
                .await?;
            }

            let new = Self::device_tx(&mut tx, udid)
                .await?
                .ok_or_else(|| anyhow!("device not found after upsert"))?;
            tx.commit().await?;

            self.emit(old, new.clone());
            Ok(new)
        })
        .await
    }

    /// Disconnect cleanup: strip `provider_id` from every device that lists
    /// it. Returns the devices that changed (post-removal state).
    pub async fn remove_provider_sources(&self, provider_id: &str) -> Result<Vec<Device>> {
        // LIKE prefilter on the JSON text; exact membership is re-checked on
        // the parsed map below.
        let pattern = format!("%\"{provider_id}\"%");
        let udids: Vec<(String,)> =
            sqlx::query_as("SELECT udid FROM devices WHERE sources LIKE ?")
                .bind(&pattern)
                .fetch_all(&self.pool)
                .await?;

        let mut changed = Vec::new();
        for (udid,) in udids {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;
            let Some(old) = Self::device_tx(&mut tx, &udid).await? else {
                continue;
            };
            let mut sources = old.sources.clone();
            if sources.remove(provider_id).is_none() {
                continue; // LIKE false positive
            }
            let drained = sources.is_empty();
            let sources_json = serde_json::to_string(&sources)?;
            if drained {
                sqlx::query(
                    "UPDATE devices SET sources = ?, in_use = 0, colding = 0, user_id = NULL, \
                     updated_at = ? WHERE udid = ?",
                )
                .bind(&sources_json)
                .bind(now.to_rfc3339())
                .bind(&udid)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query("UPDATE devices SET sources = ?, updated_at = ? WHERE udid = ?")
                    .bind(&sources_json)
                    .bind(now.to_rfc3339())
                    .bind(&udid)
                    .execute(&mut *tx)
                    .await?;
            }
            let new = Self::device_tx(&mut tx, &udid)
                .await?
                .ok_or_else(|| anyhow!("device vanished during source removal"))?;
            tx.commit().await?;
            self.emit(Some(old), new.clone());
            changed.push(new);
        }
        Ok(changed)
    }

    /// Atomically claim the `¬using → using` transition. Exactly one
    /// concurrent caller wins; everyone else gets `false`.
    ///
    /// This is the only statement in the crate that flips `in_use` to 1.
    /// The colding guard keeps `using ∧ colding` unreachable even when a
    /// full lease/release cycle slips between a caller's pre-check and its
    /// claim.
    pub async fn try_claim(&self, udid: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE devices SET in_use = 1, updated_at = ? WHERE udid = ? AND in_use = 0 AND colding = 0",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(udid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write the lease fields after a won claim. Returns `false` when the
    /// claim no longer holds (the device drained between claim and write).
    pub async fn begin_lease(
        &self,
        udid: &str,
        email: &str,
        began_at: DateTime<Utc>,
        idle_timeout: i64,
    ) -> Result<bool> {
        let old = self.device(udid).await?;
        let result = sqlx::query(
            "UPDATE devices SET user_id = ?, using_began_at = ?, last_activated_at = ?, \
             idle_timeout = ?, updated_at = ? WHERE udid = ? AND in_use = 1",
        )
        .bind(email)
        .bind(began_at.to_rfc3339())
        .bind(began_at.to_rfc3339())
        .bind(idle_timeout)
        .bind(began_at.to_rfc3339())
        .bind(udid)
        .execute(&self.pool)
        .await?;
        let replaced = result.rows_affected() > 0;
        if replaced {
            if let Some(new) = self.device(udid).await? {
                self.emit(old, new);
            }
        }
        Ok(replaced)
    }

    /// End the lease and enter cool-down: `using:false, userId:null,
    /// colding:true`, accruing `elapsed_secs` onto `usingDuration`.
    /// Returns `false` when the device was not in use (idempotent release).
    pub async fn finish_lease(&self, udid: &str, elapsed_secs: i64) -> Result<bool> {
        let old = self.device(udid).await?;
        let result = sqlx::query(
            "UPDATE devices SET in_use = 0, user_id = NULL, colding = 1, \
             using_duration = using_duration + ?, updated_at = ? WHERE udid = ? AND in_use = 1",
        )
        .bind(elapsed_secs.max(0))
        .bind(Utc::now().to_rfc3339())
        .bind(udid)
        .execute(&self.pool)
        .await?;
        let replaced = result.rows_affected() > 0;
        if replaced {
            if let Some(new) = self.device(udid).await? {
                self.emit(old, new);
            }
        }
        Ok(replaced)
    }

    /// Bump `lastActivatedAt`, but only while `email` holds the lease.
    pub async fn touch_activity(
        &self,
        udid: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let old = self.device(udid).await?;
        let result = sqlx::query(
            "UPDATE devices SET last_activated_at = ?, updated_at = ? \
             WHERE udid = ? AND in_use = 1 AND user_id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(udid)
        .bind(email)
        .execute(&self.pool)
        .await?;
        let replaced = result.rows_affected() > 0;
        if replaced {
            if let Some(new) = self.device(udid).await? {
                self.emit(old, new);
            }
        }
        Ok(replaced)
    }

    /// Clear the cool-down flag. No-op when the device is not colding.
    pub async fn clear_colding(&self, udid: &str) -> Result<bool> {
        let old = self.device(udid).await?;
        let result =
            sqlx::query("UPDATE devices SET colding = 0, updated_at = ? WHERE udid = ? AND colding = 1")
                .bind(Utc::now().to_rfc3339())
                .bind(udid)
                .execute(&self.pool)
                .await?;
        let replaced = result.rows_affected() > 0;
        if replaced {
            if let Some(new) = self.device(udid).await? {
                self.emit(old, new);
            }
        }
        Ok(replaced)
    }

    /// Overwrite the free-form properties bag.
    pub async fn set_properties(&self, udid: &str, properties: Map<String, Value>) -> Result<bool> {
        let old = self.device(udid).await?;
        let result = sqlx::query("UPDATE devices SET properties = ?, updated_at = ? WHERE udid = ?")
            .bind(serde_json::to_string(&properties)?)
            .bind(Utc::now().to_rfc3339())
            .bind(udid)
            .execute(&self.pool)
            .await?;
        let replaced = result.rows_affected() > 0;
        if replaced {
            if let Some(new) = self.device(udid).await? {
                self.emit(old, new);
            }
        }
        Ok(replaced)
    }

    /// List devices with the visibility predicate folded into the query,
    /// newest first.
    pub async fn list_devices(
        &self,
        visibility: &Visibility,
        query: &DeviceQuery,
    ) -> Result<Vec<Device>> {
        let mut sql = String::from("SELECT * FROM devices WHERE 1 = 1");
        let mut binds: Vec<String> = Vec::new();

        if let Some(platform) = query.platform {
            sql.push_str(" AND platform = ?");
            binds.push(platform.as_str().to_string());
        }
        match query.present {
            Some(true) => sql.push_str(" AND sources != '{}'"),
            Some(false) => sql.push_str(" AND sources = '{}'"),
            None => {}
        }
        match query.usable {
            Some(true) => sql.push_str(" AND sources != '{}' AND in_use = 0 AND colding = 0"),
            Some(false) => sql.push_str(" AND NOT (sources != '{}' AND in_use = 0 AND colding = 0)"),
            None => {}
        }
        if let Visibility::Scoped { email, groups } = visibility {
            let placeholders = vec!["?"; groups.len() + 1].join(", ");
            sql.push_str(&format!(" AND (owner = '' OR owner IN ({placeholders}))"));
            binds.push(email.clone());
            binds.extend(groups.iter().cloned());
        }
        sql.push_str(" ORDER BY created_at DESC");

        with_timeout(async {
            let mut q = sqlx::query_as::<_, DeviceRow>(&sql);
            for b in &binds {
                q = q.bind(b);
            }
            let rows = q.fetch_all(&self.pool).await?;
            rows.into_iter().map(DeviceRow::into_device).collect()
        })
        .await
    }

    /// Devices currently leased by `email` and still present.
    pub async fn leased_devices(&self, email: &str) -> Result<Vec<Device>> {
        let rows: Vec<DeviceRow> = sqlx::query_as(
            "SELECT * FROM devices WHERE user_id = ? AND in_use = 1 AND sources != '{}' \
             ORDER BY created_at DESC",
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeviceRow::into_device).collect()
    }

    /// All devices with a live lease. Used at startup to re-arm idle
    /// watchers after a crash restart.
    pub async fn devices_in_use(&self) -> Result<Vec<Device>> {
        let rows: Vec<DeviceRow> = sqlx::query_as("SELECT * FROM devices WHERE in_use = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DeviceRow::into_device).collect()
    }

    // ─── Users ──────────────────────────────────────────────────────────────

    pub async fn user(&self, email: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(UserRow::into_user).transpose()
    }

    /// Look up the unique user holding `token`. `None` unless exactly one
    /// user matches.
    pub async fn user_by_token(&self, token: &str) -> Result<Option<User>> {
        let rows: Vec<UserRow> = sqlx::query_as("SELECT * FROM users WHERE token = ?")
            .bind(token)
            .fetch_all(&self.pool)
            .await?;
        if rows.len() != 1 {
            return Ok(None);
        }
        rows.into_iter().next().map(UserRow::into_user).transpose()
    }

    /// Upsert on interactive login. On insert, generates `token` and
    /// `secretKey` and promotes to admin iff no admin exists yet.
    /// Returns `(user, inserted)`.
    pub async fn upsert_login(&self, email: &str, username: &str) -> Result<(User, bool)> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            let mut tx = self.pool.begin().await?;
            let existing: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
                .bind(email)
                .fetch_optional(&mut *tx)
                .await?;

            let inserted = existing.is_none();
            if inserted {
                let (admins,): (i64,) =
                    sqlx::query_as("SELECT COUNT(*) FROM users WHERE admin = 1")
                        .fetch_one(&mut *tx)
                        .await?;
                let token = uuid::Uuid::new_v4().simple().to_string();
                let secret_key = format!("S:{}", uuid::Uuid::new_v4());
                sqlx::query(
                    "INSERT INTO users (email, username, admin, token, secret_key, settings, \
                     created_at, last_logged_in_at) VALUES (?, ?, ?, ?, ?, '{}', ?, ?)",
                )
                .bind(email)
                .bind(username)
                .bind(if admins == 0 { 1 } else { 0 })
                .bind(&token)
                .bind(&secret_key)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE users SET username = ?, last_logged_in_at = ? WHERE email = ?",
                )
                .bind(username)
                .bind(&now)
                .bind(email)
                .execute(&mut *tx)
                .await?;
            }

            let row: UserRow = sqlx::query_as("SELECT * FROM users WHERE email = ?")
                .bind(email)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok((row.into_user()?, inserted))
        })
        .await
    }

    pub async fn set_admin(&self, email: &str, admin: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET admin = ? WHERE email = ?")
            .bind(if admin { 1 } else { 0 })
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn admins(&self) -> Result<Vec<User>> {
        let rows: Vec<UserRow> =
            sqlx::query_as("SELECT * FROM users WHERE admin = 1 ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(UserRow::into_user).collect()
    }

    // ─── Groups ─────────────────────────────────────────────────────────────

    /// Create a group with `creator` as its first group-admin.
    /// Returns `false` on id collision.
    pub async fn create_group(&self, id: &str, name: &str, creator: &str) -> Result<bool> {
        let mut members = BTreeMap::new();
        members.insert(creator.to_string(), GroupRole::Admin);
        let result = sqlx::query(
            "INSERT INTO groups (id, name, creator, members, created_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(name)
        .bind(creator)
        .bind(serde_json::to_string(&members)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn group(&self, id: &str) -> Result<Option<Group>> {
        let row: Option<GroupRow> = sqlx::query_as("SELECT * FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(GroupRow::into_group).transpose()
    }

    /// Groups whose member map contains `email`. The group population is
    /// small; membership is checked on the parsed map.
    pub async fn groups_of(&self, email: &str) -> Result<Vec<Group>> {
        let rows: Vec<GroupRow> = sqlx::query_as("SELECT * FROM groups ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut groups = Vec::new();
        for row in rows {
            let group = row.into_group()?;
            if group.members.contains_key(email) {
                groups.push(group);
            }
        }
        Ok(groups)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).await.unwrap();
        (store, dir)
    }

    fn source(id: &str, priority: i64) -> Source {
        Source {
            id: id.to_string(),
            url: format!("http://provider/{id}"),
            device_address: Some("10.0.0.1:7912".to_string()),
            remote_connect_address: None,
            secret: "s".to_string(),
            priority,
        }
    }

    #[tokio::test]
    async fn first_update_creates_device() {
        let (store, _dir) = test_store().await;
        let d = store
            .apply_provider_update("D1", Some(Platform::Android), None, Some(source("p1", 1)), "", "p1")
            .await
            .unwrap();
        assert!(d.present());
        assert_eq!(d.platform, Platform::Android);
        assert!(!d.using);
    }

    #[tokio::test]
    async fn properties_merge_is_last_writer_wins_per_field() {
        let (store, _dir) = test_store().await;
        let mut p1 = Map::new();
        p1.insert("brand".into(), "Huawei".into());
        p1.insert("version".into(), "7.0.1".into());
        store
            .apply_provider_update("D1", Some(Platform::Android), Some(p1), Some(source("p1", 1)), "", "p1")
            .await
            .unwrap();

        let mut p2 = Map::new();
        p2.insert("version".into(), "8.0.0".into());
        let d = store
            .apply_provider_update("D1", None, Some(p2), Some(source("p1", 1)), "", "p1")
            .await
            .unwrap();
        assert_eq!(d.properties["brand"], "Huawei");
        assert_eq!(d.properties["version"], "8.0.0");
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let (store, _dir) = test_store().await;
        store
            .apply_provider_update("D1", None, None, Some(source("p1", 1)), "", "p1")
            .await
            .unwrap();
        assert!(store.try_claim("D1").await.unwrap());
        assert!(!store.try_claim("D1").await.unwrap());
    }

    #[tokio::test]
    async fn drain_resets_flags_and_lessee() {
        let (store, _dir) = test_store().await;
        store
            .apply_provider_update("D1", None, None, Some(source("p1", 1)), "", "p1")
            .await
            .unwrap();
        assert!(store.try_claim("D1").await.unwrap());
        store
            .begin_lease("D1", "u@x", Utc::now(), 600)
            .await
            .unwrap();

        let changed = store.remove_provider_sources("p1").await.unwrap();
        assert_eq!(changed.len(), 1);
        let d = &changed[0];
        assert!(!d.present());
        assert!(!d.using);
        assert!(!d.colding);
        assert_eq!(d.user_id, None);
    }

    #[tokio::test]
    async fn finish_lease_is_idempotent() {
        let (store, _dir) = test_store().await;
        store
            .apply_provider_update("D1", None, None, Some(source("p1", 1)), "", "p1")
            .await
            .unwrap();
        assert!(store.try_claim("D1").await.unwrap());
        store
            .begin_lease("D1", "u@x", Utc::now(), 600)
            .await
            .unwrap();
        assert!(store.finish_lease("D1", 10).await.unwrap());
        assert!(!store.finish_lease("D1", 10).await.unwrap());
        let d = store.device("D1").await.unwrap().unwrap();
        assert!(!d.using);
        assert!(d.colding);
        assert_eq!(d.user_id, None);
        assert_eq!(d.using_duration, 10);
    }

    #[tokio::test]
    async fn visibility_is_folded_into_listing() {
        let (store, _dir) = test_store().await;
        store
            .apply_provider_update("PUB", None, None, Some(source("p1", 1)), "", "p1")
            .await
            .unwrap();
        store
            .apply_provider_update("TEAM", None, None, Some(source("p1", 1)), "teamA", "p1")
            .await
            .unwrap();

        let scoped = Visibility::Scoped {
            email: "u@x".to_string(),
            groups: vec![],
        };
        let seen = store
            .list_devices(&scoped, &DeviceQuery::default())
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].udid, "PUB");

        let teamed = Visibility::Scoped {
            email: "v@y".to_string(),
            groups: vec!["teamA".to_string()],
        };
        let seen = store
            .list_devices(&teamed, &DeviceQuery::default())
            .await
            .unwrap();
        assert_eq!(seen.len(), 2);

        let seen = store
            .list_devices(&Visibility::All, &DeviceQuery::default())
            .await
            .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn first_user_becomes_admin() {
        let (store, _dir) = test_store().await;
        let (first, inserted) = store.upsert_login("a@x", "a").await.unwrap();
        assert!(inserted);
        assert!(first.admin);
        let (second, inserted) = store.upsert_login("b@x", "b").await.unwrap();
        assert!(inserted);
        assert!(!second.admin);
        // Re-login keeps the record, refreshes metadata.
        let (again, inserted) = store.upsert_login("a@x", "alice").await.unwrap();
        assert!(!inserted);
        assert!(again.admin);
        assert_eq!(again.username, "alice");
        assert_eq!(again.token, first.token);
    }

    #[tokio::test]
    async fn group_creation_detects_collision() {
        let (store, _dir) = test_store().await;
        assert!(store.create_group("teamA", "Team A", "a@x").await.unwrap());
        assert!(!store.create_group("teamA", "Other", "b@x").await.unwrap());
        let groups = store.groups_of("a@x").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members["a@x"], GroupRole::Admin);
    }
}
