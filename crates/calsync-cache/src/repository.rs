//! SQLite implementation of ISyncStateStore
//!
//! Concrete SQLite-backed implementation of the sync state port defined in
//! calsync-core. It owns the SQL and the mapping between rows and domain
//! types.
//!
//! ## Type Mapping
//!
//! | Domain Type                   | SQL Type | Strategy                                  |
//! |-------------------------------|----------|-------------------------------------------|
//! | SourceId, CalendarId          | TEXT     | `.as_str()` / `::new()`                   |
//! | SyncToken, DestEventId        | TEXT     | `.as_str()` / `::new()`                   |
//! | AgentId                       | TEXT     | UUID string via `.to_string()` / `FromStr` |
//! | DateTime<Utc>                 | TEXT     | ISO 8601 via `to_rfc3339()`               |
//! | AuthState                     | TEXT     | `as_str()` / [`auth_state_from_str`]      |
//! | SyncSource (config fields)    | TEXT     | serde_json, bookkeeping in own columns    |
//! | SyncDestination               | TEXT     | serde_json                                |
//! | GlobalSettings                | TEXT     | serde_json                                |
//! | RelayBatch events, RelayReceipt | TEXT   | serde_json                                |
//! | relay sequence (u64)          | INTEGER  | checked conversion to/from i64            |
//!
//! ## Atomicity
//!
//! Every operation that touches more than one row runs in a single
//! transaction. A pass future that is dropped mid-commit drops the
//! transaction with it, which SQLx rolls back.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use calsync_core::domain::{
    newtypes::{AgentId, CalendarId, DestEventId, SourceId, SyncToken},
    parse_relay_cursor, AgentRegistration, AuthState, BatchCommit, DedupChange, DedupEntry,
    GlobalSettings, RelayBatch, RelayReceipt, RelayState, SyncConfiguration, SyncDestination,
    SyncSource,
};
use calsync_core::ports::ISyncStateStore;

use crate::CacheError;

/// SQLite-based implementation of the sync state port
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Creates a new store with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Deserialize an AuthState from its stored string representation
fn auth_state_from_str(s: &str) -> Result<AuthState, CacheError> {
    match s {
        "ok" => Ok(AuthState::Ok),
        "needs_reauth" => Ok(AuthState::NeedsReauth),
        other => Err(CacheError::SerializationError(format!(
            "Unknown auth state: {}",
            other
        ))),
    }
}

/// Parse a DateTime<Utc> from an RFC 3339 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite's own CURRENT_TIMESTAMP format
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, CacheError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

/// Wraps a domain validation error for a stored value
fn invalid<E: std::fmt::Display>(column: &'static str) -> impl FnOnce(E) -> CacheError {
    move |e| CacheError::SerializationError(format!("Invalid {} in storage: {}", column, e))
}

// ============================================================================
// Row mapping functions
// ============================================================================

/// Rebuilds a source from its row and its token rows
///
/// The `config` column holds the configuration-owned fields; tokens,
/// `last_sync` and auth state come from their own columns.
fn source_from_row(
    row: &SqliteRow,
    tokens: BTreeMap<CalendarId, SyncToken>,
) -> Result<SyncSource, CacheError> {
    let config: String = row.get("config");
    let last_sync: Option<String> = row.get("last_sync");
    let auth_state: String = row.get("auth_state");

    let mut source: SyncSource = serde_json::from_str(&config)?;
    source.restore_state(
        tokens,
        parse_optional_datetime(last_sync)?,
        auth_state_from_str(&auth_state)?,
    );
    Ok(source)
}

/// Serializes the configuration-owned fields of a source
fn source_config_json(source: &SyncSource) -> Result<String, CacheError> {
    let mut config = source.clone();
    config.restore_state(BTreeMap::new(), None, AuthState::Ok);
    Ok(serde_json::to_string(&config)?)
}

fn dedup_from_row(row: &SqliteRow) -> Result<DedupEntry, CacheError> {
    let dest_calendar_id: String = row.get("dest_calendar_id");
    let dest_event_id: String = row.get("dest_event_id");
    let source_id: String = row.get("source_id");
    let source_calendar_id: String = row.get("source_calendar_id");
    let event_start: String = row.get("event_start");
    let source_updated_at: String = row.get("source_updated_at");
    let synced_at: String = row.get("synced_at");

    Ok(DedupEntry {
        dest_calendar_id: CalendarId::new(dest_calendar_id)
            .map_err(invalid("dest_calendar_id"))?,
        dedup_key: row.get("dedup_key"),
        dest_event_id: DestEventId::new(dest_event_id).map_err(invalid("dest_event_id"))?,
        source_id: SourceId::new(source_id).map_err(invalid("source_id"))?,
        source_calendar_id: CalendarId::new(source_calendar_id)
            .map_err(invalid("source_calendar_id"))?,
        provider_event_id: row.get("provider_event_id"),
        event_start: parse_datetime(&event_start)?,
        fingerprint: row.get("fingerprint"),
        source_updated_at: parse_datetime(&source_updated_at)?,
        synced_at: parse_datetime(&synced_at)?,
    })
}

/// SQLite integers are signed
fn seq_param(seq: u64) -> Result<i64, CacheError> {
    i64::try_from(seq).map_err(invalid("relay sequence"))
}

fn relay_batch_from_row(row: &SqliteRow) -> Result<RelayBatch, CacheError> {
    let source_id: String = row.get("source_id");
    let seq: i64 = row.get("seq");
    let events: String = row.get("events");
    let received_at: String = row.get("received_at");

    Ok(RelayBatch {
        source_id: SourceId::new(source_id).map_err(invalid("source_id"))?,
        seq: u64::try_from(seq).map_err(invalid("relay sequence"))?,
        events: serde_json::from_str(&events)?,
        received_at: parse_datetime(&received_at)?,
    })
}

fn agent_from_row(row: &SqliteRow) -> Result<AgentRegistration, CacheError> {
    let id: String = row.get("id");
    let source_id: String = row.get("source_id");
    let interval_minutes: i64 = row.get("interval_minutes");
    let registered_at: String = row.get("registered_at");
    let last_check_in: Option<String> = row.get("last_check_in");
    let enabled: i64 = row.get("enabled");

    Ok(AgentRegistration {
        id: AgentId::from_str(&id).map_err(invalid("agent id"))?,
        name: row.get("name"),
        environment: row.get("environment"),
        agent_type: row.get("agent_type"),
        source_id: SourceId::new(source_id).map_err(invalid("source_id"))?,
        interval_minutes: u32::try_from(interval_minutes).map_err(invalid("interval_minutes"))?,
        credential_hash: row.get("credential_hash"),
        registered_at: parse_datetime(&registered_at)?,
        last_check_in: parse_optional_datetime(last_check_in)?,
        enabled: enabled != 0,
    })
}

// ============================================================================
// Statements shared by single writes and batch commits
// ============================================================================

async fn ensure_source(conn: &mut SqliteConnection, source_id: &SourceId) -> Result<(), CacheError> {
    let row = sqlx::query("SELECT 1 FROM sources WHERE id = ?")
        .bind(source_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(_) => Ok(()),
        None => Err(CacheError::UnknownSource(source_id.to_string())),
    }
}

async fn write_token(
    conn: &mut SqliteConnection,
    source_id: &SourceId,
    calendar_id: &CalendarId,
    token: &SyncToken,
    at: DateTime<Utc>,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO source_tokens (source_id, calendar_id, token, updated_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(source_id, calendar_id) DO UPDATE SET \
         token = excluded.token, updated_at = excluded.updated_at",
    )
    .bind(source_id.as_str())
    .bind(calendar_id.as_str())
    .bind(token.as_str())
    .bind(at.to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_last_sync(
    conn: &mut SqliteConnection,
    source_id: &SourceId,
    last_sync: DateTime<Utc>,
) -> Result<(), CacheError> {
    sqlx::query("UPDATE sources SET last_sync = ? WHERE id = ?")
        .bind(last_sync.to_rfc3339())
        .bind(source_id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn write_dedup(conn: &mut SqliteConnection, entry: &DedupEntry) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT OR REPLACE INTO dedup_index \
         (dest_calendar_id, dedup_key, dest_event_id, source_id, source_calendar_id, \
          provider_event_id, event_start, fingerprint, source_updated_at, synced_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.dest_calendar_id.as_str())
    .bind(&entry.dedup_key)
    .bind(entry.dest_event_id.as_str())
    .bind(entry.source_id.as_str())
    .bind(entry.source_calendar_id.as_str())
    .bind(&entry.provider_event_id)
    .bind(entry.event_start.to_rfc3339())
    .bind(&entry.fingerprint)
    .bind(entry.source_updated_at.to_rfc3339())
    .bind(entry.synced_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_dedup(
    conn: &mut SqliteConnection,
    dest_calendar_id: &CalendarId,
    dedup_key: &str,
) -> Result<(), CacheError> {
    sqlx::query("DELETE FROM dedup_index WHERE dest_calendar_id = ? AND dedup_key = ?")
        .bind(dest_calendar_id.as_str())
        .bind(dedup_key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Marks batches up to `up_to` as consumed by one calendar and deletes the
/// ones no calendar is waiting for; returns how many were deleted
async fn release_relay_batches(
    conn: &mut SqliteConnection,
    source_id: &SourceId,
    calendar_id: &CalendarId,
    up_to: u64,
) -> Result<u64, CacheError> {
    let up_to = seq_param(up_to)?;
    sqlx::query(
        "DELETE FROM relay_batch_calendars \
         WHERE source_id = ? AND calendar_id = ? AND seq <= ?",
    )
    .bind(source_id.as_str())
    .bind(calendar_id.as_str())
    .bind(up_to)
    .execute(&mut *conn)
    .await?;

    let released = sqlx::query(
        "DELETE FROM relay_batches \
         WHERE source_id = ? AND seq <= ? AND NOT EXISTS ( \
             SELECT 1 FROM relay_batch_calendars c \
             WHERE c.source_id = relay_batches.source_id AND c.seq = relay_batches.seq)",
    )
    .bind(source_id.as_str())
    .bind(up_to)
    .execute(&mut *conn)
    .await?;
    Ok(released.rows_affected())
}

async fn last_relay_seq(conn: &mut SqliteConnection, source_id: &SourceId) -> Result<u64, CacheError> {
    let row = sqlx::query("SELECT last_seq FROM relay_state WHERE source_id = ?")
        .bind(source_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => {
            let last_seq: i64 = row.get("last_seq");
            u64::try_from(last_seq).map_err(invalid("relay sequence"))
        }
        None => Ok(0),
    }
}

async fn tokens_for(
    conn: &mut SqliteConnection,
    source_id: &SourceId,
) -> Result<BTreeMap<CalendarId, SyncToken>, CacheError> {
    let rows = sqlx::query("SELECT calendar_id, token FROM source_tokens WHERE source_id = ?")
        .bind(source_id.as_str())
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|row| -> Result<_, CacheError> {
            let calendar: String = row.get("calendar_id");
            let token: String = row.get("token");
            Ok((
                CalendarId::new(calendar).map_err(invalid("calendar_id"))?,
                SyncToken::new(token).map_err(invalid("token"))?,
            ))
        })
        .collect()
}

// ============================================================================
// ISyncStateStore implementation
// ============================================================================

#[async_trait::async_trait]
impl ISyncStateStore for SqliteStateStore {
    // --- Configuration ---

    async fn get_configuration(&self) -> anyhow::Result<SyncConfiguration> {
        let mut conn = self.pool.acquire().await?;

        let token_rows = sqlx::query("SELECT source_id, calendar_id, token FROM source_tokens")
            .fetch_all(&mut *conn)
            .await?;
        let mut tokens: HashMap<String, BTreeMap<CalendarId, SyncToken>> = HashMap::new();
        for row in &token_rows {
            let source_id: String = row.get("source_id");
            let calendar: String = row.get("calendar_id");
            let token: String = row.get("token");
            tokens.entry(source_id).or_default().insert(
                CalendarId::new(calendar).map_err(invalid("calendar_id"))?,
                SyncToken::new(token).map_err(invalid("token"))?,
            );
        }

        // rowid keeps insertion order; updates never change it
        let source_rows = sqlx::query("SELECT * FROM sources ORDER BY rowid ASC")
            .fetch_all(&mut *conn)
            .await?;
        let sources = source_rows
            .iter()
            .map(|row| {
                let id: String = row.get("id");
                source_from_row(row, tokens.remove(&id).unwrap_or_default())
            })
            .collect::<Result<Vec<_>, _>>()?;

        let destination_row = sqlx::query("SELECT config FROM destination WHERE singleton = 1")
            .fetch_optional(&mut *conn)
            .await?;
        let destination: Option<SyncDestination> = match destination_row {
            Some(row) => {
                let config: String = row.get("config");
                Some(serde_json::from_str(&config).map_err(CacheError::from)?)
            }
            None => None,
        };

        let agents = sqlx::query("SELECT * FROM agents ORDER BY registered_at ASC")
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(agent_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let global_settings: GlobalSettings =
            match sqlx::query("SELECT settings FROM global_settings WHERE singleton = 1")
                .fetch_optional(&mut *conn)
                .await?
            {
                Some(row) => {
                    let settings: String = row.get("settings");
                    serde_json::from_str(&settings).map_err(CacheError::from)?
                }
                None => GlobalSettings::default(),
            };

        Ok(SyncConfiguration {
            sources,
            destination,
            agents,
            global_settings,
        })
    }

    async fn get_source(&self, id: &SourceId) -> anyhow::Result<Option<SyncSource>> {
        let mut conn = self.pool.acquire().await?;

        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(ref r) => {
                let tokens = tokens_for(&mut conn, id).await?;
                Ok(Some(source_from_row(r, tokens)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_source(&self, source: &SyncSource) -> anyhow::Result<()> {
        let id = source.id();
        let config = source_config_json(source)?;
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM sources WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

        if exists {
            sqlx::query("UPDATE sources SET config = ? WHERE id = ?")
                .bind(&config)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;

            // Tokens of calendars dropped from the source go with them
            for calendar in tokens_for(&mut tx, id).await?.keys() {
                if !source.has_calendar(calendar) {
                    sqlx::query(
                        "DELETE FROM source_tokens WHERE source_id = ? AND calendar_id = ?",
                    )
                    .bind(id.as_str())
                    .bind(calendar.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        } else {
            sqlx::query(
                "INSERT INTO sources (id, config, last_sync, auth_state) VALUES (?, ?, ?, ?)",
            )
            .bind(id.as_str())
            .bind(&config)
            .bind(source.last_sync().map(|dt| dt.to_rfc3339()))
            .bind(source.auth_state().as_str())
            .execute(&mut *tx)
            .await?;

            let at = source.last_sync().unwrap_or_else(Utc::now);
            for (calendar, token) in source.sync_tokens() {
                write_token(&mut tx, id, calendar, token, at).await?;
            }
        }

        tx.commit().await?;
        tracing::trace!(source_id = %id, existed = exists, "Saved source");
        Ok(())
    }

    async fn remove_source(&self, id: &SourceId) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let dedup = sqlx::query("DELETE FROM dedup_index WHERE source_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM source_tokens WHERE source_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        for table in ["relay_batch_calendars", "relay_batches", "relay_state"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE source_id = ?"))
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        let removed = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::trace!(
            source_id = %id,
            dedup_entries = dedup.rows_affected(),
            "Removed source"
        );
        Ok(removed.rows_affected() > 0)
    }

    async fn set_destination(&self, destination: &SyncDestination) -> anyhow::Result<()> {
        let config = serde_json::to_string(destination)?;

        sqlx::query(
            "INSERT INTO destination (singleton, config, updated_at) VALUES (1, ?, ?) \
             ON CONFLICT(singleton) DO UPDATE SET \
             config = excluded.config, updated_at = excluded.updated_at",
        )
        .bind(&config)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::trace!(destination_id = %destination.id, "Saved destination");
        Ok(())
    }

    async fn get_destination(&self) -> anyhow::Result<Option<SyncDestination>> {
        let row = sqlx::query("SELECT config FROM destination WHERE singleton = 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => {
                let config: String = r.get("config");
                Ok(Some(serde_json::from_str(&config)?))
            }
            None => Ok(None),
        }
    }

    async fn update_global_settings(&self, settings: &GlobalSettings) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO global_settings (singleton, settings) VALUES (1, ?) \
             ON CONFLICT(singleton) DO UPDATE SET settings = excluded.settings",
        )
        .bind(serde_json::to_string(settings)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Tokens ---

    async fn get_token(
        &self,
        source_id: &SourceId,
        calendar_id: &CalendarId,
    ) -> anyhow::Result<Option<SyncToken>> {
        let row = sqlx::query(
            "SELECT token FROM source_tokens WHERE source_id = ? AND calendar_id = ?",
        )
        .bind(source_id.as_str())
        .bind(calendar_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => {
                let token: String = r.get("token");
                Ok(Some(SyncToken::new(token).map_err(invalid("token"))?))
            }
            None => Ok(None),
        }
    }

    async fn commit_token(
        &self,
        source_id: &SourceId,
        calendar_id: &CalendarId,
        token: &SyncToken,
        last_sync: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        ensure_source(&mut tx, source_id).await?;
        write_token(&mut tx, source_id, calendar_id, token, last_sync).await?;
        write_last_sync(&mut tx, source_id, last_sync).await?;
        tx.commit().await?;

        tracing::trace!(
            source_id = %source_id,
            calendar_id = %calendar_id,
            "Committed sync token"
        );
        Ok(())
    }

    async fn clear_token(
        &self,
        source_id: &SourceId,
        calendar_id: &CalendarId,
    ) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM source_tokens WHERE source_id = ? AND calendar_id = ?")
            .bind(source_id.as_str())
            .bind(calendar_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_auth_state(&self, source_id: &SourceId, state: AuthState) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE sources SET auth_state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(source_id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CacheError::UnknownSource(source_id.to_string()).into());
        }
        Ok(())
    }

    // --- Dedup index ---

    async fn dedup_lookup(
        &self,
        dest_calendar_id: &CalendarId,
        dedup_key: &str,
    ) -> anyhow::Result<Option<DedupEntry>> {
        let row =
            sqlx::query("SELECT * FROM dedup_index WHERE dest_calendar_id = ? AND dedup_key = ?")
                .bind(dest_calendar_id.as_str())
                .bind(dedup_key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(ref r) => Ok(Some(dedup_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn dedup_upsert(&self, entry: &DedupEntry) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_dedup(&mut conn, entry).await?;
        Ok(())
    }

    async fn dedup_remove(
        &self,
        dest_calendar_id: &CalendarId,
        dedup_key: &str,
    ) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        delete_dedup(&mut conn, dest_calendar_id, dedup_key).await?;
        Ok(())
    }

    async fn dedup_entries_for(
        &self,
        dest_calendar_id: &CalendarId,
        source_id: &SourceId,
        source_calendar_id: &CalendarId,
    ) -> anyhow::Result<Vec<DedupEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM dedup_index \
             WHERE dest_calendar_id = ? AND source_id = ? AND source_calendar_id = ? \
             ORDER BY dedup_key ASC",
        )
        .bind(dest_calendar_id.as_str())
        .bind(source_id.as_str())
        .bind(source_calendar_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .iter()
            .map(dedup_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn commit_batch(&self, commit: &BatchCommit) -> anyhow::Result<()> {
        if commit.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        ensure_source(&mut tx, &commit.source_id).await?;

        for change in &commit.dedup {
            match change {
                DedupChange::Upsert(entry) => write_dedup(&mut tx, entry).await?,
                DedupChange::Remove {
                    dest_calendar_id,
                    dedup_key,
                } => delete_dedup(&mut tx, dest_calendar_id, dedup_key).await?,
            }
        }
        if let Some(ref token) = commit.token {
            let at = commit.last_sync.unwrap_or_else(Utc::now);
            write_token(&mut tx, &commit.source_id, &commit.calendar_id, token, at).await?;
        }
        if let Some(last_sync) = commit.last_sync {
            write_last_sync(&mut tx, &commit.source_id, last_sync).await?;
        }
        let released = match commit.token.as_ref().and_then(parse_relay_cursor) {
            Some(seq) => {
                release_relay_batches(&mut tx, &commit.source_id, &commit.calendar_id, seq)
                    .await?
            }
            None => 0,
        };

        tx.commit().await?;

        tracing::trace!(
            source_id = %commit.source_id,
            calendar_id = %commit.calendar_id,
            dedup_changes = commit.dedup.len(),
            token = commit.token.is_some(),
            relay_released = released,
            "Committed batch"
        );
        Ok(())
    }

    // --- Relay inbox ---

    async fn relay_state(&self, source_id: &SourceId) -> anyhow::Result<RelayState> {
        let row = sqlx::query("SELECT last_seq, receipt FROM relay_state WHERE source_id = ?")
            .bind(source_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(RelayState::default());
        };
        let last_seq: i64 = row.get("last_seq");
        let receipt: Option<String> = row.get("receipt");
        Ok(RelayState {
            last_seq: u64::try_from(last_seq).map_err(invalid("relay sequence"))?,
            last_receipt: receipt
                .map(|json| serde_json::from_str::<RelayReceipt>(&json))
                .transpose()
                .map_err(CacheError::from)?,
        })
    }

    async fn append_relay_batch(
        &self,
        source_id: &SourceId,
        receipt: &RelayReceipt,
        batch: Option<&RelayBatch>,
    ) -> anyhow::Result<()> {
        let receipt_json = serde_json::to_string(receipt)?;
        let mut tx = self.pool.begin().await?;

        let mut last_seq = last_relay_seq(&mut tx, source_id).await?;
        if let Some(batch) = batch {
            if batch.seq != last_seq + 1 {
                return Err(CacheError::RelaySequence {
                    source_id: source_id.to_string(),
                    expected: last_seq + 1,
                    got: batch.seq,
                }
                .into());
            }
            let seq = seq_param(batch.seq)?;
            sqlx::query(
                "INSERT INTO relay_batches (source_id, seq, events, received_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(source_id.as_str())
            .bind(seq)
            .bind(serde_json::to_string(&batch.events)?)
            .bind(batch.received_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            for calendar in batch.calendars() {
                sqlx::query(
                    "INSERT INTO relay_batch_calendars (source_id, seq, calendar_id) \
                     VALUES (?, ?, ?)",
                )
                .bind(source_id.as_str())
                .bind(seq)
                .bind(calendar.as_str())
                .execute(&mut *tx)
                .await?;
            }
            last_seq = batch.seq;
        }

        sqlx::query(
            "INSERT INTO relay_state (source_id, last_seq, receipt) VALUES (?, ?, ?) \
             ON CONFLICT(source_id) DO UPDATE SET \
             last_seq = excluded.last_seq, receipt = excluded.receipt",
        )
        .bind(source_id.as_str())
        .bind(seq_param(last_seq)?)
        .bind(&receipt_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::trace!(
            source_id = %source_id,
            seq = ?batch.map(|b| b.seq),
            agent_cursor = %receipt.agent_cursor,
            "Recorded relay push"
        );
        Ok(())
    }

    async fn relay_batches_after(
        &self,
        source_id: &SourceId,
        after: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<RelayBatch>> {
        let rows = sqlx::query(
            "SELECT * FROM relay_batches WHERE source_id = ? AND seq > ? \
             ORDER BY seq ASC LIMIT ?",
        )
        .bind(source_id.as_str())
        .bind(seq_param(after)?)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let batches = rows
            .iter()
            .map(relay_batch_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    async fn relay_pending(&self, source_id: &SourceId) -> anyhow::Result<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM relay_batches WHERE source_id = ?")
                .bind(source_id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(usize::try_from(count).map_err(invalid("relay batch count"))?)
    }

    // --- Agents ---

    async fn upsert_agent(&self, agent: &AgentRegistration) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO agents \
             (id, name, environment, agent_type, source_id, interval_minutes, \
              credential_hash, registered_at, last_check_in, enabled) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             name = excluded.name, environment = excluded.environment, \
             agent_type = excluded.agent_type, source_id = excluded.source_id, \
             interval_minutes = excluded.interval_minutes, \
             credential_hash = excluded.credential_hash, \
             registered_at = excluded.registered_at, \
             last_check_in = excluded.last_check_in, enabled = excluded.enabled",
        )
        .bind(agent.id.to_string())
        .bind(&agent.name)
        .bind(&agent.environment)
        .bind(&agent.agent_type)
        .bind(agent.source_id.as_str())
        .bind(i64::from(agent.interval_minutes))
        .bind(&agent.credential_hash)
        .bind(agent.registered_at.to_rfc3339())
        .bind(agent.last_check_in.map(|dt| dt.to_rfc3339()))
        .bind(i64::from(agent.enabled))
        .execute(&self.pool)
        .await?;

        tracing::trace!(agent_id = %agent.id, source_id = %agent.source_id, "Saved agent");
        Ok(())
    }

    async fn get_agent(&self, id: &AgentId) -> anyhow::Result<Option<AgentRegistration>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(agent_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn list_agents(&self) -> anyhow::Result<Vec<AgentRegistration>> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY registered_at ASC")
            .fetch_all(&self.pool)
            .await?;

        let agents = rows
            .iter()
            .map(agent_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    async fn remove_agent(&self, id: &AgentId) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_agent_check_in(&self, id: &AgentId, at: DateTime<Utc>) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE agents SET last_check_in = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CacheError::UnknownAgent(id.to_string()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_state_round_trip() {
        for state in [AuthState::Ok, AuthState::NeedsReauth] {
            assert_eq!(auth_state_from_str(state.as_str()).unwrap(), state);
        }
        assert!(auth_state_from_str("expired").is_err());
    }

    #[test]
    fn test_parse_datetime_accepts_sqlite_format() {
        let dt = parse_datetime("2026-03-01 08:30:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-03-01T08:30:00+00:00");
        assert!(parse_datetime("yesterday").is_err());
        assert_eq!(parse_optional_datetime(Some(String::new())).unwrap(), None);
    }
}
