//! SQLite storage for bulk-cached observations.
//!
//! The store holds one long table keyed by (provider, gauge, variable,
//! timestamp), the station records found in the archive, and a build marker
//! per provider. A provider's rows are only ever replaced as a whole, inside
//! one transaction together with its stations and marker.
//!
//! # Example
//!
//! ```no_run
//! use hydrofetch_core::cache::BulkStore;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = BulkStore::new(Path::new("bulk-cache.db")).await?;
//! println!("built: {}", store.is_built("austria").await?);
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, instrument};

use super::error::CacheError;
use crate::series::{Observation, StationMetadata, start_of_day};
use crate::variable::Variable;

/// Maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// One canonical row produced by an archive decoder (value already in SI).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    /// Gauge identifier.
    pub gauge_id: String,
    /// Variable the value belongs to.
    pub variable: Variable,
    /// Observation time.
    pub timestamp: DateTime<Utc>,
    /// Value in SI units.
    pub value: Option<f64>,
}

/// Build marker recorded after a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMarker {
    /// When the build finished.
    pub built_at: DateTime<Utc>,
    /// Rows written.
    pub row_count: u64,
    /// Archive the rows came from.
    pub source_url: String,
}

/// Connection pool over the bulk cache database.
#[derive(Debug, Clone)]
pub struct BulkStore {
    pool: SqlitePool,
}

impl BulkStore {
    /// Opens (creating if needed) the store at `db_path`, enables WAL and
    /// runs migrations.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the connection fails, or
    /// [`CacheError::Migration`] if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory store, used by tests.
    ///
    /// # Errors
    ///
    /// Same as [`BulkStore::new`].
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Whether a build marker exists for `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the query fails.
    pub async fn is_built(&self, provider: &str) -> Result<bool, CacheError> {
        Ok(self.build_marker(provider).await?.is_some())
    }

    /// Returns the build marker for `provider`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the query fails.
    pub async fn build_marker(&self, provider: &str) -> Result<Option<BuildMarker>, CacheError> {
        let row = sqlx::query(
            "SELECT built_at, row_count, source_url FROM cache_builds WHERE provider = ?",
        )
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let built_at: i64 = row.get("built_at");
            let row_count: i64 = row.get("row_count");
            BuildMarker {
                built_at: DateTime::from_timestamp(built_at, 0).unwrap_or_default(),
                row_count: u64::try_from(row_count).unwrap_or_default(),
                source_url: row.get("source_url"),
            }
        }))
    }

    /// Replaces every row and station of `provider` and records the marker,
    /// in one transaction.
    ///
    /// Rows sharing a key keep the first occurrence, as do stations sharing
    /// a gauge identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if any statement fails; the
    /// transaction is rolled back and the previous contents survive.
    #[instrument(skip(self, rows, stations), fields(rows = rows.len(), stations = stations.len()))]
    pub async fn replace(
        &self,
        provider: &str,
        rows: &[CacheRow],
        stations: &[StationMetadata],
        source_url: &str,
    ) -> Result<u64, CacheError> {
        let mut tx = self.pool.begin().await?;

        for table in ["observations", "stations", "cache_builds"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE provider = ?"))
                .bind(provider)
                .execute(&mut *tx)
                .await?;
        }

        let mut written: u64 = 0;
        for row in rows {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO observations (provider, gauge_id, variable, observed_at, value)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(provider)
            .bind(&row.gauge_id)
            .bind(row.variable.id())
            .bind(row.timestamp.timestamp())
            .bind(row.value)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        for station in stations {
            sqlx::query(
                "INSERT OR IGNORE INTO stations
                   (provider, gauge_id, name, river, latitude, longitude, altitude, area, country, source)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(provider)
            .bind(&station.gauge_id)
            .bind(&station.name)
            .bind(&station.river)
            .bind(station.latitude)
            .bind(station.longitude)
            .bind(station.altitude)
            .bind(station.area)
            .bind(&station.country)
            .bind(&station.source)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO cache_builds (provider, built_at, row_count, source_url) VALUES (?, ?, ?, ?)",
        )
        .bind(provider)
        .bind(Utc::now().timestamp())
        .bind(i64::try_from(written).unwrap_or(i64::MAX))
        .bind(source_url)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(written, "bulk rows committed");
        Ok(written)
    }

    /// Observations for one gauge and variable within the closed date range.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the query fails.
    pub async fn query(
        &self,
        provider: &str,
        gauge_id: &str,
        variable: &Variable,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Observation>, CacheError> {
        let lower = start_of_day(start).timestamp();
        let upper = end
            .succ_opt()
            .map_or(i64::MAX, |d| start_of_day(d).timestamp());

        let rows = sqlx::query(
            "SELECT observed_at, value FROM observations
             WHERE provider = ? AND gauge_id = ? AND variable = ?
               AND observed_at >= ? AND observed_at < ?
             ORDER BY observed_at",
        )
        .bind(provider)
        .bind(gauge_id)
        .bind(variable.id())
        .bind(lower)
        .bind(upper)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let observed_at: i64 = row.get("observed_at");
                let value: Option<f64> = row.get("value");
                DateTime::from_timestamp(observed_at, 0).map(|ts| Observation::new(ts, value))
            })
            .collect())
    }

    /// Gauges with at least one row for `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the query fails.
    pub async fn gauges(&self, provider: &str) -> Result<Vec<String>, CacheError> {
        let rows = sqlx::query(
            "SELECT DISTINCT gauge_id FROM observations WHERE provider = ? ORDER BY gauge_id",
        )
        .bind(provider)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.get("gauge_id")).collect())
    }

    /// Whether the store holds any row for this gauge and variable,
    /// regardless of date.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the query fails.
    pub async fn has_series(
        &self,
        provider: &str,
        gauge_id: &str,
        variable: &Variable,
    ) -> Result<bool, CacheError> {
        let (exists,): (i64,) = sqlx::query_as(
            "SELECT EXISTS(
                SELECT 1 FROM observations WHERE provider = ? AND gauge_id = ? AND variable = ?
             )",
        )
        .bind(provider)
        .bind(gauge_id)
        .bind(variable.id())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    /// Station records stored for `provider`, ordered by gauge.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the query fails.
    pub async fn stations(&self, provider: &str) -> Result<Vec<StationMetadata>, CacheError> {
        let rows = sqlx::query(
            "SELECT gauge_id, name, river, latitude, longitude, altitude, area, country, source
             FROM stations WHERE provider = ? ORDER BY gauge_id",
        )
        .bind(provider)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StationMetadata {
                gauge_id: row.get("gauge_id"),
                name: row.get("name"),
                river: row.get("river"),
                latitude: row.get("latitude"),
                longitude: row.get("longitude"),
                altitude: row.get("altitude"),
                area: row.get("area"),
                country: row.get("country"),
                source: row.get("source"),
            })
            .collect())
    }

    /// Deletes every row, station and the marker of `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if a statement fails.
    pub async fn clear(&self, provider: &str) -> Result<(), CacheError> {
        let mut tx = self.pool.begin().await?;
        for table in ["observations", "stations", "cache_builds"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE provider = ?"))
                .bind(provider)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Checks if WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the query fails.
    pub async fn is_wal_enabled(&self) -> Result<bool, CacheError> {
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(result.0.eq_ignore_ascii_case("wal"))
    }

    /// Gracefully closes all connections in the pool.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
