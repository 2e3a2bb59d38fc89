//! External collaborators behind traits: historical snapshot queries,
//! persisted cascade state, and notification delivery.
//!
//! The cascade only ever reads history, and it reads/writes the persisted
//! state as a whole record. Everything here distinguishes "query returned
//! nothing" (a valid outcome) from a transport failure (an error).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rust_decimal::Decimal;
use shelfwatch_core::{
    AvailabilityRecord, Notification, PersistedState, ProductKey, ProductSnapshotEntry, SizeUnit,
    VariantOffer, VariantSize,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelfwatch-store";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("reading state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decoding state file {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("encoding state record: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned status {status}")]
    HttpStatus { status: u16 },
}

/// Read-only query capability over all snapshots ever recorded. The cascade
/// depends only on these query shapes, never on the underlying store.
#[async_trait]
pub trait SnapshotHistory: Send + Sync {
    /// Most recent snapshot timestamp, or `None` when nothing has been
    /// captured yet.
    async fn latest_timestamp(&self) -> Result<Option<i64>, HistoryError>;

    /// Every entry captured at exactly `timestamp`.
    async fn entries_at(&self, timestamp: i64) -> Result<Vec<ProductSnapshotEntry>, HistoryError>;

    /// Entries captured at `timestamp` whose url did not appear in the
    /// snapshot captured at `baseline`. A `baseline` with no stored snapshot
    /// contributes an empty url set, so every entry at `timestamp` matches.
    async fn entries_absent_at(
        &self,
        timestamp: i64,
        baseline: i64,
    ) -> Result<Vec<ProductSnapshotEntry>, HistoryError>;

    /// Latest stored snapshot timestamp at or before `timestamp`.
    async fn nearest_timestamp_at_or_before(
        &self,
        timestamp: i64,
    ) -> Result<Option<i64>, HistoryError>;

    /// Total remaining grams per product at `timestamp`, summed from the
    /// fine-grained availability series.
    async fn quantity_totals_at(
        &self,
        timestamp: i64,
    ) -> Result<BTreeMap<ProductKey, Decimal>, HistoryError>;
}

/// In-memory history used by tests and fixture-driven runs. Inserting a
/// snapshot also derives its availability rows, so the size-weighted sum
/// invariant holds by construction.
#[derive(Debug, Default, Clone)]
pub struct MemoryHistory {
    snapshots: BTreeMap<i64, Vec<ProductSnapshotEntry>>,
    availability: Vec<AvailabilityRecord>,
}

impl MemoryHistory {
    pub fn insert_snapshot(&mut self, timestamp: i64, mut entries: Vec<ProductSnapshotEntry>) {
        for entry in &mut entries {
            entry.timestamp = timestamp;
            for (size, offer) in &entry.variants {
                if let Some(availability) = offer.availability {
                    self.availability.push(AvailabilityRecord {
                        timestamp,
                        brand: entry.brand.clone(),
                        name: entry.name.clone(),
                        size: size.magnitude,
                        availability,
                        price_cents: offer.price_cents,
                    });
                }
            }
        }
        self.snapshots.insert(timestamp, entries);
    }
}

#[async_trait]
impl SnapshotHistory for MemoryHistory {
    async fn latest_timestamp(&self) -> Result<Option<i64>, HistoryError> {
        Ok(self.snapshots.keys().next_back().copied())
    }

    async fn entries_at(&self, timestamp: i64) -> Result<Vec<ProductSnapshotEntry>, HistoryError> {
        Ok(self.snapshots.get(&timestamp).cloned().unwrap_or_default())
    }

    async fn entries_absent_at(
        &self,
        timestamp: i64,
        baseline: i64,
    ) -> Result<Vec<ProductSnapshotEntry>, HistoryError> {
        let known_urls: BTreeSet<&str> = self
            .snapshots
            .get(&baseline)
            .map(|entries| entries.iter().map(|e| e.url.as_str()).collect())
            .unwrap_or_default();
        Ok(self
            .snapshots
            .get(&timestamp)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| !known_urls.contains(e.url.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn nearest_timestamp_at_or_before(
        &self,
        timestamp: i64,
    ) -> Result<Option<i64>, HistoryError> {
        Ok(self.snapshots.range(..=timestamp).next_back().map(|(t, _)| *t))
    }

    async fn quantity_totals_at(
        &self,
        timestamp: i64,
    ) -> Result<BTreeMap<ProductKey, Decimal>, HistoryError> {
        let mut totals = BTreeMap::new();
        for record in self.availability.iter().filter(|r| r.timestamp == timestamp) {
            let key = ProductKey {
                brand: record.brand.clone(),
                name: record.name.clone(),
            };
            *totals.entry(key).or_insert(Decimal::ZERO) +=
                record.size * Decimal::from(record.availability);
        }
        Ok(totals)
    }
}

/// Postgres-backed history over the `history` and `history_availability`
/// tables written by the ingestion side.
#[derive(Debug, Clone)]
pub struct PgHistory {
    pool: PgPool,
}

impl PgHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, HistoryError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), HistoryError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("history schema migrations applied");
        Ok(())
    }

    async fn entries_from_rows(
        &self,
        timestamp: i64,
        rows: Vec<PgRow>,
    ) -> Result<Vec<ProductSnapshotEntry>, HistoryError> {
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(entry_from_row(&row)?);
        }
        if entries.is_empty() {
            return Ok(entries);
        }

        let variant_rows = sqlx::query(
            r#"
            SELECT brand, name, size, unit, availability, price_cents
              FROM history_availability
             WHERE "timestamp" = $1
            "#,
        )
        .bind(timestamp)
        .fetch_all(&self.pool)
        .await?;

        let mut variants: BTreeMap<ProductKey, BTreeMap<VariantSize, VariantOffer>> =
            BTreeMap::new();
        for row in variant_rows {
            let key = ProductKey {
                brand: row.try_get("brand")?,
                name: row.try_get("name")?,
            };
            let size = VariantSize::new(
                row.try_get::<Decimal, _>("size")?,
                SizeUnit::from_label(&row.try_get::<String, _>("unit")?),
            );
            let offer = VariantOffer {
                price_cents: row.try_get::<Option<i64>, _>("price_cents")?,
                availability: Some(row.try_get::<i64, _>("availability")?),
            };
            variants.entry(key).or_default().insert(size, offer);
        }

        for entry in &mut entries {
            if let Some(found) = variants.remove(&entry.key()) {
                entry.variants = found;
            }
        }
        Ok(entries)
    }
}

const HISTORY_COLUMNS: &str = r#"
    "timestamp", sku, brand, name, url, image, price_cents,
    standalone_price_cents, standalone_availability, description,
    category, plant_type, thc_low, thc_high, cbd_low, cbd_high, terpenes
"#;

fn entry_from_row(row: &PgRow) -> Result<ProductSnapshotEntry, HistoryError> {
    let thc_low: Option<Decimal> = row.try_get("thc_low")?;
    let thc_high: Option<Decimal> = row.try_get("thc_high")?;
    let cbd_low: Option<Decimal> = row.try_get("cbd_low")?;
    let cbd_high: Option<Decimal> = row.try_get("cbd_high")?;
    let terpenes: Option<String> = row.try_get("terpenes")?;
    Ok(ProductSnapshotEntry {
        timestamp: row.try_get("timestamp")?,
        sku: row.try_get("sku")?,
        brand: row.try_get("brand")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        image: row.try_get("image")?,
        price_cents: row.try_get("price_cents")?,
        standalone_price_cents: row.try_get("standalone_price_cents")?,
        standalone_availability: row.try_get("standalone_availability")?,
        variants: BTreeMap::new(),
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        plant_type: row.try_get("plant_type")?,
        thc_range: thc_low.zip(thc_high),
        cbd_range: cbd_low.zip(cbd_high),
        terpenes: terpenes
            .map(|joined| joined.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
    })
}

#[async_trait]
impl SnapshotHistory for PgHistory {
    async fn latest_timestamp(&self) -> Result<Option<i64>, HistoryError> {
        let row = sqlx::query(r#"SELECT MAX("timestamp") AS ts FROM history"#)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<i64>, _>("ts")?)
    }

    async fn entries_at(&self, timestamp: i64) -> Result<Vec<ProductSnapshotEntry>, HistoryError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {HISTORY_COLUMNS} FROM history WHERE "timestamp" = $1"#
        ))
        .bind(timestamp)
        .fetch_all(&self.pool)
        .await?;
        self.entries_from_rows(timestamp, rows).await
    }

    async fn entries_absent_at(
        &self,
        timestamp: i64,
        baseline: i64,
    ) -> Result<Vec<ProductSnapshotEntry>, HistoryError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {HISTORY_COLUMNS}
              FROM history
             WHERE "timestamp" = $1
               AND url NOT IN (SELECT url FROM history WHERE "timestamp" = $2)
            "#
        ))
        .bind(timestamp)
        .bind(baseline)
        .fetch_all(&self.pool)
        .await?;
        self.entries_from_rows(timestamp, rows).await
    }

    async fn nearest_timestamp_at_or_before(
        &self,
        timestamp: i64,
    ) -> Result<Option<i64>, HistoryError> {
        let row = sqlx::query(
            r#"SELECT MAX("timestamp") AS ts FROM history WHERE "timestamp" <= $1"#,
        )
        .bind(timestamp)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<Option<i64>, _>("ts")?)
    }

    async fn quantity_totals_at(
        &self,
        timestamp: i64,
    ) -> Result<BTreeMap<ProductKey, Decimal>, HistoryError> {
        let rows = sqlx::query(
            r#"
            SELECT brand, name, SUM(size * availability) AS total
              FROM history_availability
             WHERE "timestamp" = $1
             GROUP BY brand, name
            "#,
        )
        .bind(timestamp)
        .fetch_all(&self.pool)
        .await?;
        let mut totals = BTreeMap::new();
        for row in rows {
            let key = ProductKey {
                brand: row.try_get("brand")?,
                name: row.try_get("name")?,
            };
            totals.insert(key, row.try_get::<Decimal, _>("total")?);
        }
        Ok(totals)
    }
}

/// Persisted cascade state, read once and replaced whole once per
/// invocation. Implementations must make `replace` atomic so the cursor and
/// cooldown maps can never be observed half-updated.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedState>, StateError>;
    async fn replace(&self, state: &PersistedState) -> Result<(), StateError>;
}

/// Single-record JSON file store. Replacement writes a temp file beside the
/// target and renames over it.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<Option<PersistedState>, StateError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };
        let state = serde_json::from_slice(&bytes).map_err(|err| StateError::Decode {
            path: self.path.clone(),
            source: err,
        })?;
        Ok(Some(state))
    }

    async fn replace(&self, state: &PersistedState) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(state).map_err(StateError::Encode)?;
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if let Some(parent) = &parent {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StateError::Write {
                    path: parent.clone(),
                    source: err,
                })?;
        }
        let temp_path = self
            .path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|err| StateError::Write {
                path: temp_path.clone(),
                source: err,
            })?;
        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "persisted state replaced");
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StateError::Write {
                    path: self.path.clone(),
                    source: err,
                })
            }
        }
    }
}

/// In-memory state store for tests and orchestration dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Option<PersistedState>>,
}

impl MemoryStateStore {
    pub fn with_state(state: PersistedState) -> Self {
        Self {
            inner: Mutex::new(Some(state)),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<PersistedState>, StateError> {
        Ok(self.inner.lock().await.clone())
    }

    async fn replace(&self, state: &PersistedState) -> Result<(), StateError> {
        *self.inner.lock().await = Some(state.clone());
        Ok(())
    }
}

/// Delivery boundary. The cascade's contract is satisfied once it has
/// produced the notification list; whether delivery succeeds is the
/// caller's concern.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Posts each notification as JSON to a configured webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
        user_agent: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder.build().context("building webhook client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "text": notification.text,
                "image": notification.image,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::HttpStatus {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Collects notifications instead of delivering them; backs the debug mode
/// that runs the full cascade without external side effects.
#[derive(Debug, Default)]
pub struct DebugNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl DebugNotifier {
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for DebugNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        info!(text = %notification.text, "debug delivery");
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn mk_entry(brand: &str, name: &str, url: &str) -> ProductSnapshotEntry {
        ProductSnapshotEntry {
            timestamp: 0,
            sku: format!("{brand}-{name}"),
            brand: brand.into(),
            name: name.into(),
            url: url.into(),
            image: None,
            price_cents: None,
            standalone_price_cents: None,
            standalone_availability: None,
            variants: BTreeMap::new(),
            description: None,
            category: None,
            plant_type: None,
            thc_range: None,
            cbd_range: None,
            terpenes: vec![],
        }
    }

    fn with_variant(
        mut entry: ProductSnapshotEntry,
        size: Decimal,
        price_cents: i64,
        availability: i64,
    ) -> ProductSnapshotEntry {
        entry.variants.insert(
            VariantSize::grams(size),
            VariantOffer {
                price_cents: Some(price_cents),
                availability: Some(availability),
            },
        );
        entry
    }

    #[tokio::test]
    async fn diff_query_reports_urls_absent_from_baseline() {
        let mut history = MemoryHistory::default();
        history.insert_snapshot(100, vec![mk_entry("Acme", "Alpha", "/a")]);
        history.insert_snapshot(
            200,
            vec![mk_entry("Acme", "Alpha", "/a"), mk_entry("Acme", "Beta", "/b")],
        );

        let new_entries = history.entries_absent_at(200, 100).await.unwrap();
        assert_eq!(new_entries.len(), 1);
        assert_eq!(new_entries[0].url, "/b");
        assert_eq!(history.latest_timestamp().await.unwrap(), Some(200));
    }

    #[tokio::test]
    async fn diff_against_missing_baseline_reports_everything() {
        let mut history = MemoryHistory::default();
        history.insert_snapshot(200, vec![mk_entry("Acme", "Alpha", "/a")]);

        let new_entries = history.entries_absent_at(200, 50).await.unwrap();
        assert_eq!(new_entries.len(), 1);
    }

    #[tokio::test]
    async fn quantity_totals_sum_size_weighted_availability() {
        let mut history = MemoryHistory::default();
        let entry = with_variant(
            with_variant(mk_entry("Acme", "Alpha", "/a"), dec!(3.5), 2500, 4),
            dec!(1),
            900,
            6,
        );
        history.insert_snapshot(100, vec![entry]);

        let totals = history.quantity_totals_at(100).await.unwrap();
        let key = ProductKey {
            brand: "Acme".into(),
            name: "Alpha".into(),
        };
        assert_eq!(totals.get(&key), Some(&dec!(20)));
    }

    #[tokio::test]
    async fn nearest_timestamp_rounds_down() {
        let mut history = MemoryHistory::default();
        history.insert_snapshot(100, vec![]);
        history.insert_snapshot(200, vec![]);

        assert_eq!(history.nearest_timestamp_at_or_before(150).await.unwrap(), Some(100));
        assert_eq!(history.nearest_timestamp_at_or_before(200).await.unwrap(), Some(200));
        assert_eq!(history.nearest_timestamp_at_or_before(50).await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_state_store_round_trips_and_replaces_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStateStore::new(dir.path().join("state").join("cascade.json"));

        assert_eq!(store.load().await.unwrap(), None);

        let mut state = PersistedState {
            last_timestamp: 100,
            ..Default::default()
        };
        store.replace(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(state.clone()));

        state.last_timestamp = 200;
        state.low_stock_updates.insert("sku-1".into(), 42);
        store.replace(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(state));

        // No temp files may survive a successful replace.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("state"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn debug_notifier_collects_without_side_effects() {
        let notifier = DebugNotifier::default();
        notifier
            .deliver(&Notification {
                text: "hello".into(),
                image: None,
            })
            .await
            .unwrap();
        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "hello");
    }
}
