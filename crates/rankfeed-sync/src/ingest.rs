//! Chunked, idempotent upsert of scraped characters keyed by `(name, world)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rankfeed_core::{CharacterRecord, NaturalKey};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ConfigError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("character store unavailable: {0}")]
    Unavailable(String),
    #[error("record {0} cannot be stored: {1}")]
    InvalidRecord(NaturalKey, String),
}

/// One chunk's worth of staged writes, applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkWrite {
    pub updates: Vec<(Uuid, CharacterRecord)>,
    pub inserts: Vec<CharacterRecord>,
}

impl ChunkWrite {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.inserts.is_empty()
    }
}

#[async_trait]
pub trait CharacterStore: Send + Sync {
    /// Single bulk read: ids of stored rows matching any of `keys`.
    async fn find_existing(&self, keys: &[NaturalKey]) -> Result<HashMap<NaturalKey, Uuid>, StorageError>;

    async fn commit_chunk(&self, write: ChunkWrite) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub chunks: usize,
    pub inserted: usize,
    pub updated: usize,
}

pub struct Ingestor {
    store: Arc<dyn CharacterStore>,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(store: Arc<dyn CharacterStore>, batch_size: usize) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(Self { store, batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Upserts `records` chunk by chunk. A storage failure stops the call; chunks
    /// committed before it stay committed.
    pub async fn ingest(&self, records: &[CharacterRecord]) -> Result<IngestReport, StorageError> {
        let mut report = IngestReport::default();

        for (chunk_no, chunk) in records.chunks(self.batch_size).enumerate() {
            let chunk = collapse_duplicates(chunk);
            let keys: Vec<NaturalKey> = chunk.iter().map(CharacterRecord::natural_key).collect();
            let existing = self.store.find_existing(&keys).await?;

            let mut write = ChunkWrite::default();
            for (record, key) in chunk.into_iter().zip(keys) {
                match existing.get(&key) {
                    Some(id) => write.updates.push((*id, record)),
                    None => write.inserts.push(record),
                }
            }

            let (updated, inserted) = (write.updates.len(), write.inserts.len());
            self.store.commit_chunk(write).await?;
            debug!(chunk = chunk_no, inserted, updated, "chunk committed");

            report.chunks += 1;
            report.inserted += inserted;
            report.updated += updated;
        }

        info!(
            records = records.len(),
            chunks = report.chunks,
            inserted = report.inserted,
            updated = report.updated,
            "ingest finished"
        );
        Ok(report)
    }
}

/// Keeps one record per natural key: the last occurrence wins, placed at the first
/// occurrence's position.
pub fn collapse_duplicates(chunk: &[CharacterRecord]) -> Vec<CharacterRecord> {
    let mut positions: HashMap<NaturalKey, usize> = HashMap::with_capacity(chunk.len());
    let mut out: Vec<CharacterRecord> = Vec::with_capacity(chunk.len());
    for record in chunk {
        match positions.get(&record.natural_key()) {
            Some(&pos) => out[pos] = record.clone(),
            None => {
                positions.insert(record.natural_key(), out.len());
                out.push(record.clone());
            }
        }
    }
    out
}

/// Postgres-backed store over the `characters` table.
#[derive(Debug, Clone)]
pub struct PgCharacterStore {
    pool: PgPool,
}

impl PgCharacterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Builds the pool without connecting; connection errors surface on first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CharacterStore for PgCharacterStore {
    async fn find_existing(&self, keys: &[NaturalKey]) -> Result<HashMap<NaturalKey, Uuid>, StorageError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let names: Vec<String> = keys.iter().map(|k| k.name.clone()).collect();
        let worlds: Vec<String> = keys.iter().map(|k| k.world.clone()).collect();

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.name, c.world
              FROM characters c
              JOIN UNNEST($1::text[], $2::text[]) AS k(name, world)
                ON c.name = k.name AND c.world = k.world
            "#,
        )
        .bind(&names)
        .bind(&worlds)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            let world: String = row.try_get("world")?;
            out.insert(NaturalKey::new(name, world), id);
        }
        Ok(out)
    }

    async fn commit_chunk(&self, write: ChunkWrite) -> Result<(), StorageError> {
        if write.is_empty() {
            return Ok(());
        }
        let update_ids: Vec<Uuid> = write.updates.iter().map(|(id, _)| *id).collect();
        let update_cols = Columns::from_records(write.updates.iter().map(|(_, r)| r))?;
        let insert_ids: Vec<Uuid> = write.inserts.iter().map(|_| Uuid::new_v4()).collect();
        let insert_cols = Columns::from_records(write.inserts.iter())?;

        let mut tx = self.pool.begin().await?;

        if !update_ids.is_empty() {
            let (ids, cols) = (&update_ids, &update_cols);
            sqlx::query(
                r#"
                UPDATE characters AS c
                   SET level = u.level,
                       job = u.job,
                       image_ref = u.image_ref,
                       scraped_at = u.scraped_at
                  FROM UNNEST($1::uuid[], $2::int4[], $3::text[], $4::text[], $5::timestamptz[])
                       AS u(id, level, job, image_ref, scraped_at)
                 WHERE c.id = u.id
                "#,
            )
            .bind(ids)
            .bind(&cols.levels)
            .bind(&cols.jobs)
            .bind(&cols.image_refs)
            .bind(&cols.scraped_at)
            .execute(&mut *tx)
            .await?;
        }

        if !insert_ids.is_empty() {
            let (ids, cols) = (&insert_ids, &insert_cols);
            sqlx::query(
                r#"
                INSERT INTO characters (id, name, world, level, job, image_ref, scraped_at)
                SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::int4[],
                                     $5::text[], $6::text[], $7::timestamptz[])
                ON CONFLICT (name, world) DO UPDATE
                   SET level = EXCLUDED.level,
                       job = EXCLUDED.job,
                       image_ref = EXCLUDED.image_ref,
                       scraped_at = EXCLUDED.scraped_at
                "#,
            )
            .bind(ids)
            .bind(&cols.names)
            .bind(&cols.worlds)
            .bind(&cols.levels)
            .bind(&cols.jobs)
            .bind(&cols.image_refs)
            .bind(&cols.scraped_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Default)]
struct Columns {
    names: Vec<String>,
    worlds: Vec<String>,
    levels: Vec<i32>,
    jobs: Vec<String>,
    image_refs: Vec<String>,
    scraped_at: Vec<DateTime<Utc>>,
}

impl Columns {
    fn from_records<'a>(records: impl Iterator<Item = &'a CharacterRecord>) -> Result<Self, StorageError> {
        let mut cols = Self::default();
        for r in records {
            let level = i32::try_from(r.level).map_err(|_| {
                StorageError::InvalidRecord(r.natural_key(), format!("level {} exceeds the int4 column", r.level))
            })?;
            cols.names.push(r.name.clone());
            cols.worlds.push(r.world.as_str().to_string());
            cols.levels.push(level);
            cols.jobs.push(r.job.as_str().to_string());
            cols.image_refs.push(r.image_ref.clone());
            cols.scraped_at.push(r.scraped_at);
        }
        Ok(cols)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCharacter {
    pub id: Uuid,
    pub record: CharacterRecord,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<NaturalKey, StoredCharacter>,
    commits: usize,
}

/// In-process store for dry runs and tests. Can be switched unavailable to
/// simulate an unreachable database.
#[derive(Debug)]
pub struct MemoryCharacterStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl Default for MemoryCharacterStore {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryCharacterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn get(&self, key: &NaturalKey) -> Option<StoredCharacter> {
        self.lock().rows.get(key).cloned()
    }

    /// All rows ordered by natural key.
    pub fn rows(&self) -> Vec<StoredCharacter> {
        let state = self.lock();
        let mut rows: Vec<_> = state.rows.values().cloned().collect();
        rows.sort_by_key(|row| row.record.natural_key());
        rows
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory store switched off".into()))
        }
    }
}

#[async_trait]
impl CharacterStore for MemoryCharacterStore {
    async fn find_existing(&self, keys: &[NaturalKey]) -> Result<HashMap<NaturalKey, Uuid>, StorageError> {
        self.ensure_available()?;
        let state = self.lock();
        Ok(keys
            .iter()
            .filter_map(|key| state.rows.get(key).map(|row| (key.clone(), row.id)))
            .collect())
    }

    async fn commit_chunk(&self, write: ChunkWrite) -> Result<(), StorageError> {
        self.ensure_available()?;
        let mut state = self.lock();

        for (id, record) in write.updates {
            let key = record.natural_key();
            state.rows.insert(key, StoredCharacter { id, record });
        }
        for record in write.inserts {
            let key = record.natural_key();
            match state.rows.get_mut(&key) {
                Some(existing) => existing.record = record,
                None => {
                    state.rows.insert(
                        key,
                        StoredCharacter {
                            id: Uuid::new_v4(),
                            record,
                        },
                    );
                }
            }
        }
        state.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;
    use rankfeed_core::JobClass;
    use std::sync::atomic::AtomicUsize;

    /// Fails every commit after the first `ok_commits`.
    struct FlakyStore {
        inner: MemoryCharacterStore,
        ok_commits: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl CharacterStore for FlakyStore {
        async fn find_existing(&self, keys: &[NaturalKey]) -> Result<HashMap<NaturalKey, Uuid>, StorageError> {
            self.inner.find_existing(keys).await
        }

        async fn commit_chunk(&self, write: ChunkWrite) -> Result<(), StorageError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) >= self.ok_commits {
                return Err(StorageError::Unavailable("connection reset".into()));
            }
            self.inner.commit_chunk(write).await
        }
    }

    #[tokio::test]
    async fn reingesting_updates_in_place() {
        let store = Arc::new(MemoryCharacterStore::new());
        let ingestor = Ingestor::new(store.clone(), 500).unwrap();

        let first = ingestor.ingest(&[record("Ana", 1, 100)]).await.unwrap();
        assert_eq!(first, IngestReport { chunks: 1, inserted: 1, updated: 0 });
        let id = store.get(&NaturalKey::new("Ana", "Bera")).unwrap().id;

        let later = CharacterRecord {
            job: JobClass::Aran,
            image_ref: "fresh-hash".into(),
            scraped_at: record("Ana", 1, 0).scraped_at + chrono::Duration::hours(6),
            ..record("Ana", 1, 105)
        };
        let second = ingestor.ingest(&[later.clone()]).await.unwrap();
        assert_eq!(second, IngestReport { chunks: 1, inserted: 0, updated: 1 });

        assert_eq!(store.len(), 1);
        let row = store.get(&NaturalKey::new("Ana", "Bera")).unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.record.level, 105);
        assert_eq!(row.record.job, JobClass::Aran);
        assert_eq!(row.record.image_ref, "fresh-hash");
        assert_eq!(row.record.scraped_at, later.scraped_at);
        assert_eq!(row.record, later);
    }

    #[test]
    fn levels_beyond_the_column_range_are_rejected() {
        let fits = record("Ana", 1, 250);
        let cols = Columns::from_records([&fits].into_iter()).unwrap();
        assert_eq!(cols.levels, vec![250]);

        let huge = record("Borin", 1, u32::MAX);
        let err = Columns::from_records([&fits, &huge].into_iter()).err().unwrap();
        match err {
            StorageError::InvalidRecord(key, reason) => {
                assert_eq!(key, NaturalKey::new("Borin", "Bera"));
                assert!(reason.contains("exceeds"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn records_are_committed_in_chunks() {
        let store = Arc::new(MemoryCharacterStore::new());
        let ingestor = Ingestor::new(store.clone(), 2).unwrap();
        let records: Vec<_> = (0..5).map(|i| record(&format!("Char{i}"), 0, 10 + i)).collect();

        let report = ingestor.ingest(&records).await.unwrap();
        assert_eq!(report.chunks, 3);
        assert_eq!(report.inserted, 5);
        assert_eq!(store.commit_count(), 3);
        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_chunk_keep_the_last() {
        let store = Arc::new(MemoryCharacterStore::new());
        let ingestor = Ingestor::new(store.clone(), 10).unwrap();

        let report = ingestor
            .ingest(&[record("Ana", 1, 100), record("Borin", 1, 50), record("Ana", 1, 101)])
            .await
            .unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&NaturalKey::new("Ana", "Bera")).unwrap().record.level, 101);
    }

    #[tokio::test]
    async fn same_name_on_different_worlds_are_distinct() {
        let store = Arc::new(MemoryCharacterStore::new());
        let ingestor = Ingestor::new(store.clone(), 10).unwrap();
        ingestor
            .ingest(&[record("Ana", 1, 100), record("Ana", 0, 90)])
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get(&NaturalKey::new("Ana", "Scania")).is_some());
    }

    #[tokio::test]
    async fn storage_failure_keeps_earlier_chunks() {
        let store = Arc::new(FlakyStore {
            inner: MemoryCharacterStore::new(),
            ok_commits: 1,
            attempts: AtomicUsize::new(0),
        });
        let ingestor = Ingestor::new(store.clone(), 2).unwrap();
        let records: Vec<_> = (0..4).map(|i| record(&format!("Char{i}"), 0, 10)).collect();

        let err = ingestor.ingest(&records).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert_eq!(store.inner.len(), 2);
        assert_eq!(store.inner.commit_count(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_before_writing() {
        let store = Arc::new(MemoryCharacterStore::new());
        store.set_available(false);
        let ingestor = Ingestor::new(store.clone(), 10).unwrap();
        assert!(ingestor.ingest(&[record("Ana", 1, 1)]).await.is_err());
        store.set_available(true);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn empty_input_touches_nothing() {
        let store = Arc::new(MemoryCharacterStore::new());
        store.set_available(false);
        let report = Ingestor::new(store, 10).unwrap().ingest(&[]).await.unwrap();
        assert_eq!(report, IngestReport::default());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let store = Arc::new(MemoryCharacterStore::new());
        assert!(matches!(Ingestor::new(store, 0), Err(ConfigError::ZeroBatchSize)));
    }

    #[test]
    fn collapse_keeps_first_position_and_last_value() {
        let out = collapse_duplicates(&[record("A", 1, 1), record("B", 1, 2), record("A", 1, 3)]);
        let summary: Vec<_> = out.iter().map(|r| (r.name.as_str(), r.level)).collect();
        assert_eq!(summary, vec![("A", 3), ("B", 2)]);
    }
}
