//! Bounded-concurrency page scraping.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use rankfeed_adapters::{PageOutcome, PageSource};
use rankfeed_core::CharacterRecord;
use rankfeed_storage::SessionProvider;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{ConfigError, ScrapeError};

/// Randomized courtesy delay each page unit waits out after releasing its permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_millis(1500),
        }
    }
}

impl PacingPolicy {
    pub const NONE: Self = Self {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min > self.max {
            return Err(ConfigError::InvalidPacing {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }
}

/// Shared sinks the page units append into; safe for concurrent use.
#[derive(Debug, Default)]
pub struct ScrapeAggregate {
    records: Mutex<Vec<CharacterRecord>>,
    failed_pages: Mutex<BTreeSet<usize>>,
    empty_pages: AtomicUsize,
}

impl ScrapeAggregate {
    pub fn push_records(&self, mut records: Vec<CharacterRecord>) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(&mut records);
    }

    pub fn push_failed(&self, page: usize) {
        self.failed_pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(page);
    }

    pub fn note_empty(&self) {
        self.empty_pages.fetch_add(1, Ordering::Relaxed);
    }

    fn take(&self) -> (Vec<CharacterRecord>, Vec<usize>, usize) {
        let records = std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner));
        let failed = std::mem::take(&mut *self.failed_pages.lock().unwrap_or_else(PoisonError::into_inner));
        (
            records,
            failed.into_iter().collect(),
            self.empty_pages.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeOutcome {
    /// Unordered; completion order of the page units.
    pub records: Vec<CharacterRecord>,
    /// Ascending page indices whose fetch or parse failed.
    pub failed_pages: Vec<usize>,
    pub empty_pages: usize,
    pub pages_launched: usize,
    pub cancelled: bool,
}

pub struct ScrapeOrchestrator {
    sessions: Arc<dyn SessionProvider>,
    pages: Arc<dyn PageSource>,
    pacing: PacingPolicy,
}

impl ScrapeOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        pages: Arc<dyn PageSource>,
        pacing: PacingPolicy,
    ) -> Result<Self, ConfigError> {
        pacing.validate()?;
        Ok(Self {
            sessions,
            pages,
            pacing,
        })
    }

    /// Fetches pages `[0, max_pages)` with at most `concurrency` in flight. Failed pages
    /// are recorded, never retried here.
    pub async fn scrape_all(
        &self,
        max_pages: usize,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<ScrapeOutcome, ScrapeError> {
        if concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency.into());
        }
        if max_pages == 0 {
            return Ok(ScrapeOutcome::default());
        }

        let session = Arc::new(self.sessions.acquire_session().await?);
        let permits = Arc::new(Semaphore::new(concurrency));
        let aggregate = Arc::new(ScrapeAggregate::default());
        let mut units = PageUnits::default();
        let mut cancelled = false;

        info!(max_pages, concurrency, source = self.pages.source_id(), "scrape started");

        for index in 0..max_pages {
            units.reap_finished(&aggregate);
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let pages = self.pages.clone();
            let session = session.clone();
            let aggregate = aggregate.clone();
            let pause = self.pacing.sample();

            let unit = async move {
                let outcome = pages.fetch_page(index, &session).await;
                drop(permit);
                match outcome {
                    PageOutcome::Success(records) => {
                        debug!(records = records.len(), "page scraped");
                        aggregate.push_records(records);
                    }
                    PageOutcome::Empty => {
                        debug!("page empty");
                        aggregate.note_empty();
                    }
                    PageOutcome::Failed(err) => {
                        warn!(error = %err, "page failed");
                        aggregate.push_failed(index);
                    }
                }
                tokio::time::sleep(pause).await;
            };
            units.spawn(index, unit.instrument(info_span!("scrape_page", page = index)));
        }

        let pages_launched = units.launched;
        units.drain(&aggregate).await;

        let (records, failed_pages, empty_pages) = aggregate.take();
        info!(
            records = records.len(),
            failed = failed_pages.len(),
            empty_pages,
            pages_launched,
            cancelled,
            "scrape finished"
        );
        Ok(ScrapeOutcome {
            records,
            failed_pages,
            empty_pages,
            pages_launched,
            cancelled,
        })
    }
}

/// Spawned page units keyed back to their page index so aborted units count as failed pages.
#[derive(Default)]
struct PageUnits {
    units: JoinSet<()>,
    pages: HashMap<Id, usize>,
    launched: usize,
}

impl PageUnits {
    fn spawn<F>(&mut self, index: usize, unit: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.units.spawn(unit);
        self.pages.insert(handle.id(), index);
        self.launched += 1;
    }

    /// Number of spawned units not yet joined.
    fn pending(&self) -> usize {
        self.pages.len()
    }

    /// Joins units that already finished without waiting on the rest.
    fn reap_finished(&mut self, aggregate: &ScrapeAggregate) {
        while let Some(joined) = self.units.try_join_next_with_id() {
            self.settle(joined, aggregate);
        }
    }

    async fn drain(&mut self, aggregate: &ScrapeAggregate) {
        while let Some(joined) = self.units.join_next_with_id().await {
            self.settle(joined, aggregate);
        }
    }

    fn settle(&mut self, joined: Result<(Id, ()), JoinError>, aggregate: &ScrapeAggregate) {
        match joined {
            Ok((id, ())) => {
                self.pages.remove(&id);
            }
            Err(err) => {
                if let Some(index) = self.pages.remove(&err.id()) {
                    error!(page = index, error = %err, "page unit aborted");
                    aggregate.push_failed(index);
                }
            }
        }
    }
}
