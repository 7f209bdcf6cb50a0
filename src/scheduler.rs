//! Epoch timeline and background supervision
//!
//! Epochs start at every 4th hour of the UTC day (00:00, 04:00, 08:00,
//! 12:00, 16:00, 20:00). Transitions are driven purely by comparing the wall
//! clock against the stored start/end times; nothing can short-circuit a
//! transition, and a status never moves backward.
//!
//! Epoch creation is conditionally idempotent (existence check before
//! creation) but not fenced against a second concurrent creator. Deployments
//! running more than one scheduler instance need an external mutual-exclusion
//! mechanism keyed by the candidate epoch id.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::EpochConfig;
use crate::selection::SelectionEngine;
use crate::storage::{AssignmentStore, Epoch, EpochStatus};

/// Fixed daily epoch boundaries (UTC hours)
pub const EPOCH_START_HOURS: [u32; 6] = [0, 4, 8, 12, 16, 20];

const ALGORITHM_VERSION: &str = "v1.0";

/// Epoch id is a deterministic function of its start time
pub fn epoch_id_for(start_time: DateTime<Utc>) -> String {
    start_time.format("%Y-%m-%d-%H:%M").to_string()
}

fn at_hour(day: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    day.date_naive()
        .and_hms_opt(hour, 0, 0)
        .expect("boundary hours are valid")
        .and_utc()
}

/// Latest boundary at or before `now`, wrapping to the previous day's last
/// boundary when `now` precedes the first boundary of its day.
pub fn current_epoch_start(now: DateTime<Utc>) -> DateTime<Utc> {
    for hour in EPOCH_START_HOURS.iter().rev() {
        if *hour <= now.hour() {
            return at_hour(now, *hour);
        }
    }
    at_hour(now - Duration::days(1), EPOCH_START_HOURS[5])
}

/// Next boundary strictly after `now`
pub fn next_epoch_start(now: DateTime<Utc>) -> DateTime<Utc> {
    for hour in EPOCH_START_HOURS.iter() {
        if *hour > now.hour() {
            return at_hour(now, *hour);
        }
    }
    at_hour(now + Duration::days(1), EPOCH_START_HOURS[0])
}

/// Monitoring summary exposed through /stats
#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub id: String,
    pub status: EpochStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub assignments_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSummary {
    pub current_time: DateTime<Utc>,
    pub current_epoch: Option<EpochSummary>,
    pub next_epoch_start: DateTime<Utc>,
    pub seconds_until_next: i64,
    pub recent_epochs: Vec<EpochSummary>,
}

/// Creates, activates, completes and archives epochs on the fixed timeline
pub struct EpochScheduler {
    store: Arc<AssignmentStore>,
    engine: SelectionEngine,
    config: EpochConfig,
    target_listings: u32,
    tolerance_percent: u32,
}

impl EpochScheduler {
    pub fn new(
        store: Arc<AssignmentStore>,
        engine: SelectionEngine,
        config: EpochConfig,
        target_listings: u32,
        tolerance_percent: u32,
    ) -> Self {
        Self {
            store,
            engine,
            config,
            target_listings,
            tolerance_percent,
        }
    }

    pub fn epoch_duration(&self) -> Duration {
        Duration::hours(self.config.duration_hours)
    }

    /// Eligibility criteria the selection engine applies, for statistics
    pub fn eligibility_filter(&self) -> crate::storage::EligibilityFilter {
        self.engine.eligibility_filter()
    }

    /// Create an epoch with its selection snapshot; returns the existing
    /// record when the id is already present.
    pub fn create_epoch(&self, start_time: DateTime<Utc>, now: DateTime<Utc>) -> Result<Epoch> {
        let epoch_id = epoch_id_for(start_time);
        let end_time = start_time + self.epoch_duration();

        if let Some(existing) = self.store.get_epoch(&epoch_id)? {
            warn!("Epoch {} already exists", epoch_id);
            return Ok(existing);
        }

        let outcome = self
            .engine
            .select_for_epoch(&self.store, &epoch_id, self.target_listings, now);

        let zipcodes: Vec<String> = outcome
            .selected
            .iter()
            .map(|s| s.unit.zipcode.clone())
            .collect();
        let nonce = self.engine.epoch_nonce(&epoch_id, &zipcodes);
        let seed = self.engine.epoch_seed(&epoch_id, now.date_naive());

        let status = if start_time <= now && now < end_time {
            EpochStatus::Active
        } else {
            EpochStatus::Pending
        };

        let epoch = Epoch {
            id: epoch_id.clone(),
            start_time,
            end_time,
            nonce,
            target_listings: self.target_listings,
            tolerance_percent: self.tolerance_percent,
            status,
            selection_seed: seed as i64,
            algorithm_version: ALGORITHM_VERSION.to_string(),
            created_at: now,
        };
        let assignments = self.engine.build_assignments(&epoch_id, &outcome);

        self.store
            .insert_epoch(&epoch, &assignments)
            .with_context(|| format!("Failed to persist epoch {}", epoch_id))?;

        info!(
            "Created epoch {}: {} zipcodes, {} expected listings",
            epoch_id,
            assignments.len(),
            outcome.total_expected
        );
        Ok(epoch)
    }

    /// Idempotent: look up the epoch covering `now`, create it if absent
    pub fn ensure_current_exists(&self, now: DateTime<Utc>) -> Result<Epoch> {
        let current_start = current_epoch_start(now);
        let epoch_id = epoch_id_for(current_start);

        if let Some(epoch) = self.store.get_epoch(&epoch_id)? {
            return Ok(epoch);
        }
        self.create_epoch(current_start, now)
    }

    /// Pre-generate the next epoch once `now` is within the lead window
    /// before its boundary, so handoff at the boundary needs no work.
    pub fn prepare_next(&self, now: DateTime<Utc>) -> Result<Option<Epoch>> {
        let next_start = next_epoch_start(now);
        let lead = (next_start - now).num_seconds();
        if lead <= 0 || lead > self.config.prepare_lead_secs {
            return Ok(None);
        }

        let epoch_id = epoch_id_for(next_start);
        if let Some(existing) = self.store.get_epoch(&epoch_id)? {
            return Ok(Some(existing));
        }
        let epoch = self.create_epoch(next_start, now)?;
        info!("Pre-generated next epoch {}", epoch.id);
        Ok(Some(epoch))
    }

    /// Activate the current epoch once its start boundary has passed
    pub fn activate_due(&self, now: DateTime<Utc>) -> Result<()> {
        let epoch_id = epoch_id_for(current_epoch_start(now));
        if let Some(epoch) = self.store.get_epoch(&epoch_id)? {
            if epoch.status == EpochStatus::Pending && now >= epoch.start_time {
                if self
                    .store
                    .update_epoch_status(&epoch.id, EpochStatus::Pending, EpochStatus::Active)?
                {
                    info!("Activated epoch {}", epoch.id);
                }
            }
        }
        Ok(())
    }

    /// Complete every active epoch whose end boundary has passed
    pub fn complete_due(&self, now: DateTime<Utc>) -> Result<()> {
        let completed = self.store.complete_ended(now)?;
        if completed > 0 {
            info!("Completed {} ended epoch(s)", completed);
        }
        Ok(())
    }

    /// Archive epochs that ended before the retention cutoff
    pub fn archive_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::days(self.config.retention_days);
        let archived = self.store.archive_ended_before(cutoff)?;
        if archived > 0 {
            info!("Archived {} old epochs", archived);
        }
        Ok(archived)
    }

    /// Monitoring snapshot of the epoch timeline
    pub fn status_summary(&self, now: DateTime<Utc>) -> Result<SchedulerSummary> {
        let current_id = epoch_id_for(current_epoch_start(now));
        let current_epoch = match self.store.get_epoch(&current_id)? {
            Some(epoch) => Some(self.summarize(&epoch)?),
            None => None,
        };

        let recent_epochs = self
            .store
            .recent_epochs(5)?
            .iter()
            .map(|e| self.summarize(e))
            .collect::<Result<Vec<_>>>()?;

        let next_start = next_epoch_start(now);
        Ok(SchedulerSummary {
            current_time: now,
            current_epoch,
            next_epoch_start: next_start,
            seconds_until_next: (next_start - now).num_seconds(),
            recent_epochs,
        })
    }

    fn summarize(&self, epoch: &Epoch) -> Result<EpochSummary> {
        let assignments = self.store.get_assignments(&epoch.id)?;
        Ok(EpochSummary {
            id: epoch.id.clone(),
            status: epoch.status,
            start_time: epoch.start_time,
            end_time: epoch.end_time,
            assignments_count: assignments.len(),
        })
    }

    /// One supervisor pass. Failures bubble to the caller, which logs them
    /// without terminating the loop.
    pub fn tick(&self, now: DateTime<Utc>, last_archive_day: &mut Option<NaiveDate>) -> Result<()> {
        self.ensure_current_exists(now)?;
        self.activate_due(now)?;
        self.complete_due(now)?;
        self.prepare_next(now)?;

        // Daily archive sweep at a fixed low-traffic hour
        let today = now.date_naive();
        if now.hour() == self.config.archive_hour && *last_archive_day != Some(today) {
            self.archive_expired(now)?;
            *last_archive_day = Some(today);
        }
        Ok(())
    }

    /// Background supervisor loop: ticks every `tick_secs`, survives
    /// individual tick failures, finishes the in-flight tick on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting epoch supervisor (tick every {}s)",
            self.config.tick_secs
        );
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.config.tick_secs));
        let mut last_archive_day: Option<NaiveDate> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now(), &mut last_archive_day) {
                        error!("Epoch supervisor tick failed: {:#}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Epoch supervisor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::{MarketTier, ZipcodeUnit};
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 30, 15, 58, 0).unwrap()
    }

    fn test_scheduler(store: Arc<AssignmentStore>) -> EpochScheduler {
        let mut selection = Config::default().selection;
        selection.honeypot_probability = 0.0;
        let engine = SelectionEngine::new(selection, "test-secret");
        EpochScheduler::new(store, engine, Config::default().epochs, 2_000, 10)
    }

    fn seeded_store() -> Arc<AssignmentStore> {
        let store = Arc::new(AssignmentStore::in_memory().unwrap());
        for (zipcode, listings) in [("19102", 900), ("19103", 800), ("08540", 700), ("08541", 600)]
        {
            let state = if zipcode.starts_with('1') { "PA" } else { "NJ" };
            store
                .upsert_unit(&ZipcodeUnit::new(
                    zipcode,
                    state,
                    "Testville",
                    listings,
                    MarketTier::Standard,
                ))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_boundary_math() {
        let now = fixed_now();
        assert_eq!(
            current_epoch_start(now),
            Utc.with_ymd_and_hms(2024, 9, 30, 12, 0, 0).unwrap()
        );
        assert_eq!(
            next_epoch_start(now),
            Utc.with_ymd_and_hms(2024, 9, 30, 16, 0, 0).unwrap()
        );

        // Exactly on a boundary: current is that boundary, next is the one after
        let on_boundary = Utc.with_ymd_and_hms(2024, 9, 30, 16, 0, 0).unwrap();
        assert_eq!(current_epoch_start(on_boundary), on_boundary);
        assert_eq!(
            next_epoch_start(on_boundary),
            Utc.with_ymd_and_hms(2024, 9, 30, 20, 0, 0).unwrap()
        );

        // Late evening wraps the next boundary to the following day
        let late = Utc.with_ymd_and_hms(2024, 9, 30, 23, 30, 0).unwrap();
        assert_eq!(
            current_epoch_start(late),
            Utc.with_ymd_and_hms(2024, 9, 30, 20, 0, 0).unwrap()
        );
        assert_eq!(
            next_epoch_start(late),
            Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_epoch_id_format() {
        let start = Utc.with_ymd_and_hms(2024, 9, 30, 12, 0, 0).unwrap();
        assert_eq!(epoch_id_for(start), "2024-09-30-12:00");
    }

    #[test]
    fn test_created_epoch_invariants() {
        let scheduler = test_scheduler(seeded_store());
        let now = fixed_now();

        let epoch = scheduler.ensure_current_exists(now).unwrap();
        assert!(epoch.start_time < epoch.end_time);
        assert_eq!(epoch.end_time - epoch.start_time, Duration::hours(4));
        assert_eq!(epoch.id, epoch_id_for(epoch.start_time));
        // Created inside its own window: immediately active
        assert_eq!(epoch.status, EpochStatus::Active);
    }

    #[test]
    fn test_ensure_current_is_idempotent() {
        let store = seeded_store();
        let scheduler = test_scheduler(store.clone());
        let now = fixed_now();

        let first = scheduler.ensure_current_exists(now).unwrap();
        let second = scheduler.ensure_current_exists(now).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.nonce, second.nonce);

        // No duplicate assignment rows either
        let count_first = store.get_assignments(&first.id).unwrap().len();
        scheduler.ensure_current_exists(now).unwrap();
        assert_eq!(store.get_assignments(&first.id).unwrap().len(), count_first);
    }

    #[test]
    fn test_prepare_next_window() {
        let store = seeded_store();
        let scheduler = test_scheduler(store.clone());

        // Too early: an hour before the boundary, nothing is created
        let early = Utc.with_ymd_and_hms(2024, 9, 30, 15, 0, 0).unwrap();
        assert!(scheduler.prepare_next(early).unwrap().is_none());

        // Inside the 5-minute lead window
        let next = scheduler.prepare_next(fixed_now()).unwrap().unwrap();
        assert_eq!(next.id, "2024-09-30-16:00");
        assert_eq!(next.status, EpochStatus::Pending);

        // Idempotent when called again
        let again = scheduler.prepare_next(fixed_now()).unwrap().unwrap();
        assert_eq!(again.id, next.id);
        assert_eq!(again.nonce, next.nonce);
    }

    #[test]
    fn test_lifecycle_across_ticks() {
        let store = seeded_store();
        let scheduler = test_scheduler(store.clone());
        let mut archive_day = None;

        // Pre-created next epoch starts pending
        scheduler.prepare_next(fixed_now()).unwrap();
        let pending = store.get_epoch("2024-09-30-16:00").unwrap().unwrap();
        assert_eq!(pending.status, EpochStatus::Pending);

        // Boundary crossed: activation
        let after_start = Utc.with_ymd_and_hms(2024, 9, 30, 16, 0, 30).unwrap();
        scheduler.tick(after_start, &mut archive_day).unwrap();
        let active = store.get_epoch("2024-09-30-16:00").unwrap().unwrap();
        assert_eq!(active.status, EpochStatus::Active);

        // Window over: completion (next tick also creates the new current)
        let after_end = Utc.with_ymd_and_hms(2024, 9, 30, 20, 0, 30).unwrap();
        scheduler.tick(after_end, &mut archive_day).unwrap();
        let completed = store.get_epoch("2024-09-30-16:00").unwrap().unwrap();
        assert_eq!(completed.status, EpochStatus::Completed);

        // Further ticks never move the status backward
        scheduler.tick(after_end + Duration::minutes(1), &mut archive_day).unwrap();
        let still_completed = store.get_epoch("2024-09-30-16:00").unwrap().unwrap();
        assert_eq!(still_completed.status, EpochStatus::Completed);
    }

    #[test]
    fn test_archive_sweep_runs_once_per_day() {
        let store = seeded_store();
        let scheduler = test_scheduler(store.clone());

        // An epoch that ended well past the retention window
        let old_now = Utc.with_ymd_and_hms(2024, 9, 1, 12, 30, 0).unwrap();
        scheduler.ensure_current_exists(old_now).unwrap();
        store.complete_ended(old_now + Duration::hours(4)).unwrap();

        let mut archive_day = None;
        let archive_time = Utc.with_ymd_and_hms(2024, 9, 30, 1, 2, 0).unwrap();
        scheduler.tick(archive_time, &mut archive_day).unwrap();
        assert_eq!(archive_day, Some(archive_time.date_naive()));

        let archived = store.get_epoch("2024-09-01-12:00").unwrap().unwrap();
        assert_eq!(archived.status, EpochStatus::Archived);
    }

    #[test]
    fn test_empty_pool_still_creates_epoch() {
        // Degenerate registry: selection exhaustion is loud but not fatal
        let store = Arc::new(AssignmentStore::in_memory().unwrap());
        let scheduler = test_scheduler(store.clone());

        let epoch = scheduler.ensure_current_exists(fixed_now()).unwrap();
        assert!(store.get_assignments(&epoch.id).unwrap().is_empty());
    }

    #[test]
    fn test_status_summary() {
        let scheduler = test_scheduler(seeded_store());
        let now = fixed_now();
        scheduler.ensure_current_exists(now).unwrap();

        let summary = scheduler.status_summary(now).unwrap();
        let current = summary.current_epoch.unwrap();
        assert_eq!(current.id, "2024-09-30-12:00");
        assert!(current.assignments_count > 0);
        assert_eq!(summary.seconds_until_next, 120);
    }
}
