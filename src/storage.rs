//! Durable store for the zipcode registry, epochs and assignments
//!
//! Single SQLite database behind a mutex. Every logical mutation (epoch
//! creation with its assignment snapshot and registry history update, status
//! flips, archive sweeps) runs in one transaction so a crash cannot leave a
//! half-written epoch or a unit marked recently-assigned without a matching
//! assignment row.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Market tier of a zipcode, premium markets weigh heaviest in selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketTier {
    Premium,
    Standard,
    Emerging,
}

impl MarketTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketTier::Premium => "premium",
            MarketTier::Standard => "standard",
            MarketTier::Emerging => "emerging",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "premium" => Some(MarketTier::Premium),
            "standard" => Some(MarketTier::Standard),
            "emerging" => Some(MarketTier::Emerging),
            _ => None,
        }
    }
}

/// Epoch lifecycle status, one-way progression only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochStatus {
    Pending,
    Active,
    Completed,
    Archived,
}

impl EpochStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpochStatus::Pending => "pending",
            EpochStatus::Active => "active",
            EpochStatus::Completed => "completed",
            EpochStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EpochStatus::Pending),
            "active" => Some(EpochStatus::Active),
            "completed" => Some(EpochStatus::Completed),
            "archived" => Some(EpochStatus::Archived),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            EpochStatus::Pending => 0,
            EpochStatus::Active => 1,
            EpochStatus::Completed => 2,
            EpochStatus::Archived => 3,
        }
    }

    /// Statuses only ever move forward
    pub fn can_transition_to(&self, next: EpochStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Master record for one zipcode with market data and selection history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipcodeUnit {
    pub zipcode: String,
    pub state: String,
    pub city: String,
    pub county: Option<String>,
    pub geographic_region: Option<String>,
    pub population: Option<u32>,
    pub median_home_value: Option<u32>,
    pub expected_listings: u32,
    pub market_tier: MarketTier,
    pub last_assigned: Option<DateTime<Utc>>,
    pub assignment_count: u32,
    pub base_selection_weight: f64,
    pub data_updated_at: Option<DateTime<Utc>>,
    pub data_source: Option<String>,
    pub data_quality_score: Option<f64>,
    pub is_active: bool,
    pub is_honeypot: bool,
}

impl ZipcodeUnit {
    /// Minimal unit with defaults matching a freshly loaded record
    pub fn new(
        zipcode: &str,
        state: &str,
        city: &str,
        expected_listings: u32,
        market_tier: MarketTier,
    ) -> Self {
        Self {
            zipcode: zipcode.to_string(),
            state: state.to_string(),
            city: city.to_string(),
            county: None,
            geographic_region: None,
            population: None,
            median_home_value: None,
            expected_listings,
            market_tier,
            last_assigned: None,
            assignment_count: 0,
            base_selection_weight: 1.0,
            data_updated_at: None,
            data_source: None,
            data_quality_score: None,
            is_active: true,
            is_honeypot: false,
        }
    }
}

/// A 4-hour assignment cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub nonce: String,
    pub target_listings: u32,
    pub tolerance_percent: u32,
    pub status: EpochStatus,
    pub selection_seed: i64,
    pub algorithm_version: String,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of one zipcode's selection into one epoch, immutable once written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochAssignment {
    pub epoch_id: String,
    pub zipcode: String,
    pub expected_listings: u32,
    pub state: String,
    pub city: String,
    pub county: Option<String>,
    pub market_tier: MarketTier,
    pub selection_weight: f64,
    pub geographic_region: Option<String>,
    pub is_honeypot: bool,
}

/// Advisory miner progress report, recorded after nonce validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub id: String,
    pub epoch_id: String,
    pub miner_hotkey: String,
    pub listings_scraped: u32,
    pub zipcodes_completed: u32,
    pub reported_at: DateTime<Utc>,
}

/// Per-state slice of the registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDistribution {
    pub state: String,
    pub zipcode_count: u32,
    pub total_expected_listings: u64,
}

/// Per-tier slice of the registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDistribution {
    pub market_tier: String,
    pub zipcode_count: u32,
    pub avg_expected_listings: f64,
}

/// Registry availability and distribution summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipcodeStatistics {
    pub total_zipcodes: u32,
    pub active_zipcodes: u32,
    pub eligible_zipcodes: u32,
    pub state_distribution: Vec<StateDistribution>,
    pub tier_distribution: Vec<TierDistribution>,
}

/// Criteria for [`AssignmentStore::list_eligible`]
#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    pub min_listings: u32,
    pub max_listings: u32,
    pub cooldown: Duration,
    pub states: Vec<String>,
}

pub struct AssignmentStore {
    conn: Mutex<Connection>,
}

impl AssignmentStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS zipcodes (
                zipcode TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                city TEXT NOT NULL,
                county TEXT,
                geographic_region TEXT,
                population INTEGER,
                median_home_value INTEGER,
                expected_listings INTEGER NOT NULL CHECK (expected_listings > 0),
                market_tier TEXT NOT NULL,
                last_assigned TEXT,
                assignment_count INTEGER NOT NULL DEFAULT 0,
                base_selection_weight REAL NOT NULL DEFAULT 1.0,
                data_updated_at TEXT,
                data_source TEXT,
                data_quality_score REAL,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_honeypot INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_zipcodes_state ON zipcodes (state);
            CREATE INDEX IF NOT EXISTS ix_zipcodes_last_assigned ON zipcodes (last_assigned);
            CREATE INDEX IF NOT EXISTS ix_zipcodes_is_active ON zipcodes (is_active);
            CREATE INDEX IF NOT EXISTS ix_zipcodes_expected_listings ON zipcodes (expected_listings);

            CREATE TABLE IF NOT EXISTS epochs (
                id TEXT PRIMARY KEY,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                nonce TEXT NOT NULL UNIQUE,
                target_listings INTEGER NOT NULL,
                tolerance_percent INTEGER NOT NULL DEFAULT 10,
                status TEXT NOT NULL DEFAULT 'pending',
                selection_seed INTEGER NOT NULL,
                algorithm_version TEXT NOT NULL DEFAULT 'v1.0',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_epochs_start_time ON epochs (start_time);
            CREATE INDEX IF NOT EXISTS ix_epochs_status ON epochs (status);

            CREATE TABLE IF NOT EXISTS epoch_assignments (
                epoch_id TEXT NOT NULL REFERENCES epochs (id) ON DELETE CASCADE,
                zipcode TEXT NOT NULL,
                expected_listings INTEGER NOT NULL,
                state TEXT NOT NULL,
                city TEXT NOT NULL,
                county TEXT,
                market_tier TEXT NOT NULL,
                selection_weight REAL NOT NULL,
                geographic_region TEXT,
                is_honeypot INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (epoch_id, zipcode)
            );
            CREATE INDEX IF NOT EXISTS ix_epoch_assignments_zipcode ON epoch_assignments (zipcode);

            CREATE TABLE IF NOT EXISTS status_reports (
                id TEXT PRIMARY KEY,
                epoch_id TEXT NOT NULL,
                miner_hotkey TEXT NOT NULL,
                listings_scraped INTEGER NOT NULL DEFAULT 0,
                zipcodes_completed INTEGER NOT NULL DEFAULT 0,
                reported_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_status_reports_epoch ON status_reports (epoch_id);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // ZIPCODE REGISTRY
    // ========================================================================

    /// Insert or update a unit (out-of-band data loader entry point)
    pub fn upsert_unit(&self, unit: &ZipcodeUnit) -> Result<()> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO zipcodes (
                zipcode, state, city, county, geographic_region, population,
                median_home_value, expected_listings, market_tier, last_assigned,
                assignment_count, base_selection_weight, data_updated_at,
                data_source, data_quality_score, is_active, is_honeypot,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)
            ON CONFLICT (zipcode) DO UPDATE SET
                state = excluded.state,
                city = excluded.city,
                county = excluded.county,
                geographic_region = excluded.geographic_region,
                population = excluded.population,
                median_home_value = excluded.median_home_value,
                expected_listings = excluded.expected_listings,
                market_tier = excluded.market_tier,
                base_selection_weight = excluded.base_selection_weight,
                data_updated_at = excluded.data_updated_at,
                data_source = excluded.data_source,
                data_quality_score = excluded.data_quality_score,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
            params![
                unit.zipcode,
                unit.state,
                unit.city,
                unit.county,
                unit.geographic_region,
                unit.population,
                unit.median_home_value,
                unit.expected_listings,
                unit.market_tier.as_str(),
                unit.last_assigned.map(|t| t.to_rfc3339()),
                unit.assignment_count,
                unit.base_selection_weight,
                unit.data_updated_at.map(|t| t.to_rfc3339()),
                unit.data_source,
                unit.data_quality_score,
                unit.is_active,
                unit.is_honeypot,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_unit(&self, zipcode: &str) -> Result<Option<ZipcodeUnit>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM zipcodes WHERE zipcode = ?1",
            UNIT_COLUMNS
        ))?;
        let unit = stmt.query_row(params![zipcode], row_to_unit).ok();
        Ok(unit)
    }

    /// Units are never deleted, only deactivated
    pub fn deactivate_unit(&self, zipcode: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE zipcodes SET is_active = 0, updated_at = ?2 WHERE zipcode = ?1",
            params![zipcode, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Eligible units for selection: active, listings within the configured
    /// band, outside the cooldown window (or never assigned), state in the
    /// priority list.
    ///
    /// Fails soft: an empty pool is a valid degenerate outcome, so query
    /// failures log and return an empty set instead of erroring upward.
    pub fn list_eligible(&self, now: DateTime<Utc>, filter: &EligibilityFilter) -> Vec<ZipcodeUnit> {
        if filter.states.is_empty() {
            warn!("Eligibility filter has no states configured, returning empty pool");
            return Vec::new();
        }

        match self.query_eligible(now, filter) {
            Ok(units) => {
                info!("Found {} eligible zipcodes for selection", units.len());
                units
            }
            Err(e) => {
                warn!("Eligibility query failed, returning empty pool: {}", e);
                Vec::new()
            }
        }
    }

    fn query_eligible(
        &self,
        now: DateTime<Utc>,
        filter: &EligibilityFilter,
    ) -> Result<Vec<ZipcodeUnit>> {
        let conn = self.conn.lock();
        let cutoff = (now - filter.cooldown).to_rfc3339();

        let placeholders = vec!["?"; filter.states.len()].join(",");
        let sql = format!(
            "SELECT {} FROM zipcodes
             WHERE is_active = 1
               AND expected_listings >= ?
               AND expected_listings <= ?
               AND (last_assigned IS NULL OR last_assigned < ?)
               AND state IN ({})",
            UNIT_COLUMNS, placeholders
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut sql_params: Vec<&dyn rusqlite::ToSql> =
            vec![&filter.min_listings, &filter.max_listings, &cutoff];
        for state in &filter.states {
            sql_params.push(state);
        }

        let units = stmt
            .query_map(sql_params.as_slice(), row_to_unit)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(units)
    }

    /// Update a unit's selection history: `last_assigned` moves forward,
    /// `assignment_count` only increases.
    pub fn record_selection(&self, zipcode: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE zipcodes
             SET last_assigned = ?2,
                 assignment_count = assignment_count + 1,
                 updated_at = ?2
             WHERE zipcode = ?1",
            params![zipcode, at.to_rfc3339()],
        )?;
        Ok(())
    }

    // ========================================================================
    // EPOCHS AND ASSIGNMENTS
    // ========================================================================

    /// Persist an epoch with its full assignment snapshot and the registry
    /// history update in one transaction.
    pub fn insert_epoch(&self, epoch: &Epoch, assignments: &[EpochAssignment]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO epochs (
                id, start_time, end_time, nonce, target_listings,
                tolerance_percent, status, selection_seed, algorithm_version, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                epoch.id,
                epoch.start_time.to_rfc3339(),
                epoch.end_time.to_rfc3339(),
                epoch.nonce,
                epoch.target_listings,
                epoch.tolerance_percent,
                epoch.status.as_str(),
                epoch.selection_seed,
                epoch.algorithm_version,
                epoch.created_at.to_rfc3339(),
            ],
        )?;

        let selected_at = epoch.created_at.to_rfc3339();
        for assignment in assignments {
            tx.execute(
                r#"
                INSERT INTO epoch_assignments (
                    epoch_id, zipcode, expected_listings, state, city, county,
                    market_tier, selection_weight, geographic_region, is_honeypot
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    assignment.epoch_id,
                    assignment.zipcode,
                    assignment.expected_listings,
                    assignment.state,
                    assignment.city,
                    assignment.county,
                    assignment.market_tier.as_str(),
                    assignment.selection_weight,
                    assignment.geographic_region,
                    assignment.is_honeypot,
                ],
            )?;

            tx.execute(
                "UPDATE zipcodes
                 SET last_assigned = ?2,
                     assignment_count = assignment_count + 1,
                     is_honeypot = ?3,
                     updated_at = ?2
                 WHERE zipcode = ?1",
                params![assignment.zipcode, selected_at, assignment.is_honeypot],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_epoch(&self, epoch_id: &str) -> Result<Option<Epoch>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM epochs WHERE id = ?1",
            EPOCH_COLUMNS
        ))?;
        let epoch = stmt.query_row(params![epoch_id], row_to_epoch).ok();
        Ok(epoch)
    }

    pub fn get_assignments(&self, epoch_id: &str) -> Result<Vec<EpochAssignment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT epoch_id, zipcode, expected_listings, state, city, county,
                    market_tier, selection_weight, geographic_region, is_honeypot
             FROM epoch_assignments WHERE epoch_id = ?1 ORDER BY zipcode",
        )?;
        let assignments = stmt
            .query_map(params![epoch_id], |row| {
                Ok(EpochAssignment {
                    epoch_id: row.get(0)?,
                    zipcode: row.get(1)?,
                    expected_listings: row.get(2)?,
                    state: row.get(3)?,
                    city: row.get(4)?,
                    county: row.get(5)?,
                    market_tier: MarketTier::parse(&row.get::<_, String>(6)?)
                        .unwrap_or(MarketTier::Standard),
                    selection_weight: row.get(7)?,
                    geographic_region: row.get(8)?,
                    is_honeypot: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(assignments)
    }

    pub fn recent_epochs(&self, limit: u32) -> Result<Vec<Epoch>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM epochs ORDER BY start_time DESC LIMIT ?1",
            EPOCH_COLUMNS
        ))?;
        let epochs = stmt
            .query_map(params![limit], row_to_epoch)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(epochs)
    }

    /// One-way status flip, guarded so stale callers cannot move a status
    /// backward. Returns whether a row changed.
    pub fn update_epoch_status(
        &self,
        epoch_id: &str,
        from: EpochStatus,
        to: EpochStatus,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            warn!(
                "Refusing backward epoch transition {} -> {} for {}",
                from.as_str(),
                to.as_str(),
                epoch_id
            );
            return Ok(false);
        }
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE epochs SET status = ?3 WHERE id = ?1 AND status = ?2",
            params![epoch_id, from.as_str(), to.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Complete every active epoch whose window has closed. Returns the
    /// number completed.
    pub fn complete_ended(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE epochs SET status = 'completed'
             WHERE status = 'active' AND end_time <= ?1",
            params![now.to_rfc3339()],
        )?;
        Ok(changed)
    }

    /// Archive all epochs that ended before the cutoff, regardless of
    /// whether they were completed first. Returns the number archived.
    pub fn archive_ended_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE epochs SET status = 'archived'
             WHERE end_time < ?1 AND status != 'archived'",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(changed)
    }

    /// Remove an epoch and (via cascade) its assignment snapshot
    pub fn delete_epoch(&self, epoch_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM epochs WHERE id = ?1", params![epoch_id])?;
        Ok(changed > 0)
    }

    // ========================================================================
    // STATUS REPORTS
    // ========================================================================

    pub fn insert_report(&self, report: &StatusReport) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO status_reports
                (id, epoch_id, miner_hotkey, listings_scraped, zipcodes_completed, reported_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.id,
                report.epoch_id,
                report.miner_hotkey,
                report.listings_scraped,
                report.zipcodes_completed,
                report.reported_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn reports_for_epoch(&self, epoch_id: &str) -> Result<Vec<StatusReport>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, epoch_id, miner_hotkey, listings_scraped, zipcodes_completed, reported_at
             FROM status_reports WHERE epoch_id = ?1 ORDER BY reported_at",
        )?;
        let reports = stmt
            .query_map(params![epoch_id], |row| {
                Ok(StatusReport {
                    id: row.get(0)?,
                    epoch_id: row.get(1)?,
                    miner_hotkey: row.get(2)?,
                    listings_scraped: row.get(3)?,
                    zipcodes_completed: row.get(4)?,
                    reported_at: parse_dt(&row.get::<_, String>(5)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(reports)
    }

    // ========================================================================
    // STATISTICS
    // ========================================================================

    pub fn statistics(
        &self,
        now: DateTime<Utc>,
        filter: &EligibilityFilter,
    ) -> Result<ZipcodeStatistics> {
        let eligible = self.list_eligible(now, filter).len() as u32;
        let conn = self.conn.lock();

        let total: u32 = conn.query_row("SELECT COUNT(*) FROM zipcodes", [], |r| r.get(0))?;
        let active: u32 = conn.query_row(
            "SELECT COUNT(*) FROM zipcodes WHERE is_active = 1",
            [],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*), COALESCE(SUM(expected_listings), 0)
             FROM zipcodes WHERE is_active = 1 GROUP BY state ORDER BY state",
        )?;
        let state_distribution = stmt
            .query_map([], |row| {
                Ok(StateDistribution {
                    state: row.get(0)?,
                    zipcode_count: row.get(1)?,
                    total_expected_listings: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT market_tier, COUNT(*), COALESCE(AVG(expected_listings), 0)
             FROM zipcodes WHERE is_active = 1 GROUP BY market_tier ORDER BY market_tier",
        )?;
        let tier_distribution = stmt
            .query_map([], |row| {
                Ok(TierDistribution {
                    market_tier: row.get(0)?,
                    zipcode_count: row.get(1)?,
                    avg_expected_listings: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ZipcodeStatistics {
            total_zipcodes: total,
            active_zipcodes: active,
            eligible_zipcodes: eligible,
            state_distribution,
            tier_distribution,
        })
    }
}

const UNIT_COLUMNS: &str = "zipcode, state, city, county, geographic_region, population, \
     median_home_value, expected_listings, market_tier, last_assigned, \
     assignment_count, base_selection_weight, data_updated_at, data_source, \
     data_quality_score, is_active, is_honeypot";

const EPOCH_COLUMNS: &str = "id, start_time, end_time, nonce, target_listings, \
     tolerance_percent, status, selection_seed, algorithm_version, created_at";

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_unit(row: &Row<'_>) -> rusqlite::Result<ZipcodeUnit> {
    Ok(ZipcodeUnit {
        zipcode: row.get(0)?,
        state: row.get(1)?,
        city: row.get(2)?,
        county: row.get(3)?,
        geographic_region: row.get(4)?,
        population: row.get(5)?,
        median_home_value: row.get(6)?,
        expected_listings: row.get(7)?,
        market_tier: MarketTier::parse(&row.get::<_, String>(8)?).unwrap_or(MarketTier::Standard),
        last_assigned: row.get::<_, Option<String>>(9)?.map(|s| parse_dt(&s)),
        assignment_count: row.get(10)?,
        base_selection_weight: row.get(11)?,
        data_updated_at: row.get::<_, Option<String>>(12)?.map(|s| parse_dt(&s)),
        data_source: row.get(13)?,
        data_quality_score: row.get(14)?,
        is_active: row.get(15)?,
        is_honeypot: row.get(16)?,
    })
}

fn row_to_epoch(row: &Row<'_>) -> rusqlite::Result<Epoch> {
    Ok(Epoch {
        id: row.get(0)?,
        start_time: parse_dt(&row.get::<_, String>(1)?),
        end_time: parse_dt(&row.get::<_, String>(2)?),
        nonce: row.get(3)?,
        target_listings: row.get(4)?,
        tolerance_percent: row.get(5)?,
        status: EpochStatus::parse(&row.get::<_, String>(6)?).unwrap_or(EpochStatus::Pending),
        selection_seed: row.get(7)?,
        algorithm_version: row.get(8)?,
        created_at: parse_dt(&row.get::<_, String>(9)?),
    })
}
