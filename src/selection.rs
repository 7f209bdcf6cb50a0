//! Weighted zipcode selection with anti-gaming features
//!
//! Selection is deterministic per epoch: the rng is seeded from the epoch id,
//! the server secret and the current UTC date, so a run is reproducible for
//! the same epoch on the same day but unpredictable in advance without the
//! secret. The epoch nonce binds the secret to the selected set, which keeps
//! assignment contents unforgeable before publication.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::SelectionConfig;
use crate::storage::{
    AssignmentStore, EligibilityFilter, EpochAssignment, MarketTier, ZipcodeUnit,
};

type HmacSha256 = Hmac<Sha256>;

/// Weight floor so no eligible unit is ever fully excluded
const MIN_SELECTION_WEIGHT: f64 = 0.1;

/// Termination bound for the draw loop under degenerate pools
const MAX_DRAW_ATTEMPTS: u32 = 100;

/// Unknown states sort behind every configured priority
const DEFAULT_STATE_PRIORITY: u32 = 10;

/// One selected unit with the weight that won it selection
#[derive(Debug, Clone)]
pub struct SelectedUnit {
    pub unit: ZipcodeUnit,
    pub selection_weight: f64,
    pub is_honeypot: bool,
}

/// Result of one selection run
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub selected: Vec<SelectedUnit>,
    /// Summed expected listings across the whole selection, honeypot included
    pub total_expected: u32,
    /// The pool drained before the tolerance band was reached
    pub pool_exhausted: bool,
    /// Set when one state holds more than 70% of a selection larger than 3
    pub dominant_state: Option<String>,
}

pub struct SelectionEngine {
    config: SelectionConfig,
    secret: String,
    state_priorities: HashMap<String, u32>,
}

impl SelectionEngine {
    pub fn new(config: SelectionConfig, secret: impl Into<String>) -> Self {
        let state_priorities = config.parse_state_priorities();
        Self {
            config,
            secret: secret.into(),
            state_priorities,
        }
    }

    /// Eligibility criteria derived from the engine configuration
    pub fn eligibility_filter(&self) -> EligibilityFilter {
        let mut states: Vec<String> = self.state_priorities.keys().cloned().collect();
        states.sort_unstable();
        EligibilityFilter {
            min_listings: self.config.min_zipcode_listings,
            max_listings: self.config.max_zipcode_listings,
            cooldown: Duration::hours(self.config.cooldown_hours),
            states,
        }
    }

    /// Deterministic but unpredictable per-epoch seed
    pub fn epoch_seed(&self, epoch_id: &str, date: NaiveDate) -> u32 {
        let seed_string = format!("{}:{}:{}", epoch_id, self.secret, date.format("%Y-%m-%d"));
        let digest = Sha256::digest(seed_string.as_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Epoch nonce binding the secret to the selected set
    ///
    /// Unforgeable without the secret and unpredictable before the selection
    /// is known, which prevents scraping assignments in advance.
    pub fn epoch_nonce(&self, epoch_id: &str, selected_zipcodes: &[String]) -> String {
        let mut sorted = selected_zipcodes.to_vec();
        sorted.sort_unstable();
        let zipcode_hash = hex::encode(Sha256::digest(sorted.concat().as_bytes()));

        let nonce_input = format!("{}:{}:{}", epoch_id, self.secret, zipcode_hash);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(nonce_input.as_bytes());
        hex::encode(mac.finalize().into_bytes())[..16].to_string()
    }

    fn tier_weight(&self, tier: MarketTier) -> f64 {
        match tier {
            MarketTier::Premium => self.config.premium_weight,
            MarketTier::Standard => self.config.standard_weight,
            MarketTier::Emerging => self.config.emerging_weight,
        }
    }

    /// Linear ramp from 0.1 to 1.0 across the cooldown window; full weight
    /// when never assigned or past the window.
    fn cooldown_weight(&self, unit: &ZipcodeUnit, now: DateTime<Utc>) -> f64 {
        let Some(last_assigned) = unit.last_assigned else {
            return 1.0;
        };
        let cooldown_hours = self.config.cooldown_hours as f64;
        let hours_since = (now - last_assigned).num_seconds() as f64 / 3600.0;
        if hours_since < cooldown_hours {
            0.1 + 0.9 * hours_since / cooldown_hours
        } else {
            1.0
        }
    }

    /// Final selection weight combining capacity, tier, state priority,
    /// cooldown decay and the operator-tuned base multiplier.
    pub fn selection_weight(&self, unit: &ZipcodeUnit, now: DateTime<Utc>) -> f64 {
        let state_priority = self
            .state_priorities
            .get(&unit.state)
            .copied()
            .unwrap_or(DEFAULT_STATE_PRIORITY);

        let weight = unit.expected_listings as f64
            * self.tier_weight(unit.market_tier)
            * (1.0 / state_priority as f64)
            * self.cooldown_weight(unit, now)
            * unit.base_selection_weight;

        weight.max(MIN_SELECTION_WEIGHT)
    }

    /// Select zipcodes for an epoch via seeded weighted draws without
    /// replacement, then inject a honeypot and run the diversity check.
    pub fn select_for_epoch(
        &self,
        store: &AssignmentStore,
        epoch_id: &str,
        target_listings: u32,
        now: DateTime<Utc>,
    ) -> SelectionOutcome {
        let seed = self.epoch_seed(epoch_id, now.date_naive());
        let mut rng = ChaCha8Rng::seed_from_u64(seed as u64);

        let mut pool = store.list_eligible(now, &self.eligibility_filter());
        // Fixed draw order regardless of storage iteration order
        pool.sort_by(|a, b| a.zipcode.cmp(&b.zipcode));
        let eligible = pool.clone();

        let tolerance = target_listings as f64 * self.config.tolerance_percent as f64 / 100.0;
        let min_target = (target_listings as f64 - tolerance) as u32;
        let max_target = (target_listings as f64 + tolerance) as u32;

        let mut selected: Vec<SelectedUnit> = Vec::new();
        let mut total_expected: u32 = 0;
        let mut attempts = 0;

        while total_expected < min_target && attempts < MAX_DRAW_ATTEMPTS && !pool.is_empty() {
            attempts += 1;

            // Weights rebuilt from the live pool on every draw
            let weights: Vec<f64> = pool
                .iter()
                .map(|unit| self.selection_weight(unit, now))
                .collect();
            let Ok(dist) = WeightedIndex::new(&weights) else {
                warn!("Degenerate weight vector for epoch {}, stopping draws", epoch_id);
                break;
            };

            let index = dist.sample(&mut rng);
            let unit = pool.remove(index);

            if total_expected + unit.expected_listings > max_target {
                // Taking this unit would overshoot the upper bound before the
                // band is reached; skip it and keep drawing from the rest.
                debug!(
                    "Skipping {} ({} listings would exceed {} cap)",
                    unit.zipcode, unit.expected_listings, max_target
                );
                continue;
            }

            total_expected += unit.expected_listings;
            let selection_weight = self.selection_weight(&unit, now);
            selected.push(SelectedUnit {
                unit,
                selection_weight,
                is_honeypot: false,
            });
        }

        let pool_exhausted = total_expected < min_target;
        if pool_exhausted {
            warn!(
                "Selection for epoch {} exhausted the pool at {} of {} target listings \
                 ({} units selected, {} draw attempts)",
                epoch_id,
                total_expected,
                target_listings,
                selected.len(),
                attempts
            );
        }

        self.inject_honeypot(&mut rng, &eligible, &mut selected, &mut total_expected, now);
        let dominant_state = self.check_geographic_diversity(&selected);

        info!(
            "Selected {} zipcodes for epoch {}: {} expected listings (target {}±{})",
            selected.len(),
            epoch_id,
            total_expected,
            target_listings,
            tolerance as u32
        );

        SelectionOutcome {
            selected,
            total_expected,
            pool_exhausted,
            dominant_state,
        }
    }

    /// Probabilistically add one low-capacity unit as a honeypot
    ///
    /// Candidates come from the eligible pool minus the selected set with no
    /// cooldown re-check; the external validation process uses honeypots to
    /// catch miners fabricating data for unassigned zipcodes.
    fn inject_honeypot(
        &self,
        rng: &mut ChaCha8Rng,
        eligible: &[ZipcodeUnit],
        selected: &mut Vec<SelectedUnit>,
        total_expected: &mut u32,
        now: DateTime<Utc>,
    ) {
        if rng.gen::<f64>() >= self.config.honeypot_probability {
            return;
        }

        let candidates: Vec<&ZipcodeUnit> = eligible
            .iter()
            .filter(|unit| {
                unit.expected_listings < self.config.honeypot_threshold
                    && !unit.is_honeypot
                    && !selected.iter().any(|s| s.unit.zipcode == unit.zipcode)
            })
            .collect();

        if candidates.is_empty() {
            return;
        }

        let honeypot = candidates[rng.gen_range(0..candidates.len())].clone();
        info!("Added honeypot zipcode {} to selection", honeypot.zipcode);
        *total_expected += honeypot.expected_listings;
        let selection_weight = self.selection_weight(&honeypot, now);
        selected.push(SelectedUnit {
            unit: honeypot,
            selection_weight,
            is_honeypot: true,
        });
    }

    /// Soft guard: log when one state dominates the selection. No rebalancing
    /// is performed, the flag is informational.
    fn check_geographic_diversity(&self, selected: &[SelectedUnit]) -> Option<String> {
        if selected.len() <= 3 {
            return None;
        }

        let mut state_counts: HashMap<&str, usize> = HashMap::new();
        for entry in selected {
            *state_counts.entry(entry.unit.state.as_str()).or_insert(0) += 1;
        }

        let (state, count) = state_counts.iter().max_by_key(|(_, count)| **count)?;
        if *count as f64 > selected.len() as f64 * 0.7 {
            warn!(
                "Geographic diversity adjustment needed - state {} has {}/{} zipcodes",
                state,
                count,
                selected.len()
            );
            return Some(state.to_string());
        }
        None
    }

    /// Denormalized assignment snapshot for persistence
    pub fn build_assignments(&self, epoch_id: &str, outcome: &SelectionOutcome) -> Vec<EpochAssignment> {
        outcome
            .selected
            .iter()
            .map(|entry| EpochAssignment {
                epoch_id: epoch_id.to_string(),
                zipcode: entry.unit.zipcode.clone(),
                expected_listings: entry.unit.expected_listings,
                state: entry.unit.state.clone(),
                city: entry.unit.city.clone(),
                county: entry.unit.county.clone(),
                market_tier: entry.unit.market_tier,
                selection_weight: entry.selection_weight,
                geographic_region: entry.unit.geographic_region.clone(),
                is_honeypot: entry.is_honeypot,
            })
            .collect()
    }
}
