//! Integration tests for the Zipcode Gateway
//!
//! These tests verify end-to-end functionality across the registry,
//! selection engine, epoch scheduler, authentication and rate limiting.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use zipcode_gateway::auth;
use zipcode_gateway::config::Config;
use zipcode_gateway::limits::{MemoryCounter, RateLimiter, Window};
use zipcode_gateway::selection::SelectionEngine;
use zipcode_gateway::storage::{AssignmentStore, MarketTier, ZipcodeUnit};
use zipcode_gateway::{current_epoch_start, next_epoch_start, EpochScheduler, EpochStatus};

// ============================================================================
// Test Helpers
// ============================================================================

fn unit(zipcode: &str, state: &str, listings: u32, tier: MarketTier) -> ZipcodeUnit {
    ZipcodeUnit::new(zipcode, state, "Testville", listings, tier)
}

/// Registry from the reference scenario: five units summing to 10000
fn scenario_store() -> Arc<AssignmentStore> {
    let store = Arc::new(AssignmentStore::in_memory().unwrap());
    for (zipcode, state, listings) in [
        ("19102", "PA", 3000),
        ("19103", "PA", 2500),
        ("08540", "NJ", 2000),
        ("08541", "NJ", 1500),
        ("10001", "NY", 1000),
    ] {
        store
            .upsert_unit(&unit(zipcode, state, listings, MarketTier::Standard))
            .unwrap();
    }
    store
}

fn scheduler_for(store: Arc<AssignmentStore>, target: u32) -> EpochScheduler {
    let mut selection = Config::default().selection;
    selection.honeypot_probability = 0.0;
    let engine = SelectionEngine::new(selection, "integration-secret");
    EpochScheduler::new(store, engine, Config::default().epochs, target, 10)
}

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 30, 15, 58, 0).unwrap()
}

// ============================================================================
// Epoch creation and selection
// ============================================================================

#[test]
fn test_selection_meets_target_band_end_to_end() {
    let store = scenario_store();
    let scheduler = scheduler_for(store.clone(), 10_000);

    let epoch = scheduler.ensure_current_exists(fixed_now()).unwrap();
    let assignments = store.get_assignments(&epoch.id).unwrap();

    let total: u32 = assignments
        .iter()
        .filter(|a| !a.is_honeypot)
        .map(|a| a.expected_listings)
        .sum();
    assert!(
        (9_000..=11_000).contains(&total),
        "assignment total {} outside the 10% band",
        total
    );

    // Snapshot rows carry the denormalized unit data
    for assignment in &assignments {
        let source = store.get_unit(&assignment.zipcode).unwrap().unwrap();
        assert_eq!(assignment.state, source.state);
        assert_eq!(assignment.expected_listings, source.expected_listings);
        assert!(assignment.selection_weight > 0.0);
    }
}

#[test]
fn test_selection_reproducible_across_identical_deployments() {
    let now = fixed_now();

    let run = || {
        let store = scenario_store();
        let scheduler = scheduler_for(store.clone(), 10_000);
        let epoch = scheduler.ensure_current_exists(now).unwrap();
        let mut zipcodes: Vec<String> = store
            .get_assignments(&epoch.id)
            .unwrap()
            .iter()
            .map(|a| a.zipcode.clone())
            .collect();
        zipcodes.sort();
        (zipcodes, epoch.nonce, epoch.selection_seed)
    };

    let (zipcodes_a, nonce_a, seed_a) = run();
    let (zipcodes_b, nonce_b, seed_b) = run();
    assert_eq!(zipcodes_a, zipcodes_b);
    assert_eq!(nonce_a, nonce_b);
    assert_eq!(seed_a, seed_b);

    // A different secret yields a different nonce for the same epoch
    let other_engine = SelectionEngine::new(Config::default().selection, "other-secret");
    assert_ne!(nonce_a, other_engine.epoch_nonce("2024-09-30-12:00", &zipcodes_a));
}

#[test]
fn test_assigned_units_cool_down_for_the_next_epoch() {
    let store = scenario_store();
    let scheduler = scheduler_for(store.clone(), 10_000);
    let now = fixed_now();

    let first = scheduler.ensure_current_exists(now).unwrap();
    let assigned: Vec<String> = store
        .get_assignments(&first.id)
        .unwrap()
        .iter()
        .map(|a| a.zipcode.clone())
        .collect();
    assert!(!assigned.is_empty());

    // Four hours later every previously assigned unit is still cooling down
    let later = now + Duration::hours(4);
    let second = scheduler.ensure_current_exists(later).unwrap();
    assert_ne!(first.id, second.id);
    let second_assignments = store.get_assignments(&second.id).unwrap();
    for assignment in &second_assignments {
        assert!(
            !assigned.contains(&assignment.zipcode),
            "unit {} reassigned inside its cooldown window",
            assignment.zipcode
        );
    }

    // Past the 24h window the units become eligible again
    let next_day = now + Duration::hours(26);
    let third = scheduler.ensure_current_exists(next_day).unwrap();
    assert!(!store.get_assignments(&third.id).unwrap().is_empty());
}

// ============================================================================
// Epoch timeline
// ============================================================================

#[test]
fn test_boundary_reference_times() {
    let now = fixed_now();
    assert_eq!(
        next_epoch_start(now),
        Utc.with_ymd_and_hms(2024, 9, 30, 16, 0, 0).unwrap()
    );
    assert_eq!(
        current_epoch_start(now),
        Utc.with_ymd_and_hms(2024, 9, 30, 12, 0, 0).unwrap()
    );
}

#[test]
fn test_supervised_day_keeps_statuses_monotonic() {
    let store = scenario_store();
    let scheduler = scheduler_for(store.clone(), 2_000);
    let mut archive_day = None;

    // Tick once a minute for six hours of simulated wall clock
    let start = Utc.with_ymd_and_hms(2024, 9, 30, 11, 0, 0).unwrap();
    let mut observed: Vec<(String, EpochStatus)> = Vec::new();
    for minute in (0..360).step_by(10) {
        let now = start + Duration::minutes(minute);
        scheduler.tick(now, &mut archive_day).unwrap();
        for epoch in store.recent_epochs(10).unwrap() {
            if let Some((_, previous)) = observed.iter().rev().find(|(id, _)| *id == epoch.id) {
                assert!(
                    *previous == epoch.status || previous.can_transition_to(epoch.status),
                    "epoch {} moved backward: {:?} -> {:?}",
                    epoch.id,
                    previous,
                    epoch.status
                );
            }
            observed.push((epoch.id.clone(), epoch.status));
        }
    }

    // The 08:00 epoch must have completed once 12:00 passed
    let morning = store.get_epoch("2024-09-30-08:00").unwrap().unwrap();
    assert_eq!(morning.status, EpochStatus::Completed);
    // The epoch covering the final tick is active
    let current = store.get_epoch("2024-09-30-16:00").unwrap().unwrap();
    assert_eq!(current.status, EpochStatus::Active);
}

#[test]
fn test_pre_generated_epoch_activates_at_boundary() {
    let store = scenario_store();
    let scheduler = scheduler_for(store.clone(), 2_000);
    let mut archive_day = None;

    // 15:58 tick pre-generates the 16:00 epoch in pending state
    scheduler.tick(fixed_now(), &mut archive_day).unwrap();
    let pending = store.get_epoch("2024-09-30-16:00").unwrap().unwrap();
    assert_eq!(pending.status, EpochStatus::Pending);

    // Crossing the boundary flips it active without recreating it
    let after = Utc.with_ymd_and_hms(2024, 9, 30, 16, 0, 30).unwrap();
    scheduler.tick(after, &mut archive_day).unwrap();
    let active = store.get_epoch("2024-09-30-16:00").unwrap().unwrap();
    assert_eq!(active.status, EpochStatus::Active);
    assert_eq!(active.nonce, pending.nonce);
}

// ============================================================================
// Authentication and rate limiting
// ============================================================================

#[test]
fn test_stale_timestamp_rejected_independent_of_signature() {
    use sp_core::crypto::Ss58Codec;
    use sp_core::Pair;

    let (pair, _) = sp_core::sr25519::Pair::generate();
    let hotkey = pair.public().to_ss58check();

    let now = Utc::now().timestamp();
    let stale = now - 600;
    let commitment = auth::assignment_commitment(&hotkey, stale);
    let signature = hex::encode(pair.sign(commitment.as_bytes()));

    // The signature itself is perfectly valid
    assert!(auth::verify_signature(&hotkey, &commitment, &signature));
    // ... but the timestamp alone fails the freshness window
    assert!(!auth::is_timestamp_fresh(stale, now));
}

#[tokio::test]
async fn test_limit_violation_uses_rate_limit_taxonomy() {
    let mut config = Config::default().limits;
    config.assignment_per_minute = 20;
    let limiter = RateLimiter::new(Arc::new(MemoryCounter::new()), config);
    let now = fixed_now();

    for _ in 0..20 {
        limiter
            .check_window("miner-1", "assign", 20, Window::Minute, now)
            .await
            .unwrap();
    }
    let rejection = limiter
        .check_window("miner-1", "assign", 20, Window::Minute, now)
        .await
        .unwrap_err();
    assert_eq!(rejection.code(), "rate_limited");
}
