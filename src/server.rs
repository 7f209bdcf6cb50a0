//! Zipcode Gateway HTTP server
//!
//! Signature-gated read and credential surfaces for miners and validators.
//! Every authenticated endpoint applies, in order: rate limits (global daily
//! ceiling first, then per-caller), timestamp freshness, then chain-backed
//! signature and role checks. Component failures are translated into the
//! [`ApiError`] taxonomy at this boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth;
use crate::chain::{ChainOracle, MetagraphCache};
use crate::config::Config;
use crate::error::ApiError;
use crate::limits::{RateLimiter, Window};
use crate::s3::{ObjectStore, ReadOptions};
use crate::scheduler::{current_epoch_start, epoch_id_for, EpochScheduler};
use crate::storage::{AssignmentStore, Epoch, EpochAssignment, StatusReport};

/// Lightweight request counters for the healthcheck
#[derive(Default)]
pub struct Monitor {
    requests: AtomicU64,
    errors: AtomicU64,
}

impl Monitor {
    pub fn count_request(&self, error: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self, uptime_secs: u64) -> Value {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let uptime_hours = uptime_secs as f64 / 3600.0;
        json!({
            "uptime_hours": uptime_hours,
            "total_requests": requests,
            "total_errors": errors,
            "error_rate": if requests > 0 { errors as f64 / requests as f64 } else { 0.0 },
            "requests_per_hour": if uptime_secs > 0 { requests as f64 / uptime_hours } else { 0.0 },
        })
    }
}

pub struct AppState {
    pub store: Arc<AssignmentStore>,
    pub scheduler: Arc<EpochScheduler>,
    pub oracle: Arc<dyn ChainOracle>,
    pub limits: Arc<RateLimiter>,
    pub object_store: Arc<dyn ObjectStore>,
    pub metagraph: Option<Arc<MetagraphCache>>,
    pub config: Config,
    pub started_at: Instant,
    pub monitor: Monitor,
}

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AssignmentRequest {
    pub hotkey: String,
    pub timestamp: i64,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoricalEpochRequest {
    pub hotkey: String,
    pub timestamp: i64,
    pub signature: String,
    pub epoch_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusReportRequest {
    pub hotkey: String,
    pub timestamp: i64,
    pub signature: String,
    pub epoch_id: String,
    pub nonce: String,
    #[serde(default)]
    pub listings_scraped: u32,
    #[serde(default)]
    pub zipcodes_completed: u32,
}

#[derive(Debug, Deserialize)]
pub struct MinerAccessRequest {
    pub coldkey: String,
    pub hotkey: String,
    pub timestamp: i64,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidatorAccessRequest {
    pub hotkey: String,
    pub timestamp: i64,
    pub signature: String,
    #[serde(default)]
    pub miner_hotkey: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AssignmentEntry {
    pub zipcode: String,
    pub expected_listings: u32,
    pub state: String,
    pub city: String,
    pub county: Option<String>,
    pub market_tier: String,
    pub geographic_region: Option<String>,
    /// Only exposed on the validator surface
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_honeypot: Option<bool>,
}

impl AssignmentEntry {
    fn from_assignment(assignment: &EpochAssignment, for_validator: bool) -> Self {
        Self {
            zipcode: assignment.zipcode.clone(),
            expected_listings: assignment.expected_listings,
            state: assignment.state.clone(),
            city: assignment.city.clone(),
            county: assignment.county.clone(),
            market_tier: assignment.market_tier.as_str().to_string(),
            geographic_region: assignment.geographic_region.clone(),
            is_honeypot: for_validator.then_some(assignment.is_honeypot),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EpochSnapshot {
    pub epoch_id: String,
    pub start_time: chrono::DateTime<Utc>,
    pub end_time: chrono::DateTime<Utc>,
    pub nonce: String,
    pub target_listings: u32,
    pub tolerance_percent: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub zipcodes: Vec<AssignmentEntry>,
}

impl EpochSnapshot {
    fn build(epoch: &Epoch, assignments: &[EpochAssignment], for_validator: bool) -> Self {
        Self {
            epoch_id: epoch.id.clone(),
            start_time: epoch.start_time,
            end_time: epoch.end_time,
            nonce: epoch.nonce.clone(),
            target_listings: epoch.target_listings,
            tolerance_percent: epoch.tolerance_percent,
            status: for_validator.then(|| epoch.status.as_str().to_string()),
            zipcodes: assignments
                .iter()
                .map(|a| AssignmentEntry::from_assignment(a, for_validator))
                .collect(),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Current-assignment query (miner-facing)
async fn get_current_assignments(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AssignmentRequest>,
) -> Result<Json<EpochSnapshot>, ApiError> {
    let now = Utc::now();
    let limits = state.limits.config();
    state
        .limits
        .check_daily(&request.hotkey, limits.daily_per_miner, now)
        .await?;
    state
        .limits
        .check_window(
            &request.hotkey,
            "assign",
            limits.assignment_per_minute,
            Window::Minute,
            now,
        )
        .await?;

    if !auth::is_timestamp_fresh(request.timestamp, now.timestamp()) {
        return Err(ApiError::StaleTimestamp);
    }

    let commitment = auth::assignment_commitment(&request.hotkey, request.timestamp);
    if !state
        .oracle
        .verify_signature(&commitment, &request.signature, &request.hotkey)
        .await?
    {
        warn!("MINER SIGNATURE FAILED: {}", request.hotkey);
        return Err(ApiError::InvalidSignature);
    }

    let epoch_id = epoch_id_for(current_epoch_start(now));
    let epoch = state
        .store
        .get_epoch(&epoch_id)?
        .ok_or(ApiError::NoCurrentEpoch)?;
    let assignments = state.store.get_assignments(&epoch.id)?;

    Ok(Json(EpochSnapshot::build(&epoch, &assignments, false)))
}

/// Historical-epoch query (validator-facing), any epoch regardless of status
async fn get_epoch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HistoricalEpochRequest>,
) -> Result<Json<EpochSnapshot>, ApiError> {
    let now = Utc::now();
    let limits = state.limits.config();
    state
        .limits
        .check_daily(&request.hotkey, limits.daily_per_validator, now)
        .await?;
    state
        .limits
        .check_window(
            &request.hotkey,
            "epoch",
            limits.historical_per_hour,
            Window::Hour,
            now,
        )
        .await?;

    if !auth::is_timestamp_fresh(request.timestamp, now.timestamp()) {
        return Err(ApiError::StaleTimestamp);
    }

    if !state.oracle.verify_validator(&request.hotkey).await? {
        warn!("VALIDATOR ACCESS DENIED: {} - not a validator", request.hotkey);
        return Err(ApiError::NotValidator);
    }

    let commitment = auth::historical_commitment(&request.epoch_id, request.timestamp);
    if !state
        .oracle
        .verify_signature(&commitment, &request.signature, &request.hotkey)
        .await?
    {
        warn!("VALIDATOR SIGNATURE FAILED: {}", request.hotkey);
        return Err(ApiError::InvalidSignature);
    }

    let epoch = state
        .store
        .get_epoch(&request.epoch_id)?
        .ok_or_else(|| ApiError::EpochNotFound(request.epoch_id.clone()))?;
    let assignments = state.store.get_assignments(&epoch.id)?;

    Ok(Json(EpochSnapshot::build(&epoch, &assignments, true)))
}

/// Advisory status report (miner-facing). The nonce check is the
/// anti-pre-scraping gate; a recorded report never affects storage access.
async fn submit_report(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StatusReportRequest>,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let limits = state.limits.config();
    state
        .limits
        .check_daily(&request.hotkey, limits.daily_per_miner, now)
        .await?;

    if !auth::is_timestamp_fresh(request.timestamp, now.timestamp()) {
        return Err(ApiError::StaleTimestamp);
    }

    let commitment = auth::report_commitment(&request.epoch_id, &request.hotkey, request.timestamp);
    if !state
        .oracle
        .verify_signature(&commitment, &request.signature, &request.hotkey)
        .await?
    {
        warn!("REPORT SIGNATURE FAILED: {}", request.hotkey);
        return Err(ApiError::InvalidSignature);
    }

    let epoch = state
        .store
        .get_epoch(&request.epoch_id)?
        .ok_or_else(|| ApiError::EpochNotFound(request.epoch_id.clone()))?;
    if request.nonce != epoch.nonce {
        warn!(
            "NONCE MISMATCH for epoch {} from {}",
            request.epoch_id, request.hotkey
        );
        return Err(ApiError::NonceMismatch);
    }

    let report = StatusReport {
        id: Uuid::new_v4().to_string(),
        epoch_id: request.epoch_id.clone(),
        miner_hotkey: request.hotkey.clone(),
        listings_scraped: request.listings_scraped,
        zipcodes_completed: request.zipcodes_completed,
        reported_at: now,
    };
    state.store.insert_report(&report)?;

    Ok(Json(json!({
        "recorded": true,
        "report_id": report.id,
        "epoch_id": report.epoch_id,
    })))
}

/// Miner folder upload access: presigned POST policy plus a listing URL
async fn get_folder_access(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MinerAccessRequest>,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let limits = state.limits.config();
    state
        .limits
        .check_daily(&request.hotkey, limits.daily_per_miner, now)
        .await?;

    if !auth::is_timestamp_fresh(request.timestamp, now.timestamp()) {
        return Err(ApiError::StaleTimestamp);
    }

    let commitment =
        auth::miner_access_commitment(&request.coldkey, &request.hotkey, request.timestamp);
    if !state
        .oracle
        .verify_signature(&commitment, &request.signature, &request.hotkey)
        .await?
    {
        warn!(
            "MINER SIGNATURE FAILED: {} (coldkey: {})",
            request.hotkey, request.coldkey
        );
        return Err(ApiError::InvalidSignature);
    }

    let folder = format!("data/hotkey={}/", request.hotkey);
    let s3 = &state.config.s3;
    let upload = state
        .object_store
        .mint_upload_credential(&folder, s3.upload_expiry_hours * 3600, now)
        .await?;
    let listing = state
        .object_store
        .mint_read_credential(&folder, &ReadOptions::default(), s3.list_expiry_hours * 3600, now)
        .await?;

    Ok(Json(json!({
        "folder": folder,
        "url": upload.url,
        "fields": upload.fields,
        "expiry": upload.expires_at,
        "list_url": listing.url,
        "structure_info": {
            "folder_structure": "data/hotkey={hotkey_id}/job_id={job_id}/",
            "description": "Upload files to job_id folders within your hotkey directory under data/ prefix",
        },
    })))
}

/// Validator bucket-wide read access
async fn get_validator_access(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ValidatorAccessRequest>,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let limits = state.limits.config();
    state
        .limits
        .check_daily(&request.hotkey, limits.daily_per_validator, now)
        .await?;

    if !auth::is_timestamp_fresh(request.timestamp, now.timestamp()) {
        return Err(ApiError::StaleTimestamp);
    }

    if !state.oracle.verify_validator(&request.hotkey).await? {
        warn!("VALIDATOR ACCESS DENIED: {} - not a validator", request.hotkey);
        return Err(ApiError::NotValidator);
    }

    let commitment = auth::validator_access_commitment(request.timestamp);
    if !state
        .oracle
        .verify_signature(&commitment, &request.signature, &request.hotkey)
        .await?
    {
        warn!("VALIDATOR SIGNATURE FAILED: {}", request.hotkey);
        return Err(ApiError::InvalidSignature);
    }

    let s3 = &state.config.s3;
    let expiry_secs = s3.read_expiry_hours * 3600;
    let all_data = state
        .object_store
        .mint_read_credential("data/hotkey=", &ReadOptions::default(), expiry_secs, now)
        .await?;
    let miner_folders = state
        .object_store
        .mint_read_credential(
            "data/hotkey=",
            &ReadOptions {
                delimiter: Some("/".to_string()),
                max_keys: None,
            },
            expiry_secs,
            now,
        )
        .await?;

    Ok(Json(json!({
        "bucket": s3.bucket,
        "region": s3.region,
        "validator_hotkey": request.hotkey,
        "expiry": all_data.expires_at,
        "expiry_seconds": expiry_secs,
        "urls": {
            "global": { "list_all_data": all_data.url },
            "miners": { "list_all_miners": miner_folders.url },
        },
        "structure_info": {
            "folder_structure": "data/hotkey={hotkey_id}/job_id={job_id}/",
            "description": "Job-based folder structure with explicit hotkey and job_id labels under data/ prefix",
        },
    })))
}

/// Validator read access scoped to one miner's folder
async fn get_miner_specific_access(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ValidatorAccessRequest>,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let miner_hotkey = request
        .miner_hotkey
        .as_deref()
        .filter(|h| !h.is_empty())
        .ok_or(ApiError::MissingField("miner_hotkey"))?;

    let limits = state.limits.config();
    state
        .limits
        .check_daily(&request.hotkey, limits.daily_per_validator, now)
        .await?;

    if !auth::is_timestamp_fresh(request.timestamp, now.timestamp()) {
        return Err(ApiError::StaleTimestamp);
    }

    if !state.oracle.verify_validator(&request.hotkey).await? {
        warn!(
            "VALIDATOR ACCESS DENIED: {} - not a validator (requested miner: {})",
            request.hotkey, miner_hotkey
        );
        return Err(ApiError::NotValidator);
    }

    let commitment = auth::miner_specific_commitment(miner_hotkey, request.timestamp);
    if !state
        .oracle
        .verify_signature(&commitment, &request.signature, &request.hotkey)
        .await?
    {
        warn!(
            "VALIDATOR SIGNATURE FAILED: {} (requested miner: {})",
            request.hotkey, miner_hotkey
        );
        return Err(ApiError::InvalidSignature);
    }

    let s3 = &state.config.s3;
    let miner_prefix = format!("data/hotkey={}/", miner_hotkey);
    let listing = state
        .object_store
        .mint_read_credential(
            &miner_prefix,
            &ReadOptions {
                delimiter: None,
                max_keys: Some(10_000),
            },
            s3.list_expiry_hours * 3600,
            now,
        )
        .await?;

    Ok(Json(json!({
        "bucket": s3.bucket,
        "region": s3.region,
        "miner_hotkey": miner_hotkey,
        "miner_url": listing.url,
        "prefix": miner_prefix,
        "expiry": listing.expires_at,
    })))
}

/// Registry statistics and epoch timeline summary
async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let scheduler = &state.scheduler;
    let filter = scheduler.eligibility_filter();
    let statistics = state.store.statistics(now, &filter)?;
    let summary = scheduler.status_summary(now)?;

    Ok(Json(json!({
        "zipcodes": statistics,
        "epochs": summary,
        "configuration": {
            "target_listings": state.config.selection.target_listings,
            "tolerance_percent": state.config.selection.tolerance_percent,
            "cooldown_hours": state.config.selection.cooldown_hours,
            "state_priorities": state.config.selection.parse_state_priorities(),
        },
    })))
}

async fn healthcheck(State(state): State<Arc<AppState>>) -> Json<Value> {
    // Storage probe doubles as the readiness signal
    let db_ok = state.store.recent_epochs(1).is_ok();

    let metagraph_info = match &state.metagraph {
        Some(cache) => match cache.get(Utc::now()) {
            Some(snapshot) => json!({
                "enabled": true,
                "netuid": state.config.chain.netuid,
                "sync_interval": state.config.chain.sync_interval_secs,
                "hotkeys_count": snapshot.hotkey_count(),
                "last_sync": snapshot.synced_at,
            }),
            None => json!({ "enabled": true, "last_sync": null }),
        },
        None => json!({ "enabled": false, "reason": "syncer not running" }),
    };

    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "timestamp": Utc::now(),
        "bucket": state.config.s3.bucket,
        "region": state.config.s3.region,
        "folder_structure": "data/hotkey={hotkey_id}/job_id={job_id}/",
        "db_ok": db_ok,
        "metagraph_syncer": metagraph_info,
        "stats": state.monitor.stats(state.started_at.elapsed().as_secs()),
    }))
}

async fn commitment_formats() -> Json<Value> {
    Json(json!({
        "assignment_format": "zipcode:assignments:{hotkey}:{timestamp}",
        "epoch_format": "zipcode:epoch:{epoch_id}:{timestamp}",
        "report_format": "zipcode:report:{epoch_id}:{hotkey}:{timestamp}",
        "miner_format": "s3:data:access:{coldkey}:{hotkey}:{timestamp}",
        "validator_format": "s3:validator:access:{timestamp}",
        "miner_specific_format": "s3:validator:miner:{miner_hotkey}:{timestamp}",
        "example_miner": "s3:data:access:5F3...coldkey:5H2...hotkey:1682345678",
        "example_validator": "s3:validator:access:1682345678",
        "instructions": "1. Generate timestamp\n2. Sign commitment\n3. Make API request\n4. Upload to job_id folders with explicit labels under data/ prefix",
    }))
}

/// Count requests and log failures for the healthcheck counters
async fn track_requests(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    let failed = response.status().is_client_error() || response.status().is_server_error();
    state.monitor.count_request(failed);
    if failed {
        info!("Request to {} rejected with {}", path, response.status());
    }
    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/commitment-formats", get(commitment_formats))
        .route("/stats", get(stats))
        .route("/get-current-assignments", post(get_current_assignments))
        .route("/get-epoch", post(get_epoch))
        .route("/submit-report", post(submit_report))
        .route("/get-folder-access", post(get_folder_access))
        .route("/get-validator-access", post(get_validator_access))
        .route("/get-miner-specific-access", post(get_miner_specific_access))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the server until the shutdown signal fires
pub async fn run_server(
    host: &str,
    port: u16,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting Zipcode Gateway server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
