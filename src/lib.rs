//! Zipcode Gateway - Epoch-based zipcode assignments and S3 access
//!
//! This service hands out scraping work to data-collection miners in fixed
//! 4-hour epochs and gates scoped S3 credentials behind sr25519 signature
//! proof of subnet identity and role.
//!
//! # How it works
//!
//! 1. A background supervisor keeps the epoch timeline current (create,
//!    activate, complete, archive) at the six daily UTC boundaries
//! 2. Each epoch's zipcodes come from a deterministic-seeded weighted draw
//!    over the eligible registry, targeting a listing capacity band
//! 3. Miners query the active epoch's assignment snapshot with a signed,
//!    timestamped request and scrape the listed zipcodes
//! 4. Miners upload results through presigned POST policies scoped to their
//!    own folder; validators read any folder through presigned list URLs
//! 5. Validators audit past epochs by id, honeypot flags included
//!
//! # Anti-gaming measures
//!
//! - Selection seeds derive from the epoch id, a server secret and the UTC
//!   date: reproducible after the fact, unpredictable in advance
//! - The epoch nonce is an HMAC over the secret and the selected set, so
//!   pre-scraped submissions cannot cite a valid nonce
//! - Cooldown decay keeps recently assigned zipcodes out of rotation
//! - Low-capacity honeypot zipcodes catch fabricated data for work nobody
//!   was assigned
//! - Tight timestamp windows and two-tier rate limits blunt replay and
//!   enumeration

pub mod auth;
pub mod chain;
pub mod config;
pub mod error;
pub mod limits;
pub mod s3;
pub mod scheduler;
pub mod selection;
pub mod server;
pub mod storage;

pub use auth::{is_valid_ss58_hotkey, verify_signature};
pub use chain::{CachedChainOracle, ChainOracle, MetagraphCache};
pub use config::Config;
pub use error::ApiError;
pub use limits::{Counter, MemoryCounter, RateLimiter};
pub use scheduler::{current_epoch_start, epoch_id_for, next_epoch_start, EpochScheduler};
pub use selection::{SelectionEngine, SelectionOutcome};
pub use storage::{AssignmentStore, Epoch, EpochAssignment, EpochStatus, MarketTier, ZipcodeUnit};
