use std::time::Duration;

// ==== Channel lifecycle ====

/// A pending channel that has not seen a payment within this window expires.
pub const CHANNEL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How long after a channel reaches a terminal state its deposit address
/// stays quarantined before the vault may hand it out again.
pub const ADDRESS_REUSE_COOLDOWN: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Payments below `expected * AMOUNT_TOLERANCE` are not accepted.
pub const AMOUNT_TOLERANCE: f64 = 0.95;

// ==== Worker cadences ====

/// Global catch-all sweep over every open channel.
pub const CHANNEL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Backstop loop of the account creator; the confirmed-channel wake
/// normally gets there first.
pub const CREATOR_INTERVAL: Duration = Duration::from_secs(30);

/// Proactive ACT claim loop.
pub const CLAIM_LOOP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// External-creation reconciliation loop.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

pub const PRICING_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// A snapshot older than this triggers an opportunistic background refresh
/// on read. The stale snapshot is still what the caller gets.
pub const PRICING_STALE_AFTER: Duration = Duration::from_secs(2 * 60 * 60);

pub const PRICING_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const RC_REFRESH_INTERVAL: Duration = Duration::from_secs(3 * 60 * 60);

pub const RC_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

// ==== Outbound HTTP ====

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// ==== Hive account creation ====

/// Delegation-path creation fee, in HIVE.
pub const HIVE_CREATION_FEE: f64 = 3.0;

/// The account price in USD is `hive_price * 3 * BASE_COST_MULTIPLIER`.
pub const BASE_COST_MULTIPLIER: f64 = 1.5;

/// Share of the estimated network fee added to each crypto quote.
pub const NETWORK_FEE_SURCHARGE: f64 = 0.2;

/// Keep this many Account Creation Tokens in stock.
pub const ACT_TARGET_BALANCE: u32 = 8;

/// Claim only when current RC covers this many claims.
pub const CLAIM_RC_MULTIPLIER: u128 = 3;

/// RC worth this many claims is never spent during a batch run.
pub const CLAIM_RC_RESERVE: u128 = 2;

pub const MAX_CLAIMS_PER_RUN: u32 = 5;

pub const CLAIM_SPACING: Duration = Duration::from_secs(5);

/// Conservative floor for `claim_account_operation` RC cost, used only when
/// the RC oracle has never produced a value.
pub const CLAIM_RC_FLOOR: u128 = 13_700_000_000_000;

/// Daily health thresholds on `days_sustainable`.
pub const HEALTH_HEALTHY_DAYS: f64 = 10.0;
pub const HEALTH_ATTENTION_DAYS: f64 = 3.0;

// ==== Admin auth ====

/// A signed challenge older than this is rejected.
pub const CHALLENGE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

// ==== Notifications ====

/// Broadcast buffer; old events are dropped when receivers lag.
pub const EVENT_BUFFER_SIZE: usize = 1024;
