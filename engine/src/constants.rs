use std::time::Duration;

/// Default timeout applied to outbound HTTP and RPC requests.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Cadence of the rebalance callback loop.
pub const CALLBACK_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence of the stale-operation expiry ticker.
pub const EXPIRY_TICK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Rebalance operations still PENDING or AWAITING_CALLBACK after this long
/// are marked EXPIRED.
pub const OPERATION_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum retries for transient adapter errors before they surface.
pub const MAX_ADAPTER_RETRIES: u32 = 3;

/// Initial backoff for adapter retries. Doubles per attempt, capped below.
pub const ADAPTER_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const ADAPTER_RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How long an invoice event is deferred while an earmark is in flight.
pub const EARMARK_IN_FLIGHT_RETRY: Duration = Duration::from_secs(10);

/// How long an invoice event is deferred on transient upstream failures.
pub const TRANSIENT_FAILURE_RETRY: Duration = Duration::from_secs(60);

/// How long an invoice event is deferred when zero purchases were created.
pub const NO_PURCHASE_RETRY: Duration = Duration::from_secs(10);

/// Lifetime of cached purchase records.
pub const PURCHASE_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Minimum block confirmations before a submission counts as mined.
pub const MIN_CONFIRMATIONS: usize = 2;

/// Inline polling window after a CEX swap is executed.
pub const SWAP_POLL_TIMEOUT: Duration = Duration::from_secs(30);
pub const SWAP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Oldest invoice age the processor will still purchase, in seconds.
pub const MAX_INVOICE_AGE: u64 = 60 * 60 * 24 * 7;
