// ==== Fetcher metrics ====
/// Counter for record batches handed to a dispatch loop (redeliveries excluded)
pub const BATCHES_RECEIVED_COUNTER: &str = "trigger_batches_received_total";

/// Counter for records contained in received batches
pub const RECORDS_RECEIVED_COUNTER: &str = "trigger_records_received_total";

/// Counter for failed fetch round trips (with reason label: transport/broker/codec)
pub const FETCH_ERRORS_COUNTER: &str = "trigger_fetch_errors_total";

/// Counter for fetchers that gave up after too many consecutive failures
pub const FETCHERS_FAILED_COUNTER: &str = "trigger_fetchers_failed_total";

/// Histogram for fetch round trip duration
pub const FETCH_DURATION_HISTOGRAM: &str = "trigger_fetch_duration_seconds";

// ==== Schema metrics ====
/// Counter for schemas parsed and compiled into decoders
pub const SCHEMA_COMPILES_COUNTER: &str = "trigger_schema_compiles_total";

/// Counter for records whose value could not be decoded
pub const DECODE_FAILURES_COUNTER: &str = "trigger_decode_failures_total";

// ==== Delivery metrics ====
/// Counter for handler invocations (with outcome label: success/failure)
pub const DELIVERY_ATTEMPTS_COUNTER: &str = "trigger_delivery_attempts_total";

/// Counter for batches that exhausted their delivery attempts
pub const DELIVERY_FAILURES_COUNTER: &str = "trigger_delivery_failures_total";

/// Histogram for handler invocation duration
pub const HANDLER_DURATION_HISTOGRAM: &str = "trigger_handler_duration_seconds";

/// Histogram for number of events per delivered batch
pub const BATCH_SIZE_HISTOGRAM: &str = "trigger_batch_size_events";

/// Counter for records skipped because they belong to a control batch
pub const CONTROL_RECORDS_SKIPPED_COUNTER: &str = "trigger_control_records_skipped_total";

// ==== Coordinator metrics ====
/// Counter for successful offset commits
pub const COMMITS_COUNTER: &str = "trigger_commits_total";

/// Counter for rejected or failed offset commits
pub const COMMIT_FAILURES_COUNTER: &str = "trigger_commit_failures_total";

/// Counter for completed rebalances (with reason label: join/leave/timeout)
pub const REBALANCES_COUNTER: &str = "trigger_rebalances_total";

/// Counter for members fenced for not acknowledging a revocation in time
pub const MEMBERS_FENCED_COUNTER: &str = "trigger_members_fenced_total";

/// Gauge for the number of partitions owned across all members of a group
pub const OWNED_PARTITIONS_GAUGE: &str = "trigger_owned_partitions";

/// Gauge for the number of members in a group
pub const GROUP_MEMBERS_GAUGE: &str = "trigger_group_members";

/// Gauge for partitions halted after a fatal fetch or delivery failure
pub const HALTED_PARTITIONS_GAUGE: &str = "trigger_halted_partitions";
