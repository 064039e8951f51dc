use std::time::Duration;

// -----------------------------------------------------------------------------
// Exit Codes
// -----------------------------------------------------------------------------

/// Execution success.
pub const E_CODE_SUCCESS: u8 = 0;

/// Initialization failure.
pub const E_CODE_FAILURE_INIT: u8 = 2;

/// Execution failure.
pub const E_CODE_FAILURE_EXEC: u8 = 1;

// -----------------------------------------------------------------------------
// System - Fiber Behavior
// -----------------------------------------------------------------------------

/// Number of runtime operations a fiber may perform before it yields back to
/// the host scheduler.
pub const DEFAULT_FIBER_OPS_BUDGET: u32 = 2048;

/// Number of interpreted STM steps between journal re-validations.
pub const DEFAULT_STM_YIELD_OP_COUNT: u32 = 2048;

// -----------------------------------------------------------------------------
// System - Scheduler Behavior
// -----------------------------------------------------------------------------

/// Default amount of parallelism the tokio runtime should use.
///
/// Note: This value is only used when a default value is not
///       retrievable from the host environment.
pub const DEFAULT_PARALLELISM: usize = 1;

/// Number of scheduler ticks before polling for external events.
pub const DEFAULT_EVENT_INTERVAL: u32 = 61;

/// Number of scheduler ticks before polling the global task queue.
pub const DEFAULT_GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Maximum number of I/O events processed per scheduler tick.
pub const DEFAULT_MAX_IO_EVENTS_PER_TICK: usize = 1024;

/// Limit for additional threads spawned by the tokio runtime.
pub const DEFAULT_MAX_BLOCKING_THREADS: usize = 512;

/// How long to keep threads in the blocking pool alive.
pub const DEFAULT_THREAD_KEEP_ALIVE: Duration = Duration::from_millis(10 * 1000);

/// Stack size (in bytes) for worker threads.
pub const DEFAULT_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;

// -----------------------------------------------------------------------------
// System - Shutdown
// -----------------------------------------------------------------------------

/// How long to wait for a clean shutdown of the internal runtime.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------------
// System - Memory Allocation
// -----------------------------------------------------------------------------

/// Number of pre-allocated fiber-local bindings.
pub const CAP_FIBER_REFS: usize = 8;

/// Number of pre-allocated entries in an STM journal.
pub const CAP_STM_JOURNAL: usize = 8;

/// Number of pre-allocated continuation frames in the STM driver.
pub const CAP_STM_STACK: usize = 16;

/// Number of pre-allocated slots in an unbounded mailbox buffer.
pub const CAP_MAILBOX_BUFFER: usize = 8;
