use std::fmt::Display;
use std::process;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use tokio::runtime::Builder;
use tokio::runtime::EnterGuard;
use tokio::runtime::Handle;
use tokio::runtime::Runtime as TokioRuntime;
use tracing::Level;
use tracing::Span;

use crate::consts;
use crate::core::Cause;
use crate::core::Exit;
use crate::core::Never;
use crate::error::Exception;
use crate::error::ExceptionClass;
use crate::error::ExceptionGroup;
use crate::fiber::Fiber;
use crate::fiber::FiberRefs;
use crate::fiber::context::FiberConfig;
use crate::fiber::fork::Spawn;
use crate::fiber::signal;
use crate::raise;
use crate::supervisor;
use crate::supervisor::Supervisor;

// -----------------------------------------------------------------------------
// Flavor
// -----------------------------------------------------------------------------

/// The scheduler used to drive fibers.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum Flavor {
  /// A single thread drives every fiber.
  CurrentThread,
  /// A pool of worker threads with work stealing.
  #[default]
  MultiThread,
}

// -----------------------------------------------------------------------------
// Runtime Config
// -----------------------------------------------------------------------------

/// Configuration of a [`Runtime`].
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
  // ---------------------------------------------------------------------------
  // Tokio Runtime Configuration
  // ---------------------------------------------------------------------------
  pub flavor: Flavor,
  pub rt_event_interval: u32,
  pub rt_global_queue_interval: u32,
  pub rt_max_blocking_threads: usize,
  pub rt_max_io_events_per_tick: usize,
  pub rt_shutdown_timeout: Duration,
  pub rt_thread_keep_alive: Duration,
  pub rt_thread_stack_size: usize,
  pub rt_worker_threads: usize,
  // ---------------------------------------------------------------------------
  // Fiber Configuration
  // ---------------------------------------------------------------------------
  pub fiber_ops_budget: u32,
  pub stm_yield_op_count: u32,
  pub supervisor: Supervisor,
  // ---------------------------------------------------------------------------
  // Tracing Subscriber Configuration
  // ---------------------------------------------------------------------------
  pub tracing_source_file: bool,
  pub tracing_source_line: bool,
  pub tracing_source_name: bool,
  pub tracing_thread_info: bool,
  pub tracing_verbose: bool,
  pub tracing_very_verbose: bool,
}

impl RuntimeConfig {
  #[inline]
  pub fn new() -> Self {
    Self {
      flavor: Flavor::MultiThread,
      rt_event_interval: consts::DEFAULT_EVENT_INTERVAL,
      rt_global_queue_interval: consts::DEFAULT_GLOBAL_QUEUE_INTERVAL,
      rt_max_blocking_threads: consts::DEFAULT_MAX_BLOCKING_THREADS,
      rt_max_io_events_per_tick: consts::DEFAULT_MAX_IO_EVENTS_PER_TICK,
      rt_shutdown_timeout: consts::SHUTDOWN_TIMEOUT,
      rt_thread_keep_alive: consts::DEFAULT_THREAD_KEEP_ALIVE,
      rt_thread_stack_size: consts::DEFAULT_THREAD_STACK_SIZE,
      rt_worker_threads: Runtime::available_cpus(),
      fiber_ops_budget: consts::DEFAULT_FIBER_OPS_BUDGET,
      stm_yield_op_count: consts::DEFAULT_STM_YIELD_OP_COUNT,
      supervisor: Supervisor::none(),
      tracing_source_file: false,
      tracing_source_line: false,
      tracing_source_name: false,
      tracing_thread_info: true,
      tracing_verbose: true,
      tracing_very_verbose: false,
    }
  }

  /// Uses a single-threaded scheduler.
  #[inline]
  pub fn current_thread(mut self) -> Self {
    self.flavor = Flavor::CurrentThread;
    self
  }

  /// Uses a multi-threaded scheduler with `count` workers.
  #[inline]
  pub fn worker_threads(mut self, count: usize) -> Self {
    self.flavor = Flavor::MultiThread;
    self.rt_worker_threads = count;
    self
  }

  /// Sets the number of operations a fiber performs before yielding.
  #[inline]
  pub fn fiber_ops_budget(mut self, budget: u32) -> Self {
    self.fiber_ops_budget = budget;
    self
  }

  /// Sets how many STM steps run between journal re-validations.
  #[inline]
  pub fn stm_yield_op_count(mut self, count: u32) -> Self {
    self.stm_yield_op_count = count;
    self
  }

  /// Sets the supervisor observing every fiber of the runtime.
  #[inline]
  pub fn supervisor(mut self, supervisor: Supervisor) -> Self {
    self.supervisor = supervisor;
    self
  }

  #[inline]
  pub const fn tracing_filter(&self) -> Level {
    if self.tracing_very_verbose {
      Level::TRACE
    } else if self.tracing_verbose {
      Level::DEBUG
    } else {
      Level::INFO
    }
  }

  #[inline]
  fn fiber_config(&self) -> FiberConfig {
    FiberConfig {
      ops_budget: self.fiber_ops_budget.max(1),
      stm_yield_op_count: self.stm_yield_op_count.max(1),
    }
  }
}

impl Default for RuntimeConfig {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

// -----------------------------------------------------------------------------
// Runtime
// -----------------------------------------------------------------------------

/// A fiber runtime backed by a tokio scheduler.
///
/// ```no_run
/// use strand::core::Cause;
/// use strand::core::Exit;
/// use strand::core::Never;
/// use strand::fiber::Runtime;
/// use strand::fiber::RuntimeConfig;
///
/// let runtime: Runtime = Runtime::new(RuntimeConfig::default()).unwrap();
/// let exit: Exit<u32, Never> = runtime.block_on(async { Ok::<u32, Cause<Never>>(42) });
///
/// assert_eq!(exit.into_result().ok(), Some(42));
/// ```
pub struct Runtime {
  inner: TokioRuntime,
  fiber: FiberConfig,
  supervisor: Supervisor,
  shutdown_timeout: Duration,
}

impl Runtime {
  /// Builds a runtime.
  ///
  /// Raises `SysInv` when called from inside another runtime.
  pub fn new(config: RuntimeConfig) -> Result<Self, Exception> {
    if Handle::try_current().is_ok() {
      raise!(Error, SysInv, "cannot build a runtime from inside another runtime");
    }

    init_tracing(&config);

    Ok(Self {
      inner: build_tokio_runtime(&config)?,
      fiber: config.fiber_config(),
      supervisor: config.supervisor,
      shutdown_timeout: config.rt_shutdown_timeout,
    })
  }

  /// Runs `future` as the root fiber and blocks until it fully unwound.
  pub fn block_on<F, A, E>(&self, future: F) -> Exit<A, E>
  where
    F: Future<Output = Result<A, Cause<E>>> + Send + 'static,
    A: Send + 'static,
    E: Send + 'static,
  {
    let fiber: Fiber<A, E> = self.spawn_root(future);

    self.inner.block_on(fiber.into_exit())
  }

  /// Runs `future` as the main fiber and exits the process with its outcome.
  ///
  /// SIGINT and SIGTERM interrupt the main fiber; the process exits once it
  /// fully unwound. Failing to build the runtime exits with
  /// [`E_CODE_FAILURE_INIT`].
  ///
  /// [`E_CODE_FAILURE_INIT`]: consts::E_CODE_FAILURE_INIT
  pub fn run<F, A, E>(config: RuntimeConfig, future: F) -> !
  where
    F: Future<Output = Result<A, Cause<E>>> + Send + 'static,
    A: Send + 'static,
    E: Send + 'static,
  {
    let span: Span = tracing::span!(target: "strand", Level::DEBUG, "runtime::run");

    let this: Runtime = match Runtime::new(config) {
      Ok(runtime) => runtime,
      Err(error) => {
        tracing::error!(target: "strand", parent: &span, %error, "failed to build runtime");
        eprintln!("failed to build runtime: {error}");
        process::exit(i32::from(consts::E_CODE_FAILURE_INIT));
      }
    };

    tracing::debug!(target: "strand", parent: &span, "polling");

    let main: Fiber<A, E> = this.spawn_root(future);
    let signals: Fiber<(), Never> = this.spawn_root(signal::task(main.core.clone()));

    let exit: Exit<A, E> = this.inner.block_on(main.into_exit());

    signals.interrupt_fork();

    let status: u8 = if exit.is_success() {
      consts::E_CODE_SUCCESS
    } else {
      consts::E_CODE_FAILURE_EXEC
    };

    tracing::info!(
      target: "strand",
      parent: &span,
      status,
      timeout = ?this.shutdown_timeout,
      "system stopping",
    );

    let start: Instant = Instant::now();

    this.inner.shutdown_timeout(this.shutdown_timeout);

    tracing::info!(
      target: "strand",
      parent: &span,
      elapsed = ?start.elapsed(),
      "system stopped",
    );

    process::exit(i32::from(status))
  }

  /// Returns a handle to the underlying tokio scheduler.
  #[inline]
  pub fn handle(&self) -> &Handle {
    self.inner.handle()
  }

  /// Returns the number of available CPU cores.
  ///
  /// Falls back to [`DEFAULT_PARALLELISM`] if CPU detection fails.
  ///
  /// [`DEFAULT_PARALLELISM`]: consts::DEFAULT_PARALLELISM
  pub fn available_cpus() -> usize {
    match thread::available_parallelism() {
      Ok(count) => count.get(),
      Err(_) => consts::DEFAULT_PARALLELISM,
    }
  }

  fn spawn_root<F, A, E>(&self, future: F) -> Fiber<A, E>
  where
    F: Future<Output = Result<A, Cause<E>>> + Send + 'static,
    A: Send + 'static,
    E: Send + 'static,
  {
    let _enter: EnterGuard<'_> = self.inner.enter();
    let mut refs: FiberRefs = FiberRefs::new();

    refs.set(&*supervisor::CURRENT, self.supervisor.clone());

    Spawn::root(self.fiber, refs).start(future, None)
  }
}

// -----------------------------------------------------------------------------
// Tokio
// -----------------------------------------------------------------------------

/// Builds the tokio scheduler with the given configuration.
fn build_tokio_runtime(config: &RuntimeConfig) -> Result<TokioRuntime, Exception> {
  let mut builder: Builder = match config.flavor {
    Flavor::CurrentThread => Builder::new_current_thread(),
    Flavor::MultiThread => {
      let mut builder: Builder = Builder::new_multi_thread();
      builder.worker_threads(config.rt_worker_threads.max(1));
      builder
    }
  };

  builder
    .enable_io()
    .enable_time()
    .event_interval(config.rt_event_interval)
    .global_queue_interval(config.rt_global_queue_interval)
    .max_blocking_threads(config.rt_max_blocking_threads)
    .max_io_events_per_tick(config.rt_max_io_events_per_tick)
    .thread_keep_alive(config.rt_thread_keep_alive)
    .thread_name_fn(next_worker_name)
    .thread_stack_size(config.rt_thread_stack_size)
    .build()
    .map_err(error)
}

/// Generates a unique name for the next worker thread.
#[inline]
fn next_worker_name() -> String {
  format!("strand-worker-{:0>2}", next_worker_id())
}

/// Atomically increments and returns the next worker thread ID.
#[inline]
fn next_worker_id() -> u32 {
  static ID: AtomicU32 = AtomicU32::new(1);
  ID.fetch_add(1, Ordering::Relaxed)
}

/// Returns a generic `SysInv` exception with the given error message.
#[cold]
fn error<E>(error: E) -> Exception
where
  E: Display,
{
  Exception::new(ExceptionClass::Error, ExceptionGroup::SysInv, error)
}

// -----------------------------------------------------------------------------
// Tracing
// -----------------------------------------------------------------------------

/// Installs the global tracing subscriber, once per process.
///
/// A subscriber installed by the application takes precedence; failures are
/// reported on stderr and otherwise ignored.
#[cfg(feature = "tracing")]
fn init_tracing(config: &RuntimeConfig) {
  use std::sync::Once;
  use tracing_subscriber::FmtSubscriber;
  use tracing_subscriber::fmt::format;
  use tracing_subscriber::util::SubscriberInitExt;

  static INIT: Once = Once::new();

  INIT.call_once(|| {
    let result: Result<(), Exception> = FmtSubscriber::builder()
      .event_format(format().compact())
      .log_internal_errors(true)
      .with_ansi(true)
      .with_file(config.tracing_source_file)
      .with_level(true)
      .with_line_number(config.tracing_source_line)
      .with_max_level(config.tracing_filter())
      .with_target(config.tracing_source_name)
      .with_thread_ids(config.tracing_thread_info)
      .with_thread_names(config.tracing_thread_info)
      .finish()
      .try_init()
      .map_err(error);

    if let Err(error) = result {
      eprintln!("failed to set tracing subscriber:");
      eprintln!("    {}", error.error());
    }
  });
}

#[cfg(not(feature = "tracing"))]
fn init_tracing(_config: &RuntimeConfig) {}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
