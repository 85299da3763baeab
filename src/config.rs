/// Number of emulated CPU cores.
pub const NUM_CPU_CORES: usize = 4;

/// Highest (numerically lowest) thread priority.
pub const HIGHEST_THREAD_PRIORITY: i32 = 0;

/// Lowest (numerically highest) thread priority.
pub const LOWEST_THREAD_PRIORITY: i32 = 63;

/// Number of priority levels tracked by the ready queues.
pub const NUM_PRIORITIES: usize = (LOWEST_THREAD_PRIORITY + 1) as usize;

/// Priority assigned to the per-core idle threads. Idle threads never enter
/// the ready queues.
pub const IDLE_THREAD_PRIORITY: i32 = 64;

/// Priority assigned to dummy threads backing host callers.
pub const DUMMY_THREAD_PRIORITY: i32 = 63;

/// Priority given to a thread while its termination is pending.
pub const TERMINATING_THREAD_PRIORITY: i32 = 0;

/// Threads running at a priority below this value are never displaced by a
/// migration from a suggested queue.
pub const HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY: i32 = 2;

/// Priority level rotated on each core by the preemption tick.
pub const PREEMPTION_PRIORITIES: [i32; NUM_CPU_CORES] = [59, 59, 59, 63];

/// Interval of the preemption tick in nanoseconds.
pub const PREEMPTION_INTERVAL_NS: i64 = 10_000_000;

/// Stack size of the host threads backing fibers.
pub const FIBER_STACK_SIZE: usize = 512 * 1024;

/// Maximum number of entries in a handle table.
pub const HANDLE_TABLE_MAX_SIZE: usize = 1024;

/// Maximum number of objects accepted by a synchronization wait.
pub const ARGUMENT_HANDLE_COUNT_MAX: usize = 0x40;
