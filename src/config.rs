//! Scheduler configuration, in the spirit of the teacher crate's
//! `Options`/`Builder` pair: plain data describing the runtime's tunables,
//! kept separate from the types that act on it.

/// Default size of a coroutine's private stack, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Default wall-clock upper bound the scheduler blocks in the multiplexer
/// for, in milliseconds, when nothing else is ready.
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 1000;

/// Default initial capacity of the watched-fd table (slot 0 is always the
/// wakeup channel's read end).
pub const DEFAULT_WATCHED_FD_CAPACITY: usize = 16;

/// Tunables for a [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub(crate) stack_size: usize,
    pub(crate) poll_timeout_ms: i32,
    pub(crate) watched_fd_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            stack_size: DEFAULT_STACK_SIZE,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            watched_fd_capacity: DEFAULT_WATCHED_FD_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Starts building a configuration from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stack size used for every coroutine the scheduler creates.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Sets the bounded timeout the scheduler's multiplexer wait uses.
    pub fn poll_timeout_ms(mut self, timeout_ms: i32) -> Self {
        self.poll_timeout_ms = timeout_ms;
        self
    }

    /// Sets the initial capacity hint for the watched-fd table.
    pub fn watched_fd_capacity(mut self, capacity: usize) -> Self {
        self.watched_fd_capacity = capacity;
        self
    }
}
