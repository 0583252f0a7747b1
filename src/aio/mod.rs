//! Non-blocking, callback-driven I/O runtime
//!
//! Operations are submitted with a callback and complete through a
//! kernel completion interface (io_uring on Linux, kqueue on the BSDs
//! and macOS, IOCP on Windows). Scheduling is single-threaded and
//! cooperative: every callback runs on the thread that calls
//! [`EventLoop::tick`], and a callback must not block.

/// Completion records, operations and the runtime error type
pub(crate) mod completion;

/// Submission API, timeouts and dispatch
mod event_loop;

/// Per-platform kernel backends
mod sys;

pub use completion::{AioError, Interest};
pub use event_loop::{EventLoop, PollHandle};
