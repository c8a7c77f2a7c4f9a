//! # spool
//! A single-threaded cooperative async runtime: one event loop multiplexing
//! many logical tasks over one OS thread using non-blocking I/O readiness and
//! time-ordered callbacks.
//!
//! ## Architecture
//! * **EventLoop**: drains the cross-thread inbox, fires due callbacks, and
//!   blocks in an I/O readiness poller up to the next deadline.
//! * **Promise**: a one-shot result cell with synchronous done-callbacks.
//! * **Task**: a spawned coroutine driven by the loop, one suspension at a
//!   time, with a private cancellable context.
//! * **Context**: a cancellation tree carrying causes and deadlines.
//! * **AsyncStream**: buffered byte I/O over registered file descriptors,
//!   with line/chunk iterators.
//! * **Mutex / Queue / combinators**: promise-based synchronization and
//!   racing (`wait`, `get_first_result`, `sleep`, `spawn_blocking`).
//!
//! Everything runs on the loop thread; the only cross-thread entry points
//! are the threadsafe callback path and the poller wake-up behind it.

mod callbacks;
mod context;
mod error;
mod event_loop;
mod inbox;
mod poller;
mod promise;
mod select;
mod stream;
mod sync;
mod task;
mod thread;
mod timer;

pub use callbacks::CallbackHandle;
pub use context::{CancelHandle, Context};
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle};
pub use poller::AsyncFd;
pub use promise::{Completion, Promise, Wait};
pub use select::{get_first_result, wait, WaitMode};
pub use stream::{AsyncStream, ByteStream, Chunks, Lines};
pub use sync::{Mutex, Queue};
pub use task::{coroutine, spawn, yield_now, Coroutine, Task, YieldNow};
pub use thread::spawn_blocking;
pub use timer::sleep;
