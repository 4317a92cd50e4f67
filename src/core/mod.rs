//! Core module: reactor satu-thread dan primitive-nya
//!
//! Prinsip desain:
//! - Satu EventLoop per thread, semua state loop `!Send`
//! - Satu-satunya jalur lintas-thread: `LoopHandle` (channel + waker)
//! - Buffer tumbuh sendiri, tidak pernah blocking

mod buffer;
mod event_loop;
mod fd_event;
mod timer;

pub use buffer::TcpBuffer;
pub use event_loop::{EventLoop, LoopHandle, Task, DEFAULT_EVENTS_CAPACITY};
pub use fd_event::{Callback, FdEvent, FdInterest};
pub use timer::{TimerEvent, TimerHandle, TimerQueue};
