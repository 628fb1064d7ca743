#![warn(missing_docs)]
//! Cooperative microthreads for frame loops.
//!
//! A [Scheduler] multiplexes many long-lived units of work ("microthreads",
//! typically game scripts) onto the ticks of a frame loop. Bodies are
//! ordinary futures; they suspend at the frame boundary, on a [SignalGate],
//! on timers, on blocking work or on any other future, and are only ever
//! resumed inside [Scheduler::run_tick], in priority order.
pub mod blocking;
pub mod config;
pub mod cx;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod gate;
pub mod logging;
pub mod microthread;
pub mod scheduler;
pub mod time;
pub mod utils;

pub use config::{FaultPolicy, SchedulerConfig};
pub use cx::MicroThreadCx;
pub use error::{BodyResult, Canceled, Fault, TickError};
pub use gate::SignalGate;
pub use microthread::{MicroThread, MicroThreadId, MicroThreadOptions, MicroThreadState, Priority, ScheduleMode};
pub use scheduler::{Scheduler, TickReport};
