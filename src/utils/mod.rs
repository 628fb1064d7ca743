//! Small standalone helpers used throughout the crate

pub mod cancel_flag;
pub mod thread_pool;
mod unwrap_or;

pub(crate) use unwrap_or::unwrap_or;
