//! Expiration scheduling.
//!
//! The scheduler keeps a single timer armed for the nearest expiration
//! deadline and runs the owner's sweep when it fires. It depends only on
//! two callbacks:
//! - `find_upcoming(horizon)`: deadlines due at or before `horizon`
//! - `sweep(now)`: remove whatever has expired
//!
//! # Example
//!
//! ```ignore
//! let scheduler = ExpirationScheduler::new(
//!     SchedulerConfig::default(),
//!     move |horizon| deadlines_before(horizon),
//!     move |now| async move { remove_expired(now) },
//! );
//! scheduler.start();
//! scheduler.arm(Timestamp::now() + Duration::from_secs(5));
//! ```

mod scheduler;

pub use scheduler::{ExpirationScheduler, SchedulerConfig, SweepFuture};
