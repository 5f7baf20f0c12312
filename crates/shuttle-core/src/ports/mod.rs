//! Ports - seams to the outside world.
//!
//! The scheduler never reads the system clock or sleeps directly; it goes
//! through these traits so tests can swap in fixed or virtual time.

pub mod clock;
pub mod timer;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::timer::{Timer, TokioTimer, checked_deadline, deadline_after};
