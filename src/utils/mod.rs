//! Various utilities functions and types

pub mod clock;
mod fd;
mod geometry;
pub(crate) mod ids;

pub use self::clock::{Monotonic, TimeSource};
pub use self::fd::{DevPath, DeviceFd};
pub use self::geometry::{Buffer, Coordinate, Display, Point, Rectangle, Size, Transform};

/// Recover the guard of a poisoned lock
///
/// State behind the crate's locks is only mutated through complete
/// transactions, so a panic in another holder cannot leave it half-written.
pub(crate) fn unpoison<T>(result: std::sync::LockResult<T>) -> T {
    result.unwrap_or_else(std::sync::PoisonError::into_inner)
}
