//! Data models for copy-traded positions and wallet signals.

mod position;
mod signal;

pub use position::{ExitTier, NewPosition, Position, PositionStatus, Side, DUST_SHARES};
pub use signal::Signal;
