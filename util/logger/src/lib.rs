//! Reexports the `log` facade so all crates share one logging front-end.
//!
//! The embedding simulator owns logger installation; library crates only
//! emit through these macros.

pub use log::{self, debug, error, info, log_enabled, trace, warn, Level};
