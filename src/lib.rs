#![warn(clippy::pedantic)]
// Noisy doc/signature lints
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Positional format args are used throughout
#![allow(clippy::uninlined_format_args)]
// Intentional casts for durations, counters and ratios
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
// The task driver and supervisor are naturally long; splitting would be artificial
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod cli;
pub mod config;
pub mod errors;
pub mod providers;
pub mod session;
pub(crate) mod utils;

pub use errors::MetaloopError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
