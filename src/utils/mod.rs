//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod timer;

pub use error::OrdercastError;
pub use print::logger_init;
pub use timer::Timer;
