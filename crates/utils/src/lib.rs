//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.

mod command;
pub use command::*;
mod errors;
pub use errors::*;
mod path;
pub use path::*;
mod runner;
pub use runner::*;
/// Test doubles for the capability traits
pub mod testing;
