//! Core data types: enums, order/account structs, and strategy signals.

pub mod enums;
pub mod signal;
pub mod trading;

pub use enums::*;
pub use signal::*;
pub use trading::*;
