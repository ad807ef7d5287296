pub mod droid;
pub mod fee_table;

pub use droid::*;
pub use fee_table::*;
