//! SQLite-backed persistence for the gpud plugin ledger.

pub mod ledger;

pub use ledger::{SqliteLedger, DEFAULT_TABLE_NAME};
