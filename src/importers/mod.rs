pub mod cointracking;

pub use cointracking::{CointrackingImporter, Import, ImportError};
