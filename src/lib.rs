//! Qntropy: transaction-processing core for Spanish IRPF crypto tax
//! reporting. Normalizes an aggregator export into a canonical stream,
//! repairs history gaps with audited synthetic transactions, values
//! everything in EUR through a cached price oracle, and runs a strict FIFO
//! lot engine to produce capital gains and movable-capital income.

pub mod assets;
pub mod cmd;
pub mod config;
pub mod error;
pub mod importers;
pub mod pipeline;
pub mod prices;
pub mod reconcile;
pub mod sink;
pub mod snapshot;
pub mod tax;
pub mod transaction;
