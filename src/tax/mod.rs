pub mod events;
pub mod fifo;

pub use events::{
    tax_year, AuditCategory, AuditEntry, Holding, IncomeCategory, LotShare, TaxEvent, TaxEventKind,
};
pub use fifo::{FifoEngine, FifoError, Lot, TaxComputation};
