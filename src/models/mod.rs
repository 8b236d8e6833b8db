// src/models/mod.rs
// Finance records as they travel to the aggregation and report workers.

mod records;

pub use records::*;
