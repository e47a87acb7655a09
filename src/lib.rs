pub mod collab;
pub mod config;
pub mod dependency;
pub mod errors;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod merge;
pub mod prd;
pub mod stagnation;

#[cfg(test)]
pub(crate) mod testing;
