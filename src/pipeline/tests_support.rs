//! Test-only re-export of the crate's fake collaborators, so pipeline
//! submodules' `#[cfg(test)]` blocks can `use super::tests_support::*`
//! without reaching across to the crate root.
#![cfg(test)]

pub use crate::testing::{FailingDataLoader, InMemoryDataCache, StaticDataLoader, SuspendableDataLoader};
