//! kform: execution engine for KRM-native infrastructure graphs.
//!
//! Walks a block graph concurrently, expands `count`/`for_each` loops,
//! renders `$` expressions against a per-module variable store and drives
//! providers for resources and data sources.

pub mod cli;
pub mod core;
pub mod expr;
pub mod provider;
pub mod runners;
