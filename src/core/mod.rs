//! Core engine logic: types, store, rendering, loops, graph, scheduling.

pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod handler;
pub mod loops;
pub mod parser;
pub mod recorder;
pub mod render;
pub mod store;
pub mod types;
