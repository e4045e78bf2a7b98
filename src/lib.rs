//! fretsearch - chord voicing similarity search
//!
//! Keeps a corpus of fretted chord voicings whose embeddings are split into
//! named musical segments, and answers nearest-neighbour queries through
//! interchangeable execution strategies (in-memory scan, GPU kernel, SQLite
//! store) that can be benchmarked and switched while the daemon runs.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod retrieval;
pub mod storage;
pub mod strategy;

pub use error::{FretError, Result};
