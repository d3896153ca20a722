//! Parquet-backed runner for `erc-transfers`.
//!
//! Ingests raw Ethereum logs over JSON-RPC into a local raw log table and
//! runs the decode pipeline against it, writing ERC-20 and ERC-721
//! transfers and checkpoints to their own Parquet tables.

pub mod config;
pub mod ingest;
pub mod lock;
pub mod store;
pub mod tables;
