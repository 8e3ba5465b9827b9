//! lfs-store - object lifecycle and content storage core for a Git LFS server
//!
//! This crate provides:
//! - Content-addressable byte storage verified against each object's SHA-256
//!   oid (local filesystem, S3-compatible object storage)
//! - Object metadata with a pending -> committed lifecycle, projects and
//!   users (redb, Cassandra/ScyllaDB, SQLite)
//! - HTTP Basic authorization against an internal users table or an external
//!   credential store
//! - An audit pass that verifies stored content against committed metadata

pub mod audit;
pub mod config;
pub mod content;
pub mod meta;
#[cfg(test)]
pub mod testutil;
