// Copyright 2026 WalB Tools Dev
// SPDX-License-Identifier: Apache-2.0

//! Core types and utilities shared by all WalB components.
//!
//! This crate provides the building blocks the daemons and tools are made of:
//! - The error taxonomy and `Result` alias
//! - The salted 32-bit checksum used by every on-disk format
//! - Compression codecs for diff payloads
//! - Durable small-file I/O (temp file + fdatasync + rename)
//! - Configuration loading
//! - The transition-table state machine used by the per-volume state files

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checksum;
pub mod compress;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod state_machine;

pub use compress::Compression;
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use state_machine::{StateMachine, StateTransaction};

/// Logical block size in bytes. All IO addresses and sizes are in
/// logical blocks.
pub const LOGICAL_BLOCK_SIZE: usize = 512;

/// One mebibyte in bytes.
pub const MEBI: u64 = 1 << 20;

/// Size of a volume uuid in bytes.
pub const UUID_SIZE: usize = 16;

/// Default maximum IO size for diff records produced by converters,
/// in logical blocks (64 KiB).
pub const DEFAULT_MAX_IO_LB: u32 = 128;
