// Copyright 2026 WalB Tools Dev
// SPDX-License-Identifier: Apache-2.0

//! Wdiff: the address-indexed diff representation of a wlog range.
//!
//! Two container formats share a 32-byte file header:
//!
//! - **Sorted**: a stream of 4 KiB packs, each holding up to 127 records
//!   followed by their payloads; records appear in strictly increasing
//!   address order with no overlap. A pack with the END flag terminates
//!   the stream.
//! - **Indexed**: an unordered run of compressed payloads followed by
//!   sorted index records and an index-super footer, supporting unsorted
//!   writes during construction and random lookup after close.
//!
//! On top of the formats sit [`DiffMemory`], an overlap-resolving in-memory
//! map, and [`DiffMerger`], the bounded-memory N-way merger.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod header;
mod indexed;
mod mem;
mod merge;
mod pack;
mod record;
mod sorted;

pub use header::{DiffFileHeader, DiffFormat, DIFF_FILE_HEADER_SIZE, WALB_DIFF_VERSION};
pub use indexed::{DiffIndexSuper, IndexedDiffReader, IndexedDiffRecord, IndexedDiffWriter};
pub use mem::{DiffMemory, DiffRecIo};
pub use merge::{DiffMerger, MergeInput};
pub use pack::{DiffPackHeader, DIFF_PACK_SIZE, MAX_N_RECORDS_IN_PACK, MAX_PACK_TOTAL_SIZE};
pub use record::{DiffRecord, DiffRecordKind, DIFF_RECORD_SIZE};
pub use sorted::{SortedDiffReader, SortedDiffWriter};
