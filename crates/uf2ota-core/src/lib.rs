//! Streaming UF2/OTA engine for LibreTiny-style IoT devices.
//!
//! The apply path consumes 512-byte UF2 blocks one at a time, reads the
//! metadata tags they carry, routes payloads to a flash partition
//! chosen by the device's OTA scheme and commits them through an
//! injected flash device, coalescing erases along the way. The pack
//! path assembles the same block/tag format from firmware images so
//! that packaging and on-device application stay bit-exact inverses.

use thiserror::Error;

pub mod binpatch;
pub mod block;
pub mod family;
pub mod ota;
pub mod pack;
pub mod partition;
pub mod reader;
pub mod scheme;
pub mod tags;

pub use block::{Uf2Block, UF2_BLOCK_SIZE, UF2_DATA_SIZE};
pub use family::Family;
pub use ota::{FirmwareInfo, OtaContext};
pub use pack::{ImageInput, PackageBuilder};
pub use partition::{FlashDevice, FlashRegistry, Partition, PartitionTable};
pub use reader::{DataChunk, PackageReader};
pub use scheme::OtaScheme;
pub use tags::Tag;

/// Outcome of feeding one block to the engine: either the block was
/// processed, or it carried nothing for this device and the caller
/// should keep streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Ok,
    Ignored,
}

/// Everything that can end an update stream. Apart from the block that
/// merely gets [`BlockStatus::Ignored`], every error is fatal: the
/// caller aborts and drops the context. Flash is never rolled back;
/// callers needing atomicity run a dual-partition scheme.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Uf2OtaError {
    #[error("wrong magic numbers")]
    Magic,
    #[error("family ID mismatch (expected {expected:#010x}, found {found:#010x})")]
    Family { expected: u32, found: u32 },
    #[error("block is not a header")]
    NotHeader,
    #[error("unknown or incompatible OTA format version")]
    OtaVersion,
    #[error("no data for the current OTA scheme")]
    OtaWrong,
    #[error("no partition named {0:?} in the partition table")]
    PartitionNotFound(String),
    #[error("invalid partition info")]
    PartitionInvalid,
    #[error("data block arrived before a partition was declared")]
    PartitionUnset,
    #[error("tags do not fit in the block")]
    DataTooLong,
    #[error("sequence number mismatch (expected {expected}, found {found})")]
    SeqMismatch { expected: u32, found: u32 },
    #[error("erasing flash failed")]
    EraseFailed,
    #[error("writing to flash failed")]
    WriteFailed,
    #[error("short flash write ({written} of {requested} bytes)")]
    WriteLength { requested: u32, written: u32 },
}
