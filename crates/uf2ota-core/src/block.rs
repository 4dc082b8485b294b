use crate::Uf2OtaError;
use static_assertions::const_assert;
use std::mem;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const UF2_MAGIC_START0: u32 = 0x0A324655;
pub const UF2_MAGIC_START1: u32 = 0x9E5D5157;
pub const UF2_MAGIC_END: u32 = 0x0AB16F30;

pub const UF2_FLAG_NOT_MAIN_FLASH: u32 = 0x00000001;
pub const UF2_FLAG_FILE_CONTAINER: u32 = 0x00001000;
pub const UF2_FLAG_FAMILY_ID_PRESENT: u32 = 0x00002000;
pub const UF2_FLAG_MD5_PRESENT: u32 = 0x00004000;
pub const UF2_FLAG_TAGS_PRESENT: u32 = 0x00008000;

const UF2_FLAGS_DEFINED: u32 = UF2_FLAG_NOT_MAIN_FLASH
    | UF2_FLAG_FILE_CONTAINER
    | UF2_FLAG_FAMILY_ID_PRESENT
    | UF2_FLAG_MD5_PRESENT
    | UF2_FLAG_TAGS_PRESENT;

pub const UF2_BLOCK_SIZE: usize = 512;
pub const UF2_DATA_SIZE: usize = 476;
/// Trailer carried at the end of the data area when `has_md5` is set:
/// target address, payload length and a raw MD5 digest. Opaque to the
/// engine, which only has to keep tag iteration away from it.
pub const UF2_MD5_TRAILER_SIZE: usize = 24;

/// One 512-byte UF2 block. All multi-byte fields are little-endian on
/// the wire regardless of the host.
#[repr(C)]
#[derive(Clone, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct Uf2Block {
    pub magic_start0: U32,
    pub magic_start1: U32,
    pub flags: U32,
    pub target_addr: U32,
    pub payload_size: U32,
    pub block_seq: U32,
    pub block_count: U32,
    pub file_size: U32, // or family_id
    pub data: [u8; UF2_DATA_SIZE],
    pub magic_end: U32,
}

const_assert!(mem::size_of::<Uf2Block>() == UF2_BLOCK_SIZE);

impl Default for Uf2Block {
    fn default() -> Self {
        Self {
            magic_start0: U32::new(UF2_MAGIC_START0),
            magic_start1: U32::new(UF2_MAGIC_START1),
            flags: U32::ZERO,
            target_addr: U32::ZERO,
            payload_size: U32::ZERO,
            block_seq: U32::ZERO,
            block_count: U32::ZERO,
            file_size: U32::ZERO,
            data: [0; UF2_DATA_SIZE],
            magic_end: U32::new(UF2_MAGIC_END),
        }
    }
}

impl Uf2Block {
    /// Decodes a raw 512-byte record, rejecting it unless all three
    /// magic words match. Flags are carried verbatim; tags are not
    /// interpreted here.
    pub fn decode(raw: &[u8; UF2_BLOCK_SIZE]) -> Result<Self, Uf2OtaError> {
        let block = Uf2Block::read_from_bytes(&raw[..]).expect("size checked above");
        if block.magic_start0.get() != UF2_MAGIC_START0
            || block.magic_start1.get() != UF2_MAGIC_START1
            || block.magic_end.get() != UF2_MAGIC_END
        {
            return Err(Uf2OtaError::Magic);
        }
        Ok(block)
    }

    /// Serializes the block, forcing the magic words and masking
    /// reserved flag bits to zero.
    pub fn encode(&self) -> [u8; UF2_BLOCK_SIZE] {
        let mut block = self.clone();
        block.magic_start0 = U32::new(UF2_MAGIC_START0);
        block.magic_start1 = U32::new(UF2_MAGIC_START1);
        block.magic_end = U32::new(UF2_MAGIC_END);
        block.flags = U32::new(block.flags.get() & UF2_FLAGS_DEFINED);

        let mut out = [0u8; UF2_BLOCK_SIZE];
        out.copy_from_slice(block.as_bytes());
        out
    }

    pub fn has_magic(&self) -> bool {
        self.magic_start0.get() == UF2_MAGIC_START0
            && self.magic_start1.get() == UF2_MAGIC_START1
            && self.magic_end.get() == UF2_MAGIC_END
    }

    pub fn not_main_flash(&self) -> bool {
        self.flags.get() & UF2_FLAG_NOT_MAIN_FLASH != 0
    }

    pub fn is_file_container(&self) -> bool {
        self.flags.get() & UF2_FLAG_FILE_CONTAINER != 0
    }

    pub fn has_family_id(&self) -> bool {
        self.flags.get() & UF2_FLAG_FAMILY_ID_PRESENT != 0
    }

    pub fn has_md5(&self) -> bool {
        self.flags.get() & UF2_FLAG_MD5_PRESENT != 0
    }

    pub fn has_tags(&self) -> bool {
        self.flags.get() & UF2_FLAG_TAGS_PRESENT != 0
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags = U32::new(self.flags.get() | flag);
    }

    /// End of the area available to payload and tags; the MD5 trailer,
    /// if present, owns the last 24 bytes.
    pub fn data_end(&self) -> usize {
        if self.has_md5() {
            UF2_DATA_SIZE - UF2_MD5_TRAILER_SIZE
        } else {
            UF2_DATA_SIZE
        }
    }
}
