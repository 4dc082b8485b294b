use crate::binpatch;
use crate::block::{Uf2Block, UF2_DATA_SIZE};
use crate::partition::{parse_table, FlashRegistry, Partition, PartitionTable};
use crate::scheme::{check_part_list, select_partition, OtaScheme};
use crate::tags::{Tag, TagIter, TAG_HEADER_SIZE};
use crate::{BlockStatus, Uf2OtaError};
use log::{debug, warn};

/// Firmware metadata extracted from the header block's tags.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub fw_name: Option<String>,
    pub fw_version: Option<String>,
    pub lt_version: Option<String>,
    pub board: Option<String>,
}

/// Flash window cleared by the last erase. The driver may over-erase
/// whole sectors, so the window often covers several upcoming blocks.
#[derive(Debug, Clone, Copy)]
struct ErasedRegion {
    offset: u32,
    length: u32,
}

impl ErasedRegion {
    fn contains(&self, offset: u32, length: u32) -> bool {
        offset >= self.offset
            && u64::from(offset) + u64::from(length) <= u64::from(self.offset) + u64::from(self.length)
    }
}

/// Tags that only matter for the block they travelled with.
#[derive(Default)]
struct BlockTags {
    binpatch: Option<Vec<u8>>,
}

/// Streaming state for one OTA update. Created per stream, fed decoded
/// blocks in order, dropped when the stream ends or on the first fatal
/// error. The partition table starts out borrowed from the platform; a
/// `FAL_PTABLE` tag swaps in a table owned by the stream.
pub struct OtaContext<'a> {
    scheme: OtaScheme,
    family_id: u32,
    seq: u32,
    written: u32,
    is_format_ok: bool,
    is_part_set: bool,
    part: Option<usize>,
    erased: Option<ErasedRegion>,
    table: PartitionTable<'a>,
    flash: &'a mut dyn FlashRegistry,
}

impl<'a> OtaContext<'a> {
    pub fn new(
        scheme: OtaScheme,
        family_id: u32,
        table: &'a [Partition],
        flash: &'a mut dyn FlashRegistry,
    ) -> Self {
        Self {
            scheme,
            family_id,
            seq: 0,
            written: 0,
            is_format_ok: false,
            is_part_set: false,
            part: None,
            erased: None,
            table: PartitionTable::Borrowed(table),
            flash,
        }
    }

    /// Number of blocks accepted so far.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Bytes committed to flash so far.
    pub fn written(&self) -> u32 {
        self.written
    }

    /// The partition the stream currently routes data blocks to, if
    /// the running scheme has one.
    pub fn target_partition(&self) -> Option<&Partition> {
        self.part.map(|index| &self.table.entries()[index])
    }

    /// Validates framing common to every block: magic words, the
    /// family-ID flag and the expected family. File containers are
    /// ignored rather than rejected.
    pub fn check_block(&self, block: &Uf2Block) -> Result<BlockStatus, Uf2OtaError> {
        if !block.has_magic() {
            return Err(Uf2OtaError::Magic);
        }
        if block.is_file_container() {
            // ignore file containers, for now
            return Ok(BlockStatus::Ignored);
        }
        let found = block.file_size.get();
        if !block.has_family_id() || found != self.family_id {
            return Err(Uf2OtaError::Family {
                expected: self.family_id,
                found,
            });
        }
        Ok(BlockStatus::Ok)
    }

    /// Accepts the stream header: block 0 must carry tags and no
    /// payload, and its tag set must include `OTA_FORMAT_2`. Firmware
    /// metadata is copied into `info` when the caller wants it.
    pub fn parse_header(
        &mut self,
        block: &Uf2Block,
        info: Option<&mut FirmwareInfo>,
    ) -> Result<(), Uf2OtaError> {
        if !block.has_tags() || block.is_file_container() || block.payload_size.get() != 0 {
            return Err(Uf2OtaError::NotHeader);
        }
        self.parse_block(block, info)?;
        if !self.is_format_ok {
            return Err(Uf2OtaError::OtaVersion);
        }
        Ok(())
    }

    /// Feeds one block to the update. Routes the payload through the
    /// current partition, applying a binpatch when the scheme calls for
    /// one, erasing ahead of the write when the last erased window does
    /// not already cover the target region.
    pub fn write_block(&mut self, block: &mut Uf2Block) -> Result<BlockStatus, Uf2OtaError> {
        if let BlockStatus::Ignored = self.check_block(block)? {
            return Ok(BlockStatus::Ignored);
        }
        if self.seq == 0 {
            self.parse_header(block, None)?;
            return Ok(BlockStatus::Ok);
        }

        let tags = self.parse_block(block, None)?;

        let len = block.payload_size.get();
        if block.not_main_flash() || len == 0 {
            // nothing to flash in this block
            return Ok(BlockStatus::Ignored);
        }
        if !self.is_part_set {
            // a data block arrived before any OTA_PART_INFO
            return Err(Uf2OtaError::PartitionUnset);
        }
        let Some(index) = self.part else {
            // this block carries data for other schemes only
            return Ok(BlockStatus::Ignored);
        };

        if self.scheme.requires_binpatch() {
            if let Some(patch) = &tags.binpatch {
                binpatch::apply(&mut block.data, patch)?;
            }
        }

        let part = &self.table.entries()[index];
        let (part_offset, part_length) = (part.offset, part.length);
        let flash_name = part.flash_name.clone();

        let addr = block.target_addr.get();
        if len as usize > UF2_DATA_SIZE
            || addr.checked_add(len).map_or(true, |end| end > part_length)
        {
            warn!("block {} at {addr:#x}+{len} overflows the target partition", self.seq - 1);
            return Err(Uf2OtaError::WriteFailed);
        }
        let offset = part_offset + addr;

        let need_erase = !self.erased.is_some_and(|region| region.contains(offset, len));

        let Some(flash) = self.flash.find(&flash_name) else {
            warn!("flash device {flash_name:?} not found, skipping block");
            return Ok(BlockStatus::Ignored);
        };

        if need_erase {
            let erased = flash.erase(offset, len).map_err(|err| {
                warn!("erase at {offset:#x} failed: {err}");
                Uf2OtaError::EraseFailed
            })?;
            self.erased = Some(ErasedRegion {
                offset,
                length: erased,
            });
        }

        let written = flash
            .write(offset, &block.data[..len as usize])
            .map_err(|err| {
                warn!("write at {offset:#x} failed: {err}");
                Uf2OtaError::WriteFailed
            })?;
        if written < len {
            return Err(Uf2OtaError::WriteLength {
                requested: len,
                written,
            });
        }

        self.written += written;
        debug!("block {} -> {offset:#x} ({len} bytes)", self.seq - 1);
        Ok(BlockStatus::Ok)
    }

    /// Checks the sequence number, then walks the block's tags and
    /// updates the context. Tags scoped to a single block (the
    /// binpatch) are handed back to the caller instead of being stored.
    fn parse_block(
        &mut self,
        block: &Uf2Block,
        mut info: Option<&mut FirmwareInfo>,
    ) -> Result<BlockTags, Uf2OtaError> {
        let found = block.block_seq.get();
        if found != self.seq {
            return Err(Uf2OtaError::SeqMismatch {
                expected: self.seq,
                found,
            });
        }
        self.seq += 1;

        let mut tags = BlockTags::default();
        if !block.has_tags() {
            return Ok(tags);
        }

        // at least the terminator must fit behind the payload
        if block.payload_size.get() as usize > block.data_end() - TAG_HEADER_SIZE {
            return Err(Uf2OtaError::DataTooLong);
        }

        for (raw, payload) in TagIter::over_block(block) {
            let Some(tag) = Tag::from_raw(raw) else {
                debug!("skipping unknown tag {raw:#08x} ({} bytes)", payload.len());
                continue;
            };
            match tag {
                Tag::Firmware => copy_str(info.as_deref_mut(), payload, |i| &mut i.fw_name),
                Tag::Version => copy_str(info.as_deref_mut(), payload, |i| &mut i.fw_version),
                Tag::LtVersion => copy_str(info.as_deref_mut(), payload, |i| &mut i.lt_version),
                Tag::Board => copy_str(info.as_deref_mut(), payload, |i| &mut i.board),
                Tag::OtaFormat2 => self.is_format_ok = true,
                Tag::OtaFormat1 => return Err(Uf2OtaError::OtaVersion),
                Tag::OtaPartList => check_part_list(self.scheme, payload)?,
                Tag::OtaPartInfo => self.parse_part_info(payload)?,
                Tag::Binpatch => tags.binpatch = Some(payload.to_vec()),
                Tag::FalPtable => {
                    let table = parse_table(payload)?;
                    debug!("stream supplies its own partition table ({} entries)", table.len());
                    self.table = PartitionTable::Owned(table);
                    // any routed partition belonged to the old table
                    self.part = None;
                }
                // carried for host tooling; the engine has no use for them
                Tag::PageSize | Tag::Sha2 | Tag::Device | Tag::DeviceId | Tag::BuildDate => {}
            }
        }

        Ok(tags)
    }

    /// Applies an `OTA_PART_INFO` tag: re-routes subsequent data blocks
    /// to the partition named for the running scheme, or to nowhere
    /// when the scheme's index is zero.
    fn parse_part_info(&mut self, payload: &[u8]) -> Result<(), Uf2OtaError> {
        self.part = None;
        // the erased window belonged to the previous partition
        self.erased = None;
        self.is_part_set = true;

        let Some(name) = select_partition(self.scheme, payload)? else {
            debug!("no partition for {:?} in this section", self.scheme);
            return Ok(());
        };
        let index = self
            .table
            .find(name)
            .ok_or_else(|| Uf2OtaError::PartitionNotFound(name.to_owned()))?;
        let part = &self.table.entries()[index];
        debug!(
            "routing to partition {:?} on {:?} at {:#x}",
            part.name, part.flash_name, part.offset
        );
        if self.flash.find(&part.flash_name).is_none() {
            warn!("flash device {:?} not registered", part.flash_name);
        }
        self.part = Some(index);
        Ok(())
    }
}

fn copy_str(
    info: Option<&mut FirmwareInfo>,
    payload: &[u8],
    field: impl FnOnce(&mut FirmwareInfo) -> &mut Option<String>,
) {
    if let Some(info) = info {
        *field(info) = Some(String::from_utf8_lossy(payload).into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{UF2_FLAG_FAMILY_ID_PRESENT, UF2_FLAG_TAGS_PRESENT};
    use crate::tags::TagWriter;
    use std::io;
    use zerocopy::little_endian::U32;

    const FAMILY: u32 = 0x675a40b0;

    struct NoFlash;

    impl FlashRegistry for NoFlash {
        fn find(&mut self, _name: &str) -> Option<&mut dyn crate::partition::FlashDevice> {
            None
        }
    }

    fn header_block(tags: &[(Tag, &[u8])]) -> Uf2Block {
        let mut block = Uf2Block::default();
        block.set_flag(UF2_FLAG_FAMILY_ID_PRESENT | UF2_FLAG_TAGS_PRESENT);
        block.file_size = U32::new(FAMILY);
        let mut writer = TagWriter::new(&mut block.data);
        for (tag, payload) in tags {
            writer.emit(*tag, payload).unwrap();
        }
        block
    }

    #[test]
    fn header_requires_format_tag() {
        let mut flash = NoFlash;
        let mut ctx = OtaContext::new(OtaScheme::DeviceSingle, FAMILY, &[], &mut flash);
        let block = header_block(&[(Tag::Firmware, b"demo")]);
        assert_eq!(
            ctx.parse_header(&block, None),
            Err(Uf2OtaError::OtaVersion)
        );
    }

    #[test]
    fn legacy_format_tag_is_rejected() {
        let mut flash = NoFlash;
        let mut ctx = OtaContext::new(OtaScheme::DeviceSingle, FAMILY, &[], &mut flash);
        let block = header_block(&[(Tag::OtaFormat1, b"")]);
        assert_eq!(
            ctx.parse_header(&block, None),
            Err(Uf2OtaError::OtaVersion)
        );
    }

    #[test]
    fn header_must_have_no_payload() {
        let mut flash = NoFlash;
        let mut ctx = OtaContext::new(OtaScheme::DeviceSingle, FAMILY, &[], &mut flash);
        let mut block = header_block(&[(Tag::OtaFormat2, b"")]);
        block.payload_size = U32::new(16);
        assert_eq!(ctx.parse_header(&block, None), Err(Uf2OtaError::NotHeader));
    }

    #[test]
    fn check_block_validates_family() {
        let mut flash = NoFlash;
        let ctx = OtaContext::new(OtaScheme::DeviceSingle, FAMILY, &[], &mut flash);

        let mut block = Uf2Block::default();
        block.set_flag(UF2_FLAG_FAMILY_ID_PRESENT);
        block.file_size = U32::new(0x1234);
        assert_eq!(
            ctx.check_block(&block),
            Err(Uf2OtaError::Family {
                expected: FAMILY,
                found: 0x1234
            })
        );

        let block = Uf2Block::default(); // family flag missing entirely
        assert!(matches!(
            ctx.check_block(&block),
            Err(Uf2OtaError::Family { .. })
        ));
    }

    #[test]
    fn header_info_is_extracted() {
        let mut flash = NoFlash;
        let mut ctx = OtaContext::new(OtaScheme::DeviceSingle, FAMILY, &[], &mut flash);
        let block = header_block(&[
            (Tag::OtaFormat2, b""),
            (Tag::Firmware, b"demo"),
            (Tag::Version, b"1.0.0"),
            (Tag::Board, b"generic"),
        ]);
        let mut info = FirmwareInfo::default();
        ctx.parse_header(&block, Some(&mut info)).unwrap();
        assert_eq!(info.fw_name.as_deref(), Some("demo"));
        assert_eq!(info.fw_version.as_deref(), Some("1.0.0"));
        assert_eq!(info.board.as_deref(), Some("generic"));
        assert_eq!(info.lt_version, None);
        assert_eq!(ctx.seq(), 1);
    }

    #[test]
    fn oversized_payload_with_tags_is_too_long() {
        let mut flash = NoFlash;
        let mut ctx = OtaContext::new(OtaScheme::DeviceSingle, FAMILY, &[], &mut flash);
        let header = header_block(&[(Tag::OtaFormat2, b"")]);
        ctx.parse_header(&header, None).unwrap();

        let mut block = Uf2Block::default();
        block.set_flag(UF2_FLAG_FAMILY_ID_PRESENT | UF2_FLAG_TAGS_PRESENT);
        block.file_size = U32::new(FAMILY);
        block.block_seq = U32::new(1);
        block.payload_size = U32::new(473); // 476 - 4 + 1
        assert_eq!(
            ctx.write_block(&mut block),
            Err(Uf2OtaError::DataTooLong)
        );
    }

    #[test]
    fn missing_flash_device_skips_the_block() {
        let table = [Partition::new("app", "ghost", 0, 0x1000)];
        let mut flash = NoFlash;
        let mut ctx = OtaContext::new(OtaScheme::DeviceSingle, FAMILY, &table, &mut flash);

        let header = header_block(&[(Tag::OtaFormat2, b"")]);
        ctx.parse_header(&header, None).unwrap();

        let mut info = vec![0u8; 3];
        OtaScheme::DeviceSingle.set_nibble(&mut info, 1);
        info.extend_from_slice(b"app\0");
        let mut block = Uf2Block::default();
        block.set_flag(UF2_FLAG_FAMILY_ID_PRESENT | UF2_FLAG_TAGS_PRESENT);
        block.file_size = U32::new(FAMILY);
        block.block_seq = U32::new(1);
        block.payload_size = U32::new(64);
        let mut writer = TagWriter::new(&mut block.data[64..]);
        writer.emit(Tag::OtaPartInfo, &info).unwrap();

        assert_eq!(ctx.write_block(&mut block), Ok(BlockStatus::Ignored));
        assert_eq!(ctx.written(), 0);
    }

    // the registry trait stays object-safe
    #[allow(dead_code)]
    fn registry_is_object_safe(registry: &mut dyn FlashRegistry) -> Option<io::Result<u32>> {
        registry.find("x").map(|dev| dev.erase(0, 0))
    }
}
