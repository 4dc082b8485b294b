use crate::binpatch;
use crate::block::{Uf2Block, UF2_BLOCK_SIZE};
use crate::ota::FirmwareInfo;
use crate::partition::{parse_table, Partition};
use crate::scheme::{select_partition, OtaScheme};
use crate::tags::{Tag, TagIter};
use crate::Uf2OtaError;
use log::warn;
use std::io::{self, Read};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("failed to read package")]
    Io(#[from] io::Error),
    #[error("file size {0} is not a multiple of {UF2_BLOCK_SIZE} (not a UF2 file?)")]
    OddSize(usize),
    #[error("package contains no valid blocks")]
    Empty,
    #[error("package does not start with a header block")]
    NoHeader,
    #[error("unsupported package format")]
    Format,
    #[error("broken package")]
    Block(#[from] Uf2OtaError),
}

/// A contiguous run of firmware data for one partition, assembled from
/// consecutive blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub partition: String,
    /// Offset within the partition, as carried by the blocks.
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Host-side view of a whole UF2 package: the inverse of the on-device
/// writer, used by flasher tooling to inspect packages and extract the
/// flat images for a chosen scheme.
pub struct PackageReader {
    blocks: Vec<Uf2Block>,
}

impl PackageReader {
    /// Reads and frames a whole package. Records with broken magic
    /// words are skipped with a warning, the way forgiving UF2 readers
    /// behave; a package without a leading header block is rejected.
    pub fn read(mut input: impl Read) -> Result<Self, ReadError> {
        let mut raw = Vec::new();
        input.read_to_end(&mut raw)?;
        if raw.len() % UF2_BLOCK_SIZE != 0 {
            return Err(ReadError::OddSize(raw.len()));
        }

        let mut blocks = Vec::with_capacity(raw.len() / UF2_BLOCK_SIZE);
        for (index, record) in raw.chunks_exact(UF2_BLOCK_SIZE).enumerate() {
            match Uf2Block::decode(record.try_into().expect("chunked to 512")) {
                Ok(block) => blocks.push(block),
                Err(_) => warn!("record at offset {:#x} has bad magic, skipping", index * UF2_BLOCK_SIZE),
            }
        }
        if blocks.is_empty() {
            return Err(ReadError::Empty);
        }

        let reader = Self { blocks };
        let header = &reader.blocks[0];
        if header.payload_size.get() != 0 || !header.has_tags() {
            return Err(ReadError::NoHeader);
        }
        if !reader.header_tags().any(|(raw, _)| raw == Tag::OtaFormat2.raw()) {
            return Err(ReadError::Format);
        }
        Ok(reader)
    }

    pub fn blocks(&self) -> &[Uf2Block] {
        &self.blocks
    }

    pub fn family_id(&self) -> Option<u32> {
        let header = &self.blocks[0];
        header.has_family_id().then(|| header.file_size.get())
    }

    fn header_tags(&self) -> TagIter<'_> {
        TagIter::over_block(&self.blocks[0])
    }

    /// Firmware metadata from the header block.
    pub fn info(&self) -> FirmwareInfo {
        let mut info = FirmwareInfo::default();
        for (raw, payload) in self.header_tags() {
            let text = || Some(String::from_utf8_lossy(payload).into_owned());
            match Tag::from_raw(raw) {
                Some(Tag::Firmware) => info.fw_name = text(),
                Some(Tag::Version) => info.fw_version = text(),
                Some(Tag::LtVersion) => info.lt_version = text(),
                Some(Tag::Board) => info.board = text(),
                _ => {}
            }
        }
        info
    }

    /// Build timestamp from the header, when the packer recorded one.
    pub fn build_date(&self) -> Option<u32> {
        self.header_tags().find_map(|(raw, payload)| {
            (raw == Tag::BuildDate.raw() && payload.len() >= 4)
                .then(|| u32::from_le_bytes(payload[..4].try_into().unwrap()))
        })
    }

    /// The partition table embedded in the package, if any.
    pub fn partition_table(&self) -> Result<Option<Vec<Partition>>, Uf2OtaError> {
        for block in &self.blocks {
            for (raw, payload) in TagIter::over_block(block) {
                if raw == Tag::FalPtable.raw() {
                    return parse_table(payload).map(Some);
                }
            }
        }
        Ok(None)
    }

    /// Schemes the package carries data for, from `OTA_PART_LIST`.
    pub fn schemes(&self) -> Vec<OtaScheme> {
        self.header_tags()
            .find(|(raw, _)| *raw == Tag::OtaPartList.raw())
            .map(|(_, payload)| {
                OtaScheme::ALL
                    .into_iter()
                    .filter(|scheme| payload.len() >= 3 && scheme.nibble(payload) != 0)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Walks the data blocks as the device would under `scheme`,
    /// following `OTA_PART_INFO` routing and applying binpatches, and
    /// gathers the payloads into contiguous per-partition chunks.
    pub fn collect(&self, scheme: OtaScheme) -> Result<Vec<DataChunk>, Uf2OtaError> {
        let mut chunks: Vec<DataChunk> = Vec::new();
        let mut part: Option<String> = None;

        for block in &self.blocks[1..] {
            let mut patch: Option<&[u8]> = None;
            for (raw, payload) in TagIter::over_block(block) {
                match Tag::from_raw(raw) {
                    Some(Tag::OtaPartInfo) => {
                        part = select_partition(scheme, payload)?.map(str::to_owned);
                    }
                    Some(Tag::Binpatch) => patch = Some(payload),
                    _ => {}
                }
            }

            let len = block.payload_size.get() as usize;
            if len == 0 || block.not_main_flash() {
                continue;
            }
            let Some(partition) = &part else {
                continue;
            };

            let data = if let (true, Some(patch)) = (scheme.requires_binpatch(), patch) {
                let mut area = block.data;
                binpatch::apply(&mut area, patch)?;
                area[..len].to_vec()
            } else {
                block.data[..len].to_vec()
            };

            let offset = block.target_addr.get();
            match chunks.last_mut() {
                Some(last)
                    if last.partition == *partition
                        && last.offset as usize + last.data.len() == offset as usize =>
                {
                    last.data.extend_from_slice(&data);
                }
                _ => chunks.push(DataChunk {
                    partition: partition.clone(),
                    offset,
                    data,
                }),
            }
        }
        Ok(chunks)
    }
}
