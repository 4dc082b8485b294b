use crate::binpatch;
use crate::block::{
    Uf2Block, UF2_DATA_SIZE, UF2_FLAG_FAMILY_ID_PRESENT, UF2_FLAG_MD5_PRESENT,
    UF2_FLAG_TAGS_PRESENT, UF2_MD5_TRAILER_SIZE,
};
use crate::family::Family;
use crate::partition::{encode_table, Partition};
use crate::scheme::{OtaScheme, SCHEME_COUNT};
use crate::tags::{Tag, TagWriter, TAG_HEADER_SIZE};
use crate::Uf2OtaError;
use assert_into::AssertInto;
use log::debug;
use md5::{Digest, Md5};
use std::io::{self, Write};
use thiserror::Error;
use zerocopy::little_endian::U32;

/// Payload bytes per data block. Small enough to leave room for tags
/// and binpatches next to every chunk.
pub const PACK_BLOCK_SIZE: usize = 256;

#[derive(Error, Debug)]
pub enum PackError {
    #[error("package assembly failed")]
    Assembly(#[from] Uf2OtaError),
    #[error("image pair lengths differ ({primary} vs {secondary})")]
    ImageLengthMismatch { primary: usize, secondary: usize },
    #[error("binary patch at {offset:#x} does not fit next to its block ({size} > {max})")]
    BinpatchTooLong { offset: u32, size: usize, max: usize },
    #[error("package has no input images")]
    NoInputs,
    #[error("failed to write output")]
    Io(#[from] io::Error),
}

/// One firmware image to be packaged, together with the partitions it
/// targets under each OTA scheme. A pair of images (primary plus its
/// relocated counterpart) is stored once, with per-block binary patches
/// reconstructing the counterpart on devices that need it.
pub struct ImageInput {
    offset: u32,
    primary: Vec<u8>,
    secondary: Option<Vec<u8>>,
    schemes: [Option<String>; SCHEME_COUNT],
}

impl ImageInput {
    pub fn new(data: Vec<u8>, offset: u32) -> Self {
        Self {
            offset,
            primary: data,
            secondary: None,
            schemes: Default::default(),
        }
    }

    pub fn pair(primary: Vec<u8>, secondary: Vec<u8>, offset: u32) -> Result<Self, PackError> {
        if primary.len() != secondary.len() {
            return Err(PackError::ImageLengthMismatch {
                primary: primary.len(),
                secondary: secondary.len(),
            });
        }
        Ok(Self {
            offset,
            primary,
            secondary: Some(secondary),
            schemes: Default::default(),
        })
    }

    /// Routes this image to `partition` when applied under `scheme`.
    pub fn route(mut self, scheme: OtaScheme, partition: &str) -> Self {
        self.schemes[scheme.index()] = Some(partition.to_owned());
        self
    }

    /// Builds the `OTA_PART_INFO` payload: one nibble index per scheme
    /// into the NUL-terminated name list that follows.
    fn part_info(&self) -> Vec<u8> {
        let mut names: Vec<&str> = self
            .schemes
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.dedup();

        let mut payload = vec![0u8; 3];
        for scheme in OtaScheme::ALL {
            if let Some(name) = &self.schemes[scheme.index()] {
                let index = names.iter().position(|n| n == name).unwrap() + 1;
                scheme.set_nibble(&mut payload, index as u8);
            }
        }
        for name in names {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
        }
        payload
    }
}

/// Assembles a UF2/OTA package: a header block carrying the global
/// metadata tags, then the images' data blocks with their routing and
/// binpatch tags. The output stream is exactly what [`crate::ota`]
/// consumes on the device.
pub struct PackageBuilder {
    family: Family,
    fw_name: Option<String>,
    fw_version: Option<String>,
    lt_version: Option<String>,
    board: Option<String>,
    device: Option<String>,
    build_date: Option<u32>,
    ptable: Option<Vec<Partition>>,
    with_md5: bool,
    images: Vec<ImageInput>,
}

impl PackageBuilder {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            fw_name: None,
            fw_version: None,
            lt_version: None,
            board: None,
            device: None,
            build_date: None,
            ptable: None,
            with_md5: false,
            images: Vec::new(),
        }
    }

    /// Firmware name, optionally with a `name:version` suffix.
    pub fn firmware(&mut self, fw: &str) -> &mut Self {
        match fw.split_once(':') {
            Some((name, version)) => {
                self.fw_name = Some(name.to_owned());
                self.fw_version = Some(version.to_owned());
            }
            None => self.fw_name = Some(fw.to_owned()),
        }
        self
    }

    pub fn lt_version(&mut self, version: &str) -> &mut Self {
        self.lt_version = Some(version.to_owned());
        self
    }

    pub fn board(&mut self, board: &str) -> &mut Self {
        self.board = Some(board.to_lowercase());
        self
    }

    pub fn device(&mut self, device: &str) -> &mut Self {
        self.device = Some(device.to_owned());
        self
    }

    pub fn build_date(&mut self, timestamp: u32) -> &mut Self {
        self.build_date = Some(timestamp);
        self
    }

    /// Embeds a partition table, letting the update override the one
    /// compiled into the device.
    pub fn partition_table(&mut self, table: Vec<Partition>) -> &mut Self {
        self.ptable = Some(table);
        self
    }

    /// Appends MD5 trailers to every data block.
    pub fn with_md5(&mut self, enable: bool) -> &mut Self {
        self.with_md5 = enable;
        self
    }

    pub fn image(&mut self, image: ImageInput) -> &mut Self {
        self.images.push(image);
        self
    }

    /// Nibble bitmap of the schemes any image has data for.
    fn part_list(&self) -> [u8; 3] {
        let mut payload = [0u8; 3];
        for scheme in OtaScheme::ALL {
            let covered = self
                .images
                .iter()
                .any(|image| image.schemes[scheme.index()].is_some());
            if covered {
                scheme.set_nibble(&mut payload, 1);
            }
        }
        payload
    }

    fn header_block(&self) -> Result<Uf2Block, PackError> {
        let mut block = Uf2Block::default();
        block.set_flag(UF2_FLAG_FAMILY_ID_PRESENT | UF2_FLAG_TAGS_PRESENT);
        block.file_size = U32::new(self.family.id());
        let mut tags = TagWriter::new(&mut block.data);

        tags.emit(Tag::OtaFormat2, b"")?;
        tags.emit(Tag::OtaPartList, &self.part_list())?;
        if let Some(name) = &self.fw_name {
            tags.emit(Tag::Firmware, name.as_bytes())?;
        }
        if let Some(version) = &self.fw_version {
            tags.emit(Tag::Version, version.as_bytes())?;
        }
        if let Some(version) = &self.lt_version {
            tags.emit(Tag::LtVersion, version.as_bytes())?;
        }
        if let Some(board) = &self.board {
            tags.emit(Tag::Board, board.as_bytes())?;
            let device = self.device.as_deref().unwrap_or("LibreTiny");
            let key = format!("{device} {board}");
            tags.emit(Tag::DeviceId, &crc32fast::hash(key.as_bytes()).to_le_bytes())?;
        }
        if let Some(device) = &self.device {
            tags.emit(Tag::Device, device.as_bytes())?;
        }
        if let Some(date) = self.build_date {
            tags.emit(Tag::BuildDate, &date.to_le_bytes())?;
        }
        if let Some(table) = &self.ptable {
            tags.emit(Tag::FalPtable, &encode_table(table)?)?;
        }
        Ok(block)
    }

    /// Builds the full block sequence, ready to serialize.
    pub fn build(&self) -> Result<Vec<Uf2Block>, PackError> {
        if self.images.is_empty() {
            return Err(PackError::NoInputs);
        }

        let mut blocks = vec![self.header_block()?];

        for image in &self.images {
            // the first block of every image re-routes the stream
            let mut pending: Vec<(Tag, Vec<u8>)> = vec![(Tag::OtaPartInfo, image.part_info())];

            for (index, chunk) in image.primary.chunks(PACK_BLOCK_SIZE).enumerate() {
                let chunk_offset: u32 = (index * PACK_BLOCK_SIZE).assert_into();
                let addr = image.offset + chunk_offset;

                if let Some(secondary) = &image.secondary {
                    let other = &secondary[index * PACK_BLOCK_SIZE..][..chunk.len()];
                    if chunk != other {
                        let patch = binpatch::diff32(chunk, other)?;
                        let used: usize = pending
                            .iter()
                            .map(|(_, payload)| (TAG_HEADER_SIZE + payload.len() + 3) & !3)
                            .sum();
                        let max = self
                            .data_end()
                            .saturating_sub(chunk.len() + used + TAG_HEADER_SIZE);
                        if patch.len() > max {
                            return Err(PackError::BinpatchTooLong {
                                offset: addr,
                                size: patch.len(),
                                max,
                            });
                        }
                        pending.push((Tag::Binpatch, patch));
                    }
                }
                blocks.push(self.data_block(addr, chunk, std::mem::take(&mut pending))?);
            }
        }

        let count: u32 = blocks.len().assert_into();
        for (seq, block) in blocks.iter_mut().enumerate() {
            let seq: u32 = seq.assert_into();
            block.block_seq = U32::new(seq);
            block.block_count = U32::new(count);
        }
        debug!(
            "package assembled: {count} blocks from {} image(s)",
            self.images.len()
        );
        Ok(blocks)
    }

    /// Serializes the package to `out` block by block, in order.
    pub fn write(&self, mut out: impl Write) -> Result<(), PackError> {
        for block in self.build()? {
            out.write_all(&block.encode())?;
        }
        Ok(())
    }

    fn data_end(&self) -> usize {
        if self.with_md5 {
            UF2_DATA_SIZE - UF2_MD5_TRAILER_SIZE
        } else {
            UF2_DATA_SIZE
        }
    }

    fn data_block(
        &self,
        addr: u32,
        chunk: &[u8],
        tags: Vec<(Tag, Vec<u8>)>,
    ) -> Result<Uf2Block, PackError> {
        let len: u32 = chunk.len().assert_into();
        let mut block = Uf2Block::default();
        block.set_flag(UF2_FLAG_FAMILY_ID_PRESENT);
        block.file_size = U32::new(self.family.id());
        block.target_addr = U32::new(addr);
        block.payload_size = U32::new(len);
        block.data[..chunk.len()].copy_from_slice(chunk);

        if self.with_md5 {
            block.set_flag(UF2_FLAG_MD5_PRESENT);
            let digest = Md5::digest(chunk);
            let trailer = &mut block.data[UF2_DATA_SIZE - UF2_MD5_TRAILER_SIZE..];
            trailer[..4].copy_from_slice(&addr.to_le_bytes());
            trailer[4..8].copy_from_slice(&len.to_le_bytes());
            trailer[8..].copy_from_slice(&digest);
        }

        if !tags.is_empty() {
            block.set_flag(UF2_FLAG_TAGS_PRESENT);
            let end = self.data_end();
            let mut writer = TagWriter::new(&mut block.data[chunk.len()..end]);
            for (tag, payload) in &tags {
                writer.emit(*tag, payload)?;
            }
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::TagIter;

    #[test]
    fn header_comes_first_and_carries_the_format_tag() {
        let mut builder = PackageBuilder::new(Family::BK7231T);
        builder
            .firmware("demo:1.0.0")
            .board("Generic-BK7231T")
            .image(ImageInput::new(vec![0xAA; 64], 0).route(OtaScheme::DeviceSingle, "app"));
        let blocks = builder.build().unwrap();

        let header = &blocks[0];
        assert_eq!(header.payload_size.get(), 0);
        assert!(header.has_tags());
        assert_eq!(header.block_seq.get(), 0);
        assert_eq!(header.block_count.get(), blocks.len() as u32);

        let tags: Vec<u32> = TagIter::over_block(header).map(|(raw, _)| raw).collect();
        assert!(tags.contains(&Tag::OtaFormat2.raw()));
        assert!(tags.contains(&Tag::OtaPartList.raw()));
        assert!(tags.contains(&Tag::Firmware.raw()));
        assert!(tags.contains(&Tag::Version.raw()));
        assert!(tags.contains(&Tag::DeviceId.raw()));
    }

    #[test]
    fn part_list_covers_only_routed_schemes() {
        let mut builder = PackageBuilder::new(Family::BK7231N);
        builder.image(
            ImageInput::new(vec![0u8; 16], 0)
                .route(OtaScheme::DeviceDual1, "ota1")
                .route(OtaScheme::DeviceDual2, "ota2"),
        );
        let list = builder.part_list();
        assert_eq!(OtaScheme::DeviceSingle.nibble(&list), 0);
        assert_eq!(OtaScheme::DeviceDual1.nibble(&list), 1);
        assert_eq!(OtaScheme::DeviceDual2.nibble(&list), 1);
        assert_eq!(OtaScheme::FlasherSingle.nibble(&list), 0);
    }

    #[test]
    fn first_data_block_carries_part_info() {
        let mut builder = PackageBuilder::new(Family::BK7231T);
        builder.image(
            ImageInput::new(vec![0x5A; PACK_BLOCK_SIZE * 2], 0x100)
                .route(OtaScheme::DeviceSingle, "app"),
        );
        let blocks = builder.build().unwrap();
        assert_eq!(blocks.len(), 3);

        let first = &blocks[1];
        assert!(first.has_tags());
        assert_eq!(first.target_addr.get(), 0x100);
        let tags: Vec<u32> = TagIter::over_block(first).map(|(raw, _)| raw).collect();
        assert_eq!(tags, vec![Tag::OtaPartInfo.raw()]);

        // later blocks carry data only
        let second = &blocks[2];
        assert!(!second.has_tags());
        assert_eq!(second.target_addr.get(), 0x100 + PACK_BLOCK_SIZE as u32);
    }

    #[test]
    fn image_pairs_get_binpatch_tags_where_they_differ() {
        let primary = vec![0x11; PACK_BLOCK_SIZE * 2];
        let mut secondary = primary.clone();
        secondary[PACK_BLOCK_SIZE + 8..PACK_BLOCK_SIZE + 12]
            .copy_from_slice(&0xDEADBEEFu32.to_le_bytes());

        let mut builder = PackageBuilder::new(Family::RTL8710B);
        builder.image(
            ImageInput::pair(primary.clone(), secondary, 0)
                .unwrap()
                .route(OtaScheme::DeviceDual1, "ota1")
                .route(OtaScheme::DeviceDual2, "ota2"),
        );
        let blocks = builder.build().unwrap();

        // first chunk is identical: no binpatch
        let tags: Vec<u32> = TagIter::over_block(&blocks[1]).map(|(raw, _)| raw).collect();
        assert_eq!(tags, vec![Tag::OtaPartInfo.raw()]);

        // second chunk differs: binpatch travels with it
        let tags: Vec<(u32, Vec<u8>)> = TagIter::over_block(&blocks[2])
            .map(|(raw, payload)| (raw, payload.to_vec()))
            .collect();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].0, Tag::Binpatch.raw());
        // stored payload stays the primary image
        assert_eq!(&blocks[2].data[..PACK_BLOCK_SIZE], &primary[PACK_BLOCK_SIZE..]);
    }

    #[test]
    fn md5_trailer_is_appended_when_enabled() {
        let mut builder = PackageBuilder::new(Family::BK7231T);
        builder.with_md5(true).image(
            ImageInput::new(vec![0xA5; 100], 0x40).route(OtaScheme::DeviceSingle, "app"),
        );
        let blocks = builder.build().unwrap();
        let block = &blocks[1];
        assert!(block.has_md5());
        let trailer = &block.data[UF2_DATA_SIZE - UF2_MD5_TRAILER_SIZE..];
        assert_eq!(&trailer[..4], &0x40u32.to_le_bytes());
        assert_eq!(&trailer[4..8], &100u32.to_le_bytes());
        assert_eq!(&trailer[8..], Md5::digest(&[0xA5; 100]).as_slice());
    }

    #[test]
    fn empty_builder_is_an_error() {
        let builder = PackageBuilder::new(Family::BK7231T);
        assert!(matches!(builder.build(), Err(PackError::NoInputs)));
    }

    #[test]
    fn sequence_numbers_are_strictly_monotonic() {
        let mut builder = PackageBuilder::new(Family::BK7231T);
        builder.image(
            ImageInput::new(vec![1u8; PACK_BLOCK_SIZE * 3 + 10], 0)
                .route(OtaScheme::FlasherSingle, "app"),
        );
        let blocks = builder.build().unwrap();
        for (index, block) in blocks.iter().enumerate() {
            assert_eq!(block.block_seq.get() as usize, index);
            assert_eq!(block.block_count.get() as usize, blocks.len());
        }
        // trailing partial chunk keeps its short length
        assert_eq!(blocks.last().unwrap().payload_size.get(), 10);
    }
}
