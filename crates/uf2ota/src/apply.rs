use clap::Args;
use log::{debug, info, warn};
use std::error::Error;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use uf2ota_core::{
    BlockStatus, Family, FirmwareInfo, FlashDevice, FlashRegistry, OtaContext, OtaScheme,
    Partition, Uf2Block, Uf2OtaError, UF2_BLOCK_SIZE,
};

use crate::parse_u32;

#[derive(Args)]
pub struct ApplyArgs {
    /// Package to apply
    input: PathBuf,

    /// Family of the simulated device
    #[clap(value_enum, short, long)]
    family: Family,

    /// OTA scheme the simulated device runs
    #[clap(value_enum, short, long)]
    scheme: OtaScheme,

    /// Flash image file standing in for the device's flash; created
    /// when missing, grown as needed
    #[clap(long, default_value = "flash.bin")]
    flash: PathBuf,

    /// Platform partition, repeatable: name=offset:length
    #[clap(short, long = "partition")]
    partitions: Vec<PartitionArg>,
}

#[derive(Clone)]
pub struct PartitionArg(Partition);

impl FromStr for PartitionArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (name, region) = value
            .split_once('=')
            .ok_or("expected name=offset:length")?;
        let (offset, length) = region
            .split_once(':')
            .ok_or("expected name=offset:length")?;
        Ok(Self(Partition::new(
            name,
            "sim0",
            parse_u32(offset)?,
            parse_u32(length)?,
        )))
    }
}

const SECTOR_SIZE: u32 = 4096;

/// A flash device backed by a plain file image. Erases clear whole
/// sectors to 0xFF, the way NOR flash behaves.
struct FileFlash {
    data: Vec<u8>,
}

impl FileFlash {
    fn reserve(&mut self, end: usize) {
        if self.data.len() < end {
            self.data.resize(end, 0xFF);
        }
    }
}

impl FlashDevice for FileFlash {
    fn erase(&mut self, offset: u32, length: u32) -> io::Result<u32> {
        let erased = length.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        let start = offset as usize;
        self.reserve(start + erased as usize);
        self.data[start..start + erased as usize].fill(0xFF);
        Ok(erased)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> io::Result<u32> {
        let start = offset as usize;
        self.reserve(start + data.len());
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(data.len() as u32)
    }
}

/// Hands every device name to the single file image. The simulation
/// has one flash chip; name routing only matters on real hardware.
struct SimRegistry {
    flash: FileFlash,
}

impl FlashRegistry for SimRegistry {
    fn find(&mut self, name: &str) -> Option<&mut dyn FlashDevice> {
        debug!("flash lookup for {name:?} -> file image");
        Some(&mut self.flash)
    }
}

pub fn run(args: ApplyArgs) -> Result<(), Box<dyn Error>> {
    let stream = fs::read(&args.input)?;
    if stream.len() % UF2_BLOCK_SIZE != 0 {
        return Err(format!(
            "file size ({} bytes) isn't evenly divisible by {UF2_BLOCK_SIZE}",
            stream.len()
        )
        .into());
    }

    let table: Vec<Partition> = args.partitions.iter().map(|arg| arg.0.clone()).collect();
    let flash_data = fs::read(&args.flash).unwrap_or_default();
    let mut registry = SimRegistry {
        flash: FileFlash { data: flash_data },
    };

    let mut info = FirmwareInfo::default();
    let written = {
        let mut ctx = OtaContext::new(args.scheme, args.family.id(), &table, &mut registry);

        for (index, raw) in stream.chunks_exact(UF2_BLOCK_SIZE).enumerate() {
            let mut block = match Uf2Block::decode(raw.try_into().expect("chunked to 512")) {
                Ok(block) => block,
                Err(Uf2OtaError::Magic) => {
                    warn!("block {index} has bad magic, skipping");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if let BlockStatus::Ignored = ctx.check_block(&block)? {
                debug!("block {index} ignored");
                continue;
            }
            if ctx.seq() == 0 {
                ctx.parse_header(&block, Some(&mut info))?;
                info!(
                    "|-- {} {} -> {}",
                    info.fw_name.as_deref().unwrap_or("?"),
                    info.fw_version.as_deref().unwrap_or("?"),
                    info.board.as_deref().unwrap_or("?")
                );
            } else {
                ctx.write_block(&mut block)?;
            }
        }
        ctx.written()
    };

    fs::write(&args.flash, &registry.flash.data)?;
    info!(
        "Applied {written} bytes to {}",
        args.flash.to_string_lossy()
    );
    Ok(())
}
