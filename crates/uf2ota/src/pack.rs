use clap::Args;
use log::{info, max_level, LevelFilter};
use std::error::Error;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use sysinfo::Disks;
use uf2ota_core::{Family, ImageInput, OtaScheme, PackageBuilder, UF2_BLOCK_SIZE};

use crate::parse_u32;
use crate::reporter::ProgressBarReporter;

#[derive(Args)]
pub struct PackArgs {
    /// Family of the target chip
    #[clap(value_enum, short, long)]
    family: Family,

    /// Board name (lowercase code)
    #[clap(short, long)]
    board: Option<String>,

    /// Firmware name, or name:version
    #[clap(short = 'F', long)]
    fw: Option<String>,

    /// Core version stored in the package
    #[clap(short, long)]
    lt_version: Option<String>,

    /// Build date as a Unix timestamp (defaults to now)
    #[clap(short, long)]
    date: Option<u32>,

    /// Append MD5 trailers to data blocks
    #[clap(long)]
    md5: bool,

    /// Output file
    #[clap(short, long, default_value = "out.uf2")]
    output: PathBuf,

    /// Write the package to a mounted UF2 drive instead of a file
    #[clap(long)]
    deploy: bool,

    /// Image inputs: file[,file2][+offset]=role:part[,part][;role:...]
    /// where role is "device" or "flasher"
    #[clap(required = true)]
    inputs: Vec<ImageSpec>,
}

/// One `file[,file2][+offset]=role:part[,part]` input argument, the
/// same shape the packer has always accepted.
#[derive(Clone)]
pub struct ImageSpec {
    files: Vec<PathBuf>,
    offset: u32,
    routes: Vec<(OtaScheme, String)>,
}

impl FromStr for ImageSpec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        const USAGE: &str = "expected file[,file2][+offset]=role:part[,part][;role:...]";

        let (files, targets) = value.split_once('=').ok_or(USAGE)?;
        let (files, offset) = match files.split_once('+') {
            Some((files, offset)) => (files, parse_u32(offset)?),
            None => (files, 0),
        };
        let files: Vec<PathBuf> = files.split(',').map(PathBuf::from).collect();
        if files.is_empty() || files.len() > 2 {
            return Err("can only supply 1 or 2 input files".to_owned());
        }

        let mut routes = Vec::new();
        for target in targets.split(';') {
            let (role, parts) = target.split_once(':').ok_or(USAGE)?;
            let base = match role {
                "device" => OtaScheme::DeviceSingle,
                "flasher" => OtaScheme::FlasherSingle,
                other => return Err(format!("unknown role {other:?}")),
            };
            let parts: Vec<&str> = parts.split(',').collect();
            if parts.len() != files.len() {
                return Err("target partition count doesn't match file count".to_owned());
            }
            match parts[..] {
                [single] => routes.push((base, single.to_owned())),
                [first, second] => {
                    let dual1 = OtaScheme::ALL[base.index() + 1];
                    let dual2 = OtaScheme::ALL[base.index() + 2];
                    routes.push((dual1, first.to_owned()));
                    routes.push((dual2, second.to_owned()));
                }
                _ => return Err(USAGE.to_owned()),
            }
        }
        Ok(Self {
            files,
            offset,
            routes,
        })
    }
}

impl ImageSpec {
    fn into_input(self) -> Result<ImageInput, Box<dyn Error>> {
        let primary = fs::read(&self.files[0])?;
        let mut input = match self.files.get(1) {
            Some(path) => ImageInput::pair(primary, fs::read(path)?, self.offset)?,
            None => ImageInput::new(primary, self.offset),
        };
        for (scheme, partition) in &self.routes {
            input = input.route(*scheme, partition);
        }
        Ok(input)
    }
}

/// Looks for a mounted drive that behaves like a UF2 bootloader.
fn find_uf2_drive() -> Option<PathBuf> {
    let disks = Disks::new_with_refreshed_list();

    for disk in &disks {
        let mount = disk.mount_point();
        if mount.join("INFO_UF2.TXT").is_file() {
            info!("Found UF2 drive {}", &mount.to_string_lossy());
            return Some(mount.to_owned());
        }
    }
    None
}

pub fn run(args: PackArgs) -> Result<(), Box<dyn Error>> {
    let mut builder = PackageBuilder::new(args.family);

    if let Some(board) = &args.board {
        builder.board(board);
    }
    if let Some(fw) = &args.fw {
        builder.firmware(fw);
    }
    if let Some(version) = &args.lt_version {
        builder.lt_version(version);
    }
    let date = match args.date {
        Some(date) => date,
        None => SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as u32,
    };
    builder.build_date(date);
    builder.with_md5(args.md5);

    for spec in args.inputs {
        builder.image(spec.into_input()?);
    }

    let output_path = if args.deploy {
        match find_uf2_drive() {
            Some(drive) => drive.join("FIRMWARE.UF2"),
            None => return Err("unable to find a mounted UF2 drive".into()),
        }
    } else {
        args.output.clone()
    };

    info!("Using UF2 family {}", args.family);

    let blocks = builder.build()?;
    let output = BufWriter::new(File::create(&output_path)?);

    let result = if max_level() >= LevelFilter::Info {
        let len = blocks.len() as u64 * UF2_BLOCK_SIZE as u64;
        let mut reporter = ProgressBarReporter::new(len, output);
        let result = write_blocks(&blocks, &mut reporter);
        reporter.finish();
        result
    } else {
        write_blocks(&blocks, output)
    };

    if let Err(err) = result {
        fs::remove_file(&output_path)?;
        return Err(err);
    }

    // New line after progress bar
    println!();
    info!(
        "Wrote {} blocks to {}",
        blocks.len(),
        display_path(&output_path)
    );
    Ok(())
}

fn write_blocks(
    blocks: &[uf2ota_core::Uf2Block],
    mut out: impl std::io::Write,
) -> Result<(), Box<dyn Error>> {
    for block in blocks {
        out.write_all(&block.encode())?;
    }
    out.flush()?;
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
