use clap::Args;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use uf2ota_core::{Family, OtaScheme, PackageReader, Tag};

#[derive(Args)]
pub struct InfoArgs {
    /// Package to analyze
    input: PathBuf,
}

fn scheme_label(scheme: OtaScheme) -> &'static str {
    match scheme {
        OtaScheme::DeviceSingle => "device",
        OtaScheme::DeviceDual1 => "device1",
        OtaScheme::DeviceDual2 => "device2",
        OtaScheme::FlasherSingle => "flasher",
        OtaScheme::FlasherDual1 => "flasher1",
        OtaScheme::FlasherDual2 => "flasher2",
    }
}

pub fn run(args: InfoArgs) -> Result<(), Box<dyn Error>> {
    let reader = PackageReader::read(BufReader::new(File::open(&args.input)?))?;

    let info = reader.info();
    println!("Firmware:   {}", info.fw_name.as_deref().unwrap_or("-"));
    println!("Version:    {}", info.fw_version.as_deref().unwrap_or("-"));
    println!("Core:       {}", info.lt_version.as_deref().unwrap_or("-"));
    println!("Board:      {}", info.board.as_deref().unwrap_or("-"));
    match reader.family_id() {
        Some(id) => match Family::from_id(id) {
            Some(family) => println!("Family:     {family}"),
            None => println!("Family:     unknown ({id:#010x})"),
        },
        None => println!("Family:     not set"),
    }
    if let Some(date) = reader.build_date() {
        println!("Build date: {date} (Unix)");
    }
    println!("Blocks:     {}", reader.blocks().len());

    let schemes = reader.schemes();
    if schemes.is_empty() {
        println!("Schemes:    none declared");
    } else {
        for scheme in schemes {
            let total: usize = reader
                .collect(scheme)?
                .iter()
                .map(|chunk| chunk.data.len())
                .sum();
            println!("Scheme {:9} {} bytes", format!("{}:", scheme_label(scheme)), total);
        }
    }

    if let Some(table) = reader.partition_table()? {
        println!("Embedded partition table:");
        for part in table {
            println!(
                "  {:16} {:8} {:#010x}  {:#x} bytes",
                part.name, part.flash_name, part.offset, part.length
            );
        }
    }

    // census of tags across the stream, to spot unusual packages
    let mut binpatched = 0usize;
    for block in reader.blocks() {
        for (raw, _) in uf2ota_core::tags::TagIter::over_block(block) {
            if raw == Tag::Binpatch.raw() {
                binpatched += 1;
            }
        }
    }
    if binpatched > 0 {
        println!("Binpatched blocks: {binpatched}");
    }

    Ok(())
}
