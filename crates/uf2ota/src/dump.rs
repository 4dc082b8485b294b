use clap::Args;
use log::info;
use std::error::Error;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::PathBuf;
use uf2ota_core::{OtaScheme, PackageReader};

#[derive(Args)]
pub struct DumpArgs {
    /// Package to extract
    input: PathBuf,

    /// Scheme to extract data for (all schemes when omitted)
    #[clap(value_enum, short, long)]
    scheme: Option<OtaScheme>,

    /// Output directory
    #[clap(short, long, default_value = ".")]
    output: PathBuf,
}

pub fn run(args: DumpArgs) -> Result<(), Box<dyn Error>> {
    let reader = PackageReader::read(BufReader::new(File::open(&args.input)?))?;
    fs::create_dir_all(&args.output)?;

    let board = reader.info().board.unwrap_or_else(|| "unknown".to_owned());
    let schemes = match args.scheme {
        Some(scheme) => vec![scheme],
        None => reader.schemes(),
    };
    if schemes.is_empty() {
        return Err("package declares no schemes to extract".into());
    }

    for scheme in schemes {
        for chunk in reader.collect(scheme)? {
            let path = args.output.join(format!(
                "image_{board}_{scheme:?}_{}_{:#x}.bin",
                chunk.partition, chunk.offset
            ));
            info!("Writing {} bytes to {}", chunk.data.len(), path.to_string_lossy());
            fs::write(path, &chunk.data)?;
        }
    }
    Ok(())
}
