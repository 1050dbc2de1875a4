use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use schem2vox::{semantic::Conversion, syntax};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schem2vox")]
#[command(about = "Converts a Minecraft schematic file into a simpler format", long_about = None)]
struct Cli {
    /// The .schem file to convert
    schematic: PathBuf,

    /// Directory the palette and indices files are written to
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Palette file name, relative to the output directory
    #[arg(long, default_value = "mc_palette.txt")]
    palette: PathBuf,

    /// Indices file name, relative to the output directory
    #[arg(long, default_value = "mc_indices.bin")]
    indices: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let schematic = syntax::parse_file(&cli.schematic)?;
    let conversion = Conversion::from_schematic(&schematic)
        .with_context(|| format!("Could not convert {}", cli.schematic.display()))?;

    std::fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("Could not create {}", cli.out_dir.display()))?;
    conversion.write_to(cli.out_dir.join(&cli.palette), cli.out_dir.join(&cli.indices))
}
