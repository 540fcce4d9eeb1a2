//! Host-side tool to format a fresh file system image.
//!
//! Modeled on the teaching kernel's own `mkfs`, which built an image by
//! seeking and writing raw sectors into a host file; this version does the
//! same through the library's own `FileBlockDevice` and `Filesystem::format`
//! rather than duplicating the on-disk layout logic in the tool.

use std::fs::OpenOptions;
use std::process;
use std::sync::Arc;

use clap::Parser;

use blockfs::{FileBlockDevice, Filesystem, SECTOR_SIZE};

#[derive(Parser, Debug)]
#[command(name = "mkfs", about = "Format a block-addressed file system image")]
struct Args {
    /// Path to the image file to create (truncated if it already exists).
    image: String,

    /// Image size in sectors.
    #[arg(long, default_value_t = 8192)]
    sectors: u32,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(err) = run(&args) {
        log::error!("mkfs: {err}");
        eprintln!("mkfs: {err}");
        process::exit(1);
    }
}

fn run(args: &Args) -> std::io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .truncate(true)
        .open(&args.image)?;
    file.set_len(args.sectors as u64 * SECTOR_SIZE as u64)?;

    let to_io_error = |e: blockfs::FsError| std::io::Error::new(std::io::ErrorKind::Other, e);
    let device = Arc::new(FileBlockDevice::new(file, args.sectors));
    let fs = Filesystem::format(device).map_err(to_io_error)?;
    fs.shutdown().map_err(to_io_error)?;

    log::info!(
        "formatted {} ({} sectors, {} bytes)",
        args.image,
        args.sectors,
        args.sectors as u64 * SECTOR_SIZE as u64
    );
    Ok(())
}
