//! A small mkdwarfs-style CLI: build an image from a directory tree.
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use dwarfs_mk::fsaccess::OsAccess;
use dwarfs_mk::{
    parse_compression, BlockConfig, FileOrderMode, HashAlgorithm, Progress, Scanner,
    ScannerOptions,
};
use indicatif::{HumanBytes, HumanCount, ProgressBar, ProgressStyle};

#[derive(Debug, clap::Parser)]
struct Cli {
    /// Source directory.
    #[arg(short, long)]
    input: PathBuf,
    /// Output image path.
    #[arg(short, long)]
    output: PathBuf,

    /// Overwrite an existing output file.
    #[arg(short, long)]
    force: bool,

    /// Compression: null|lz4|lz4hc:level=N|zstd:level=N|lzma:level=N.
    #[arg(short = 'C', long, default_value = "zstd:level=19")]
    compression: String,

    /// Block size as a power of two.
    #[arg(short = 'S', long, default_value_t = 24)]
    block_size_bits: u32,

    /// Rolling hash window; 0 disables segmentation.
    #[arg(short = 'W', long, default_value_t = 64)]
    window_size: usize,

    /// File ordering: none|path|similarity|nilsimsa.
    #[arg(long, default_value = "similarity")]
    order: String,

    /// Content hash for deduplication; "none" disables deduplication.
    #[arg(long, default_value = "xxh3-128")]
    file_hash: String,

    /// Include block/char devices.
    #[arg(long)]
    with_devices: bool,

    /// Include fifos and sockets.
    #[arg(long)]
    with_specials: bool,

    /// Keep atime and ctime besides mtime.
    #[arg(long)]
    keep_all_times: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli: Cli = clap::Parser::parse();

    let started = Instant::now();

    let out = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .create_new(!cli.force)
        .open(&cli.output)?;

    let cfg = BlockConfig {
        block_size_bits: cli.block_size_bits,
        blockhash_window_size: cli.window_size,
        ..Default::default()
    };
    let mut options = ScannerOptions::default();
    options.file_order = match cli.order.as_str() {
        "none" => FileOrderMode::None,
        "path" => FileOrderMode::Path,
        "similarity" => FileOrderMode::Similarity,
        "nilsimsa" => FileOrderMode::Nilsimsa,
        other => return Err(format!("unknown order mode: {other}").into()),
    };
    options.file_hash_algorithm = match cli.file_hash.as_str() {
        "none" => None,
        name => Some(HashAlgorithm::parse(name)?),
    };
    options.with_devices = cli.with_devices;
    options.with_specials = cli.with_specials;
    options.keep_all_times = cli.keep_all_times;
    options.pack_chunk_table = true;
    options.pack_directories = true;
    options.pack_shared_files_table = true;
    options.pack_names_index = true;
    options.pack_symlinks_index = true;

    let compression = parse_compression(&cli.compression)?;
    let fs_access = OsAccess::new(&cli.input);
    let prog = Progress::default();

    let bar = ProgressBar::new_spinner().with_style(
        ProgressStyle::with_template("{spinner} {msg} ({binary_bytes_per_sec})").unwrap(),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(200));

    // The scanner blocks this thread; sample counters from the tick hook.
    let out = std::thread::scope(|scope| {
        let handle = scope.spawn(|| {
            Scanner::new(&cfg, &options, &fs_access).scan(out, compression, &prog, None)
        });
        while !handle.is_finished() {
            bar.set_message(format!(
                "{} files, {} in, {} out",
                HumanCount(prog.files_found.get()),
                HumanBytes(prog.original_size.get()),
                HumanBytes(prog.compressed_size.get()),
            ));
            bar.tick();
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        handle.join().expect("scanner panicked")
    })?;
    bar.finish_and_clear();

    out.sync_all()?;
    let elapsed = started.elapsed();
    eprintln!("{}", prog.summary());
    eprintln!(
        "completed in {:.1?}, ratio {:.2}%",
        elapsed,
        prog.compressed_size.get() as f64 / prog.original_size.get().max(1) as f64 * 100.0,
    );
    Ok(())
}
