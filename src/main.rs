use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::process::ExitCode;

use clap::Parser;

use btrfsdump::dump::{DumpError, DumpOptions, Dumper};
use btrfsdump::fsreader::FsReader;
use btrfsdump::restore::{RestoreOptions, Restorer};

#[derive(Parser)]
#[command(
    name = "btrfs-image",
    version = "1.0.0",
    about = "Dump or restore the metadata of a copy-on-write B-tree filesystem image"
)]
struct Cli {
    /// Restore mode (default is dump).
    #[arg(short = 'r')]
    restore: bool,

    /// Compression level 0-9. Non-zero enables zlib.
    #[arg(short = 'c', default_value_t = 0)]
    compression_level: u32,

    /// Worker count 1-32. Defaults to the number of online CPUs when
    /// compression is enabled, 1 otherwise.
    #[arg(short = 't')]
    workers: Option<usize>,

    /// Old-restore mode: use `update_super_old`, skip chunk-tree fixup.
    /// Incompatible with dump mode.
    #[arg(short = 'o')]
    old_restore: bool,

    /// Source path, or "-" for stdin (restore only).
    source: String,

    /// Target path, or "-" for stdout (dump only).
    target: String,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Usage(msg)) => {
            eprintln!("usage error: {msg}");
            ExitCode::from(2)
        }
        Err(CliError::Run(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(1)
        }
    }
}

enum CliError {
    Usage(String),
    Run(String),
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        CliError::Run(e.to_string())
    }
}

fn dispatch(cli: &Cli) -> Result<(), CliError> {
    if cli.old_restore && !cli.restore {
        return Err(CliError::Usage("-o (old-restore) is incompatible with dump mode".into()));
    }
    if !cli.restore && cli.source == "-" {
        return Err(CliError::Usage(
            "dump requires a real source (a block device); \"-\" is only valid on restore".into(),
        ));
    }
    if cli.compression_level > 9 {
        return Err(CliError::Usage("-c must be between 0 and 9".into()));
    }
    if let Some(t) = cli.workers {
        if !(1..=32).contains(&t) {
            return Err(CliError::Usage("-t must be between 1 and 32".into()));
        }
    }

    let worker_count = cli.workers.unwrap_or_else(|| {
        if cli.compression_level > 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            1
        }
    });

    if cli.restore {
        run_restore(cli, worker_count)
    } else {
        run_dump(cli, worker_count)
    }
}

fn run_restore(cli: &Cli, worker_count: usize) -> Result<(), CliError> {
    let mut input: Box<dyn Read> = if cli.source == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(File::open(&cli.source)?)
    };

    let target = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&cli.target)?;

    let opts = RestoreOptions {
        old_restore: cli.old_restore,
        worker_count,
    };

    Restorer::run(&mut input, target, &opts).map_err(|e| CliError::Run(e.to_string()))
}

fn run_dump(cli: &Cli, worker_count: usize) -> Result<(), CliError> {
    let mut out: Box<dyn Write> = if cli.target == "-" {
        Box::new(io::stdout())
    } else {
        Box::new(File::create(&cli.target)?)
    };

    // Opening and B-tree-walking the live source volume is an external
    // collaborator this crate does not implement (see `fsreader::FsReader`)
    // — an embedding application supplies the concrete reader. This binary
    // can still validate its own CLI surface and construct `DumpOptions`,
    // but it has no real filesystem to hand to `Dumper::run`.
    let mut fs = UnimplementedFsReader;

    let opts = DumpOptions {
        compression_level: if cli.compression_level > 0 {
            Some(cli.compression_level)
        } else {
            None
        },
        worker_count,
        legacy_extent_ref: false,
    };

    match Dumper::run(&mut fs, &mut out, &opts) {
        Ok(()) => Ok(()),
        Err(DumpError::Io(e)) if e.kind() == io::ErrorKind::Unsupported => Err(CliError::Run(
            "no FsReader is linked into this binary; opening a live filesystem requires an \
             embedding application to supply one (source filesystem access is out of scope for \
             btrfsdump itself)"
                .into(),
        )),
        Err(e) => Err(CliError::Run(e.to_string())),
    }
}

/// Placeholder `FsReader` that reports every call as unsupported — stands
/// in for the externally-provided live-filesystem reader this binary does
/// not ship.
struct UnimplementedFsReader;

impl FsReader for UnimplementedFsReader {
    fn node_size(&self) -> u32 {
        16 * 1024
    }

    fn super_offset(&self) -> u64 {
        btrfsdump::btrfs_format::SUPER_OFFSET
    }

    fn read_block(&mut self, _la: u64) -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no FsReader linked in"))
    }

    fn read_data_extent(&mut self, _la: u64, _len: usize) -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no FsReader linked in"))
    }

    fn super_block_bytes(&mut self) -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no FsReader linked in"))
    }

    fn log_root(&mut self) -> io::Result<Option<u64>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no FsReader linked in"))
    }

    fn extent_tree_metadata_ranges(&mut self) -> io::Result<Vec<(u64, u64)>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no FsReader linked in"))
    }

    fn walk_log_root_blocks(&mut self, _log_root_la: u64) -> io::Result<Vec<u64>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no FsReader linked in"))
    }

    fn free_space_cache_data_extents(&mut self) -> io::Result<Vec<(u64, u64)>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no FsReader linked in"))
    }
}
