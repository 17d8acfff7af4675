//! rfio client: run file operations against local or agent-served locations.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use rfio::cli::{parse_octal, ConnectOpts};
use rfio::config::Config;
use rfio::log::{TransferLog, TransferLogEntry};
use rfio::{send_pages, CompressAlg, Compression, Fio, Location, OpenFlags, PageRecordReader, PageRequest, SkipPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about = "rfio - file operations across backup locations")]
struct Args {
    #[command(flatten)]
    connect: ConnectOpts,

    /// Location of the paths given to the command
    #[arg(long, value_enum, default_value_t = Location::DbHost, global = true)]
    at: Location,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show file metadata
    Stat {
        path: PathBuf,
        /// Report the link itself rather than its target
        #[arg(long)]
        no_follow: bool,
    },
    /// List a directory
    Ls { path: PathBuf },
    /// Print a file to stdout
    Cat { path: PathBuf },
    /// Copy a file from the target location to a local path
    Get { remote: PathBuf, local: PathBuf },
    /// Copy a local file to the target location
    Put { local: PathBuf, remote: PathBuf },
    /// Remove a file
    Rm { path: PathBuf },
    /// Create a directory and its parents
    Mkdir {
        path: PathBuf,
        #[arg(long, value_parser = parse_octal, default_value = "700")]
        mode: u32,
    },
    /// Rename a file
    Mv { from: PathBuf, to: PathBuf },
    /// Create a symbolic link
    Ln { target: PathBuf, link: PathBuf },
    /// Change permission bits
    Chmod {
        #[arg(value_parser = parse_octal)]
        mode: u32,
        path: PathBuf,
    },
    /// Stream changed pages of a relation segment into a local record file
    SendPages {
        source: PathBuf,
        dest: PathBuf,
        /// Page LSN below which blocks are unchanged
        #[arg(long, default_value_t = 0)]
        horizon: u64,
        /// Absolute number of the segment's first block
        #[arg(long, default_value_t = 0)]
        segment_block: u32,
        #[arg(long, value_enum)]
        compress: Option<CompressAlg>,
        #[arg(long)]
        level: Option<u32>,
        #[arg(long, value_enum)]
        skip_policy: Option<SkipPolicy>,
        /// Do not verify page checksums
        #[arg(long)]
        no_verify: bool,
    },
    /// Write the pages of a local record file into a file at the target location
    RestorePages {
        records: PathBuf,
        target: PathBuf,
        #[arg(long, value_enum)]
        compress: Option<CompressAlg>,
    },
    /// Print a gzip file, decompressed
    Zcat { path: PathBuf },
    /// Compress a local file into a gzip file at the target location
    Zput {
        local: PathBuf,
        remote: PathBuf,
        #[arg(long)]
        level: Option<u32>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load_or_default(args.config.as_deref())?;
    rfio::logger::init(args.verbose, &config.logging)?;

    let fio = args.connect.context(&config)?;
    run(&fio, args.at, &config, args.command)
}

fn run(fio: &Fio, at: Location, config: &Config, command: Cmd) -> Result<()> {
    match command {
        Cmd::Stat { path, no_follow } => {
            let st = fio
                .stat(&path, !no_follow, at)
                .with_context(|| format!("stat {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&st)?);
        }
        Cmd::Ls { path } => {
            let dir = fio
                .opendir(&path, at)
                .with_context(|| format!("opendir {}", path.display()))?;
            let mut names = Vec::new();
            for entry in dir {
                let entry = entry?;
                names.push((entry.name.to_string_lossy().into_owned(), entry.kind));
            }
            names.sort_by(|a, b| a.0.cmp(&b.0));
            for (name, kind) in names {
                println!("{:<8} {}", format!("{:?}", kind).to_lowercase(), name);
            }
        }
        Cmd::Cat { path } => {
            let data = fio
                .load(&path, at)
                .with_context(|| format!("load {}", path.display()))?;
            io::stdout().lock().write_all(&data)?;
        }
        Cmd::Get { remote, local } => {
            let mut src = fio
                .open(&remote, OpenFlags::read_only(), at)
                .with_context(|| format!("open {}", remote.display()))?;
            let mut dst = File::create(&local).with_context(|| format!("create {}", local.display()))?;
            let bytes = io::copy(&mut src, &mut dst)?;
            src.close()?;
            info!(bytes, "copied {} to {}", remote.display(), local.display());
        }
        Cmd::Put { local, remote } => {
            let mut src = File::open(&local).with_context(|| format!("open {}", local.display()))?;
            let mut dst = fio
                .open(&remote, OpenFlags::create_truncate(), at)
                .with_context(|| format!("create {}", remote.display()))?;
            let bytes = io::copy(&mut src, &mut dst)?;
            dst.close()?;
            info!(bytes, "copied {} to {}", local.display(), remote.display());
        }
        Cmd::Rm { path } => fio.unlink(&path, at).with_context(|| format!("unlink {}", path.display()))?,
        Cmd::Mkdir { path, mode } => fio
            .mkdir(&path, mode, at)
            .with_context(|| format!("mkdir {}", path.display()))?,
        Cmd::Mv { from, to } => fio
            .rename(&from, &to, at)
            .with_context(|| format!("rename {} to {}", from.display(), to.display()))?,
        Cmd::Ln { target, link } => fio
            .symlink(&target, &link, at)
            .with_context(|| format!("symlink {}", link.display()))?,
        Cmd::Chmod { mode, path } => fio
            .chmod(&path, mode, at)
            .with_context(|| format!("chmod {}", path.display()))?,
        Cmd::SendPages {
            source,
            dest,
            horizon,
            segment_block,
            compress,
            level,
            skip_policy,
            no_verify,
        } => {
            let mut input = fio
                .open(&source, OpenFlags::read_only(), at)
                .with_context(|| format!("open {}", source.display()))?;
            let size = input.fstat()?.size;
            let nblocks = PageRequest::for_file_size(size, config.pages.block_size).nblocks;
            let mut req = config.page_request(nblocks);
            req.verify_checksums &= !no_verify;
            if let Some(policy) = skip_policy {
                req.skip_policy = policy;
            }
            req.compression = compression(config, compress, level);
            let req = req.with_horizon(horizon).with_segment_block(segment_block);

            let mut out = BufWriter::new(File::create(&dest).with_context(|| format!("create {}", dest.display()))?);
            let entry = TransferLogEntry::new(&source, at, &dest, horizon);
            let result = send_pages(&mut input, &mut out, &req).and_then(|stats| {
                out.flush()?;
                Ok(stats)
            });
            if let Some(journal) = &config.logging.journal {
                let entry = match &result {
                    Ok(stats) => entry.completed(stats),
                    Err(e) => entry.failed(e),
                };
                TransferLog::new(journal).add_entry(&entry)?;
            }
            let stats = result.with_context(|| format!("send pages of {}", source.display()))?;
            input.close()?;
            info!(
                examined = stats.blocks_examined,
                sent = stats.blocks_sent,
                skipped = stats.blocks_skipped,
                bytes = stats.bytes_written,
                truncated = stats.truncated,
                "page transfer finished"
            );
            println!(
                "{} blocks examined, {} sent, {} skipped",
                stats.blocks_examined, stats.blocks_sent, stats.blocks_skipped
            );
        }
        Cmd::RestorePages {
            records,
            target,
            compress,
        } => {
            let input = io::BufReader::new(
                File::open(&records).with_context(|| format!("open {}", records.display()))?,
            );
            let reader = PageRecordReader::new(input, compression(config, compress, None), config.pages.block_size);
            let flags = OpenFlags::from_bits(OpenFlags::WRITE | OpenFlags::CREATE);
            let mut file = fio
                .open(&target, flags, at)
                .with_context(|| format!("open {}", target.display()))?;
            let pages = reader.apply_to(&mut file)?;
            file.close()?;
            println!("{} pages restored", pages);
        }
        Cmd::Zcat { path } => {
            let mut gz = fio
                .gzopen(&path, "rb", 0, at)
                .with_context(|| format!("gzopen {}", path.display()))?;
            io::copy(&mut gz, &mut io::stdout().lock())?;
            gz.close()?;
        }
        Cmd::Zput { local, remote, level } => {
            let mut src = File::open(&local).with_context(|| format!("open {}", local.display()))?;
            let level = level.unwrap_or(config.compression.level);
            let mut gz = fio
                .gzopen(&remote, "wb", level, at)
                .with_context(|| format!("gzopen {}", remote.display()))?;
            let bytes = io::copy(&mut src, &mut gz)?;
            gz.close()?;
            info!(bytes, "compressed {} into {}", local.display(), remote.display());
        }
    }
    Ok(())
}

fn compression(config: &Config, alg: Option<CompressAlg>, level: Option<u32>) -> Compression {
    let level = level.unwrap_or(config.compression.level);
    match alg.unwrap_or(config.compression.algorithm) {
        CompressAlg::None => Compression::none(),
        CompressAlg::Zlib => Compression::zlib(level),
    }
}
