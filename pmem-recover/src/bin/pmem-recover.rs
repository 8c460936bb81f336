use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use memmap2::MmapMut;
use pmem_fd::{persist_range, Durability};
use pmem_pages::{memlogs, read_log, Config, HeapKind, LogDestination};
use pmem_recover::{CrashFlags, PageRecovery, RecoverError, RegionMap, Replayer};
use pmem_state::{DurableLog, LogRegion};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let RecoverCommand { command } = RecoverCommand::parse();
    match run(command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Parser)]
#[command(about = "Inspect and recover the logs of a persistent memory program")]
struct RecoverCommand {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Tell whether the last run in a log directory finished cleanly.
    Status {
        #[command(flatten)]
        logs: LogDir,
    },
    /// Restore one variable from the memory logs and print its bytes in hex.
    Recover {
        #[command(flatten)]
        logs: LogDir,
        /// The variable, as registered in the variable map.
        #[arg(long)]
        name: String,
        /// Bytes to restore.
        #[arg(long)]
        size: usize,
    },
    /// Write every committed page of the memory logs into an image file.
    RestoreImage {
        #[command(flatten)]
        logs: LogDir,
        #[arg(help = "The image file, sized to the store")]
        image: PathBuf,
        /// How the restored image is made durable.
        #[arg(value_enum, long, default_value = "fdatasync")]
        durability: DurabilityMode,
    },
    /// Replay a durable log into the region files of a directory.
    Replay {
        #[arg(help = "The durable log region")]
        log: PathBuf,
        #[arg(long, help = "Directory of the `region_<id>` files")]
        regions: PathBuf,
    },
    /// Print the log structures and entries of a durable log.
    Inspect {
        #[arg(help = "The durable log region")]
        log: PathBuf,
    },
    /// List the memory logs of a log directory.
    Memlogs {
        #[command(flatten)]
        logs: LogDir,
    },
}

#[derive(clap::Args)]
struct LogDir {
    /// Where the program wrote its logs.
    #[arg(value_enum, long, default_value = "disk")]
    dest: Destination,
    /// The directory for `nvram` and `dir` destinations.
    #[arg(long)]
    dir: Option<PathBuf>,
    #[arg(value_enum, long, default_value = "heap")]
    kind: Kind,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Destination {
    /// The working directory.
    Disk,
    /// `/mnt/tmpfs/`.
    DramTmpfs,
    Nvram,
    Dir,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Kind {
    Heap,
    Globals,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum DurabilityMode {
    Msync,
    Clflush,
    Both,
    Fdatasync,
}

impl LogDir {
    fn config(&self) -> Result<Config, RecoverError> {
        let dir = || {
            self.dir.clone().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "--dir is required")
            })
        };

        let log_destination = match self.dest {
            Destination::Disk => LogDestination::Disk,
            Destination::DramTmpfs => LogDestination::DramTmpfs,
            Destination::Nvram => LogDestination::Nvram(dir()?),
            Destination::Dir => LogDestination::Directory(dir()?),
        };

        let kind = match self.kind {
            Kind::Heap => HeapKind::Heap,
            Kind::Globals => HeapKind::Globals,
        };

        Ok(Config {
            log_destination,
            kind,
            ..Config::default()
        })
    }
}

impl From<DurabilityMode> for Durability {
    fn from(mode: DurabilityMode) -> Self {
        match mode {
            DurabilityMode::Msync => Durability::Msync,
            DurabilityMode::Clflush => Durability::Flush,
            DurabilityMode::Both => Durability::MsyncAndFlush,
            DurabilityMode::Fdatasync => Durability::Fdatasync,
        }
    }
}

fn run(command: Command) -> Result<ExitCode, RecoverError> {
    match command {
        Command::Status { logs } => {
            let dir = logs.config()?.log_dir();
            if CrashFlags::is_flagged(&dir) {
                println!("crashed");
            } else {
                println!("clean");
            }
        }
        Command::Recover { logs, name, size } => {
            let mut recovery = PageRecovery::open(&logs.config()?)?;
            let mut dest = vec![0; size];
            let restored = recovery.recover(&mut dest, size, &name);
            if restored == 0 {
                eprintln!("Nothing restored for {name:?}");
                return Ok(ExitCode::FAILURE);
            }

            let hex: String = dest[..restored].iter().map(|b| format!("{b:02x}")).collect();
            println!("{hex}");
        }
        Command::RestoreImage {
            logs,
            image,
            durability,
        } => {
            let mut recovery = PageRecovery::open(&logs.config()?)?;
            let pages = restore_image(&mut recovery, &image, durability.into())?;
            println!("{pages} pages restored");
        }
        Command::Replay { log, regions } => {
            let log = DurableLog::open(LogRegion::open(&log)?)?;
            let mut target = RegionMap::new(regions);
            let stats = Replayer::new(&log).recover_all(&mut target)?;
            target.flush()?;
            println!(
                "{} threads, {} edges, {} writes",
                stats.threads, stats.edges, stats.writes
            );
        }
        Command::Inspect { log } => {
            let log = DurableLog::open(LogRegion::open(&log)?)?;
            for structure in log.structures() {
                println!("thread {} at {:?}", structure.tid, structure.handle);
                for entry in log.entries(structure.first) {
                    println!(
                        "  {:?} {:?} addr={:#x} value={:#x} size={}",
                        entry.handle, entry.kind, entry.addr, entry.value, entry.size
                    );
                }
            }
        }
        Command::Memlogs { logs } => {
            let dir = logs.config()?.log_dir();
            for (tid, xact, path) in memlogs(&dir)? {
                match read_log(&path) {
                    Ok(contents) => println!(
                        "{xact} thread {tid}: {} pages{}",
                        contents.records.len(),
                        if contents.complete { "" } else { ", truncated" }
                    ),
                    Err(err) => eprintln!("{}: {err}", path.display()),
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn restore_image(
    recovery: &mut PageRecovery,
    image: &Path,
    durability: Durability,
) -> Result<usize, RecoverError> {
    let file = OpenOptions::new().read(true).write(true).open(image)?;
    // Safety: the image is not in use while it is restored.
    let mut map = unsafe { MmapMut::map_mut(&file)? };
    let pages = recovery.recover_image(&mut map);

    match durability {
        Durability::Msync => map.flush()?,
        Durability::Flush => persist_range(map.as_ptr(), map.len()),
        Durability::MsyncAndFlush => {
            persist_range(map.as_ptr(), map.len());
            map.flush()?;
        }
        Durability::Fdatasync => {
            drop(map);
            file.sync_data()?;
        }
    }

    Ok(pages)
}
