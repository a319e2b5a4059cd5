use anyhow::Context;
use clap::{Parser, Subcommand};
use jbd_core::{BlockDevice, BufferCache, FileDevice};
use jbd_journal::{Journal, JournalConfig, JournalSuperblock, RecoveryEngine, RecoveryInfo};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "jbdctl")]
#[command(about = "Create, inspect and recover block journals", long_about = None)]
struct Cli {
    /// Journal configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a journal image
    Format {
        /// Journal image path
        image: PathBuf,
        /// Log length in blocks
        #[arg(short, long)]
        blocks: u64,
        /// Block size in bytes (overrides the configuration)
        #[arg(long)]
        block_size: Option<u32>,
    },
    /// Show the superblock and the committed transactions in the log
    Inspect {
        /// Journal image path
        image: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Replay committed transactions into a filesystem image
    Recover {
        /// Journal image path
        image: PathBuf,
        /// Filesystem image receiving the replayed blocks
        #[arg(long)]
        home: PathBuf,
    },
    /// Recover, write every logged block home and mark the journal clean
    Checkpoint {
        /// Journal image path
        image: PathBuf,
        /// Filesystem image
        #[arg(long)]
        home: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => JournalConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => JournalConfig::default(),
    };

    match cli.command {
        Commands::Format { image, blocks, block_size } => {
            if let Some(block_size) = block_size {
                config.block_size = block_size;
            }
            let device = FileDevice::create(&image, config.block_size as usize, blocks)
                .with_context(|| format!("creating {}", image.display()))?;
            let superblock = Journal::create(&device, &config)?;
            println!("Created journal on {}", image.display());
            print_superblock(&superblock);
        }
        Commands::Inspect { image, json } => {
            let log = open_log(&image)?;
            let superblock = Journal::read_superblock(log.as_ref())?;
            let mut engine = RecoveryEngine::new(log.as_ref(), &superblock);
            let scan = engine.scan();
            let info = engine.info().clone();

            if json {
                let report = serde_json::json!({
                    "block_size": superblock.blocksize,
                    "length": superblock.maxlen,
                    "first": superblock.first,
                    "sequence": superblock.sequence,
                    "start": superblock.start,
                    "errno": superblock.errno,
                    "clean": superblock.start == 0,
                    "scan_error": scan.as_ref().err().map(|e| e.to_string()),
                    "recovery": info,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_superblock(&superblock);
                if superblock.start == 0 {
                    println!("Journal is clean");
                } else {
                    println!(
                        "Committed transactions: {} ({}..{})",
                        info.transactions(),
                        info.start_transaction,
                        info.end_transaction
                    );
                    if let Err(e) = scan {
                        println!("Scan stopped early: {}", e);
                    }
                }
            }
        }
        Commands::Recover { image, home } => {
            let journal = mount(&image, &home, config)?;
            match journal.recovery_info() {
                Some(info) => print_recovery(info),
                None => println!("Journal is clean, nothing to recover"),
            }
            journal.destroy()?;
        }
        Commands::Checkpoint { image, home } => {
            let journal = mount(&image, &home, config)?;
            if let Some(info) = journal.recovery_info() {
                print_recovery(info);
            }
            journal.flush()?;
            journal.destroy()?;
            println!("Journal checkpointed and marked clean");
        }
    }

    Ok(())
}

/// Open a journal image with the block size recorded in its superblock
fn open_log(path: &Path) -> anyhow::Result<Arc<dyn BlockDevice>> {
    let header_device = FileDevice::open(path, jbd_journal::format::MIN_BLOCK_SIZE)
        .with_context(|| format!("opening {}", path.display()))?;
    let superblock = Journal::read_superblock(&header_device)?;
    drop(header_device);
    let device = FileDevice::open(path, superblock.blocksize as usize)?;
    Ok(Arc::new(device))
}

fn mount(image: &Path, home: &Path, config: JournalConfig) -> anyhow::Result<Arc<Journal>> {
    let log = open_log(image)?;
    let home_device = FileDevice::open(home, log.block_size())
        .with_context(|| format!("opening {}", home.display()))?;
    let cache = Arc::new(BufferCache::new(Arc::new(home_device)));
    Ok(Journal::load(log, cache, config)?)
}

fn print_superblock(superblock: &JournalSuperblock) {
    println!("Journal superblock:");
    println!("  Version:     {}", if superblock.is_v2() { 2 } else { 1 });
    println!("  Block size:  {}", superblock.blocksize);
    println!("  Length:      {} blocks", superblock.maxlen);
    println!("  First block: {}", superblock.first);
    println!("  Sequence:    {}", superblock.sequence);
    println!("  Start:       {}", superblock.start);
    println!("  Errno:       {}", superblock.errno);
}

fn print_recovery(info: &RecoveryInfo) {
    if info.ignored {
        println!("Journal could not be scanned; its contents were discarded");
        return;
    }
    println!(
        "Recovered transactions {}..{}: {} blocks replayed, {} revoke records, {} blocks revoked",
        info.start_transaction, info.end_transaction, info.nr_replays, info.nr_revokes, info.nr_revoke_hits
    );
}
