use clap::{Args, Parser as ClapParser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{error, info};
use std::{fs, path::PathBuf, process};

use objheap::{
    FreeListHeap, Handle, HandleHeap, HeapDescription, HeapError,
    HeapSettings, HeapStats, Result, SpaceChainHeap,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print usage statistics of a persisted heap
    Stats(Target),
    /// Verify the guards and lengths of every live record
    Check(Target),
    /// Dump one handle's record
    Info {
        #[command(flatten)]
        target: Target,
        #[arg(help = "Handle number")]
        handle: u32,
    },
}

#[derive(Args, Debug)]
struct Target {
    #[arg(help = "Base path the heap was saved under")]
    base: PathBuf,

    #[arg(long, value_enum, default_value_t = Kind::Handles)]
    kind: Kind,

    /// Map the space files instead of reading them
    #[arg(long)]
    mapped: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Chain,
    Handles,
    Unified,
}

enum Opened {
    Chain(SpaceChainHeap),
    Handles(HandleHeap),
    Unified(FreeListHeap),
}

impl Opened {
    fn stats(&self) -> Vec<String> {
        match self {
            Opened::Chain(heap) => heap.stats(),
            Opened::Handles(heap) => heap.stats(),
            Opened::Unified(heap) => heap.stats(),
        }
    }

    fn check(&self) -> Result<usize> {
        match self {
            Opened::Chain(heap) => {
                heap.check_space_lists()?;
                heap.check_all()
            }
            Opened::Handles(heap) => {
                heap.chain().check_space_lists()?;
                heap.check_all()
            }
            Opened::Unified(heap) => heap.check_all(),
        }
    }
}

/// Settings matching the geometry recorded in `<base>.desc`.
fn settings_for(target: &Target) -> Result<HeapSettings> {
    let probe = HeapSettings::default().with_base_path(&target.base);
    let path = probe
        .desc_file_name()
        .ok_or(HeapError::InvalidConfig("no base path configured"))?;
    let desc = HeapDescription::decode(&fs::read(path)?)?;
    let settings = HeapSettings {
        memory_mapped: target.mapped,
        ..HeapSettings::in_memory(
            desc.space_size as usize,
            desc.max_spaces as usize,
        )
    };
    Ok(settings.with_base_path(&target.base))
}

fn open(target: &Target) -> Result<Opened> {
    let settings = settings_for(target)?;
    let opened = match target.kind {
        Kind::Chain => {
            let mut heap = SpaceChainHeap::new(settings)?;
            heap.load()?;
            Opened::Chain(heap)
        }
        Kind::Handles => {
            let mut heap = HandleHeap::new(settings)?;
            heap.load()?;
            Opened::Handles(heap)
        }
        Kind::Unified => {
            let heap = FreeListHeap::new(settings)?;
            heap.load()?;
            Opened::Unified(heap)
        }
    };
    Ok(opened)
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Stats(target) => {
            for line in open(&target)?.stats() {
                println!("{line}");
            }
        }
        Command::Check(target) => {
            let checked = open(&target)?.check()?;
            info!("{checked} records checked");
            println!("ok: {checked} records");
        }
        Command::Info { target, handle } => match open(&target)? {
            Opened::Handles(heap) => {
                print!("{}", heap.handle_info(Handle::new(handle))?);
            }
            _ => {
                return Err(HeapError::InvalidConfig(
                    "handle info needs --kind handles",
                ));
            }
        },
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    if let Err(err) = run(Cli::parse()) {
        error!("{err}");
        process::exit(1);
    }
}
