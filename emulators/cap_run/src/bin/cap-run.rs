use anyhow::{Context, Result};
use cap_run::{run_on, Input};
use clap::{ArgAction, Parser};
use morello_core::{load_snapshot, save_snapshot, CoreConfig, MemoryImage, Snapshot};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cap-run")]
#[command(about = "Run decoded Morello capability instructions from a JSON description", long_about = None)]
struct Args {
    /// JSON input (reads stdin when omitted)
    input: Option<PathBuf>,

    /// Core configuration JSON; overrides the `config` field of the input
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start from a saved snapshot instead of the input's state
    #[arg(long)]
    load_snapshot: Option<PathBuf>,

    /// Write a snapshot of the final state
    #[arg(long)]
    save_snapshot: Option<PathBuf>,

    /// Override the input's step limit
    #[arg(long)]
    steps: Option<u64>,

    /// Collect out-of-bounds derivation statistics
    #[arg(long, action = ArgAction::SetTrue)]
    stats: bool,

    /// Pretty-print the output
    #[arg(long, action = ArgAction::SetTrue)]
    pretty: bool,
}

fn read_input(path: Option<&PathBuf>) -> Result<Input> {
    let text = match path {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
        }
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    Ok(serde_json::from_str(&text)?)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut input = read_input(args.input.as_ref())?;

    let mut config = match &args.config {
        Some(path) => CoreConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => input.config.clone().unwrap_or_default(),
    };
    let mut memory = MemoryImage::new();
    if let Some(path) = &args.load_snapshot {
        let snapshot = load_snapshot(path)?;
        log::info!(
            "resuming from {} after {} instructions",
            path.display(),
            snapshot.instruction_count
        );
        if args.config.is_none() {
            config = snapshot.config.clone();
        }
        input.state = Some(snapshot.state.clone());
        memory = snapshot.restore_memory();
    }
    let config = config.with_env_overrides();
    if let Some(steps) = args.steps {
        input.max_steps = steps;
    }

    let output = run_on(&input, config.clone(), memory, args.stats);
    log::info!("{} steps, stopped: {:?}", output.report.steps, output.report.stop);

    if let Some(path) = &args.save_snapshot {
        let mut memory = MemoryImage::new();
        for &(addr, value) in &output.memory {
            memory.write_bytes(addr, &[value]);
        }
        memory.restore_tags(output.tags.iter().copied());
        let snapshot = Snapshot::capture(&config, &output.state, &memory, output.report.steps);
        save_snapshot(path, &snapshot)?;
    }

    if args.pretty {
        serde_json::to_writer_pretty(io::stdout(), &output)?;
    } else {
        serde_json::to_writer(io::stdout(), &output)?;
    }
    Ok(())
}
