use std::{fs, path::PathBuf};

use adversarial_training::{
    checkpoint::{export_resumable, read_manifest, CheckpointId},
    CheckpointStore, RetentionMode, Role, TrainingError,
};
use clap::{Parser, Subcommand, ValueEnum};
use safetensors::SafeTensors;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    if let Err(err) = run() {
        eprintln!("checkpoints failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and export training checkpoints", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the newest resumable checkpoint of a role.
    Latest {
        #[arg(value_name = "DIR")]
        directory: PathBuf,
        #[arg(long, value_enum, default_value_t = RoleArg::G)]
        role: RoleArg,
    },
    /// Print the manifest and tensor summary of a checkpoint or deployment file.
    Inspect {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Write half-precision deployment weights from a resumable checkpoint.
    Export {
        #[arg(value_name = "FILE")]
        checkpoint: PathBuf,
        #[arg(short, long, value_name = "DIR")]
        out: PathBuf,
        #[arg(long, default_value = "experiment")]
        experiment: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RoleArg {
    G,
    D,
    T2s,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::G => Role::Generator,
            RoleArg::D => Role::Discriminator,
            RoleArg::T2s => Role::Semantic,
        }
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    match args.command {
        Command::Latest { directory, role } => {
            // Retention mode only matters for writes.
            let store = CheckpointStore::new(directory, RetentionMode::All);
            match store.find_latest(role.into())? {
                Some(id) => println!("{}", id.path.display()),
                None => info!("no checkpoint found"),
            }
        }
        Command::Inspect { path } => {
            let bytes = fs::read(&path)?;
            let manifest: serde_json::Value = read_manifest(&path, &bytes)?;
            let tensors = SafeTensors::deserialize(&bytes)
                .map_err(|err| TrainingError::corrupt(&path, err.to_string()))?;
            let mut names = tensors.names();
            names.sort();
            let elements: usize = names
                .iter()
                .filter_map(|name| tensors.tensor(name).ok())
                .map(|view| view.shape().iter().product::<usize>())
                .sum();

            if let Some(id) = CheckpointId::parse(&path) {
                println!("role: {} (#{})", id.role, id.number);
            }
            println!("tensors: {} ({} elements)", names.len(), elements);
            println!(
                "{}",
                serde_json::to_string_pretty(&manifest)
                    .map_err(|err| TrainingError::runtime(err.to_string()))?
            );
        }
        Command::Export {
            checkpoint,
            out,
            experiment,
        } => {
            let outcome = export_resumable(&checkpoint, &out, &experiment)?;
            if !outcome.overflowed.is_empty() {
                info!(tensors = ?outcome.overflowed, "some values saturated in f16");
            }
            println!("{}", outcome.path.display());
        }
    }
    Ok(())
}
