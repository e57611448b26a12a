mod commands;
mod project;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use serde::Serialize;

use commands::ReadRequest;
use project::Project;

/// Inspect engine structures through dumped offset tables
#[derive(ClapParser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Project file listing the builds and their dumps
    #[arg(short, long, default_value = "sdklens.toml")]
    project: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the builds with layouts available
    Builds,
    /// Show a structure's fields, size and bases
    Inspect {
        #[arg(short, long)]
        build: String,
        structure: String,
    },
    /// Decode a captured buffer through a structure layout
    Read {
        #[arg(short, long)]
        build: String,
        #[arg(short, long)]
        structure: String,
        /// Raw bytes of one instance, starting at offset 0
        #[arg(short, long)]
        input: PathBuf,
        /// Only this field (may be inherited)
        #[arg(short, long)]
        field: Option<String>,
        /// Show byte arrays as NUL-terminated text
        #[arg(short, long)]
        text: bool,
        /// Captured memory holding vector elements
        #[arg(long, requires = "heap_base")]
        heap: Option<PathBuf>,
        /// Address of the first byte of --heap
        #[arg(long, value_parser = parse_address, requires = "heap")]
        heap_base: Option<u64>,
    },
    /// Parse dumps and write binary snapshots
    Snapshot {
        #[arg(short, long)]
        build: Option<String>,
    },
    /// List layout changes between two builds
    Diff { old: String, new: String },
    /// Print the generation stamp of a dump file
    Stamp { dump: PathBuf },
}

fn parse_address(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("bad address {s:?}: {e}"))
}

fn print_yaml<T: Serialize>(value: &T) -> Result<()> {
    serde_yaml::to_writer(std::io::stdout().lock(), value)?;
    Ok(())
}

fn run(args: Args) -> Result<()> {
    if let Command::Stamp { dump } = &args.command {
        return print_yaml(&commands::stamp(dump)?);
    }

    let project = Project::new(&args.project).with_context(|| format!("opening {}", args.project.display()))?;
    match &args.command {
        Command::Builds => print_yaml(&commands::builds(&project)?),
        Command::Inspect { build, structure } => print_yaml(&commands::inspect(&project, build, structure)?),
        Command::Read {
            build,
            structure,
            input,
            field,
            text,
            heap,
            heap_base,
        } => {
            let req = ReadRequest {
                build,
                structure,
                input,
                field: field.as_deref(),
                text: *text,
                heap: heap.as_deref().zip(*heap_base),
            };
            print_yaml(&commands::read(&project, &req)?)
        }
        Command::Snapshot { build } => {
            for path in commands::snapshot(&project, build.as_deref())? {
                println!("{}", path.display());
            }
            Ok(())
        }
        Command::Diff { old, new } => print_yaml(&commands::diff_builds(&project, old, new)?),
        Command::Stamp { .. } => Ok(()),
    }
}

fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
