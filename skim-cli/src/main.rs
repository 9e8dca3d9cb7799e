use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use skim_store::codec::{binary, columnar};
use skim_store::merge::{MergeConfig, PropagationMap, merge_iteration};
use skim_store::SkimCube;

#[derive(Parser, Debug)]
#[command(name = "skim-cli", author, version, about, long_about = None)]
struct Cli {
    /// Subcommand/tool to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Family {
    Highway,
    Transit,
}

impl From<Family> for binary::SkimFamily {
    fn from(family: Family) -> Self {
        match family {
            Family::Highway => binary::SkimFamily::Highway,
            Family::Transit => binary::SkimFamily::Transit,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Summarize a skim file: zones, intervals, and matrices
    Info {
        /// Binary (.skm) or columnar (.skx) skim file
        file: PathBuf,

        /// File family, for binary inputs
        #[arg(long, value_enum, default_value_t = Family::Highway)]
        family: Family,
    },
    /// Convert between the binary and columnar containers
    Convert {
        /// Input skim file (direction is chosen by extension)
        input: PathBuf,

        /// Output skim file
        output: PathBuf,

        /// File family, for the binary side
        #[arg(long, value_enum, default_value_t = Family::Highway)]
        family: Family,
    },
    /// Merge one iteration's observation into the cumulative store
    Merge {
        /// Cumulative columnar skim file (created empty-equivalent if absent)
        #[arg(long)]
        cumulative: PathBuf,

        /// This iteration's observation, columnar
        #[arg(long)]
        observation: PathBuf,

        /// Where to write the updated cumulative store
        #[arg(long)]
        output: PathBuf,

        /// Cross-mode propagation entries, `source=derived1,derived2`
        #[arg(long = "propagate")]
        propagate: Vec<String>,
    },
}

/// `.skx` marks the columnar container; anything else is treated as binary.
fn is_columnar(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("skx"))
}

fn load_cube(path: &Path, family: Family) -> anyhow::Result<SkimCube> {
    if is_columnar(path) {
        columnar::open(path).with_context(|| format!("Failed to read {}", path.display()))
    } else {
        let file = binary::open(path, family.into())
            .with_context(|| format!("Failed to read {}", path.display()))?;
        info!(version = ?file.version, "Decoded binary skim file");
        Ok(file.cube)
    }
}

fn print_summary(cube: &SkimCube) {
    println!("zones:     {}", cube.zone_count());
    println!(
        "intervals: {}",
        cube.intervals()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("matrices:  {}", cube.len());
    for mode in cube.modes() {
        println!("  {mode}: {}", cube.measures_for(mode).join(", "));
    }
}

fn parse_propagation(entries: &[String]) -> anyhow::Result<PropagationMap> {
    let mut map = PropagationMap::new();
    for entry in entries {
        let (source, derived) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("Propagation entry {entry:?} must be source=derived,..."))?;
        let derived: Vec<String> = derived
            .split(',')
            .filter(|d| !d.is_empty())
            .map(String::from)
            .collect();
        if derived.is_empty() {
            bail!("Propagation entry {entry:?} lists no derived modes");
        }
        map.insert(source.to_string(), derived);
    }
    Ok(map)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        // Standard logger, configured via the RUST_LOG env variable
        .with(tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { file, family } => {
            let cube = load_cube(&file, family)?;
            print_summary(&cube);
            Ok(())
        }
        Commands::Convert {
            input,
            output,
            family,
        } => {
            let cube = load_cube(&input, family)?;
            if is_columnar(&output) {
                columnar::save(&output, &cube)
                    .with_context(|| format!("Failed to write {}", output.display()))?;
            } else {
                binary::save(
                    &output,
                    &cube,
                    family.into(),
                    binary::FormatVersion::V3,
                )
                .with_context(|| format!("Failed to write {}", output.display()))?;
            }
            info!(path = output.to_str(), "Wrote converted skims");
            Ok(())
        }
        Commands::Merge {
            cumulative,
            observation,
            output,
            propagate,
        } => {
            let mut store = columnar::open(&cumulative)
                .with_context(|| format!("Failed to read {}", cumulative.display()))?;

            // A missing observation is recoverable: the simulator crashed or
            // produced nothing, so carry the previous skims forward.
            if !observation.exists() {
                warn!(
                    path = observation.to_str(),
                    "No skim observation found; carrying cumulative skims forward"
                );
                columnar::save(&output, &store)
                    .with_context(|| format!("Failed to write {}", output.display()))?;
                return Ok(());
            }

            let observed = columnar::open(&observation)
                .with_context(|| format!("Failed to read {}", observation.display()))?;
            let propagation = parse_propagation(&propagate)?;
            let report = merge_iteration(
                &mut store,
                &observed,
                &propagation,
                &MergeConfig::default(),
            )?;
            info!(
                updated_cells = report.updated_cells,
                cancelled_ods = report.cancelled_ods,
                penalized_ods = report.penalized_ods,
                suppressed_ods = report.suppressed_ods,
                propagated_matrices = report.propagated_matrices,
                "Merge complete"
            );
            columnar::save(&output, &store)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            Ok(())
        }
    }
}
