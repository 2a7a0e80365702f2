//! rnotebook CLI entry point.
//!
//! Parses R Markdown documents and runs their chunks against a local R
//! interpreter through the same kernel an editor integration would use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};
use rnotebook::controller::{CellOutput, Controller, RunState};
use rnotebook::kernel::KernelEvent;
use rnotebook::notebook;
use rnotebook::settings::{self, Settings};
use rnotebook::supervisor::{install_bridge_script, RSupervisor};

#[derive(Parser, Debug)]
#[command(name = "rnotebook")]
#[command(about = "Run R Markdown chunks against a persistent R session")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the parsed cells as JSON
    Cells {
        file: PathBuf,
    },

    /// Run every chunk (or a single cell) and print the outputs
    Run {
        file: PathBuf,

        /// Only run the cell at this index
        #[arg(long)]
        cell: Option<usize>,

        /// Interpreter binary (overrides settings)
        #[arg(long)]
        r_path: Option<PathBuf>,
    },

    /// Check that parsing and serializing reproduces the file
    Roundtrip {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let settings = settings::load_settings();

    match cli.command {
        Commands::Cells { file } => print_cells(&file, &settings),
        Commands::Run { file, cell, r_path } => {
            let settings = Settings {
                r_path: r_path.unwrap_or(settings.r_path),
                ..settings
            };
            run(&file, cell, settings).await
        }
        Commands::Roundtrip { file } => roundtrip(&file, &settings),
    }
}

fn read_document(file: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))
}

fn print_cells(file: &Path, settings: &Settings) -> anyhow::Result<()> {
    let text = read_document(file)?;
    let cells = notebook::parse(&text, &settings.target_language);
    println!("{}", serde_json::to_string_pretty(&cells)?);
    Ok(())
}

fn roundtrip(file: &Path, settings: &Settings) -> anyhow::Result<()> {
    let text = read_document(file)?;
    let cells = notebook::parse(&text, &settings.target_language);
    let serialized = notebook::serialize(&cells);
    if serialized == text {
        println!("{}: {} cells, identical", file.display(), cells.len());
        return Ok(());
    }
    let reparsed = notebook::parse(&serialized, &settings.target_language);
    let same = cells.len() == reparsed.len()
        && cells
            .iter()
            .zip(&reparsed)
            .all(|(a, b)| a.kind == b.kind && a.language == b.language && a.source == b.source);
    if !same {
        bail!("{}: cells changed after serialize", file.display());
    }
    println!("{}: {} cells, equivalent", file.display(), cells.len());
    Ok(())
}

async fn run(file: &Path, cell: Option<usize>, settings: Settings) -> anyhow::Result<()> {
    let text = read_document(file)?;
    let path = std::fs::canonicalize(file)
        .with_context(|| format!("failed to resolve {}", file.display()))?;
    let script = install_bridge_script(&rnotebook::default_cache_dir())?;
    info!("Bridge script: {}", script.display());

    let launcher = Arc::new(RSupervisor::new(&settings));
    let controller = Controller::new(settings, launcher, script);
    let uri = format!("file://{}", path.display());
    let session = controller.open(&uri, &path, &text);

    let mut events = session.kernel().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                KernelEvent::Status(status) => info!("[kernel] status: {}", status),
                KernelEvent::Exited { code } => warn!("[kernel] interpreter exited: {:?}", code),
                KernelEvent::ConnectionLost { reason } => {
                    warn!("[kernel] connection lost: {}", reason)
                }
            }
        }
    });

    let result = match cell {
        Some(index) => controller.run_one(&uri, index).await.map(|_| ()),
        None => controller.run_all(&uri).await,
    };

    let mut failed = 0;
    for (index, entry) in session.cells().iter().enumerate() {
        if entry.run.execution_order.is_none() {
            continue;
        }
        if entry.run.state == RunState::Failed {
            failed += 1;
        }
        println!(
            "[{}] cell {} ({}) {:?} in {}ms",
            entry.run.execution_order.unwrap_or_default(),
            index,
            entry.cell.chunk.as_ref().and_then(|c| c.label()).unwrap_or("-"),
            entry.run.state,
            entry.run.duration_ms.unwrap_or_default()
        );
        match &entry.run.output {
            Some(CellOutput::Text { text })
            | Some(CellOutput::Viewer { text })
            | Some(CellOutput::Browser { text }) => println!("{}", text),
            Some(CellOutput::Plot { mime, path, data }) => {
                println!("<{} {} ({} bytes base64)>", mime, path.display(), data.len())
            }
            Some(CellOutput::Error { message }) => println!("Error: {}", message),
            None => {}
        }
    }

    controller.shutdown_all().await;
    result?;
    if failed > 0 {
        bail!("{} cell(s) failed", failed);
    }
    Ok(())
}
