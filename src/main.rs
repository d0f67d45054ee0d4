//! # Canopy CLI (`canopy`)
//!
//! ## Usage
//!
//! ```bash
//! canopy --config ./config/canopy.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `canopy init` | Create the SQLite database and run schema migrations |
//! | `canopy build <file>` | Build a summary tree for a document |
//! | `canopy trees` | List built trees, newest first |
//! | `canopy show <root>` | Print a tree outline |
//! | `canopy get <id>` | Print one node as JSON |
//! | `canopy refine <id> "<instruction>"` | Rewrite and lock one node |
//! | `canopy regenerate <root>` | Re-synthesise every unlocked node |
//! | `canopy check <root>` | Validate tree invariants |
//! | `canopy export <root>` | Export a tree as nested JSON |

use canopy::{build_cmd, config, export, inspect, logging, migrate, progress, refine_cmd};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Canopy CLI: hierarchical summary trees over large documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/canopy.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "canopy",
    about = "Canopy: build, refine and inspect hierarchical summary trees over large documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/canopy.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines on stderr (filter with CANOPY_LOG).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressArg {
    fn mode(self) -> progress::ProgressMode {
        match self {
            ProgressArg::Auto => progress::ProgressMode::default_for_tty(),
            ProgressArg::Off => progress::ProgressMode::Off,
            ProgressArg::Human => progress::ProgressMode::Human,
            ProgressArg::Json => progress::ProgressMode::Json,
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Build a summary tree for a document.
    ///
    /// Plain text and markdown are read as UTF-8; `.pdf` and `.docx` files
    /// are converted to text first. Nothing is written if the build fails.
    Build {
        /// Path to the input document.
        file: PathBuf,

        /// Label stored with the tree (defaults to the file name).
        #[arg(long)]
        label: Option<String>,

        /// Progress output on stderr.
        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressArg,
    },

    /// List built trees, newest first.
    Trees,

    /// Print an indented outline of a tree.
    Show {
        /// Root node id.
        root: String,

        /// Maximum number of levels below the root to print.
        #[arg(long)]
        depth: Option<u32>,
    },

    /// Print one node (text, metadata, parent and children) as JSON.
    Get {
        /// Node id.
        id: String,
    },

    /// Rewrite one node following an instruction and lock it.
    Refine {
        /// Node id.
        id: String,

        /// Instruction for the rewrite, e.g. "focus on the budget figures".
        instruction: String,

        /// Require the node to belong to this tree.
        #[arg(long)]
        root: Option<String>,
    },

    /// Re-synthesise every unlocked node of a tree from its children.
    Regenerate {
        /// Root node id.
        root: String,
    },

    /// Validate the structural invariants of a tree.
    Check {
        /// Root node id.
        root: String,
    },

    /// Export a tree as nested JSON.
    Export {
        /// Root node id.
        root: String,

        /// Output file (defaults to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_json);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Build {
            file,
            label,
            progress,
        } => {
            build_cmd::run_build(&cfg, &file, label, progress.mode()).await?;
        }
        Commands::Trees => {
            inspect::run_trees(&cfg).await?;
        }
        Commands::Show { root, depth } => {
            inspect::run_show(&cfg, &root, depth).await?;
        }
        Commands::Get { id } => {
            inspect::run_get(&cfg, &id).await?;
        }
        Commands::Refine {
            id,
            instruction,
            root,
        } => {
            refine_cmd::run_refine(&cfg, &id, &instruction, root.as_deref()).await?;
        }
        Commands::Regenerate { root } => {
            refine_cmd::run_regenerate(&cfg, &root).await?;
        }
        Commands::Check { root } => {
            inspect::run_check(&cfg, &root).await?;
        }
        Commands::Export { root, output } => {
            export::run_export(&cfg, &root, output.as_deref()).await?;
        }
    }

    Ok(())
}
