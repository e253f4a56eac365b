//! # census-map CLI (`cmap`)
//!
//! Ask questions about census statistics and get choropleth maps back.
//!
//! ## Usage
//!
//! ```bash
//! cmap --config ./config/cmap.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cmap ask "<question>"` | Run the full pipeline: SQL, data, map |
//! | `cmap retrieve "<question>"` | Show the catalog variables ranked for a question |
//! | `cmap catalog` | List the catalog variables |
//! | `cmap validate "<sql>"` | Check SQL against the query safety rules |
//! | `cmap serve` | Start the JSON HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! cmap ask "Which parishes in Lisbon have the highest percentage of women?" --html lisbon.html
//! cmap retrieve "elderly population"
//! cmap validate "SELECT dicofre, geometry, pct_women FROM censo2021portugal"
//! cmap serve --test-db
//! ```
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `census_map=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use census_map::{commands, config};

/// census-map: turn questions about census statistics into maps.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cmap.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cmap",
    about = "census-map: turn questions about census statistics into maps",
    version,
    long_about = "census-map retrieves the census variables relevant to a question, asks a \
    language model for one read-only spatial SQL query, validates and runs it against a \
    Parquet file or a PostGIS table, and renders the result as a choropleth map."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cmap.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question with SQL, data, and a map.
    Ask {
        /// The question, in any language the models understand.
        question: String,

        /// Write the map as a standalone HTML page.
        #[arg(long)]
        html: Option<PathBuf>,

        /// Write the map as GeoJSON.
        #[arg(long)]
        geojson: Option<PathBuf>,

        /// Use the PostGIS source's `test_db_name`.
        #[arg(long)]
        test_db: bool,
    },

    /// Rank catalog variables for a question.
    Retrieve {
        question: String,

        /// Number of variables to show (defaults to `[retrieval].top_k`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List the variable catalog.
    Catalog,

    /// Check a SQL statement against the dataset table.
    ///
    /// Prints the canonical, row-capped SQL when accepted. Nothing is executed.
    Validate {
        sql: String,

        #[arg(long)]
        test_db: bool,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve {
        #[arg(long)]
        test_db: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("census_map=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Ask {
            question,
            html,
            geojson,
            test_db,
        } => {
            commands::run_ask(&cfg, &question, html.as_deref(), geojson.as_deref(), test_db)
                .await?;
        }
        Commands::Retrieve { question, limit } => {
            commands::run_retrieve(&cfg, &question, limit).await?;
        }
        Commands::Catalog => {
            commands::run_catalog(&cfg)?;
        }
        Commands::Validate { sql, test_db } => {
            commands::run_validate(&cfg, &sql, test_db).await?;
        }
        Commands::Serve { test_db } => {
            commands::run_serve(&cfg, test_db).await?;
        }
    }

    Ok(())
}
