//! CLI entry points. Each `run_*` function backs one `cmap` subcommand and
//! prints to stdout.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::backend::open_backend;
use crate::catalog::VariableCatalog;
use crate::config::Config;
use crate::embedding;
use crate::engine::{describe_schema, QuestionMapper};
use crate::error::EngineError;
use crate::retrieval::Retriever;
use crate::server;
use crate::validate::validate;

/// Rows printed by `cmap ask` before truncating.
const PREVIEW_ROWS: usize = 20;

fn load_catalog(config: &Config) -> Result<VariableCatalog, EngineError> {
    VariableCatalog::load(
        &config.dataset.variables_catalog_path,
        &config.dataset.embeddings_path,
    )
}

/// `cmap ask`: run the full pipeline and print SQL, variables, and rows.
pub async fn run_ask(
    config: &Config,
    question: &str,
    html: Option<&Path>,
    geojson: Option<&Path>,
    test_db: bool,
) -> Result<()> {
    let mapper = QuestionMapper::from_config(config, test_db).await?;
    let bundle = mapper.to_map(question).await?;

    println!("--- SQL ---");
    println!("{}", bundle.sql);
    println!();

    println!("--- Variables ---");
    for v in &bundle.variables {
        let marker = if bundle.referenced_variables.contains(&v.name) {
            "*"
        } else {
            " "
        };
        println!("{} [{:.3}] {}: {}", marker, v.score, v.name, v.description);
    }
    println!();

    println!("--- Data ({} rows) ---", bundle.data.len());
    if bundle.data.is_empty() {
        println!("No results.");
    } else {
        let header: Vec<&str> = bundle.data.columns.iter().map(|c| c.name.as_str()).collect();
        println!("{}", header.join("\t"));
        for feature in bundle.data.features.iter().take(PREVIEW_ROWS) {
            let cells: Vec<String> = feature.attributes.iter().map(|v| v.display()).collect();
            println!("{}", cells.join("\t"));
        }
        if bundle.data.len() > PREVIEW_ROWS {
            println!("... {} more", bundle.data.len() - PREVIEW_ROWS);
        }
    }

    match &bundle.map.value_column {
        Some(column) => println!("\nMap coloured by `{}`.", column),
        None => println!("\nNo numeric column; outline map."),
    }

    if let Some(path) = html {
        std::fs::write(path, bundle.map.to_html(question))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    if let Some(path) = geojson {
        let text = serde_json::to_string_pretty(&bundle.map.to_geojson())?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
    }

    Ok(())
}

/// `cmap retrieve`: rank catalog variables for a question.
pub async fn run_retrieve(config: &Config, question: &str, limit: Option<usize>) -> Result<()> {
    let catalog = load_catalog(config)?;
    let provider = embedding::create_provider(&config.embedding)?;
    let retriever = Retriever::new(provider, limit.unwrap_or(config.retrieval.top_k));

    let result = retriever.retrieve(question, &catalog).await?;
    if result.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, scored) in result.items.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}",
            i + 1,
            scored.score,
            scored.variable.name
        );
        println!("    {}", scored.variable.description);
    }
    Ok(())
}

/// `cmap catalog`: list catalog variables.
pub fn run_catalog(config: &Config) -> Result<()> {
    let catalog = load_catalog(config)?;
    println!(
        "{} variables ({} dimensions)",
        catalog.len(),
        catalog.dims()
    );
    for record in catalog.records() {
        println!("  {:<32} {}", record.name, record.description);
    }
    Ok(())
}

/// `cmap validate`: check SQL against the dataset table without running it.
///
/// Prints the canonical SQL on success; exits with status 1 on rejection.
pub async fn run_validate(config: &Config, sql: &str, test_db: bool) -> Result<()> {
    let catalog = load_catalog(config)?;
    let backend = open_backend(config, test_db).await?;
    let schema = describe_schema(
        backend.table_schema(),
        backend.dialect(),
        &catalog,
        config.execution.max_rows,
    );

    match validate(sql, &schema) {
        Ok(query) => {
            println!("OK");
            println!("{}", query.sql_text());
            if !query.referenced_variables().is_empty() {
                let names: Vec<&str> = query
                    .referenced_variables()
                    .iter()
                    .map(|s| s.as_str())
                    .collect();
                println!("variables: {}", names.join(", "));
            }
            Ok(())
        }
        Err(EngineError::UnsafeQuery { reason, .. }) => {
            eprintln!("Rejected: {}", reason);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

/// `cmap serve`: start the HTTP API.
pub async fn run_serve(config: &Config, test_db: bool) -> Result<()> {
    let mapper = QuestionMapper::from_config(config, test_db).await?;
    server::run_server(config, Arc::new(mapper)).await
}
