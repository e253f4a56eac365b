//! # census-map
//!
//! Turn free-text questions about census statistics into spatial SQL, run it,
//! and return a choropleth map together with the data and the SQL.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌─────────────┐   ┌───────────┐   ┌─────────┐
//! │ question  │──▶│ Retriever │──▶│ Synthesizer │──▶│  Backend  │──▶│   Map   │
//! └───────────┘   │ (catalog) │   │ + validator │   │ file / PG │   │ Leaflet │
//!                 └───────────┘   └─────────────┘   └───────────┘   └─────────┘
//! ```
//!
//! The language model is an injected [`completion::CompletionProvider`];
//! its output only reaches a backend after [`validate::validate`] accepted
//! it.
//!
//! ## Quick Start
//!
//! ```bash
//! cmap catalog                                   # list variables
//! cmap ask "Where do most women live in Lisbon?" --html map.html
//! cmap serve                                     # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Engine error type and stages |
//! | [`models`] | Core data types |
//! | [`io`] | Parquet / gzip readers |
//! | [`catalog`] | Variable catalog loading |
//! | [`http`] | JSON POST with retry and backoff |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`retrieval`] | Question → candidate variables |
//! | [`completion`] | Chat-completion provider abstraction |
//! | [`synthesis`] | Question → SQL with repair loop |
//! | [`validate`] | SQL safety boundary |
//! | [`geometry`] | WKT parsing, checks, GeoJSON |
//! | [`backend`] | File (SQLite) and PostGIS backends |
//! | [`map`] | Choropleth materialization and rendering |
//! | [`engine`] | The question mapper |
//! | [`server`] | JSON HTTP API |
//! | [`commands`] | CLI command implementations |

pub mod backend;
pub mod catalog;
pub mod commands;
pub mod completion;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod http;
pub mod io;
pub mod map;
pub mod models;
pub mod retrieval;
pub mod server;
pub mod synthesis;
pub mod validate;

pub use engine::{MapBundle, QuestionMapper};
pub use error::EngineError;
