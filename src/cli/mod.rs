//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "fretsearch",
    version,
    about = "Chord voicing similarity search with pluggable execution strategies",
    long_about = "fretsearch keeps a corpus of chord voicings with segmented embeddings and answers \
                  nearest-neighbour queries through an in-memory, GPU or persistent-store strategy, \
                  switchable at runtime through a small administrative surface."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/fretsearch/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the search daemon in the foreground
    Serve {
        /// Profile to apply on top of the config file
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Stop a running daemon
    Stop,

    /// Show corpus size, current strategy and cache statistics
    Status,

    /// Inspect or change the active search strategy
    Strategy {
        #[command(subcommand)]
        action: StrategyAction,
    },

    /// Nearest voicings for a query embedding
    Search {
        /// Comma-separated vector components
        #[arg(conflicts_with = "file")]
        vector: Option<String>,

        /// JSON file holding the query vector as an array
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Maximum number of results to return
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Rank with a segment-weighted preset instead of plain cosine
        #[arg(short, long)]
        preset: Option<String>,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Resolve a chord name or free-text description to voicings
    Lookup {
        text: String,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        #[arg(short, long)]
        preset: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Add voicings from a JSON documents file and embed them
    Ingest { file: PathBuf },

    /// Remove a voicing by id
    Purge { id: String },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum StrategyAction {
    /// Show the current strategy
    Current,

    /// List registered strategies and their characteristics
    Available,

    /// Switch to a named strategy
    Switch { name: String },

    /// Per-strategy usage statistics
    Stats,

    /// Time every available strategy on a synthetic query
    Benchmark {
        #[arg(short, long)]
        iterations: Option<usize>,
    },

    /// Pick the preferred available strategy
    AutoSelect,
}

impl StrategyAction {
    /// Admin route for this action
    pub fn route(&self) -> (&'static str, String) {
        match self {
            Self::Current => ("GET", "/strategy/current".to_string()),
            Self::Available => ("GET", "/strategy/available".to_string()),
            Self::Switch { name } => ("POST", format!("/strategy/switch/{}", name)),
            Self::Stats => ("GET", "/strategy/stats".to_string()),
            Self::Benchmark { iterations: Some(n) } => {
                ("POST", format!("/strategy/benchmark?iterations={}", n))
            }
            Self::Benchmark { iterations: None } => ("POST", "/strategy/benchmark".to_string()),
            Self::AutoSelect => ("POST", "/strategy/auto-select".to_string()),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Parse `0.1,0.2,...` into a query vector
pub fn parse_vector(text: &str) -> Result<Vec<f32>, String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f32>()
                .map_err(|e| format!("invalid component '{}': {}", s, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{AdminRequest, AdminRouter};

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_strategy_actions_route() {
        let (method, path) = StrategyAction::Benchmark {
            iterations: Some(5),
        }
        .route();
        assert_eq!(
            AdminRouter::route(method, &path),
            Ok(AdminRequest::Benchmark {
                iterations: Some(5)
            })
        );

        let (method, path) = StrategyAction::Switch {
            name: "GPU".to_string(),
        }
        .route();
        assert!(AdminRouter::route(method, &path).is_ok());
    }

    #[test]
    fn test_parse_vector() {
        assert_eq!(parse_vector("1, 0.5,-2").unwrap(), vec![1.0, 0.5, -2.0]);
        assert!(parse_vector("1,x").is_err());
    }
}
