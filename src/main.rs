use fretsearch::cli::{parse_vector, Cli, Commands, ConfigAction, StrategyAction};
use fretsearch::config::Config;
use fretsearch::daemon::{Daemon, IpcClient, IpcMessage, IpcResponse};
use fretsearch::embedding::{EmbeddingProvider, FastEmbedProvider, RateLimitedProvider};
use fretsearch::engine::SearchEngine;
use fretsearch::error::{FretError, Result};
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Serve { profile } => cmd_serve(cli.config, profile)?,
        Commands::Stop => cmd_stop(cli.config)?,
        Commands::Status => cmd_status(cli.config)?,
        Commands::Strategy { action } => cmd_strategy(cli.config, action)?,
        Commands::Search {
            vector,
            file,
            top_k,
            preset,
            json,
        } => cmd_search(cli.config, vector, file, top_k, preset, json)?,
        Commands::Lookup {
            text,
            top_k,
            preset,
            json,
        } => cmd_lookup(cli.config, text, top_k, preset, json)?,
        Commands::Ingest { file } => cmd_ingest(cli.config, file)?,
        Commands::Purge { id } => cmd_purge(cli.config, id)?,
        Commands::Config { action } => cmd_config(cli.config, action)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "fretsearch=debug" } else { "fretsearch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt().with_env_filter(filter).with_target(false).init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| FretError::Io {
        source: e,
        context: "Failed to create tokio runtime".to_string(),
    })
}

fn cmd_serve(config_path: Option<PathBuf>, profile: Option<String>) -> Result<()> {
    let config = load_config(config_path, profile)?;
    tracing::info!("Configuration loaded successfully");

    let provider: Option<Arc<dyn EmbeddingProvider>> =
        match FastEmbedProvider::new(&config.embedding.model) {
            Ok(provider) => Some(Arc::new(RateLimitedProvider::new(
                Arc::new(provider),
                config.embedding.max_concurrency,
                config.schema.total_dimension,
            ))),
            Err(e) => {
                tracing::warn!("Embedding model unavailable, text lookup disabled: {}", e);
                None
            }
        };

    runtime()?.block_on(async move {
        let mut engine = SearchEngine::bootstrap(config).await?;
        if let Some(provider) = provider {
            engine = engine.with_provider(provider);
            if let Some(report) = engine.backfill().await? {
                println!(
                    "  Embeddings: {} computed, {} reused, {} failed",
                    report.processed - report.reused,
                    report.reused,
                    report.failed
                );
            }
        }

        let status = engine.status();
        println!("✓ fretsearch daemon starting");
        println!(
            "  Documents: {} ({} embedded)",
            status.documents, status.embedded
        );
        println!("  Strategy: {}", status.current_strategy.name);

        Arc::new(Daemon::new(Arc::new(engine)))
            .run_foreground()
            .await
    })
}

fn cmd_stop(config_path: Option<PathBuf>) -> Result<()> {
    match send(config_path, IpcMessage::Stop) {
        Ok(_) => {
            println!("✓ Daemon stopping");
            Ok(())
        }
        Err(FretError::DaemonNotRunning) => {
            println!("Daemon is not running");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn cmd_status(config_path: Option<PathBuf>) -> Result<()> {
    let response = send(config_path, IpcMessage::Status)?;
    let data = expect_data(response)?;

    println!("fretsearch Status");
    println!("=================");
    println!(
        "\nDocuments: {} ({} embedded)",
        data["documents"], data["embedded"]
    );
    println!(
        "Strategy:  {} ({})",
        data["currentStrategy"]["name"].as_str().unwrap_or("?"),
        data["currentStrategy"]["performanceCharacteristics"]
            .as_str()
            .unwrap_or("")
    );
    println!("Presets:   {}", data["presets"]);
    println!(
        "Cache:     {} entries, {} hits, {} misses",
        data["cache"]["entries"], data["cache"]["hits"], data["cache"]["misses"]
    );
    if let Some(model) = data["embeddingModel"].as_str() {
        println!("Model:     {}", model);
    }
    Ok(())
}

fn cmd_strategy(config_path: Option<PathBuf>, action: StrategyAction) -> Result<()> {
    let (method, path) = action.route();
    let response = send(
        config_path,
        IpcMessage::Admin {
            method: method.to_string(),
            path,
        },
    )?;

    let data = response.data.unwrap_or_default();
    let status = data["status"].as_u64().unwrap_or(500);
    print_json(&data["body"])?;

    if response.success {
        Ok(())
    } else {
        Err(FretError::Daemon(format!(
            "{} (status {})",
            data["body"]["error"].as_str().unwrap_or("request failed"),
            status
        )))
    }
}

fn cmd_search(
    config_path: Option<PathBuf>,
    vector: Option<String>,
    file: Option<PathBuf>,
    top_k: Option<usize>,
    preset: Option<String>,
    json: bool,
) -> Result<()> {
    let vector = match (vector, file) {
        (Some(text), _) => parse_vector(&text).map_err(FretError::Config)?,
        (None, Some(path)) => read_vector_file(&path)?,
        (None, None) => {
            return Err(FretError::Config(
                "Provide a query vector or --file".to_string(),
            ))
        }
    };

    let message = match preset {
        Some(preset) => IpcMessage::WeightedSearch {
            vector,
            preset,
            top_k,
        },
        None => IpcMessage::Search { vector, top_k },
    };
    let data = expect_data(send(config_path, message)?)?;

    if json {
        print_json(&data)
    } else {
        print_results(&data);
        Ok(())
    }
}

fn cmd_lookup(
    config_path: Option<PathBuf>,
    text: String,
    top_k: Option<usize>,
    preset: Option<String>,
    json: bool,
) -> Result<()> {
    let data = expect_data(send(
        config_path,
        IpcMessage::Lookup {
            text,
            preset,
            top_k,
        },
    )?)?;

    if json {
        return print_json(&data);
    }
    match data["kind"].as_str() {
        Some("exact") => {
            let doc = &data["value"];
            println!(
                "{} [{}]  {}",
                doc["chordName"].as_str().unwrap_or("?"),
                doc["id"].as_str().unwrap_or("?"),
                doc["diagram"].as_str().unwrap_or("")
            );
        }
        _ => print_results(&data["value"]),
    }
    Ok(())
}

fn cmd_ingest(config_path: Option<PathBuf>, file: PathBuf) -> Result<()> {
    let path = std::fs::canonicalize(&file).map_err(|e| FretError::Io {
        source: e,
        context: format!("Failed to resolve documents file: {:?}", file),
    })?;
    let data = expect_data(send(config_path, IpcMessage::Ingest { path })?)?;
    println!(
        "✓ Ingested {} documents ({} rejected)",
        data["added"], data["rejected"]
    );
    if !data["backfill"].is_null() {
        println!(
            "  Embeddings: {} computed, {} reused, {} failed",
            data["backfill"]["processed"], data["backfill"]["reused"], data["backfill"]["failed"]
        );
    }
    Ok(())
}

fn cmd_purge(config_path: Option<PathBuf>, id: String) -> Result<()> {
    let response = send(config_path, IpcMessage::Purge { id })?;
    let message = response.message.unwrap_or_default();
    if response.success {
        println!("✓ {}", message);
        Ok(())
    } else {
        Err(FretError::Daemon(message))
    }
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path, None)?;
            let text = toml::to_string_pretty(&config)?;
            println!("{}", text);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
            println!("  Dimension: {}", config.schema.total_dimension);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'fretsearch config init' to create one."
        );
    }

    let mut config = Config::load_or_default(&path)?;
    if let Some(profile) = profile {
        config.apply_profile(&profile)?;
    }
    Ok(config)
}

fn send(config_path: Option<PathBuf>, message: IpcMessage) -> Result<IpcResponse> {
    let config = load_config(config_path, None)?;
    let client = IpcClient::new(config.socket_path());
    runtime()?.block_on(client.send(&message))
}

fn expect_data(response: IpcResponse) -> Result<serde_json::Value> {
    if !response.success {
        return Err(FretError::Daemon(
            response
                .message
                .unwrap_or_else(|| "request failed".to_string()),
        ));
    }
    Ok(response.data.unwrap_or_default())
}

fn read_vector_file(path: &std::path::Path) -> Result<Vec<f32>> {
    let content = std::fs::read_to_string(path).map_err(|e| FretError::Io {
        source: e,
        context: format!("Failed to read query vector: {:?}", path),
    })?;
    serde_json::from_str(&content).map_err(|e| FretError::Json {
        source: e,
        context: format!("Query vector in {:?} must be a JSON array of numbers", path),
    })
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| FretError::Json {
        source: e,
        context: "Failed to format response".to_string(),
    })?;
    println!("{}", text);
    Ok(())
}

fn print_results(results: &serde_json::Value) {
    let rows = results.as_array().map(Vec::as_slice).unwrap_or_default();
    if rows.is_empty() {
        println!("No results");
        return;
    }
    for (rank, row) in rows.iter().enumerate() {
        let doc = &row["document"];
        println!(
            "{:>3}. {:.4}  {:<12} [{}]  {}",
            rank + 1,
            row["score"].as_f64().unwrap_or(0.0),
            doc["chordName"].as_str().unwrap_or("?"),
            doc["id"].as_str().unwrap_or("?"),
            doc["diagram"].as_str().unwrap_or("")
        );
    }
}
