use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use retriever_client::ReqwestFetcher;
use retriever_core::{CallbackRegistry, EntityCollection, EntityConfiguration, Fetcher, RetrievalReporter};

#[derive(Parser, Debug)]
#[command(
    name = "retriever",
    version,
    about = "Retrieve data about entities using a public API"
)]
struct Cli {
    /// CSV file with parameters for identifying entities and for validation
    #[arg(short, long)]
    input_file: PathBuf,

    /// Output directory for retrieved data
    #[arg(short, long)]
    output_dir: PathBuf,

    /// JSON file with the entity configuration
    #[arg(short, long)]
    config_file: PathBuf,

    /// Directory with the configurations of chained requests
    #[arg(long, env = "RETRIEVER_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Delimiter in CSV files
    #[arg(short, long, default_value_t = ',')]
    delimiter: char,

    /// Index of the first input row to import
    #[arg(long, default_value_t = 0)]
    start_index: usize,

    /// Number of input rows to import (0 means all)
    #[arg(long, default_value_t = 0)]
    chunk_size: usize,

    /// Request timeout in seconds
    #[arg(long, env = "RETRIEVER_TIMEOUT", default_value_t = 30)]
    timeout: u64,
}

impl Cli {
    fn delimiter_byte(&self) -> Result<u8> {
        if !self.delimiter.is_ascii() {
            bail!("Delimiter must be a single ASCII character, got '{}'", self.delimiter);
        }
        Ok(self.delimiter as u8)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("retriever=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(&cli).await
}

async fn run(cli: &Cli) -> Result<()> {
    let delimiter = cli.delimiter_byte()?;
    let registry = CallbackRegistry::with_builtins();

    let configuration = EntityConfiguration::from_file(&cli.config_file, &registry)
        .with_context(|| format!("Failed to load configuration {}", cli.config_file.display()))?;
    let configuration = Arc::new(configuration);

    let fetcher = ReqwestFetcher::with_timeout(Duration::from_secs(cli.timeout))
        .context("Failed to create HTTP client")?;
    let mut entities = EntityCollection::new(Arc::clone(&configuration), fetcher)
        .with_window(cli.start_index, cli.chunk_size);

    entities
        .read_from_csv(&cli.input_file, delimiter)
        .await
        .with_context(|| format!("Failed to read {}", cli.input_file.display()))?;
    entities.retrieve_data().await?;

    if configuration.flatten_output() {
        entities.flatten_output();
    }

    if configuration.chained_request().is_some() {
        let mut chained = entities
            .execute_chained_request(&cli.config_dir, &registry)
            .await
            .context("Chained request failed")?;
        export(&mut chained, &cli.output_dir, delimiter)?;
    } else {
        export(&mut entities, &cli.output_dir, delimiter)?;
    }

    Ok(())
}

fn export<F: Fetcher, R: RetrievalReporter>(
    entities: &mut EntityCollection<F, R>,
    output_dir: &Path,
    delimiter: u8,
) -> Result<()> {
    if entities.configuration().is_raw_download() {
        entities
            .save_raw_files(output_dir)
            .context("Failed to save raw files")?;
    }
    match entities.write_to_csv(output_dir, delimiter)? {
        Some(path) => tracing::info!(path = %path.display(), "Export finished"),
        None => tracing::info!("No entities exported"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let cli = Cli::try_parse_from([
            "retriever", "-i", "in.csv", "-o", "out", "-c", "config/users.json",
        ])
        .unwrap();
        assert_eq!(cli.input_file, PathBuf::from("in.csv"));
        assert_eq!(cli.delimiter_byte().unwrap(), b',');
        assert_eq!(cli.start_index, 0);
        assert_eq!(cli.chunk_size, 0);
        assert_eq!(cli.timeout, 30);
    }

    #[test]
    fn parses_window_and_delimiter() {
        let cli = Cli::try_parse_from([
            "retriever",
            "--input-file",
            "in.csv",
            "--output-dir",
            "out",
            "--config-file",
            "users.json",
            "--delimiter",
            ";",
            "--start-index",
            "100",
            "--chunk-size",
            "50",
            "--config-dir",
            "configs",
        ])
        .unwrap();
        assert_eq!(cli.delimiter_byte().unwrap(), b';');
        assert_eq!(cli.start_index, 100);
        assert_eq!(cli.chunk_size, 50);
        assert_eq!(cli.config_dir, PathBuf::from("configs"));
    }

    #[test]
    fn rejects_non_ascii_delimiter() {
        let cli = Cli::try_parse_from([
            "retriever", "-i", "in.csv", "-o", "out", "-c", "c.json", "-d", "§",
        ])
        .unwrap();
        assert!(cli.delimiter_byte().is_err());
    }

    #[test]
    fn requires_input_output_and_config() {
        assert!(Cli::try_parse_from(["retriever", "-i", "in.csv"]).is_err());
    }
}
