//! soap-wsse command line tool.
//!
//! Run with: `soap-wsse --config config.yaml secure request.xml`
//!
//! Secures a SOAP envelope or decrypts a SOAP response offline, using the
//! key material named in the configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use soap_wsse::{KeyMaterial, ResponseDecryptor, SecurityBuilder, WsSecurityConfig};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// WS-Security signing, encryption and decryption for SOAP envelopes.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign and encrypt a plain SOAP envelope
    Secure {
        /// Envelope to secure
        input: PathBuf,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Decrypt an encrypted SOAP response
    Decrypt {
        /// Response to decrypt
        input: PathBuf,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("soap-wsse v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config: WsSecurityConfig = if args.config.exists() {
        let content = tokio::fs::read_to_string(&args.config)
            .await
            .context("Failed to read config file")?;
        serde_yaml::from_str(&content).context("Failed to parse config file")?
    } else {
        info!("Config file not found, using defaults");
        WsSecurityConfig::default()
    };

    let keys = KeyMaterial::load(&config.keys).context("Failed to load key material")?;

    match args.command {
        Command::Secure { input, output } => {
            let envelope = read_input(&input).await?;
            let builder = SecurityBuilder::new(keys.into(), (&config).into());
            let secured = builder.secure(&envelope).context("Failed to secure envelope")?;
            write_output(output.as_deref(), &secured).await?;
        }
        Command::Decrypt { input, output } => {
            let response = read_input(&input).await?;
            let decryptor = ResponseDecryptor::from_key_material(&keys)
                .with_missing_key_policy(config.missing_key_policy);
            let outcome = decryptor
                .decrypt(&response)
                .context("Failed to decrypt response")?;

            for failure in &outcome.failures {
                warn!(element_id = ?failure.element_id, "{}", failure);
            }
            info!(
                decrypted = outcome.decrypted,
                failures = outcome.failures.len(),
                recovered = outcome.recovered.len(),
                "Decryption finished"
            );
            write_output(output.as_deref(), &outcome.envelope).await?;
        }
    }

    Ok(())
}

async fn read_input(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

async fn write_output(path: Option<&Path>, content: &str) -> Result<()> {
    match path {
        Some(path) => tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            println!("{}", content);
            Ok(())
        }
    }
}
