//! CLI command implementations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use undertow_core::{
    InMemoryLibrary, StreamBody, StreamRequest, StreamingService, TranscodeCache, Transcoder,
    UndertowConfig, UserId,
};
use undertow_web::{AppState, run_server};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the streaming server over a JSON catalog
    Serve {
        /// Catalog with tracks and user preferences
        #[arg(long)]
        catalog: PathBuf,
        /// Address to bind to, overriding configuration
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Run one negotiated transcode through the cache
    Transcode {
        /// Catalog with tracks and user preferences
        #[arg(long)]
        catalog: PathBuf,
        /// Track id
        id: String,
        /// Target format, or `raw` for the source format
        #[arg(short, long)]
        format: Option<String>,
        /// Bitrate cap in kbps, 0 for no limit
        #[arg(short = 'b', long)]
        max_bit_rate: Option<String>,
        /// User whose preferences apply
        #[arg(short, long, default_value = "admin")]
        user: String,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration as JSON
    InspectConfig,
}

/// Loads the configuration file, if any, and applies environment overrides.
///
/// # Errors
/// - `ConfigError` - Configuration file unreadable or invalid
pub fn load_config(path: Option<&Path>) -> anyhow::Result<UndertowConfig> {
    let config = match path {
        Some(path) => UndertowConfig::from_file(path)?,
        None => UndertowConfig::default(),
    };
    Ok(config.with_overrides(std::env::vars()))
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands, config: UndertowConfig) -> anyhow::Result<()> {
    match command {
        Commands::Serve { catalog, bind } => serve(config, &catalog, bind).await,
        Commands::Transcode {
            catalog,
            id,
            format,
            max_bit_rate,
            user,
            output,
        } => {
            let request = StreamRequest {
                id: Some(id),
                format,
                max_bit_rate,
                ..Default::default()
            };
            transcode(config, &catalog, UserId::new(user), request, output).await
        }
        Commands::InspectConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn build_service(
    config: &UndertowConfig,
    catalog: &Path,
) -> anyhow::Result<StreamingService> {
    let library = Arc::new(
        InMemoryLibrary::load(catalog)
            .await
            .with_context(|| format!("loading catalog {}", catalog.display()))?,
    );
    let cache = TranscodeCache::open(config.cache.clone())?;
    let transcoder = Transcoder::new(config.transcoding.clone());

    Ok(StreamingService::new(
        library.clone(),
        library,
        cache,
        transcoder,
    ))
}

/// Start the streaming server
///
/// # Errors
/// - Catalog or cache directory cannot be opened
/// - Address cannot be bound
pub async fn serve(
    config: UndertowConfig,
    catalog: &Path,
    bind: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let service = build_service(&config, catalog).await?;
    let bind_address = bind.unwrap_or(config.server.bind_address);

    run_server(bind_address, AppState::new(service))
        .await
        .with_context(|| format!("serving on {bind_address}"))
}

/// Transcode one track and write the result
///
/// # Errors
/// - Catalog or cache directory cannot be opened
/// - The stream request fails
/// - Output cannot be written
pub async fn transcode(
    config: UndertowConfig,
    catalog: &Path,
    user: UserId,
    request: StreamRequest,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let service = build_service(&config, catalog).await?;
    let response = service.stream(&user, &request).await?;
    let target = response.target.clone();

    let mut writer: Box<dyn AsyncWrite + Unpin + Send> = match &output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let written = match response.body {
        StreamBody::File(path) => {
            let mut file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            tokio::io::copy(&mut file, &mut writer).await?
        }
        StreamBody::Transcoded(mut stream) => {
            let mut written = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                writer.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            written
        }
    };
    writer.flush().await?;

    eprintln!(
        "Wrote {} bytes of {} at {}kbps{}",
        written,
        target.suffix,
        target.bitrate,
        if target.requires_transcode {
            ""
        } else {
            " (source file)"
        }
    );
    if let Some(path) = output {
        eprintln!("  Output: {}", path.display());
    }

    Ok(())
}
