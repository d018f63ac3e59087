//! Sparkify ETL command line

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use sparkify_common::logging::{init_logging, LogConfig, LogLevel};
use sparkify_etl::config::{EtlConfig, ParseFailurePolicy};
use sparkify_etl::pipeline::Pipeline;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sparkify-etl")]
#[command(author, version, about = "Load Sparkify song and event data into the star schema")]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Root directory of the song catalog
    #[arg(long, env = "SONG_DATA_DIR")]
    song_data: Option<PathBuf>,

    /// Root directory of the event logs
    #[arg(long, env = "LOG_DATA_DIR")]
    log_data: Option<PathBuf>,

    /// Extension of source files
    #[arg(long, env = "SOURCE_EXTENSION")]
    extension: Option<String>,

    /// What to do with a file that fails to parse (skip or abort)
    ///
    /// Overrides `ETL_ON_PARSE_ERROR`.
    #[arg(long)]
    on_parse_error: Option<ParseFailurePolicy>,

    /// Do not apply foreign keys and indexes after loading
    #[arg(long)]
    no_constraints: bool,

    /// Create the star schema tables before loading
    #[arg(long)]
    migrate: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self, mut config: EtlConfig) -> EtlConfig {
        if let Some(url) = self.database_url {
            config.database_url = url;
        }
        if let Some(dir) = self.song_data {
            config.song_data_dir = dir;
        }
        if let Some(dir) = self.log_data {
            config.log_data_dir = dir;
        }
        if let Some(extension) = self.extension {
            config.extension = extension;
        }
        if let Some(policy) = self.on_parse_error {
            config.on_parse_error = policy;
        }
        if self.no_constraints {
            config.apply_constraints = false;
        }
        config
    }
}

async fn run(cli: Cli) -> Result<()> {
    let migrate = cli.migrate;
    let config = cli.into_config(EtlConfig::from_env()?);
    config.validate()?;

    info!(
        song_data = %config.song_data_dir.display(),
        log_data = %config.log_data_dir.display(),
        on_parse_error = %config.on_parse_error,
        apply_constraints = config.apply_constraints,
        "Starting Sparkify ETL"
    );

    let mut pipeline = Pipeline::connect(&config).await?;
    if migrate {
        pipeline.migrate().await?;
    }

    let report = pipeline.run().await?;
    println!("{report}");

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("sparkify-etl")
        .filter_directives("sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    match run(cli).await {
        Ok(()) => {
            info!("ETL finished");
            ExitCode::SUCCESS
        },
        Err(e) => {
            let message = format!("{e:#}");
            error!(error = %message, "ETL failed");
            ExitCode::FAILURE
        },
    }
}
