mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "testbox")]
#[command(about = "testbox - Run test functions inside disposable Docker instances", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test function on every image of a run config
    Run {
        /// Run config (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// File holding the test function source
        #[arg(short, long)]
        function: PathBuf,

        /// Function called by the payload
        #[arg(short, long, default_value = "main")]
        entry: String,

        /// Regex stripped from the source before it is shipped (repeatable)
        #[arg(short = 'x', long = "exclude")]
        exclude: Vec<String>,

        /// Run instances concurrently
        #[arg(long, default_value = "false")]
        parallel: bool,

        /// Keep instances after the run, overriding the config
        #[arg(long, default_value = "false")]
        preserve: bool,

        /// Image catalog (defaults to config/images.json when present)
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Store the run record in Redis
        #[arg(long)]
        redis_url: Option<String>,
    },

    /// Show whether each configured instance exists and is running
    Status {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List catalogued images
    Images {
        #[arg(long, default_value = "config/images.json")]
        catalog: PathBuf,
    },

    /// Print a stored run record
    Report {
        /// Base name of the run
        #[arg(short, long)]
        name: String,

        /// Specific run id (defaults to the latest run for the name)
        #[arg(long)]
        run_id: Option<String>,

        #[arg(long, default_value = "redis://127.0.0.1:6379")]
        redis_url: String,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // stdout carries command output; logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run {
            config,
            function,
            entry,
            exclude,
            parallel,
            preserve,
            catalog,
            redis_url,
        } => {
            let all_passed = commands::run(commands::RunArgs {
                config,
                function,
                entry,
                exclude,
                parallel,
                preserve,
                catalog,
                redis_url,
            })
            .await?;

            if !all_passed {
                std::process::exit(1);
            }
        }
        Commands::Status { config } => {
            commands::status(&config).await?;
        }
        Commands::Images { catalog } => {
            commands::images(&catalog)?;
        }
        Commands::Report {
            name,
            run_id,
            redis_url,
        } => {
            commands::report(&name, run_id.as_deref(), &redis_url).await?;
        }
    }

    Ok(())
}
