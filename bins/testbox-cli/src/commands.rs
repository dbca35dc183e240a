// CLI commands for testbox
use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use testbox_common::config::RunConfig;
use testbox_common::package::SourceText;
use testbox_common::redis as store;
use testbox_common::types::RunRecord;
use testbox_core::aggregator;
use testbox_core::docker::DockerBackend;
use testbox_core::{ImageCatalog, RunMode, Runner, TestFunction};
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_CATALOG: &str = "config/images.json";

pub struct RunArgs {
    pub config: PathBuf,
    pub function: PathBuf,
    pub entry: String,
    pub exclude: Vec<String>,
    pub parallel: bool,
    pub preserve: bool,
    pub catalog: Option<PathBuf>,
    pub redis_url: Option<String>,
}

fn load_config(path: &Path) -> Result<RunConfig> {
    RunConfig::load(path).with_context(|| format!("Failed to load run config {}", path.display()))
}

/// Explicit catalog, else the default one when it exists, else an empty
/// catalog (every image is inferred from its tag).
fn load_catalog(path: Option<&Path>) -> Result<ImageCatalog> {
    match path {
        Some(path) => ImageCatalog::load(path),
        None if Path::new(DEFAULT_CATALOG).exists() => ImageCatalog::load_default(),
        None => {
            info!("No image catalog found, inferring image families from tags");
            Ok(ImageCatalog::default())
        }
    }
}

fn docker() -> Result<Arc<DockerBackend>> {
    let backend = DockerBackend::connect().context("Failed to connect to Docker daemon")?;
    Ok(Arc::new(backend))
}

async fn redis_connection(url: &str) -> Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url).with_context(|| format!("Invalid Redis URL {}", url))?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", url))?;
    Ok(conn)
}

/// Run a test function; returns whether every instance passed.
pub async fn run(args: RunArgs) -> Result<bool> {
    let mut config = load_config(&args.config)?;
    if args.preserve {
        config.preserve = true;
    }
    let catalog = load_catalog(args.catalog.as_deref())?;

    if !args.function.is_file() {
        bail!("Test function file not found: {}", args.function.display());
    }
    let function = TestFunction::new(SourceText::File(args.function.clone()), args.entry)
        .with_exclusions(args.exclude);

    // connect before the run so an unreachable store cannot discard results
    let mut store_conn = match args.redis_url.as_deref() {
        Some(url) => Some(redis_connection(url).await?),
        None => None,
    };

    let mode = if args.parallel {
        RunMode::Parallel
    } else {
        RunMode::Serial
    };
    let name = config.name.clone();
    let runner = Runner::new(docker()?, Arc::new(catalog), config);

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(run_id = %run_id, run = %name, mode = ?mode, "Starting testbox run");

    let results = match runner.run(&function, mode).await {
        Ok(results) => results,
        Err(e) => {
            error!(run_id = %run_id, "Run aborted: {}", e);
            return Err(e).context(format!("Run '{}' aborted", name));
        }
    };
    let summary = aggregator::summarize(&results);

    let record = RunRecord {
        run_id,
        name,
        started_at,
        finished_at: Utc::now(),
        results,
    };

    if let Some(conn) = store_conn.as_mut() {
        match store::store_run(conn, &record).await {
            Ok(()) => info!(key = %store::run_key(&record.run_id), "Run record stored"),
            Err(e) => warn!("Failed to store run record: {}", e),
        }
    }

    let output = json!({
        "run_id": record.run_id,
        "name": record.name,
        "summary": summary,
        "results": record.results,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(record.results.all_succeeded())
}

pub async fn status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    // probes only use instance names
    let runner = Runner::new(docker()?, Arc::new(ImageCatalog::default()), config);

    let probes = runner
        .status()
        .await
        .context("Failed to query instance status")?;

    let output: Vec<_> = probes
        .iter()
        .map(|probe| {
            json!({
                "name": probe.name,
                "image": probe.image,
                "state": probe.state(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub fn images(catalog_path: &Path) -> Result<()> {
    let catalog = ImageCatalog::load(catalog_path)?;

    println!("Catalogued images ({}):", catalog_path.display());
    for name in catalog.list_images() {
        let image = catalog.get_config(&name);
        println!("  {:<16} {:<32} family={}", name, image.reference, image.family);
        if !image.pip_packages.is_empty() {
            println!("  {:<16} pip: {}", "", image.pip_packages.join(", "));
        }
    }
    Ok(())
}

pub async fn report(name: &str, run_id: Option<&str>, redis_url: &str) -> Result<()> {
    let mut conn = redis_connection(redis_url).await?;

    let run_id = match run_id {
        Some(id) => Uuid::parse_str(id).with_context(|| format!("Invalid run id {}", id))?,
        None => match store::latest_run_id(&mut conn, name).await? {
            Some(id) => id,
            None => bail!("No stored runs for '{}'", name),
        },
    };

    let record = store::get_run(&mut conn, &run_id)
        .await?
        .with_context(|| format!("Run {} not found (records expire after 24h)", run_id))?;
    if record.name != name {
        warn!(stored = %record.name, requested = %name, "Run record belongs to a different name");
    }

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
