mod config;
mod netcdf;
mod shapefile;
mod sqlite;
use clap::{Args, Parser, Subcommand};

use config::{load_config, Job};
use netcdf::NetcdfReader;
use rusqlite::Connection;
use shapefile::read_shapefile;
use sqlite::write_to_db;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zonal_aggregation::{RasterInput, StatsFunctionType, ZonalOptions, ZonalOrchestrator, ZonalRequest};

#[derive(Parser, Debug)]
#[command(version, about = "Zonal statistics of gridded rasters over polygon zones", long_about = None)]
struct Cli {
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Aggregate one or more netcdf files over the zones of a shapefile
    Run(RunArgs),
    /// Run every job of a YAML configuration file
    Batch {
        #[clap(help = "Path to the configuration file")]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[clap(help = "Path to the shapefile")]
    shp_file: PathBuf,

    #[clap(help = "Name of the field to use as the id of the feature")]
    field: String,

    #[clap(help = "Name of the variable to extract")]
    variable: String,

    #[clap(help = "Comma separated list of stats functions to apply")]
    stats: String,

    #[clap(required = true, help = "Paths or glob patterns of the netcdf files")]
    rasters: Vec<String>,

    #[clap(long, default_value = "0", help = "Index of the layer to aggregate")]
    subdataset: usize,

    #[clap(long, help = "Largest leading dimension sent to the remote engine")]
    threshold: Option<usize>,

    #[clap(long, help = "Show progress bars")]
    progress: bool,

    #[clap(long, help = "Do not join the zone attributes to the results")]
    no_join: bool,

    #[clap(long, value_delimiter = ',', help = "Columns to drop from the results")]
    drop: Vec<String>,

    #[clap(long, help = "CRS tag attached to the zones")]
    crs: Option<String>,

    #[clap(long, help = "Name of the table to write the results to")]
    table: Option<String>,

    #[clap(long, help = "Path to the output file", default_value = "cache.db")]
    output: PathBuf,
}

impl RunArgs {
    fn to_job(&self) -> Job {
        Job {
            shapefile: self.shp_file.to_string_lossy().into_owned(),
            id_field: self.field.clone(),
            variable: self.variable.clone(),
            rasters: self.rasters.clone(),
            stats: self.stats.split(',').map(|s| s.trim().to_string()).collect(),
            subdataset_index: self.subdataset,
            drop: self.drop.clone(),
            join_geometry: !self.no_join,
            crs: self.crs.clone(),
            table: self.table.clone(),
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("a global tracing subscriber is already installed");
    }
}

/// Expand every glob pattern, keeping the order of the patterns.
fn expand_rasters(patterns: &[String]) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    let mut paths = vec![];
    for pattern in patterns {
        let matches = glob::glob(pattern)?.collect::<Result<Vec<_>, _>>()?;
        if matches.is_empty() {
            return Err(format!("No file matches {pattern}").into());
        }
        paths.extend(matches);
    }
    Ok(paths)
}

/// Default table name: shapefile name, id field and variable.
fn default_table(job: &Job) -> Result<String, Box<dyn Error>> {
    let shp_file_name = Path::new(&job.shapefile)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| format!("Invalid shapefile path {}", job.shapefile))?;
    Ok(format!("{}_{}_{}", shp_file_name, job.id_field, job.variable))
}

/// Read the zones and the rasters of a job, compute the stats and write
/// one table per raster to the database.
///
/// # Arguments
///
/// * `job` - The job to run
/// * `remote_threshold` - Overrides the orchestrator threshold when set
/// * `show_progress` - Display progress bars
/// * `conn` - Output database
fn process(
    job: &Job,
    remote_threshold: Option<usize>,
    show_progress: bool,
    conn: &mut Connection,
) -> Result<(), Box<dyn Error>> {
    let stats = job
        .stats
        .iter()
        .map(|s| StatsFunctionType::from_str(s).map_err(|e| format!("Invalid stat {s}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    let rasters = expand_rasters(&job.rasters)?;
    let table = match &job.table {
        Some(table) => table.clone(),
        None => default_table(job)?,
    };

    let start = Instant::now();
    let zones = read_shapefile(Path::new(&job.shapefile), &job.id_field)?;
    info!("Reading shapefile took {:?}", start.elapsed());

    let mut orchestrator = ZonalOrchestrator::new().with_reader(NetcdfReader {
        variable: job.variable.clone(),
    });
    if let Some(threshold) = remote_threshold {
        orchestrator = orchestrator.with_remote_threshold(threshold);
    }

    let options = ZonalOptions {
        stats,
        subdataset_index: job.subdataset_index,
        show_progress,
        join_geometry: job.join_geometry,
        drop_columns: job.drop.clone(),
        crs: job.crs.clone(),
        ..Default::default()
    };
    let request = ZonalRequest::new()
        .data(rasters.into_iter().map(RasterInput::File).collect::<Vec<_>>())
        .geometry(zones)
        .id_field(job.id_field.as_str())
        .options(options);

    let start = Instant::now();
    let tables = orchestrator.execute(request)?.into_tables();
    info!("Calculating stats took {:?}", start.elapsed());

    let start = Instant::now();
    let n_tables = tables.len();
    for (i, result) in tables.iter().enumerate() {
        let name = if n_tables == 1 {
            table.clone()
        } else {
            format!("{table}_{i}")
        };
        write_to_db(conn, result, &name)?;
    }
    info!("Writing {} table(s) to db took {:?}", n_tables, start.elapsed());

    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run(args) => {
            let job = args.to_job();
            let mut conn = Connection::open(&args.output)?;
            process(&job, args.threshold, args.progress, &mut conn)?;
            conn.close().or(Err("Failed to close the connection"))?;
        }
        Commands::Batch { config } => {
            let config = load_config(&config)?;
            let mut conn = Connection::open(&config.output_path)?;
            for job in &config.jobs {
                info!(shapefile = %job.shapefile, variable = %job.variable, "running job");
                process(job, config.remote_threshold, false, &mut conn)?;
            }
            conn.close().or(Err("Failed to close the connection"))?;
        }
    }

    Ok(())
}
