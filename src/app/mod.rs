use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rayon::prelude::*;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, EngineMode};
use crate::geocoder::{NominatimGeocoder, RateLimiter};
use crate::pipeline::{EnrichSettings, Enricher, IngestError, RoutePipeline, Upload};
use crate::render::MapRenderer;
use crate::storage::{Route, RouteId, RouteStore};
use crate::tasks::{InlineQueue, TaskQueue, TaskReport, WorkerPool};
use crate::utils::{ProgressCounter, is_coordinate_string, split_tag_list};

/// Largest GPX upload accepted.
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Parser)]
#[command(author, version, about = "Import GPX routes, enrich them with locations and map thumbnails", long_about = None)]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "GPXROUTES_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory (overrides storage.data_dir)
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Enrichment worker threads (0 = run inline)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Thumbnail engine: auto, browser or canvas
    #[arg(long)]
    pub engine: Option<EngineMode>,

    /// Threads for parallel thumbnail regeneration (default: all cores)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Upload one GPX file; it is parsed before the command returns
    Upload {
        file: PathBuf,
        /// Route name (defaults to the GPX name, then the filename)
        #[arg(long)]
        name: Option<String>,
        /// Comma-separated tags
        #[arg(long, default_value = "")]
        tags: String,
    },
    /// Queue many GPX files; parsing happens in the background
    BulkUpload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Comma-separated tags applied to every upload
        #[arg(long, default_value = "")]
        tags: String,
    },
    /// Fill in missing start locations, thumbnails and maps
    Enrich {
        #[arg(long)]
        route_id: Option<RouteId>,
    },
    /// Re-process start locations against the start point list
    UpdateStartLocations(UpdateStartLocationsArgs),
    /// Regenerate thumbnail images
    RegenerateThumbnails(RegenerateThumbnailsArgs),
    /// List routes, newest first
    List {
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        search: Option<String>,
    },
    /// Print one route as JSON, by id or share token
    Show {
        #[arg(required_unless_present = "token")]
        id: Option<RouteId>,
        #[arg(long, conflicts_with = "id")]
        token: Option<String>,
        /// Also write the stored thumbnail to this path
        #[arg(long)]
        thumbnail_out: Option<PathBuf>,
    },
    /// Delete a route and its stored files
    Delete { id: RouteId },
}

#[derive(Args)]
pub struct UpdateStartLocationsArgs {
    /// Reprocess all routes (default: only routes without start_location)
    #[arg(long)]
    pub all: bool,
    /// Re-geocode routes that don't match start points (slower, hits the API)
    #[arg(long)]
    pub force_geocode: bool,
    /// Show what would be updated without making changes
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct RegenerateThumbnailsArgs {
    /// Include routes without a thumbnail (default: only routes with one)
    #[arg(long)]
    pub all: bool,
    /// Regenerate even if a thumbnail already exists
    #[arg(long)]
    pub force: bool,
    /// Show what would be updated without making changes
    #[arg(long)]
    pub dry_run: bool,
    /// Regenerate a single route
    #[arg(long)]
    pub route_id: Option<RouteId>,
}

pub struct AppContext {
    pub config: AppConfig,
    pub store: Arc<RouteStore>,
    pub enricher: Arc<Enricher>,
    pub verbose: bool,
}

impl AppContext {
    pub fn build(cli: &Cli) -> Result<Self> {
        let mut config = AppConfig::load(cli.config.as_deref())?;
        if let Some(dir) = &cli.data_dir {
            config.storage.data_dir = dir.clone();
        }
        if let Some(workers) = cli.workers {
            config.workers = workers;
        }
        if let Some(engine) = cli.engine {
            config.render.engine = engine;
        }

        let store = Arc::new(
            RouteStore::open(&config.storage.data_dir).context("CLI: Failed to open data directory")?,
        );
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(
            config.geocoder.min_interval_ms,
        )));
        let geocoder = Arc::new(NominatimGeocoder::new(&config.geocoder, limiter)?);
        let renderer = Arc::new(MapRenderer::from_config(&config.render));
        tracing::info!(
            "Data: {:?}, {} start points, engines: {}",
            config.storage.data_dir,
            config.start_points.len(),
            renderer.engine_names().join(", ")
        );

        let enricher = Arc::new(Enricher::new(
            store.clone(),
            Arc::new(config.start_points.clone()),
            geocoder,
            renderer,
            EnrichSettings::from_config(&config),
        ));

        Ok(Self {
            config,
            store,
            enricher,
            verbose: cli.verbose,
        })
    }

    pub fn pipeline(&self) -> RoutePipeline {
        let queue: Arc<dyn TaskQueue> = if self.config.workers == 0 {
            Arc::new(InlineQueue::new())
        } else {
            Arc::new(WorkerPool::new(self.config.workers))
        };
        RoutePipeline::new(self.store.clone(), self.enricher.clone(), queue)
    }
}

pub fn run(cli: &Cli) -> Result<()> {
    let ctx = AppContext::build(cli)?;
    match &cli.command {
        Command::Upload { file, name, tags } => upload(&ctx, file, name.clone(), tags),
        Command::BulkUpload { files, tags } => bulk_upload(&ctx, files, tags),
        Command::Enrich { route_id } => enrich(&ctx, *route_id),
        Command::UpdateStartLocations(args) => update_start_locations(&ctx, args),
        Command::RegenerateThumbnails(args) => regenerate_thumbnails(&ctx, args),
        Command::List { tag, search } => list(&ctx, tag.as_deref(), search.as_deref()),
        Command::Show {
            id,
            token,
            thumbnail_out,
        } => show(&ctx, *id, token.as_deref(), thumbnail_out.as_deref()),
        Command::Delete { id } => delete(&ctx, *id),
    }
}

/// Size and extension checks an upload must pass before parsing.
pub fn read_upload(path: &Path, name: Option<String>, tags: Vec<String>) -> Result<Upload> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Upload: Invalid file name {:?}", path))?
        .to_string();
    if !path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gpx"))
    {
        bail!("Upload: {filename}: only .gpx files are accepted");
    }
    let size = std::fs::metadata(path)
        .with_context(|| format!("Upload: Cannot read {:?}", path))?
        .len();
    if size > MAX_UPLOAD_BYTES {
        bail!("Upload: {filename}: file is larger than 10MB");
    }
    let bytes = std::fs::read(path).with_context(|| format!("Upload: Cannot read {:?}", path))?;
    Ok(Upload {
        filename,
        bytes,
        name,
        tags,
    })
}

fn print_reports(reports: &[TaskReport]) {
    for report in reports {
        if report.ok {
            println!("{}", report.message);
        } else {
            println!("ERROR: {}", report.message);
        }
    }
}

fn upload(ctx: &AppContext, file: &Path, name: Option<String>, tags: &str) -> Result<()> {
    let upload = read_upload(file, name, split_tag_list(tags))?;
    let filename = upload.filename.clone();
    let pipeline = ctx.pipeline();

    let route = match pipeline.ingest(upload) {
        Ok(route) => route,
        Err(err @ IngestError::Parse(_)) => bail!("Upload: {filename}: {err}"),
        Err(IngestError::Storage(err)) => return Err(err.context(format!("Upload: {filename}"))),
    };
    println!(
        "Route \"{}\" uploaded successfully! (id {}, {:.2} km, {:.0} m gain)",
        route.name, route.id, route.distance_km, route.elevation_gain_m
    );

    print_reports(&pipeline.wait());
    Ok(())
}

fn bulk_upload(ctx: &AppContext, files: &[PathBuf], tags: &str) -> Result<()> {
    let tags = split_tag_list(tags);
    let pipeline = ctx.pipeline();
    let mut failed_files = Vec::new();

    for file in files {
        let queued = read_upload(file, None, tags.clone()).and_then(|upload| pipeline.ingest_deferred(upload));
        if let Err(err) = queued {
            failed_files.push(format!("{} ({:#})", file.display(), err));
        }
    }

    let reports = pipeline.wait();
    let uploaded = reports.iter().filter(|r| r.ok).count();
    failed_files.extend(reports.iter().filter(|r| !r.ok).map(|r| r.message.clone()));

    if ctx.verbose {
        print_reports(&reports);
    }
    if uploaded > 0 {
        println!("Successfully uploaded {uploaded} route(s)");
    }
    if !failed_files.is_empty() {
        println!("Failed to upload: {}", failed_files.join(", "));
    }
    Ok(())
}

fn enrich(ctx: &AppContext, route_id: Option<RouteId>) -> Result<()> {
    let ids: Vec<RouteId> = match route_id {
        Some(id) => vec![id],
        None => ctx.store.all()?.iter().map(|r| r.id).collect(),
    };
    let pipeline = ctx.pipeline();
    for id in ids {
        pipeline.schedule_enrichment(id)?;
    }
    print_reports(&pipeline.wait());
    Ok(())
}

#[derive(Default)]
struct LocationSummary {
    matched: usize,
    geocoded: usize,
    unchanged: usize,
    errors: usize,
}

fn update_start_locations(ctx: &AppContext, args: &UpdateStartLocationsArgs) -> Result<()> {
    let routes: Vec<Route> = ctx
        .store
        .all()?
        .into_iter()
        .filter(|r| r.start().is_some() && (args.all || r.start_location.is_empty()))
        .collect();

    if args.all {
        println!("Processing all {} routes with coordinates...", routes.len());
    } else {
        println!("Processing {} routes without start_location...", routes.len());
    }
    if routes.is_empty() {
        println!("No routes to process.");
        return Ok(());
    }
    println!("Checking against {} start points...", ctx.config.start_points.len());

    let mut summary = LocationSummary::default();
    for route in &routes {
        if let Err(err) = update_one_location(ctx, route, args, &mut summary) {
            summary.errors += 1;
            println!("  [ERR] Route #{} '{}': Error - {:#}", route.id, route.name, err);
        }
    }

    println!("\n{}", "=".repeat(60));
    if args.dry_run {
        println!("DRY RUN - No changes were made");
    }
    println!("\nSummary:");
    println!("  Matched to start points: {}", summary.matched);
    if args.force_geocode {
        println!("  Re-geocoded: {}", summary.geocoded);
    }
    println!("  Unchanged: {}", summary.unchanged);
    if summary.errors > 0 {
        println!("  Errors: {}", summary.errors);
    }
    println!("  Total processed: {}", routes.len());
    Ok(())
}

fn update_one_location(
    ctx: &AppContext,
    route: &Route,
    args: &UpdateStartLocationsArgs,
    summary: &mut LocationSummary,
) -> Result<()> {
    let Some((lat, lon)) = route.start() else {
        return Ok(());
    };
    let old = &route.start_location;

    if let Some(start_point) = ctx.enricher.match_start_point(lat, lon) {
        if &start_point.name == old {
            summary.unchanged += 1;
            if ctx.verbose {
                println!("  - Route #{} '{}': Already matches '{}'", route.id, route.name, old);
            }
            return Ok(());
        }
        summary.matched += 1;
        println!(
            "  [OK] Route #{} '{}': '{}' -> '{}' (start point)",
            route.id, route.name, old, start_point.name
        );
        if !args.dry_run {
            ctx.store.replace_start_location(route.id, &start_point.name)?;
        }
        return Ok(());
    }

    if !args.force_geocode || !is_coordinate_string(old) {
        summary.unchanged += 1;
        if ctx.verbose {
            println!("  - Route #{} '{}': No start point match, keeping '{}'", route.id, route.name, old);
        }
        return Ok(());
    }

    // Calls go through the shared rate limiter, one at a time.
    let geocoded = ctx.enricher.geocode(lat, lon);
    if geocoded.is_empty() || &geocoded == old {
        summary.unchanged += 1;
        return Ok(());
    }
    summary.geocoded += 1;
    println!(
        "  [GEO] Route #{} '{}': '{}' -> '{}' (geocoded)",
        route.id, route.name, old, geocoded
    );
    if !args.dry_run {
        ctx.store.replace_start_location(route.id, &geocoded)?;
    }
    Ok(())
}

enum ThumbnailOutcome {
    Regenerated,
    WouldRegenerate,
    Failed(String),
}

fn regenerate_thumbnails(ctx: &AppContext, args: &RegenerateThumbnailsArgs) -> Result<()> {
    let with_coordinates = ctx.store.all()?.into_iter().filter(|r| !r.coordinates.is_empty());
    let routes: Vec<Route> = if let Some(id) = args.route_id {
        let routes: Vec<Route> = with_coordinates.filter(|r| r.id == id).collect();
        if routes.is_empty() {
            println!("Route #{id} not found or has no coordinates.");
            return Ok(());
        }
        println!("Processing route #{id}...");
        routes
    } else if args.all || args.force {
        let routes: Vec<Route> = with_coordinates.collect();
        println!("Processing all {} routes with coordinates...", routes.len());
        routes
    } else {
        let routes: Vec<Route> = with_coordinates.filter(|r| r.has_thumbnail()).collect();
        println!("Processing {} routes with existing thumbnails...", routes.len());
        routes
    };

    if routes.is_empty() {
        println!("No routes to process.");
        return Ok(());
    }

    let (width, height) = ctx.enricher.settings().thumbnail_size;
    let progress = ProgressCounter::new("Rendering", routes.len() as u64, std::io::stderr().is_terminal());
    let outcomes: Vec<(&Route, ThumbnailOutcome)> = routes
        .par_iter()
        .map(|route| {
            let outcome = if args.dry_run {
                ThumbnailOutcome::WouldRegenerate
            } else {
                match ctx.enricher.renderer().render(&route.coordinates, width, height) {
                    Some(bytes) => match ctx.store.store_thumbnail(route.id, &bytes, true) {
                        Ok(_) => ThumbnailOutcome::Regenerated,
                        Err(err) => ThumbnailOutcome::Failed(format!("Error - {err:#}")),
                    },
                    None => ThumbnailOutcome::Failed("Failed to generate thumbnail".to_string()),
                }
            };
            progress.inc();
            (route, outcome)
        })
        .collect();
    progress.finish();

    let mut success = 0;
    let mut errors = 0;
    for (route, outcome) in &outcomes {
        match outcome {
            ThumbnailOutcome::Regenerated => {
                success += 1;
                println!("  [OK] Route #{} '{}': Thumbnail regenerated successfully", route.id, route.name);
            }
            ThumbnailOutcome::WouldRegenerate => {
                success += 1;
                println!("  [OK] Route #{} '{}': Would regenerate thumbnail", route.id, route.name);
            }
            ThumbnailOutcome::Failed(reason) => {
                errors += 1;
                println!("  [ERR] Route #{} '{}': {}", route.id, route.name, reason);
            }
        }
    }

    println!("\n{}", "=".repeat(60));
    if args.dry_run {
        println!("DRY RUN - No changes were made");
    }
    println!("\nSummary:");
    println!("  Successfully regenerated: {success}");
    if errors > 0 {
        println!("  Errors: {errors}");
    }
    println!("  Total processed: {}", routes.len());
    Ok(())
}

pub fn filter_routes<'a>(routes: &'a [Route], tag: Option<&str>, search: Option<&str>) -> Vec<&'a Route> {
    let search = search.map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty());
    routes
        .iter()
        .filter(|route| match tag {
            Some(tag) => route.tags.iter().any(|t| t.eq_ignore_ascii_case(tag.trim())),
            None => true,
        })
        .filter(|route| match &search {
            Some(needle) => route.name.to_lowercase().contains(needle),
            None => true,
        })
        .collect()
}

fn list(ctx: &AppContext, tag: Option<&str>, search: Option<&str>) -> Result<()> {
    let routes = ctx.store.all()?;
    for route in filter_routes(&routes, tag, search) {
        println!(
            "{:>5}  {:<40}  {:>8.2} km ({:.2} mi)  {:>6.0} m  {}  [{}]",
            route.id,
            route.name,
            route.distance_km,
            route.distance_miles(),
            route.elevation_gain_m,
            route.start_location,
            route.tags.join(", ")
        );
    }
    Ok(())
}

fn show(ctx: &AppContext, id: Option<RouteId>, token: Option<&str>, thumbnail_out: Option<&Path>) -> Result<()> {
    let route = match (id, token) {
        (_, Some(token)) => ctx.store.find_by_share_token(token)?,
        (Some(id), None) => ctx.store.get(id)?,
        (None, None) => None,
    };
    let Some(route) = route else {
        bail!("CLI: Route not found");
    };
    println!("{}", serde_json::to_string_pretty(&route)?);

    if let Some(out) = thumbnail_out {
        let Some(thumbnail) = route.thumbnail.as_deref().filter(|t| !t.is_empty()) else {
            bail!("CLI: Route {} has no thumbnail yet", route.id);
        };
        let bytes = ctx.store.read_blob(thumbnail)?;
        std::fs::write(out, bytes).with_context(|| format!("CLI: Failed to write {:?}", out))?;
    }
    Ok(())
}

fn delete(ctx: &AppContext, id: RouteId) -> Result<()> {
    if ctx.store.delete(id)? {
        println!("Deleted route {id}");
    } else {
        println!("Route {id} not found");
    }
    Ok(())
}
