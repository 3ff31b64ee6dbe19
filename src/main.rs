//! quadtile - drives the tile cache through a simulated terrain camera walk.

use clap::Parser;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quadtile::{
    config::{Cli, Command, OutputFormat, SimulateConfig, StorageBudget},
    simulation::{self, CacheReport, SimulationReport},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Simulate(config) => run_simulate(config).await,
        Command::Check(config) => run_check(config),
    }
}

// =============================================================================
// Simulate Command
// =============================================================================

async fn run_simulate(config: SimulateConfig) -> ExitCode {
    init_logging(config.verbose);

    let report = match simulation::run(&config).await {
        Ok(report) => report,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match config.format {
        OutputFormat::Text => print_report(&report),
        OutputFormat::Json => {
            if let Err(e) = print_json(&report) {
                error!("Failed to serialize report: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

fn print_report(report: &SimulationReport) {
    println!("quadtile simulation");
    println!("═══════════════════");
    println!();
    println!("Frames:           {}", report.frames);
    println!("Levels:           {}", report.levels);
    println!("Tile size:        {}", report.tile_size);
    println!("Workers:          {}", report.workers);
    println!("Prefetch:         {}", report.prefetch);
    println!("Peak visible:     {}", report.peak_visible);
    println!("Tiles requested:  {}", report.tiles_requested);
    println!("Tiles ready:      {}", report.tiles_ready);
    println!("Tiles refused:    {}", report.tiles_unavailable);
    println!("Tasks scheduled:  {}", report.tasks_scheduled);
    println!("Tasks executed:   {}", report.tasks_executed);
    println!("Elapsed:          {} ms", report.elapsed_ms);

    print_cache(&report.heights);
    if let Some(ref slopes) = report.slopes {
        print_cache(slopes);
    }
}

fn print_cache(cache: &CacheReport) {
    let stats = &cache.stats;
    println!();
    println!("Cache '{}'", cache.name);
    println!("─────────────────");
    println!("  Slots:          {} ({} free)", cache.capacity, cache.free_slots);
    println!("  Used / unused:  {} / {}", cache.used, cache.unused);
    println!("  Hits:           {}", stats.hits);
    println!("  Unused hits:    {}", stats.unused_hits);
    println!("  Misses:         {}", stats.misses);
    println!("  Hit rate:       {:.1}%", stats.hit_rate() * 100.0);
    println!("  Evictions:      {}", stats.evictions);
    println!("  Resurrections:  {}", stats.resurrections);
    println!("  Exhausted:      {}", stats.exhausted);
    println!("  Prefetches:     {}", stats.prefetches);
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Check Command
// =============================================================================

fn run_check(config: SimulateConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    if let Err(e) = config.validate() {
        match config.format {
            OutputFormat::Text => println!("✗ Configuration: {}", e),
            OutputFormat::Json => {
                let json = serde_json::json!({ "valid": false, "error": e.to_string() });
                println!("{}", json);
            }
        }
        return ExitCode::FAILURE;
    }

    let budget = config.storage_budget();
    match config.format {
        OutputFormat::Text => print_budget(&config, &budget),
        OutputFormat::Json => {
            let json = serde_json::json!({ "valid": true, "budget": budget });
            println!("{}", json);
        }
    }
    ExitCode::SUCCESS
}

fn print_budget(config: &SimulateConfig, budget: &StorageBudget) {
    println!("quadtile configuration check");
    println!("════════════════════════════");
    println!();
    println!("✓ Tile size: {} ({} border)", config.tile_size, config.border);
    println!("✓ Levels: {}", config.levels);
    println!("✓ Frames: {}", config.frames);
    println!();
    println!("Storage budget:");
    println!("  Caches:          {}", budget.caches);
    println!("  Slots per cache: {}", budget.slots_per_cache);
    println!("  Bytes per slot:  {}", budget.bytes_per_slot);
    println!(
        "  Total:           {} bytes ({:.1} MiB)",
        budget.total_bytes,
        budget.total_bytes as f64 / (1024.0 * 1024.0)
    );
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "quadtile=debug"
    } else {
        "quadtile=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
