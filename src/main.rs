//! Walks a viewer over a procedural meadow and logs what the mesh generator does each frame.

mod ground;
mod sinks;

use std::error::Error;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{LevelFilter, error, info, warn};
use meshgen_core::config::{self, GeneratorConfig};
use meshgen_core::{DensityFactorMap, MapTransform, MeshFactory, MeshGenError, MeshGenerator};
use meshgen_geom::{Aabb, Vec3};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

use ground::NoiseGround;
use sinks::LoggingFactory;

const BUILTIN_CONFIG: &str = include_str!("../config/meshgen.toml");
const MEADOW_MAP: &str = "meadow";
const MEADOW_RES: usize = 64;
const EYE_HEIGHT: f32 = 1.7;

#[derive(Parser, Debug)]
#[command(name = "meshgen")]
#[command(about = "Scatters instanced meshes around a moving viewer and logs per-frame stats")]
struct Args {
    /// Generator config (TOML). Uses the built-in meadow when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frames to simulate.
    #[arg(short, long, default_value_t = 240)]
    frames: u32,

    /// Distance the viewer moves per frame.
    #[arg(short, long, default_value_t = 1.5)]
    step: f32,

    /// Terrain and density map seed.
    #[arg(long, default_value_t = 1337)]
    seed: i32,

    /// Log debug output to the terminal.
    #[arg(short, long)]
    verbose: bool,

    /// Also write a full debug log here.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<(), Box<dyn Error>> {
    let term_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        term_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &args.log_file {
        loggers.push(WriteLogger::new(
            LevelFilter::Debug,
            Config::default(),
            File::create(path)?,
        ));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn resolve_factory(name: &str) -> Option<Arc<dyn MeshFactory>> {
    let factory: Arc<dyn MeshFactory> = match name {
        "grass_hi" | "grass_lo" | "rock" => Arc::new(LoggingFactory::new(name)),
        _ => return None,
    };
    Some(factory)
}

fn terrain(seed: i32) -> NoiseGround {
    NoiseGround::new(seed, 0.01, 0.0, 12.0)
}

/// Greyscale meadow mask covering the sample box, brighter where grass grows thick.
fn meadow_map(seed: i32, sample_box: &Aabb) -> Result<DensityFactorMap, MeshGenError> {
    let mask = NoiseGround::new(seed ^ 0x5EED, 3.0 / MEADOW_RES as f32, 0.5, 0.5);
    let luma: Vec<u8> = (0..MEADOW_RES * MEADOW_RES)
        .map(|i| {
            let (x, z) = ((i % MEADOW_RES) as f32, (i / MEADOW_RES) as f32);
            (mask.height(x, z).clamp(0.0, 1.0) * 255.0) as u8
        })
        .collect();
    DensityFactorMap::from_luma(
        MEADOW_RES,
        MEADOW_RES,
        &luma,
        MapTransform::covering(sample_box.xz_rect()),
    )
}

fn build_generator(cfg: &GeneratorConfig, seed: i32) -> Result<MeshGenerator, Box<dyn Error>> {
    let mut mg = MeshGenerator::new();
    if let Some(sample_box) = &cfg.sample_box {
        let sample_box = sample_box.to_aabb();
        mg.add_density_factor_map(MEADOW_MAP, meadow_map(seed, &sample_box)?);
        mg.add_ground_mesh(Arc::new(terrain(seed).with_bounds(sample_box)));
    }
    mg.apply_config(cfg, resolve_factory)?;
    info!(
        "generator ready: {} geometries, {}x{} cells, {} blocks, max draw distance {:.1}",
        mg.geometry_count(),
        mg.cell_count(),
        mg.cell_count(),
        mg.block_count(),
        mg.total_max_dist()
    );
    Ok(mg)
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(&args)?;

    let cfg = match &args.config {
        Some(path) => {
            info!("loading config from {}", path.display());
            config::load_config_from_path(path)?
        }
        None => config::from_toml_str(BUILTIN_CONFIG)?,
    };
    let Some(sample_box) = cfg.sample_box.as_ref().map(|b| b.to_aabb()) else {
        error!("config has no sample_box; nothing to scatter over");
        return Ok(());
    };
    let mut mg = build_generator(&cfg, args.seed)?;
    let ground = terrain(args.seed);

    // Circle the middle of the box.
    let area = sample_box.xz_rect();
    let (cx, cz) = (
        (area.min_x + area.max_x) * 0.5,
        (area.min_z + area.max_z) * 0.5,
    );
    let radius = area.min_side() * 0.3;
    let mut budget_errors = 0u32;
    for frame in 0..args.frames {
        let angle = frame as f32 * args.step / radius.max(1.0);
        let (x, z) = (cx + radius * angle.cos(), cz + radius * angle.sin());
        let viewer = Vec3::new(x, ground.height(x, z) + EYE_HEIGHT, z);
        match mg.update_for_position(viewer) {
            Ok(stats) => info!(
                "frame={frame} pos=({x:.1}, {z:.1}) cells={} generated={} stolen={} alloc={} freed={} live={}",
                stats.cells_in_range,
                stats.blocks_generated,
                stats.blocks_stolen,
                stats.instances_allocated,
                stats.instances_freed,
                stats.live_instances
            ),
            Err(e @ MeshGenError::BlockBudgetExceeded { .. }) => {
                budget_errors += 1;
                warn!("frame={frame} skipped: {e}");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let pool = mg.pool_stats();
    info!(
        "done: live={} blocks_in_use={} hits={} misses={} evictions={} skipped_frames={budget_errors}",
        mg.live_instances(),
        pool.in_use,
        pool.hits,
        pool.misses,
        pool.evictions
    );
    if let Err(e) = mg.validate() {
        error!("{e}");
    }
    Ok(())
}
