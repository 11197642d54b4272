//! Residency simulator - drives the geometry manager with a synthetic scene.
//!
//! Usage: cargo run --release --bin residency_sim -- [OPTIONS]
//!
//! Options:
//!   --groups <N>        Number of LOD groups, laid out on a line (default: 500)
//!   --lods <N>          LODs per group (default: 4)
//!   --frames <N>        Frames to simulate (default: 240)
//!   --budget-mb <MB>    Resident budget in MiB (default: from config)
//!   --view <N>          Groups visible around the camera (default: 40)
//!   --config <PATH>     Load manager settings from a JSON file
//!   --save-config <PATH> Write the effective settings and exit
//!
//! The camera moves one group per frame. Visible groups are referenced from a
//! rayon pool and their first LOD follows the camera distance. Final stats are
//! printed as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use serde_json::json;

use rtgeom::core::types::GroupHandle;
use rtgeom::gpu::batch::ResourceReplace;
use rtgeom::gpu::device::{BuildParams, CommandList, GpuGeometry, GpuGeometryRef, RayTracingDevice};
use rtgeom::gpu::geometry::{GeometryInitializer, InitializerType, RayTracingGeometry};
use rtgeom::{GeometryManager, ManagerConfig};

/// Acceleration structure bytes per primitive
const BYTES_PER_PRIMITIVE: u64 = 64;

/// Primitives of LOD 0; every coarser LOD has a quarter
const LOD0_PRIMITIVES: u32 = 65536;

#[derive(Debug)]
struct SimGeometry;

impl GpuGeometry for SimGeometry {}

struct SimDevice;

impl RayTracingDevice for SimDevice {
    fn calc_geometry_size(&self, initializer: &GeometryInitializer) -> u64 {
        initializer.total_primitive_count as u64 * BYTES_PER_PRIMITIVE
    }
}

#[derive(Default)]
struct SimCommandList {
    created: usize,
    replaced: usize,
    built: usize,
    built_primitives: u64,
}

impl CommandList for SimCommandList {
    fn create_geometry(&mut self, initializer: &GeometryInitializer) -> GpuGeometryRef {
        log::trace!("create {} ({:?})", initializer.debug_name, initializer.kind);
        self.created += 1;
        Arc::new(SimGeometry)
    }

    fn replace_resources(&mut self, batch: Vec<ResourceReplace>) {
        self.replaced += batch.len();
    }

    fn build_acceleration_structures(&mut self, params: &[BuildParams]) {
        self.built += params.len();
        self.built_primitives += params.iter().map(|p| p.primitive_count as u64).sum::<u64>();
    }
}

struct SimGroup {
    handle: GroupHandle,
    position: usize,
    // Kept alive for the manager
    _lods: Vec<Arc<RayTracingGeometry>>,
}

fn main() {
    rtgeom::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    let group_count = parse_usize_arg(&args, "--groups").unwrap_or(500);
    let lod_count = parse_usize_arg(&args, "--lods").unwrap_or(4).clamp(1, 8);
    let frames = parse_u64_arg(&args, "--frames").unwrap_or(240);
    let view = parse_usize_arg(&args, "--view").unwrap_or(40);

    let mut config = match parse_str_arg(&args, "--config") {
        Some(path) => match ManagerConfig::load_sync(&PathBuf::from(&path)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => ManagerConfig {
            use_reference_based_residency: true,
            ..Default::default()
        },
    };
    if let Some(mb) = parse_u64_arg(&args, "--budget-mb") {
        match budget_bytes(mb) {
            Some(bytes) => config.resident_geometry_memory_pool_size = bytes,
            None => {
                eprintln!("--budget-mb {} is too large", mb);
                std::process::exit(1);
            }
        }
    }

    if let Some(path) = parse_str_arg(&args, "--save-config") {
        if let Err(e) = config.save_sync(&PathBuf::from(&path)) {
            eprintln!("Failed to save config {}: {}", path, e);
            std::process::exit(1);
        }
        println!("Config written to {}", path);
        return;
    }

    println!("=== rtgeom Residency Simulator ===");
    println!("Groups: {} x {} LODs", group_count, lod_count);
    println!("Frames: {}", frames);
    println!("View:   {} groups", view);
    println!(
        "Budget: {:.1} MiB ({})",
        config.resident_geometry_memory_pool_size as f64 / (1024.0 * 1024.0),
        if config.use_reference_based_residency { "reference based" } else { "all resident" }
    );
    println!();

    let manager = GeometryManager::new(config, Arc::new(SimDevice));
    let groups = register_scene(&manager, group_count, lod_count);

    let mut cmd = SimCommandList::default();
    let marked = AtomicUsize::new(0);
    let start = Instant::now();

    for frame in 1..=frames {
        let camera = (frame as usize) % group_count.max(1);

        for group in &groups {
            let distance = group.position.abs_diff(camera);
            let first_lod = (distance / view.max(1)).min(lod_count - 1) as u8;
            if let Err(e) = manager.set_group_current_first_lod(&mut cmd, group.handle, first_lod) {
                log::error!("Frame {}: {}", frame, e);
            }
        }

        manager.pre_render();
        groups
            .par_iter()
            .filter(|g| g.position.abs_diff(camera) <= view)
            .for_each(|g| {
                manager.add_referenced_geometry_groups([g.handle]);
                marked.fetch_add(1, Ordering::Relaxed);
            });

        manager.tick(&mut cmd, frame);
        manager.process_build_requests(&mut cmd, false);

        if frame % 60 == 0 {
            let stats = manager.stats();
            log::info!(
                "Frame {}: {:.1} MiB resident, {:.1} MiB requested, {} pending builds, {} frames over budget",
                frame,
                stats.resident_bytes as f64 / (1024.0 * 1024.0),
                stats.requested_bytes as f64 / (1024.0 * 1024.0),
                stats.pending_builds,
                stats.consecutive_overrun_frames
            );
        }
    }

    let elapsed = start.elapsed();
    let report = json!({
        "frames": frames,
        "elapsed_ms": elapsed.as_millis() as u64,
        "ms_per_frame": elapsed.as_secs_f64() * 1000.0 / frames.max(1) as f64,
        "group_references_marked": marked.load(Ordering::Relaxed),
        "geometries_created": cmd.created,
        "resources_replaced": cmd.replaced,
        "structures_built": cmd.built,
        "primitives_built": cmd.built_primitives,
        "manager": manager.stats(),
    });

    match serde_json::to_string_pretty(&report) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to serialize report: {}", e),
    }

    for group in &groups {
        for lod in 0..lod_count {
            if let Some(handle) = manager.group_lod(group.handle, lod as u8) {
                if let Err(e) = manager.release_geometry(handle) {
                    log::error!("{}", e);
                }
            }
        }
        if let Err(e) = manager.release_group(group.handle) {
            log::error!("{}", e);
        }
    }
}

fn register_scene(manager: &GeometryManager, group_count: usize, lod_count: usize) -> Vec<SimGroup> {
    (0..group_count)
        .map(|position| {
            let handle = manager.register_group(lod_count, 0);
            let lods = (0..lod_count)
                .filter_map(|lod| {
                    let primitives = (LOD0_PRIMITIVES >> (2 * lod)).max(1);
                    let initializer = GeometryInitializer::with_primitives(
                        format!("group{}_lod{}", position, lod),
                        InitializerType::Rendering,
                        primitives,
                    );
                    let geometry = Arc::new(RayTracingGeometry::in_group(initializer, handle, lod as u8));
                    match manager.register_geometry(&geometry) {
                        Ok(_) => Some(geometry),
                        Err(e) => {
                            log::error!("{}", e);
                            None
                        }
                    }
                })
                .collect();

            SimGroup {
                handle,
                position,
                _lods: lods,
            }
        })
        .collect()
}

fn budget_bytes(mb: u64) -> Option<u64> {
    mb.checked_mul(1024 * 1024)
}

fn parse_u64_arg(args: &[String], flag: &str) -> Option<u64> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
