//! # Voxel LOD Streaming Demo
//!
//! Flies a camera over generated terrain and logs what the streamer does.
//! Runs against the headless backend unless `--wgpu` is given.
//!
//! ## Usage
//!
//! ```bash
//! RUST_LOG=info cargo run --release -- [config.json] [--wgpu]
//! ```

use std::process::ExitCode;

use cgmath::Point3;
use log::{error, info};

use voxel_lod_streaming::engine_state::buffer_state::headless::HeadlessBackend;
use voxel_lod_streaming::engine_state::buffer_state::wgpu_backend::{request_default_device, WgpuBackend};
use voxel_lod_streaming::engine_state::buffer_state::GpuBackend;
use voxel_lod_streaming::{StreamingConfig, StreamingError, TerrainStreamer};

/// Frames flown by the demo.
const FRAMES: u32 = 600;
/// Camera speed in voxels per frame.
const SPEED: f32 = 4.0;
/// Camera height above the surface.
const ALTITUDE: f32 = 96.0;

fn fly<B: GpuBackend>(config: StreamingConfig, backend: B) -> Result<(), StreamingError> {
    let mut streamer = TerrainStreamer::new(config, backend)?;

    for frame in 0..FRAMES {
        let t = frame as f32 * SPEED;
        let camera = Point3::new(t, ALTITUDE, (t * 0.01).sin() * 256.0);
        streamer.update(camera)?;

        if frame % 60 == 0 {
            let stats = streamer.stats();
            info!(
                "frame {frame}: {} nodes, {} draws, {} quads, {} tasks in flight",
                stats.nodes, stats.active_draws, stats.quads_used, stats.tasks_in_flight
            );
        }
    }

    streamer.finish_pending_work()?;
    info!("Final state: {:?}", streamer.stats());

    streamer.reset()?;
    info!("Reset complete: {:?}", streamer.stats());
    Ok(())
}

fn main() -> ExitCode {
    voxel_lod_streaming::init_logging();

    let mut use_wgpu = false;
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--wgpu" => use_wgpu = true,
            _ => config_path = Some(arg),
        }
    }

    let config = match config_path.map(StreamingConfig::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let result = if use_wgpu {
        request_default_device()
            .map_err(StreamingError::from)
            .and_then(|(device, queue)| fly(config, WgpuBackend::new(device, queue)))
    } else {
        fly(config, HeadlessBackend::new())
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Streaming failed: {err}");
            ExitCode::FAILURE
        }
    }
}
