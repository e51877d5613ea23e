//! Kiln demo viewer
//!
//! Orbits a lit cube above a line grid with a ring of batched quads. Every
//! draw goes through the renderer's batching and mesh paths, and resizing
//! the window runs the full recreation protocol.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p kiln-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--no-vsync`: Present without waiting for vertical blank
//! - `--quads <N>`: Quads in the ring (default: 64)
//! - `--pipeline-cache <DIR>`: Persist pipeline caches in `DIR`
//! - `-h, --help`: Print help message
//!
//! Press `Space` to pause the orbit.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use kiln_app::{run_app, AppConfig};
use kiln_render::{RendererConfig, ShaderSet};

use crate::app::{Viewer, ViewerParams};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const TARGET_FPS: u32 = 240;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let params = ViewerParams::from_args();
    let mut renderer =
        RendererConfig::new(ShaderSet::built_in()).with_clear_color([0.05, 0.06, 0.08, 1.0]);
    if let Some(dir) = &params.pipeline_cache {
        renderer = renderer.with_pipeline_cache_dir(dir);
    }

    run_app::<Viewer>(
        AppConfig::new("Kiln Viewer")
            .with_size(WIDTH, HEIGHT)
            .with_target_fps(TARGET_FPS)
            .with_vsync(params.vsync),
        renderer,
    )
}

fn print_help() {
    eprintln!(
        "Kiln demo viewer

USAGE:
    cargo run -p kiln-viewer -- [OPTIONS]

OPTIONS:
    --no-vsync              Present without waiting for vertical blank
    --quads <N>             Quads in the ring (default: 64)
    --pipeline-cache <DIR>  Persist pipeline caches in DIR
    -h, --help              Print this help message

CONTROLS:
    Space                   Pause or resume the orbit

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
