//! Viewer application.

use std::path::PathBuf;

use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
use kiln_app::{AppContext, Camera, FrameContext, KilnApp, WindowEvent};
use kiln_core::{Geometry, GeometryProperties};
use kiln_render::{Mesh, MeshData};
use tracing::info;
use winit::event::ElementState;
use winit::keyboard::{KeyCode, PhysicalKey};

/// Orbit radius around the origin.
const ORBIT_RADIUS: f32 = 6.0;

/// Orbit speed in radians per second.
const ORBIT_SPEED: f32 = 0.4;

/// Half the grid size in cells.
const GRID_HALF: i32 = 10;

/// Command line parameters.
#[derive(Debug, Clone)]
pub struct ViewerParams {
    pub vsync: bool,
    pub quads: u32,
    pub pipeline_cache: Option<PathBuf>,
}

impl Default for ViewerParams {
    fn default() -> Self {
        Self {
            vsync: true,
            quads: 64,
            pipeline_cache: None,
        }
    }
}

impl ViewerParams {
    /// Parse parameters from command line arguments. Unknown flags are ignored.
    pub fn from_args() -> Self {
        let mut params = Self::default();
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--no-vsync" => params.vsync = false,
                "--quads" => {
                    if let Some(v) = args.next().and_then(|v| v.parse().ok()) {
                        params.quads = v;
                    }
                }
                "--pipeline-cache" => params.pipeline_cache = args.next().map(PathBuf::from),
                _ => {}
            }
        }
        params
    }
}

pub struct Viewer {
    camera: Camera,
    cube: Mesh,
    orbit: f32,
    spin: f32,
    paused: bool,
    quads: u32,
}

impl KilnApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let params = ViewerParams::from_args();
        let cube = Mesh::new(&ctx.gpu, "cube", &MeshData::cube(1.5))?;
        let eye = Vec3::new(ORBIT_RADIUS, 3.0, 0.0);
        let camera = Camera::looking_at(eye, Vec3::ZERO, ctx.aspect_ratio());
        info!(quads = params.quads, vsync = params.vsync, "viewer initialized");

        Ok(Self {
            camera,
            cube,
            orbit: 0.0,
            spin: 0.0,
            paused: false,
            quads: params.quads,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        if self.paused {
            return;
        }
        self.orbit = (self.orbit + ORBIT_SPEED * dt) % std::f32::consts::TAU;
        self.spin = (self.spin + dt) % std::f32::consts::TAU;
        self.camera.position = Vec3::new(
            ORBIT_RADIUS * self.orbit.cos(),
            3.0,
            ORBIT_RADIUS * self.orbit.sin(),
        );
        self.camera.look_at(Vec3::ZERO);
    }

    fn view_projection(&self, _ctx: &AppContext) -> Mat4 {
        self.camera.view_projection_matrix()
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render(&mut self, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
        frame.begin_pass(false)?;

        self.draw_grid(frame)?;
        self.draw_ring(frame)?;

        let transform =
            Mat4::from_rotation_translation(Quat::from_rotation_y(self.spin), Vec3::Y);
        frame.draw_mesh(&self.cube, transform)?;

        frame.end_pass()?;
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        self.camera.set_aspect(ctx.aspect_ratio());
        info!(width, height, "viewer resized");
        Ok(())
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        if let WindowEvent::KeyboardInput { event, .. } = event {
            if event.state == ElementState::Pressed
                && !event.repeat
                && event.physical_key == PhysicalKey::Code(KeyCode::Space)
            {
                self.paused = !self.paused;
                info!(paused = self.paused, "orbit toggled");
                return true;
            }
        }
        false
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        self.cube.destroy(&ctx.gpu);
    }
}

impl Viewer {
    fn draw_grid(&self, frame: &mut FrameContext<'_>) -> kiln_render::Result<()> {
        let extent = GRID_HALF as f32;
        let color = Vec4::new(0.35, 0.38, 0.42, 1.0);
        for i in -GRID_HALF..=GRID_HALF {
            let offset = i as f32;
            let along_x = GeometryProperties::line(
                Vec3::new(-extent, 0.0, offset),
                Vec3::new(extent, 0.0, offset),
            );
            let along_z = GeometryProperties::line(
                Vec3::new(offset, 0.0, -extent),
                Vec3::new(offset, 0.0, extent),
            );
            frame.draw_planar_geometry(Geometry::Line, &along_x.with_color(color))?;
            frame.draw_planar_geometry(Geometry::Line, &along_z.with_color(color))?;
        }
        Ok(())
    }

    fn draw_ring(&self, frame: &mut FrameContext<'_>) -> kiln_render::Result<()> {
        let count = self.quads.max(1);
        for i in 0..count {
            let angle = std::f32::consts::TAU * i as f32 / count as f32 + self.spin * 0.5;
            let position = Vec3::new(3.5 * angle.cos(), 0.5, 3.5 * angle.sin());
            let hue = i as f32 / count as f32;
            let color = Vec4::new(hue, 1.0 - hue, 0.6, 0.8);
            let quad = GeometryProperties::rectangle(position, Vec2::splat(0.3))
                .with_rotation(Quat::from_rotation_y(-angle))
                .with_color(color)
                .with_identifier(i);
            frame.draw_planar_geometry(Geometry::Rectangle, &quad)?;
        }
        Ok(())
    }
}
