//! Simulation stepper. `SimulationState` owns every field target, the
//! pointer list and the timers; `tick` is the explicit per-frame entry
//! point driven by whatever scheduler the host uses.

use rand::Rng;

use crate::blit::Blit;
use crate::config::Config;
use crate::gpu::GpuContext;
use crate::pointer::{self, Pointer, MOUSE_POINTER_ID};
use crate::shader::{
    AdvectionParams, ClearParams, Passes, SplatParams, TexelParams, VorticityParams,
};
use crate::texture::{
    get_resolution, DitherTexture, DoubleFramebuffer, Framebuffer, DITHER_TEXTURE_PATH,
};

/// Upper bound on the wall-clock timestep. A long frame gap (tab in the
/// background, debugger stop) otherwise feeds advection a huge dt and the
/// fields blow up.
pub const MAX_DT: f32 = 0.016666;

pub fn clamp_dt(seconds: f32) -> f32 {
    seconds.clamp(0.0, MAX_DT)
}

/// Ephemeral ink/impulse injection, consumed once by the next tick.
#[derive(Debug, Clone, Copy)]
pub struct Splat {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
    pub color: [f32; 3],
}

/// Splats spread over the short axis of the window too; widen the radius
/// on wide windows so they stay visually round.
pub fn correct_radius(radius: f32, aspect_ratio: f32) -> f32 {
    if aspect_ratio > 1.0 {
        radius * aspect_ratio
    } else {
        radius
    }
}

/// Bloom downsample chain dimensions: halved per level, stopping before
/// either axis drops below 2 texels.
pub fn cascade_sizes(width: u32, height: u32, iterations: u32) -> Vec<(u32, u32)> {
    let mut sizes = Vec::new();
    for i in 0..iterations {
        let w = width >> (i + 1);
        let h = height >> (i + 1);
        if w < 2 || h < 2 {
            break;
        }
        sizes.push((w, h));
    }
    sizes
}

pub struct SimulationState {
    pub velocity: DoubleFramebuffer,
    pub dye: DoubleFramebuffer,
    pub pressure: DoubleFramebuffer,
    pub curl: Framebuffer,
    pub divergence: Framebuffer,
    pub bloom: Framebuffer,
    pub bloom_cascade: Vec<Framebuffer>,
    pub sunrays: Framebuffer,
    pub sunrays_temp: Framebuffer,
    pub dither: DitherTexture,
    pub pointers: Vec<Pointer>,
    pub splat_queue: Vec<Splat>,
    screen_size: [u32; 2],
    color_timer: f32,
    auto_splat_timer: f32,
}

impl SimulationState {
    pub fn new(
        gpu: &GpuContext,
        config: &Config,
        screen_width: u32,
        screen_height: u32,
    ) -> Self {
        let (sim_w, sim_h) = get_resolution(config.sim_resolution, screen_width, screen_height);
        let (dye_w, dye_h) = get_resolution(config.dye_resolution, screen_width, screen_height);
        let (bloom_w, bloom_h) =
            get_resolution(config.bloom_resolution, screen_width, screen_height);
        let (sun_w, sun_h) = get_resolution(config.sunrays_resolution, screen_width, screen_height);
        let formats = gpu.formats;

        Self {
            velocity: DoubleFramebuffer::new(
                gpu,
                "Velocity",
                sim_w,
                sim_h,
                formats.rg,
                wgpu::FilterMode::Linear,
            ),
            dye: DoubleFramebuffer::new(
                gpu,
                "Dye",
                dye_w,
                dye_h,
                formats.rgba,
                wgpu::FilterMode::Linear,
            ),
            pressure: DoubleFramebuffer::new(
                gpu,
                "Pressure",
                sim_w,
                sim_h,
                formats.r,
                wgpu::FilterMode::Nearest,
            ),
            curl: Framebuffer::new(gpu, "Curl", sim_w, sim_h, formats.r, wgpu::FilterMode::Nearest),
            divergence: Framebuffer::new(
                gpu,
                "Divergence",
                sim_w,
                sim_h,
                formats.r,
                wgpu::FilterMode::Nearest,
            ),
            bloom: Framebuffer::new(
                gpu,
                "Bloom",
                bloom_w,
                bloom_h,
                formats.rgba,
                wgpu::FilterMode::Linear,
            ),
            bloom_cascade: cascade_sizes(bloom_w, bloom_h, config.bloom_iterations)
                .into_iter()
                .map(|(w, h)| {
                    Framebuffer::new(gpu, "Bloom Cascade", w, h, formats.rgba, wgpu::FilterMode::Linear)
                })
                .collect(),
            sunrays: Framebuffer::new(
                gpu,
                "Sunrays",
                sun_w,
                sun_h,
                formats.r,
                wgpu::FilterMode::Linear,
            ),
            sunrays_temp: Framebuffer::new(
                gpu,
                "Sunrays Temp",
                sun_w,
                sun_h,
                formats.r,
                wgpu::FilterMode::Linear,
            ),
            dither: DitherTexture::load(gpu, DITHER_TEXTURE_PATH),
            pointers: vec![Pointer::default()],
            splat_queue: Vec::new(),
            screen_size: [screen_width, screen_height],
            color_timer: 0.0,
            auto_splat_timer: 0.0,
        }
    }

    pub fn screen_size(&self) -> [u32; 2] {
        self.screen_size
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.screen_size[0] as f32 / self.screen_size[1].max(1) as f32
    }

    fn screen_f32(&self) -> [f32; 2] {
        [self.screen_size[0] as f32, self.screen_size[1] as f32]
    }

    /// Re-provisions render targets against the live configuration and
    /// screen size. Velocity, dye and pressure are resized with their
    /// contents carried forward; history-free targets are recreated when
    /// their dimensions change.
    pub fn update_framebuffers(
        &mut self,
        gpu: &GpuContext,
        passes: &mut Passes,
        blit: &Blit,
        config: &Config,
        screen_width: u32,
        screen_height: u32,
    ) {
        self.screen_size = [screen_width, screen_height];
        let formats = gpu.formats;

        let (sim_w, sim_h) = get_resolution(config.sim_resolution, screen_width, screen_height);
        let (dye_w, dye_h) = get_resolution(config.dye_resolution, screen_width, screen_height);
        self.velocity.resize(gpu, blit, &mut passes.copy, sim_w, sim_h);
        self.dye.resize(gpu, blit, &mut passes.copy, dye_w, dye_h);
        self.pressure.resize(gpu, blit, &mut passes.copy, sim_w, sim_h);
        if self.curl.width != sim_w || self.curl.height != sim_h {
            self.curl =
                Framebuffer::new(gpu, "Curl", sim_w, sim_h, formats.r, wgpu::FilterMode::Nearest);
            self.divergence = Framebuffer::new(
                gpu,
                "Divergence",
                sim_w,
                sim_h,
                formats.r,
                wgpu::FilterMode::Nearest,
            );
        }

        let (bloom_w, bloom_h) =
            get_resolution(config.bloom_resolution, screen_width, screen_height);
        let expected = cascade_sizes(bloom_w, bloom_h, config.bloom_iterations);
        let current: Vec<(u32, u32)> = self
            .bloom_cascade
            .iter()
            .map(|fb| (fb.width, fb.height))
            .collect();
        if self.bloom.width != bloom_w || self.bloom.height != bloom_h || current != expected {
            self.bloom = Framebuffer::new(
                gpu,
                "Bloom",
                bloom_w,
                bloom_h,
                formats.rgba,
                wgpu::FilterMode::Linear,
            );
            self.bloom_cascade = expected
                .into_iter()
                .map(|(w, h)| {
                    Framebuffer::new(gpu, "Bloom Cascade", w, h, formats.rgba, wgpu::FilterMode::Linear)
                })
                .collect();
        }

        let (sun_w, sun_h) = get_resolution(config.sunrays_resolution, screen_width, screen_height);
        if self.sunrays.width != sun_w || self.sunrays.height != sun_h {
            self.sunrays = Framebuffer::new(
                gpu,
                "Sunrays",
                sun_w,
                sun_h,
                formats.r,
                wgpu::FilterMode::Linear,
            );
            self.sunrays_temp = Framebuffer::new(
                gpu,
                "Sunrays Temp",
                sun_w,
                sun_h,
                formats.r,
                wgpu::FilterMode::Linear,
            );
        }
    }

    // ---- input surface -------------------------------------------------

    pub fn pointer_down(&mut self, id: i64, x: f32, y: f32) {
        let screen = self.screen_f32();
        if id == MOUSE_POINTER_ID {
            self.pointers[0].update_down(id, [x, y], screen);
            return;
        }
        let slot = self.touch_slot(id);
        self.pointers[slot].update_down(id, [x, y], screen);
    }

    pub fn pointer_move(&mut self, id: i64, x: f32, y: f32) {
        let screen = self.screen_f32();
        let Some(pointer) = self.find_pointer(id) else {
            return;
        };
        if !pointer.down {
            return;
        }
        pointer.update_move([x, y], screen);
    }

    pub fn pointer_up(&mut self, id: i64) {
        if let Some(pointer) = self.find_pointer(id) {
            pointer.update_up();
        }
    }

    fn find_pointer(&mut self, id: i64) -> Option<&mut Pointer> {
        if id == MOUSE_POINTER_ID {
            return self.pointers.first_mut();
        }
        self.pointers.iter_mut().skip(1).find(|p| p.id == id)
    }

    /// Slot 0 belongs to the mouse; touch contacts reuse released slots
    /// before the list grows.
    fn touch_slot(&mut self, id: i64) -> usize {
        if let Some(i) = self.pointers.iter().skip(1).position(|p| p.id == id) {
            return i + 1;
        }
        if let Some(i) = self
            .pointers
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, p)| !p.down)
            .map(|(i, _)| i)
        {
            return i;
        }
        self.pointers.push(Pointer::default());
        self.pointers.len() - 1
    }

    pub fn queue_splat(&mut self, splat: Splat) {
        self.splat_queue.push(splat);
    }

    /// The "inject N random splats" request from the input surface.
    pub fn multiple_splats(&mut self, amount: u32) {
        let mut rng = rand::thread_rng();
        for _ in 0..amount {
            let color = pointer::generate_color().map(|c| c * 10.0);
            self.splat_queue.push(Splat {
                x: rng.gen::<f32>(),
                y: rng.gen::<f32>(),
                dx: 1000.0 * (rng.gen::<f32>() - 0.5),
                dy: 1000.0 * (rng.gen::<f32>() - 0.5),
                color,
            });
        }
    }

    // ---- per-frame update ----------------------------------------------

    /// One simulation tick. Pending splats are always applied; the field
    /// update itself is skipped while paused (the frame is still rendered
    /// by the compositor afterwards).
    pub fn tick(
        &mut self,
        gpu: &GpuContext,
        passes: &mut Passes,
        blit: &Blit,
        config: &Config,
        dt: f32,
    ) {
        self.dither.poll(gpu);
        self.update_colors(config, dt);
        self.update_auto_splat(config, dt);
        self.queue_pointer_splats(config);

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Simulation Tick"),
            });
        self.apply_splats(gpu, passes, blit, &mut encoder, config);
        if !config.paused {
            self.step(gpu, passes, blit, &mut encoder, config, dt);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    fn update_colors(&mut self, config: &Config, dt: f32) {
        if !config.colorful {
            return;
        }
        self.color_timer += dt * config.color_update_speed;
        if self.color_timer >= 1.0 {
            self.color_timer = pointer::wrap(self.color_timer, 0.0, 1.0);
            for pointer in &mut self.pointers {
                pointer.color = pointer::generate_color();
            }
        }
    }

    fn update_auto_splat(&mut self, config: &Config, dt: f32) {
        if !config.auto_splat || config.bpm <= 0.0 || config.paused {
            self.auto_splat_timer = 0.0;
            return;
        }
        self.auto_splat_timer += dt;
        let interval = 60.0 / config.bpm;
        while self.auto_splat_timer >= interval {
            self.auto_splat_timer -= interval;
            self.multiple_splats(config.splat_count);
        }
    }

    fn queue_pointer_splats(&mut self, config: &Config) {
        for i in 0..self.pointers.len() {
            let pointer = &mut self.pointers[i];
            if !pointer.moved {
                continue;
            }
            pointer.moved = false;
            let splat = Splat {
                x: pointer.texcoord[0],
                y: pointer.texcoord[1],
                dx: pointer.delta[0] * config.splat_force,
                dy: pointer.delta[1] * config.splat_force,
                color: pointer.color,
            };
            self.splat_queue.push(splat);
        }
    }

    fn apply_splats(
        &mut self,
        gpu: &GpuContext,
        passes: &mut Passes,
        blit: &Blit,
        encoder: &mut wgpu::CommandEncoder,
        config: &Config,
    ) {
        if self.splat_queue.is_empty() {
            return;
        }
        let device = &gpu.device;
        let aspect_ratio = self.aspect_ratio();
        let radius = correct_radius(config.splat_radius / 100.0, aspect_ratio);
        let splats: Vec<Splat> = self.splat_queue.drain(..).collect();

        for splat in splats {
            let impulse = SplatParams {
                point: [splat.x, splat.y],
                radius,
                aspect_ratio,
                color: [splat.dx, splat.dy, 0.0],
                _pad: 0.0,
            };
            let bind_group =
                passes
                    .splat
                    .bind(device, &impulse, &[self.velocity.read().binding(gpu)]);
            let pipeline = passes.splat.pipeline(device, self.velocity.write().format);
            blit.draw(encoder, pipeline, &bind_group, &self.velocity.write().view, false);
            self.velocity.swap();

            let deposit = SplatParams {
                color: splat.color,
                ..impulse
            };
            let bind_group = passes
                .splat
                .bind(device, &deposit, &[self.dye.read().binding(gpu)]);
            let pipeline = passes.splat.pipeline(device, self.dye.write().format);
            blit.draw(encoder, pipeline, &bind_group, &self.dye.write().view, false);
            self.dye.swap();
        }
    }

    /// The fixed pass order. Each pass consumes the previous pass's
    /// output, so the sequence is load-bearing; every write into a
    /// double-buffered field is followed by its swap before the next read.
    fn step(
        &mut self,
        gpu: &GpuContext,
        passes: &mut Passes,
        blit: &Blit,
        encoder: &mut wgpu::CommandEncoder,
        config: &Config,
        dt: f32,
    ) {
        let device = &gpu.device;
        let texel_size = self.velocity.texel_size();
        let texel = TexelParams {
            texel_size,
            _pad: [0.0; 2],
        };

        // 1. curl of velocity
        let bind_group = passes
            .curl
            .bind(device, &texel, &[self.velocity.read().binding(gpu)]);
        let pipeline = passes.curl.pipeline(device, self.curl.format);
        blit.draw(encoder, pipeline, &bind_group, &self.curl.view, false);

        // 2. vorticity confinement
        let params = VorticityParams {
            texel_size,
            curl: config.curl,
            dt,
        };
        let bind_group = passes.vorticity.bind(
            device,
            &params,
            &[self.velocity.read().binding(gpu), self.curl.binding(gpu)],
        );
        let pipeline = passes
            .vorticity
            .pipeline(device, self.velocity.write().format);
        blit.draw(encoder, pipeline, &bind_group, &self.velocity.write().view, false);
        self.velocity.swap();

        // 3. divergence of velocity
        let bind_group = passes
            .divergence
            .bind(device, &texel, &[self.velocity.read().binding(gpu)]);
        let pipeline = passes.divergence.pipeline(device, self.divergence.format);
        blit.draw(encoder, pipeline, &bind_group, &self.divergence.view, false);

        // 4. decay previous pressure
        let params = ClearParams {
            value: config.pressure,
            _pad: [0.0; 3],
        };
        let bind_group = passes
            .clear
            .bind(device, &params, &[self.pressure.read().binding(gpu)]);
        let pipeline = passes.clear.pipeline(device, self.pressure.write().format);
        blit.draw(encoder, pipeline, &bind_group, &self.pressure.write().view, false);
        self.pressure.swap();

        // 5. Jacobi pressure solve, fixed iteration count from config
        for _ in 0..config.pressure_iterations {
            let bind_group = passes.pressure.bind(
                device,
                &texel,
                &[
                    self.pressure.read().binding(gpu),
                    self.divergence.binding(gpu),
                ],
            );
            let pipeline = passes
                .pressure
                .pipeline(device, self.pressure.write().format);
            blit.draw(encoder, pipeline, &bind_group, &self.pressure.write().view, false);
            self.pressure.swap();
        }

        // 6. subtract pressure gradient
        let bind_group = passes.gradient_subtract.bind(
            device,
            &texel,
            &[
                self.pressure.read().binding(gpu),
                self.velocity.read().binding(gpu),
            ],
        );
        let pipeline = passes
            .gradient_subtract
            .pipeline(device, self.velocity.write().format);
        blit.draw(encoder, pipeline, &bind_group, &self.velocity.write().view, false);
        self.velocity.swap();

        // 7. velocity self-advection
        let params = AdvectionParams {
            texel_size,
            dt,
            dissipation: config.velocity_dissipation,
        };
        let bind_group = passes.advection.bind(
            device,
            &params,
            &[
                self.velocity.read().binding(gpu),
                self.velocity.read().binding(gpu),
            ],
        );
        let pipeline = passes
            .advection
            .pipeline(device, self.velocity.write().format);
        blit.draw(encoder, pipeline, &bind_group, &self.velocity.write().view, false);
        self.velocity.swap();

        // 8. dye advection by the projected velocity
        let params = AdvectionParams {
            texel_size,
            dt,
            dissipation: config.density_dissipation,
        };
        let bind_group = passes.advection.bind(
            device,
            &params,
            &[
                self.velocity.read().binding(gpu),
                self.dye.read().binding(gpu),
            ],
        );
        let pipeline = passes.advection.pipeline(device, self.dye.write().format);
        blit.draw(encoder, pipeline, &bind_group, &self.dye.write().view, false);
        self.dye.swap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dt_clamps_long_stalls() {
        // A five second stall must come out as one normal frame step.
        assert_eq!(clamp_dt(5.0), MAX_DT);
        assert_eq!(clamp_dt(0.008), 0.008);
        assert_eq!(clamp_dt(-0.1), 0.0);
    }

    #[test]
    fn radius_grows_on_wide_windows_only() {
        assert_eq!(correct_radius(0.1, 0.5), 0.1);
        assert_eq!(correct_radius(0.1, 1.0), 0.1);
        assert!((correct_radius(0.1, 2.0) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn cascade_halves_until_too_small() {
        let sizes = cascade_sizes(256, 128, 8);
        assert_eq!(sizes.first(), Some(&(128, 64)));
        // 128x64 -> ... -> 4x2, the next level would be 2x1.
        assert_eq!(sizes.last(), Some(&(4, 2)));
        for window in sizes.windows(2) {
            assert_eq!(window[1].0, window[0].0 / 2);
            assert_eq!(window[1].1, window[0].1 / 2);
        }
    }

    #[test]
    fn tiny_viewports_produce_degenerate_cascades() {
        assert!(cascade_sizes(4, 4, 8).len() < 2);
        assert!(cascade_sizes(2, 2, 8).is_empty());
    }

    #[test]
    fn cascade_respects_iteration_cap() {
        assert_eq!(cascade_sizes(1 << 12, 1 << 12, 3).len(), 3);
    }
}
