//! Compositor: bloom and sunrays post-processing plus the final display
//! blit onto the screen or an off-screen capture target. Reads the field
//! targets owned by `SimulationState`; the only state it mutates lives on
//! the GPU.

use std::path::PathBuf;

use crate::blit::Blit;
use crate::config::Config;
use crate::gpu::GpuContext;
use crate::shader::{
    BloomFinalParams, BloomPrefilterParams, BlurParams, CheckerboardParams, ColorParams,
    DisplayKeywords, DisplayParams, Passes, SunraysParams, TexelParams,
};
use crate::sim::SimulationState;
use crate::texture::{get_resolution, Framebuffer};

/// Terminal blit destination: the visible surface or a capture target.
pub struct RenderTarget<'a> {
    pub view: &'a wgpu::TextureView,
    pub width: u32,
    pub height: u32,
    pub to_screen: bool,
}

/// The three soft-knee constants the prefilter shader derives its response
/// curve from.
pub fn bloom_curve(threshold: f32, soft_knee: f32) -> [f32; 3] {
    let knee = threshold * soft_knee + 0.0001;
    [threshold - knee, knee * 2.0, 0.25 / knee]
}

/// Composites one frame into `target`. Post-processing runs first, then
/// background and display blend on top of each other; the first pass into
/// the target clears it.
pub fn render(
    gpu: &GpuContext,
    passes: &mut Passes,
    blit: &Blit,
    state: &SimulationState,
    config: &Config,
    target: &RenderTarget<'_>,
) {
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Composite"),
        });

    if config.bloom {
        apply_bloom(gpu, passes, blit, state, config, &mut encoder);
    }
    if config.sunrays {
        apply_sunrays(gpu, passes, blit, state, config, &mut encoder);
        blur(
            gpu,
            passes,
            blit,
            &state.sunrays,
            &state.sunrays_temp,
            1,
            &mut encoder,
        );
    }

    let mut cleared = false;
    if !config.transparent {
        draw_color(gpu, passes, blit, &mut encoder, config.back_color, target, &mut cleared);
    } else if target.to_screen {
        draw_checkerboard(gpu, passes, blit, &mut encoder, target, &mut cleared);
    }
    draw_display(gpu, passes, blit, state, config, &mut encoder, target, &mut cleared);

    gpu.queue.submit(std::iter::once(encoder.finish()));
}

/// Prefilter, downsample, additively upsample, scale. Skipped outright on
/// degenerate cascades; nothing is touched then, including the bloom
/// accumulator.
fn apply_bloom(
    gpu: &GpuContext,
    passes: &mut Passes,
    blit: &Blit,
    state: &SimulationState,
    config: &Config,
    encoder: &mut wgpu::CommandEncoder,
) {
    if state.bloom_cascade.len() < 2 {
        return;
    }
    let device = &gpu.device;

    let params = BloomPrefilterParams {
        curve: bloom_curve(config.bloom_threshold, config.bloom_soft_knee),
        threshold: config.bloom_threshold,
    };
    let bind_group = passes
        .bloom_prefilter
        .bind(device, &params, &[state.dye.read().binding(gpu)]);
    let pipeline = passes.bloom_prefilter.pipeline(device, state.bloom.format);
    blit.draw(encoder, pipeline, &bind_group, &state.bloom.view, false);

    let mut last = &state.bloom;
    for dest in &state.bloom_cascade {
        let params = TexelParams {
            texel_size: last.texel_size(),
            _pad: [0.0; 2],
        };
        let bind_group = passes.bloom_blur.bind(device, &params, &[last.binding(gpu)]);
        let pipeline = passes.bloom_blur.pipeline(device, dest.format);
        blit.draw(encoder, pipeline, &bind_group, &dest.view, false);
        last = dest;
    }

    for i in (0..state.bloom_cascade.len() - 1).rev() {
        let dest = &state.bloom_cascade[i];
        let params = TexelParams {
            texel_size: last.texel_size(),
            _pad: [0.0; 2],
        };
        let bind_group = passes
            .bloom_blur_add
            .bind(device, &params, &[last.binding(gpu)]);
        let pipeline = passes.bloom_blur_add.pipeline(device, dest.format);
        blit.draw(encoder, pipeline, &bind_group, &dest.view, false);
        last = dest;
    }

    let params = BloomFinalParams {
        texel_size: last.texel_size(),
        intensity: config.bloom_intensity,
        _pad: 0.0,
    };
    let bind_group = passes.bloom_final.bind(device, &params, &[last.binding(gpu)]);
    let pipeline = passes.bloom_final.pipeline(device, state.bloom.format);
    blit.draw(encoder, pipeline, &bind_group, &state.bloom.view, false);
}

/// Brightness mask into the dye scratch side, then the radial march into
/// the sunrays buffer.
fn apply_sunrays(
    gpu: &GpuContext,
    passes: &mut Passes,
    blit: &Blit,
    state: &SimulationState,
    config: &Config,
    encoder: &mut wgpu::CommandEncoder,
) {
    let device = &gpu.device;

    let bind_group = passes
        .sunrays_mask
        .bind_textures(device, &[state.dye.read().binding(gpu)]);
    let pipeline = passes
        .sunrays_mask
        .pipeline(device, state.dye.write().format);
    blit.draw(encoder, pipeline, &bind_group, &state.dye.write().view, false);

    let params = SunraysParams {
        weight: config.sunrays_weight,
        _pad: [0.0; 3],
    };
    let bind_group = passes
        .sunrays
        .bind(device, &params, &[state.dye.write().binding(gpu)]);
    let pipeline = passes.sunrays.pipeline(device, state.sunrays.format);
    blit.draw(encoder, pipeline, &bind_group, &state.sunrays.view, false);
}

/// Separable blur: horizontal into the temp target, vertical back.
fn blur(
    gpu: &GpuContext,
    passes: &mut Passes,
    blit: &Blit,
    target: &Framebuffer,
    temp: &Framebuffer,
    iterations: u32,
    encoder: &mut wgpu::CommandEncoder,
) {
    let device = &gpu.device;
    let texel_size = target.texel_size();
    for _ in 0..iterations {
        let params = BlurParams {
            direction: [texel_size[0], 0.0],
            _pad: [0.0; 2],
        };
        let bind_group = passes.blur.bind(device, &params, &[target.binding(gpu)]);
        let pipeline = passes.blur.pipeline(device, temp.format);
        blit.draw(encoder, pipeline, &bind_group, &temp.view, false);

        let params = BlurParams {
            direction: [0.0, texel_size[1]],
            _pad: [0.0; 2],
        };
        let bind_group = passes.blur.bind(device, &params, &[temp.binding(gpu)]);
        let pipeline = passes.blur.pipeline(device, target.format);
        blit.draw(encoder, pipeline, &bind_group, &target.view, false);
    }
}

fn draw_color(
    gpu: &GpuContext,
    passes: &mut Passes,
    blit: &Blit,
    encoder: &mut wgpu::CommandEncoder,
    color: [f32; 3],
    target: &RenderTarget<'_>,
    cleared: &mut bool,
) {
    let device = &gpu.device;
    let format = passes.display.format;
    let params = ColorParams {
        color: [color[0], color[1], color[2], 1.0],
    };
    let bind_group = passes.color.bind(device, &params, &[]);
    let pipeline = passes.color.pipeline(device, format);
    blit.draw(encoder, pipeline, &bind_group, target.view, !*cleared);
    *cleared = true;
}

fn draw_checkerboard(
    gpu: &GpuContext,
    passes: &mut Passes,
    blit: &Blit,
    encoder: &mut wgpu::CommandEncoder,
    target: &RenderTarget<'_>,
    cleared: &mut bool,
) {
    let device = &gpu.device;
    let format = passes.display.format;
    let params = CheckerboardParams {
        aspect_ratio: target.width as f32 / target.height.max(1) as f32,
        _pad: [0.0; 3],
    };
    let bind_group = passes.checkerboard.bind(device, &params, &[]);
    let pipeline = passes.checkerboard.pipeline(device, format);
    blit.draw(encoder, pipeline, &bind_group, target.view, !*cleared);
    *cleared = true;
}

#[allow(clippy::too_many_arguments)]
fn draw_display(
    gpu: &GpuContext,
    passes: &mut Passes,
    blit: &Blit,
    state: &SimulationState,
    config: &Config,
    encoder: &mut wgpu::CommandEncoder,
    target: &RenderTarget<'_>,
    cleared: &mut bool,
) {
    let device = &gpu.device;
    passes
        .display
        .set_keywords(device, DisplayKeywords::from_config(config));

    let params = DisplayParams {
        texel_size: [1.0 / target.width as f32, 1.0 / target.height as f32],
        dither_scale: state.dither.scale(target.width, target.height),
    };
    let bind_group = passes.display.bind(
        device,
        &params,
        &[
            state.dye.read().binding(gpu),
            state.bloom.binding(gpu),
            state.sunrays.binding(gpu),
            (&state.dither.view, &gpu.tile_sampler),
        ],
    );
    blit.draw(encoder, passes.display.pipeline(), &bind_group, target.view, !*cleared);
    *cleared = true;
}

/// Renders the composite into an off-screen target of the configured
/// capture resolution and writes it out as a PNG.
pub fn capture(
    gpu: &GpuContext,
    passes: &mut Passes,
    blit: &Blit,
    state: &SimulationState,
    config: &Config,
) -> anyhow::Result<PathBuf> {
    let [screen_w, screen_h] = state.screen_size();
    let (width, height) = get_resolution(config.capture_resolution, screen_w, screen_h);
    let format = passes.display.format;
    if format.block_copy_size(None) != Some(4) {
        anyhow::bail!("capture target format {format:?} is not an 8-bit color format");
    }

    let target = Framebuffer::new(gpu, "Capture Target", width, height, format, wgpu::FilterMode::Linear);
    render(
        gpu,
        passes,
        blit,
        state,
        config,
        &RenderTarget {
            view: &target.view,
            width,
            height,
            to_screen: false,
        },
    );

    let mut bytes = target.read_bytes(gpu)?;
    if matches!(
        format,
        wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb
    ) {
        for pixel in bytes.chunks_exact_mut(4) {
            pixel.swap(0, 2);
        }
    }
    if !config.transparent {
        for pixel in bytes.chunks_exact_mut(4) {
            pixel[3] = 255;
        }
    }

    let path = PathBuf::from("fluid_capture.png");
    image::save_buffer(&path, &bytes, width, height, image::ColorType::Rgba8)?;
    log::info!("saved capture to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bloom_curve_matches_soft_knee_derivation() {
        let [curve0, curve1, curve2] = bloom_curve(0.6, 0.7);
        let knee = 0.6 * 0.7 + 0.0001;
        assert!((curve0 - (0.6 - knee)).abs() < 1e-6);
        assert!((curve1 - knee * 2.0).abs() < 1e-6);
        assert!((curve2 - 0.25 / knee).abs() < 1e-6);
    }

    #[test]
    fn bloom_curve_survives_zero_knee() {
        // The epsilon keeps the reciprocal finite with the knee slider at 0.
        let [_, _, curve2] = bloom_curve(0.5, 0.0);
        assert!(curve2.is_finite());
    }
}
