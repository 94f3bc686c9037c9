//! Headless pipeline tests. Each test acquires its own device and skips
//! with a notice when the machine has no usable GPU adapter.

use inkflow::blit::Blit;
use inkflow::config::Config;
use inkflow::gpu::GpuContext;
use inkflow::render::{self, RenderTarget};
use inkflow::shader::{DisplayKeywords, DisplayMaterial, Passes};
use inkflow::sim::{SimulationState, Splat, MAX_DT};
use inkflow::texture::{DoubleFramebuffer, Framebuffer};

fn test_gpu() -> Option<GpuContext> {
    match GpuContext::headless() {
        Ok(gpu) => Some(gpu),
        Err(err) => {
            eprintln!("skipping GPU test: {err}");
            None
        }
    }
}

/// Small configuration that keeps the field targets test-sized and the
/// optional effects off unless a test opts in.
fn test_config() -> Config {
    Config {
        sim_resolution: 64,
        dye_resolution: 128,
        pressure_iterations: 0,
        curl: 0.0,
        bloom: false,
        sunrays: false,
        shading: false,
        colorful: false,
        auto_splat: false,
        ..Config::default()
    }
}

fn fill(gpu: &GpuContext, fb: &Framebuffer, pixel: [u8; 4]) {
    let data: Vec<u8> = pixel
        .iter()
        .copied()
        .cycle()
        .take((fb.width * fb.height * 4) as usize)
        .collect();
    gpu.queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: fb.texture(),
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &data,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(4 * fb.width),
            rows_per_image: Some(fb.height),
        },
        wgpu::Extent3d {
            width: fb.width,
            height: fb.height,
            depth_or_array_layers: 1,
        },
    );
}

fn f16_to_f32(bits: u16) -> f32 {
    let sign = if bits >> 15 == 1 { -1.0f32 } else { 1.0 };
    let exp = (bits >> 10) & 0x1f;
    let frac = bits & 0x3ff;
    match (exp, frac) {
        (0, 0) => sign * 0.0,
        (0, f) => sign * f as f32 * 2f32.powi(-24),
        (0x1f, 0) => sign * f32::INFINITY,
        (0x1f, _) => f32::NAN,
        (e, f) => sign * (1.0 + f as f32 / 1024.0) * 2f32.powi(e as i32 - 15),
    }
}

fn read_f16(gpu: &GpuContext, fb: &Framebuffer) -> Vec<f32> {
    let bytes = fb.read_bytes(gpu).expect("readback");
    bytes
        .chunks_exact(2)
        .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
        .collect()
}

#[test]
fn double_buffer_swap_exchanges_roles_in_place() {
    let Some(gpu) = test_gpu() else { return };
    let mut field = DoubleFramebuffer::new(
        &gpu,
        "Test Field",
        4,
        4,
        wgpu::TextureFormat::Rgba8Unorm,
        wgpu::FilterMode::Nearest,
    );

    let read_id = field.read().texture().global_id();
    let write_id = field.write().texture().global_id();
    assert_ne!(read_id, write_id);

    // swap is its own inverse: two swaps restore the original assignment.
    field.swap();
    assert_eq!(field.read().texture().global_id(), write_id);
    field.swap();
    assert_eq!(field.read().texture().global_id(), read_id);

    // After N writes and N swaps, read holds the Nth written state and
    // write holds the (N-1)th as scratch.
    let colors: [[u8; 4]; 3] = [[10, 0, 0, 255], [0, 20, 0, 255], [0, 0, 30, 255]];
    for color in colors {
        fill(&gpu, field.write(), color);
        field.swap();
    }
    let newest = field.read().read_bytes(&gpu).unwrap();
    assert_eq!(&newest[..4], &colors[2]);
    let scratch = field.write().read_bytes(&gpu).unwrap();
    assert_eq!(&scratch[..4], &colors[1]);
}

#[test]
fn same_size_resize_is_identity() {
    let Some(gpu) = test_gpu() else { return };
    let mut passes = Passes::new(&gpu.device, wgpu::TextureFormat::Rgba8Unorm);
    let blit = Blit::new(&gpu.device);
    let mut fb = Framebuffer::new(
        &gpu,
        "Test Target",
        32,
        16,
        wgpu::TextureFormat::Rgba8Unorm,
        wgpu::FilterMode::Linear,
    );
    fill(&gpu, &fb, [1, 2, 3, 4]);
    let id = fb.texture().global_id();

    assert!(!fb.resize(&gpu, &blit, &mut passes.copy, 32, 16));
    assert_eq!(fb.texture().global_id(), id, "same-size resize must keep the texture");
    assert!(!fb.resize(&gpu, &blit, &mut passes.copy, 32, 16));
    assert_eq!(fb.texture().global_id(), id);
    assert_eq!(&fb.read_bytes(&gpu).unwrap()[..4], &[1, 2, 3, 4]);
}

#[test]
fn resize_carries_contents_forward() {
    let Some(gpu) = test_gpu() else { return };
    let mut passes = Passes::new(&gpu.device, wgpu::TextureFormat::Rgba8Unorm);
    let blit = Blit::new(&gpu.device);

    let mut field = DoubleFramebuffer::new(
        &gpu,
        "Test Field",
        8,
        8,
        wgpu::TextureFormat::Rgba8Unorm,
        wgpu::FilterMode::Linear,
    );
    let color = [100, 150, 200, 255];
    fill(&gpu, field.read(), color);

    assert!(field.resize(&gpu, &blit, &mut passes.copy, 16, 16));
    assert_eq!(field.width(), 16);

    // A uniform field must stay that uniform color through the copy pass,
    // up to rounding.
    let bytes = field.read().read_bytes(&gpu).unwrap();
    for pixel in bytes.chunks_exact(4) {
        for (got, want) in pixel.iter().zip(color.iter()) {
            assert!(
                (*got as i32 - *want as i32).abs() <= 2,
                "expected ~{color:?}, got {pixel:?}"
            );
        }
    }
}

#[test]
fn splat_deposits_dye_without_momentum() {
    let Some(gpu) = test_gpu() else { return };
    let config = test_config();
    let mut passes = Passes::new(&gpu.device, wgpu::TextureFormat::Rgba8Unorm);
    let blit = Blit::new(&gpu.device);
    let mut state = SimulationState::new(&gpu, &config, 256, 256);

    state.queue_splat(Splat {
        x: 0.5,
        y: 0.5,
        dx: 0.0,
        dy: 0.0,
        color: [1.0, 0.0, 0.0],
    });
    state.tick(&gpu, &mut passes, &blit, &config, MAX_DT);

    let dye = read_f16(&gpu, state.dye.read());
    let (w, h) = (state.dye.width() as usize, state.dye.height() as usize);
    let center = (h / 2 * w + w / 2) * 4;
    assert!(
        dye[center] > 0.1,
        "expected red dye at the center, got {}",
        dye[center]
    );
    assert!(dye[center + 1] < 0.01 && dye[center + 2] < 0.01);
    // Far corner stays clear; the deposit is localized.
    assert!(dye[3 * 4] < 0.01);

    // No directional impulse was given, so the velocity field stays flat.
    let velocity = read_f16(&gpu, state.velocity.read());
    let max = velocity.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    assert!(max < 1e-3, "velocity should remain near zero, max {max}");
}

#[test]
fn disabled_bloom_leaves_bloom_targets_untouched() {
    let Some(gpu) = test_gpu() else { return };
    let mut config = test_config();
    let mut passes = Passes::new(&gpu.device, wgpu::TextureFormat::Rgba8Unorm);
    let blit = Blit::new(&gpu.device);
    let mut state = SimulationState::new(&gpu, &config, 256, 256);

    state.multiple_splats(4);
    state.tick(&gpu, &mut passes, &blit, &config, MAX_DT);

    config.bloom = false;
    let before: Vec<Vec<u8>> = std::iter::once(&state.bloom)
        .chain(state.bloom_cascade.iter())
        .map(|fb| fb.read_bytes(&gpu).unwrap())
        .collect();

    let target = Framebuffer::new(
        &gpu,
        "Offscreen",
        256,
        256,
        wgpu::TextureFormat::Rgba8Unorm,
        wgpu::FilterMode::Linear,
    );
    render::render(
        &gpu,
        &mut passes,
        &blit,
        &state,
        &config,
        &RenderTarget {
            view: &target.view,
            width: 256,
            height: 256,
            to_screen: false,
        },
    );

    let after: Vec<Vec<u8>> = std::iter::once(&state.bloom)
        .chain(state.bloom_cascade.iter())
        .map(|fb| fb.read_bytes(&gpu).unwrap())
        .collect();
    assert_eq!(before, after, "bloom buffers mutated with bloom disabled");
}

#[test]
fn pause_freezes_fields_while_frames_still_render() {
    let Some(gpu) = test_gpu() else { return };
    let mut config = test_config();
    let mut passes = Passes::new(&gpu.device, wgpu::TextureFormat::Rgba8Unorm);
    let blit = Blit::new(&gpu.device);
    let mut state = SimulationState::new(&gpu, &config, 256, 256);

    state.queue_splat(Splat {
        x: 0.3,
        y: 0.7,
        dx: 400.0,
        dy: -200.0,
        color: [0.2, 0.5, 0.9],
    });
    state.tick(&gpu, &mut passes, &blit, &config, MAX_DT);

    config.paused = true;
    let velocity_before = state.velocity.read().read_bytes(&gpu).unwrap();
    let dye_before = state.dye.read().read_bytes(&gpu).unwrap();

    let target = Framebuffer::new(
        &gpu,
        "Offscreen",
        256,
        256,
        wgpu::TextureFormat::Rgba8Unorm,
        wgpu::FilterMode::Linear,
    );
    for _ in 0..3 {
        state.tick(&gpu, &mut passes, &blit, &config, MAX_DT);
        render::render(
            &gpu,
            &mut passes,
            &blit,
            &state,
            &config,
            &RenderTarget {
                view: &target.view,
                width: 256,
                height: 256,
                to_screen: false,
            },
        );
    }

    assert_eq!(velocity_before, state.velocity.read().read_bytes(&gpu).unwrap());
    assert_eq!(dye_before, state.dye.read().read_bytes(&gpu).unwrap());

    // The composite still draws while paused.
    let frame = target.read_bytes(&gpu).unwrap();
    assert!(frame.chunks_exact(4).any(|px| px[0] > 0 || px[1] > 0 || px[2] > 0));
}

#[test]
fn display_material_memoizes_keyword_variants() {
    let Some(gpu) = test_gpu() else { return };
    let mut material = DisplayMaterial::new(&gpu.device, wgpu::TextureFormat::Rgba8Unorm);
    let baseline = material.variant_count();

    let keywords = DisplayKeywords {
        shading: true,
        bloom: true,
        sunrays: false,
    };
    material.set_keywords(&gpu.device, keywords);
    let compiled = material.variant_count();
    assert_eq!(compiled, baseline + 1);

    // Same combination again: cache hit, no recompilation.
    material.set_keywords(&gpu.device, keywords);
    assert_eq!(material.variant_count(), compiled);
    assert_eq!(material.active_keywords(), keywords);

    material.set_keywords(
        &gpu.device,
        DisplayKeywords {
            shading: true,
            bloom: true,
            sunrays: true,
        },
    );
    assert_eq!(material.variant_count(), compiled + 1);
}
