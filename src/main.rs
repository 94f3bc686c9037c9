use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use winit::{
    event::{ElementState, Event, KeyEvent, MouseButton, Touch, TouchPhase, WindowEvent},
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
};

use inkflow::blit::Blit;
use inkflow::config::Config;
use inkflow::gpu::GpuContext;
use inkflow::pointer::MOUSE_POINTER_ID;
use inkflow::render::{self, RenderTarget};
use inkflow::shader::Passes;
use inkflow::sim::{clamp_dt, SimulationState};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let settings_path = Config::default_path();
    let mut config = Config::load_or_default(&settings_path);

    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        event_loop.create_window(
            winit::window::WindowAttributes::default()
                .with_title("inkflow")
                .with_inner_size(winit::dpi::PhysicalSize::new(1280, 720)),
        )?,
    );

    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let surface = instance.create_surface(window.clone())?;
    let gpu = pollster::block_on(GpuContext::new(&instance, Some(&surface)))?;

    let size = window.inner_size();
    let surface_caps = surface.get_capabilities(&gpu.adapter);
    let surface_format = surface_caps
        .formats
        .iter()
        .find(|f| f.is_srgb())
        .copied()
        .unwrap_or(surface_caps.formats[0]);
    let mut surface_config = wgpu::SurfaceConfiguration {
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        format: surface_format,
        width: size.width.max(1),
        height: size.height.max(1),
        present_mode: wgpu::PresentMode::Fifo,
        alpha_mode: surface_caps.alpha_modes[0],
        view_formats: vec![],
        desired_maximum_frame_latency: 2,
    };
    surface.configure(&gpu.device, &surface_config);

    let mut passes = Passes::new(&gpu.device, surface_format);
    let blit = Blit::new(&gpu.device);
    let mut state = SimulationState::new(&gpu, &config, surface_config.width, surface_config.height);

    // Seed the field with a burst of random splats so the first frame has
    // something to show.
    state.multiple_splats(rand::thread_rng().gen_range(5..25));

    let mut last_update = Instant::now();
    let mut cursor_position: Option<(f32, f32)> = None;

    event_loop.run(move |event, control_flow| {
        match event {
            Event::WindowEvent {
                ref event,
                window_id,
            } if window_id == window.id() => match event {
                WindowEvent::CloseRequested => {
                    if let Err(err) = config.save_to_disk(&settings_path) {
                        log::warn!("failed to save settings: {err}");
                    }
                    control_flow.exit();
                }
                WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            physical_key: PhysicalKey::Code(key),
                            state: ElementState::Pressed,
                            ..
                        },
                    ..
                } => match key {
                    KeyCode::Escape => {
                        if let Err(err) = config.save_to_disk(&settings_path) {
                            log::warn!("failed to save settings: {err}");
                        }
                        control_flow.exit();
                    }
                    KeyCode::KeyP => config.paused = !config.paused,
                    KeyCode::Space => state.multiple_splats(config.splat_count),
                    KeyCode::KeyS => {
                        if let Err(err) = render::capture(&gpu, &mut passes, &blit, &state, &config)
                        {
                            log::warn!("capture failed: {err}");
                        }
                    }
                    _ => {}
                },
                WindowEvent::CursorMoved { position, .. } => {
                    let pos = (position.x as f32, position.y as f32);
                    cursor_position = Some(pos);
                    state.pointer_move(MOUSE_POINTER_ID, pos.0, pos.1);
                }
                WindowEvent::MouseInput {
                    state: button_state,
                    button: MouseButton::Left,
                    ..
                } => match button_state {
                    ElementState::Pressed => {
                        if let Some((x, y)) = cursor_position {
                            state.pointer_down(MOUSE_POINTER_ID, x, y);
                        }
                    }
                    ElementState::Released => state.pointer_up(MOUSE_POINTER_ID),
                },
                WindowEvent::Touch(Touch {
                    phase,
                    location,
                    id,
                    ..
                }) => {
                    let (x, y) = (location.x as f32, location.y as f32);
                    match phase {
                        TouchPhase::Started => state.pointer_down(*id as i64, x, y),
                        TouchPhase::Moved => state.pointer_move(*id as i64, x, y),
                        TouchPhase::Ended | TouchPhase::Cancelled => state.pointer_up(*id as i64),
                    }
                }
                WindowEvent::Resized(physical_size) => {
                    if physical_size.width > 0 && physical_size.height > 0 {
                        surface_config.width = physical_size.width;
                        surface_config.height = physical_size.height;
                        surface.configure(&gpu.device, &surface_config);
                    }
                }
                WindowEvent::RedrawRequested => {
                    let now = Instant::now();
                    let dt = clamp_dt((now - last_update).as_secs_f32());
                    last_update = now;

                    // Live-read the configuration: resolution-affecting
                    // options route through the content-preserving resize
                    // path, which no-ops when nothing changed.
                    state.update_framebuffers(
                        &gpu,
                        &mut passes,
                        &blit,
                        &config,
                        surface_config.width,
                        surface_config.height,
                    );
                    state.tick(&gpu, &mut passes, &blit, &config, dt);

                    match surface.get_current_texture() {
                        Ok(frame) => {
                            let view = frame
                                .texture
                                .create_view(&wgpu::TextureViewDescriptor::default());
                            render::render(
                                &gpu,
                                &mut passes,
                                &blit,
                                &state,
                                &config,
                                &RenderTarget {
                                    view: &view,
                                    width: surface_config.width,
                                    height: surface_config.height,
                                    to_screen: true,
                                },
                            );
                            frame.present();
                        }
                        Err(wgpu::SurfaceError::Lost) => {
                            surface.configure(&gpu.device, &surface_config);
                        }
                        Err(wgpu::SurfaceError::OutOfMemory) => {
                            control_flow.exit();
                        }
                        Err(err) => log::warn!("surface error: {err:?}"),
                    }
                }
                _ => {}
            },
            Event::AboutToWait => {
                window.request_redraw();
            }
            _ => {}
        }
    })?;

    Ok(())
}
