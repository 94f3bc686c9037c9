//! Render-target resource manager. All GPU textures used by the pipeline
//! are owned here; the stepper and compositor only ever borrow views and
//! samplers for the current frame.

use std::path::PathBuf;
use std::sync::mpsc;

use crate::blit::Blit;
use crate::gpu::GpuContext;
use crate::shader::PassProgram;

pub const DITHER_TEXTURE_PATH: &str = "assets/LDR_LLL1_0.png";

/// A single render target: texture, cached view and the metadata shaders
/// need for neighbor sampling.
pub struct Framebuffer {
    label: &'static str,
    texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub filter: wgpu::FilterMode,
}

impl Framebuffer {
    pub fn new(
        gpu: &GpuContext,
        label: &'static str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        filter: wgpu::FilterMode,
    ) -> Self {
        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            label,
            texture,
            view,
            width,
            height,
            format,
            filter,
        }
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn texel_size(&self) -> [f32; 2] {
        [1.0 / self.width as f32, 1.0 / self.height as f32]
    }

    pub fn binding<'a>(&'a self, gpu: &'a GpuContext) -> (&'a wgpu::TextureView, &'a wgpu::Sampler) {
        (&self.view, gpu.sampler_for(self.filter))
    }

    /// Replaces this target with one of the new size, copying the old
    /// contents forward through a sampling pass. A same-size resize is an
    /// identity no-op: the existing texture and its contents survive.
    pub fn resize(
        &mut self,
        gpu: &GpuContext,
        blit: &Blit,
        copy: &mut PassProgram,
        width: u32,
        height: u32,
    ) -> bool {
        if self.width == width && self.height == height {
            return false;
        }
        let replacement = Framebuffer::new(gpu, self.label, width, height, self.format, self.filter);
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Framebuffer Resize"),
            });
        let bind_group = copy.bind_textures(&gpu.device, &[self.binding(gpu)]);
        let pipeline = copy.pipeline(&gpu.device, replacement.format);
        blit.draw(&mut encoder, pipeline, &bind_group, &replacement.view, false);
        gpu.queue.submit(std::iter::once(encoder.finish()));
        *self = replacement;
        true
    }

    /// Blocking readback of the full texture as tightly packed rows.
    pub fn read_bytes(&self, gpu: &GpuContext) -> anyhow::Result<Vec<u8>> {
        let bytes_per_pixel = self
            .format
            .block_copy_size(None)
            .ok_or_else(|| anyhow::anyhow!("format {:?} is not readable", self.format))?;
        let unpadded_bytes_per_row = self.width * bytes_per_pixel;
        let padded_bytes_per_row = unpadded_bytes_per_row
            .div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size: (padded_bytes_per_row * self.height) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(receiver.receive())
            .ok_or_else(|| anyhow::anyhow!("readback channel closed"))??;

        let data = slice.get_mapped_range();
        let mut bytes = Vec::with_capacity((unpadded_bytes_per_row * self.height) as usize);
        for row in data.chunks(padded_bytes_per_row as usize) {
            bytes.extend_from_slice(&row[..unpadded_bytes_per_row as usize]);
        }
        drop(data);
        staging.unmap();
        Ok(bytes)
    }
}

/// Ping-pong pair: two targets and an index flag. `read` holds the current
/// field state, `write` is scratch; `swap` toggles the index in O(1).
pub struct DoubleFramebuffer {
    targets: [Framebuffer; 2],
    index: usize,
    label: &'static str,
}

impl DoubleFramebuffer {
    pub fn new(
        gpu: &GpuContext,
        label: &'static str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        filter: wgpu::FilterMode,
    ) -> Self {
        Self {
            targets: [
                Framebuffer::new(gpu, label, width, height, format, filter),
                Framebuffer::new(gpu, label, width, height, format, filter),
            ],
            index: 0,
            label,
        }
    }

    pub fn read(&self) -> &Framebuffer {
        &self.targets[self.index]
    }

    pub fn write(&self) -> &Framebuffer {
        &self.targets[1 - self.index]
    }

    pub fn swap(&mut self) {
        self.index = 1 - self.index;
    }

    pub fn width(&self) -> u32 {
        self.read().width
    }

    pub fn height(&self) -> u32 {
        self.read().height
    }

    pub fn texel_size(&self) -> [f32; 2] {
        self.read().texel_size()
    }

    /// Content-preserving resize: the read side is copied forward, the
    /// write side is scratch and allocated blank. Same-size calls are
    /// identity no-ops.
    pub fn resize(
        &mut self,
        gpu: &GpuContext,
        blit: &Blit,
        copy: &mut PassProgram,
        width: u32,
        height: u32,
    ) -> bool {
        if self.width() == width && self.height() == height {
            return false;
        }
        self.targets[self.index].resize(gpu, blit, copy, width, height);
        let format = self.targets[self.index].format;
        let filter = self.targets[self.index].filter;
        self.targets[1 - self.index] =
            Framebuffer::new(gpu, self.label, width, height, format, filter);
        true
    }
}

/// Maps a resolution tier to concrete target dimensions: the short screen
/// edge gets the tier value, the long edge scales with the aspect ratio so
/// texels stay square regardless of window shape.
pub fn get_resolution(resolution: u32, screen_width: u32, screen_height: u32) -> (u32, u32) {
    let mut aspect_ratio = screen_width as f32 / screen_height.max(1) as f32;
    if aspect_ratio < 1.0 {
        aspect_ratio = 1.0 / aspect_ratio;
    }

    let min = resolution;
    let max = (resolution as f32 * aspect_ratio).round() as u32;

    if screen_width > screen_height {
        (max, min)
    } else {
        (min, max)
    }
}

/// The tiling blue-noise texture used to dither the bloom composite. The
/// image decodes on a background thread; until it arrives (or if it never
/// does) a 1x1 white placeholder stands in and dithering degrades to a
/// flat scale.
pub struct DitherTexture {
    texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
    pending: Option<mpsc::Receiver<image::RgbaImage>>,
}

impl DitherTexture {
    pub fn load(gpu: &GpuContext, path: impl Into<PathBuf>) -> Self {
        let (texture, view) = upload_rgba(gpu, 1, 1, &[255, 255, 255, 255]);
        let (sender, receiver) = mpsc::channel();
        let path = path.into();
        std::thread::spawn(move || match image::open(&path) {
            Ok(img) => {
                let _ = sender.send(img.to_rgba8());
            }
            Err(err) => {
                log::debug!("dither texture {} unavailable: {err}", path.display());
            }
        });
        Self {
            texture,
            view,
            width: 1,
            height: 1,
            pending: Some(receiver),
        }
    }

    /// Swaps the placeholder for the decoded image once it is ready.
    pub fn poll(&mut self, gpu: &GpuContext) {
        let Some(receiver) = &self.pending else {
            return;
        };
        match receiver.try_recv() {
            Ok(img) => {
                let (width, height) = img.dimensions();
                let (texture, view) = upload_rgba(gpu, width, height, &img);
                self.texture = texture;
                self.view = view;
                self.width = width;
                self.height = height;
                self.pending = None;
            }
            Err(mpsc::TryRecvError::Empty) => {}
            Err(mpsc::TryRecvError::Disconnected) => {
                self.pending = None;
            }
        }
    }

    /// Tiling factor that makes the texture cover a target of the given
    /// size at its native texel density.
    pub fn scale(&self, width: u32, height: u32) -> [f32; 2] {
        [
            width as f32 / self.width as f32,
            height as f32 / self.height as f32,
        ]
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }
}

fn upload_rgba(
    gpu: &GpuContext,
    width: u32,
    height: u32,
    pixels: &[u8],
) -> (wgpu::Texture, wgpu::TextureView) {
    let size = wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    };
    let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Dither Texture"),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    gpu.queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        pixels,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(4 * width),
            rows_per_image: Some(height),
        },
        size,
    );
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_preserves_aspect_ratio() {
        for (w, h) in [(1000u32, 2000u32), (1000, 1000), (1777, 1000)] {
            let aspect = w as f32 / h as f32;
            let expected = if aspect < 1.0 { 1.0 / aspect } else { aspect };
            let (rw, rh) = get_resolution(128, w, h);
            let got = rw.max(rh) as f32 / rw.min(rh) as f32;
            assert!(
                (got - expected).abs() < 0.02,
                "aspect {expected} mapped to {got} ({rw}x{rh})"
            );
        }
    }

    #[test]
    fn resolution_short_edge_gets_the_tier() {
        let (w, h) = get_resolution(128, 1920, 1080);
        assert_eq!(h, 128);
        assert!(w > h);

        let (w, h) = get_resolution(128, 1080, 1920);
        assert_eq!(w, 128);
        assert!(h > w);
    }

    #[test]
    fn resolution_square_screen_is_square() {
        assert_eq!(get_resolution(256, 512, 512), (256, 256));
    }
}
