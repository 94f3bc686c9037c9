use anyhow::bail;

/// Render-target pixel formats negotiated at startup. Each tier walks a
/// fallback chain towards more channels until the adapter can render to,
/// filter and blend the format.
#[derive(Debug, Clone, Copy)]
pub struct TargetFormats {
    pub r: wgpu::TextureFormat,
    pub rg: wgpu::TextureFormat,
    pub rgba: wgpu::TextureFormat,
}

/// Owns the device/queue plus the shared samplers every pass binds with.
pub struct GpuContext {
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub formats: TargetFormats,
    pub linear_sampler: wgpu::Sampler,
    pub nearest_sampler: wgpu::Sampler,
    /// Repeat-addressing sampler for the tiling dither texture.
    pub tile_sampler: wgpu::Sampler,
}

impl GpuContext {
    pub async fn new(
        instance: &wgpu::Instance,
        surface: Option<&wgpu::Surface<'_>>,
    ) -> anyhow::Result<Self> {
        let Some(adapter) = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface,
                ..Default::default()
            })
            .await
        else {
            bail!("no compatible GPU adapter found");
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Fluid Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await?;

        // Shader or pipeline validation failures must not take down the
        // frame loop; they are reported and the broken pass draws garbage.
        device.on_uncaptured_error(Box::new(|error| {
            log::error!("wgpu validation error: {error}");
        }));

        let r = supported_target_format(
            &adapter,
            &[
                wgpu::TextureFormat::R16Float,
                wgpu::TextureFormat::Rg16Float,
                wgpu::TextureFormat::Rgba16Float,
            ],
        );
        let rg = supported_target_format(
            &adapter,
            &[wgpu::TextureFormat::Rg16Float, wgpu::TextureFormat::Rgba16Float],
        );
        let rgba = supported_target_format(&adapter, &[wgpu::TextureFormat::Rgba16Float]);
        let (Some(r), Some(rg), Some(rgba)) = (r, rg, rgba) else {
            bail!("adapter cannot render to half-float textures");
        };

        let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Linear Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let nearest_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Nearest Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let tile_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Tile Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Ok(Self {
            adapter,
            device,
            queue,
            formats: TargetFormats { r, rg, rgba },
            linear_sampler,
            nearest_sampler,
            tile_sampler,
        })
    }

    /// Device without a surface, for tests and offline use.
    pub fn headless() -> anyhow::Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        pollster::block_on(Self::new(&instance, None))
    }

    pub fn sampler_for(&self, filter: wgpu::FilterMode) -> &wgpu::Sampler {
        match filter {
            wgpu::FilterMode::Linear => &self.linear_sampler,
            wgpu::FilterMode::Nearest => &self.nearest_sampler,
        }
    }
}

fn supported_target_format(
    adapter: &wgpu::Adapter,
    candidates: &[wgpu::TextureFormat],
) -> Option<wgpu::TextureFormat> {
    for &format in candidates {
        let features = adapter.get_texture_format_features(format);
        let renderable = features
            .allowed_usages
            .contains(wgpu::TextureUsages::RENDER_ATTACHMENT);
        let usable = features.flags.contains(
            wgpu::TextureFormatFeatureFlags::FILTERABLE
                | wgpu::TextureFormatFeatureFlags::BLENDABLE,
        );
        if renderable && usable {
            if format != candidates[0] {
                log::debug!("falling back to {format:?} render targets");
            }
            return Some(format);
        }
    }
    None
}
