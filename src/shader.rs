//! Shader program cache. Pass programs pair the shared quad vertex stage
//! with one fragment source; wgpu render pipelines bake the color target
//! format and blend state, so each program memoizes one pipeline per
//! format it is asked to render into. The display material additionally
//! memoizes one variant per feature-keyword combination.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::blit::quad_vertex_layout;
use crate::config::Config;

const QUAD_SRC: &str = include_str!("../shaders/quad.wgsl");
const COPY_SRC: &str = include_str!("../shaders/copy.wgsl");
const CLEAR_SRC: &str = include_str!("../shaders/clear.wgsl");
const COLOR_SRC: &str = include_str!("../shaders/color.wgsl");
const CHECKERBOARD_SRC: &str = include_str!("../shaders/checkerboard.wgsl");
const SPLAT_SRC: &str = include_str!("../shaders/splat.wgsl");
const ADVECTION_SRC: &str = include_str!("../shaders/advection.wgsl");
const DIVERGENCE_SRC: &str = include_str!("../shaders/divergence.wgsl");
const CURL_SRC: &str = include_str!("../shaders/curl.wgsl");
const VORTICITY_SRC: &str = include_str!("../shaders/vorticity.wgsl");
const PRESSURE_SRC: &str = include_str!("../shaders/pressure.wgsl");
const GRADIENT_SUBTRACT_SRC: &str = include_str!("../shaders/gradient_subtract.wgsl");
const BLUR_SRC: &str = include_str!("../shaders/blur.wgsl");
const BLOOM_PREFILTER_SRC: &str = include_str!("../shaders/bloom_prefilter.wgsl");
const BLOOM_BLUR_SRC: &str = include_str!("../shaders/bloom_blur.wgsl");
const BLOOM_FINAL_SRC: &str = include_str!("../shaders/bloom_final.wgsl");
const SUNRAYS_MASK_SRC: &str = include_str!("../shaders/sunrays_mask.wgsl");
const SUNRAYS_SRC: &str = include_str!("../shaders/sunrays.wgsl");
const DISPLAY_SRC: &str = include_str!("../shaders/display.wgsl");

pub const ADDITIVE_BLEND: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
};

// Per-pass uniform blocks. Layouts match the WGSL structs field for field,
// padded to 16-byte multiples.

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct TexelParams {
    pub texel_size: [f32; 2],
    pub _pad: [f32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ClearParams {
    pub value: f32,
    pub _pad: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ColorParams {
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct CheckerboardParams {
    pub aspect_ratio: f32,
    pub _pad: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct SplatParams {
    pub point: [f32; 2],
    pub radius: f32,
    pub aspect_ratio: f32,
    pub color: [f32; 3],
    pub _pad: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct AdvectionParams {
    pub texel_size: [f32; 2],
    pub dt: f32,
    pub dissipation: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct VorticityParams {
    pub texel_size: [f32; 2],
    pub curl: f32,
    pub dt: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct BlurParams {
    pub direction: [f32; 2],
    pub _pad: [f32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct BloomPrefilterParams {
    pub curve: [f32; 3],
    pub threshold: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct BloomFinalParams {
    pub texel_size: [f32; 2],
    pub intensity: f32,
    pub _pad: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct SunraysParams {
    pub weight: f32,
    pub _pad: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct DisplayParams {
    pub texel_size: [f32; 2],
    pub dither_scale: [f32; 2],
}

/// Compiles a module inside a validation error scope so a broken shader is
/// reported with its full diagnostic instead of tearing the process down.
pub fn create_shader_module(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> wgpu::ShaderModule {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        log::error!("shader '{label}' failed to compile:\n{error}");
    }
    module
}

fn pass_bind_group_layout(
    device: &wgpu::Device,
    label: &str,
    has_uniforms: bool,
    texture_count: u32,
) -> wgpu::BindGroupLayout {
    let mut entries = Vec::new();
    if has_uniforms {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
    }
    for i in 0..texture_count {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 1 + 2 * i,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 2 + 2 * i,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
    }
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    })
}

fn create_pass_pipeline(
    device: &wgpu::Device,
    label: &str,
    module: &wgpu::ShaderModule,
    layout: &wgpu::PipelineLayout,
    format: wgpu::TextureFormat,
    blend: Option<wgpu::BlendState>,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: "vs_main",
            buffers: &[quad_vertex_layout()],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: "fs_main",
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
        cache: None,
    })
}

/// One fixed fragment pass. The module compiles once; pipelines are
/// memoized per target format on first use. Uniforms are uploaded as a
/// small transient buffer per draw, so one command encoder can carry many
/// invocations of the same pass with different parameters.
pub struct PassProgram {
    label: &'static str,
    module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    blend: Option<wgpu::BlendState>,
    has_uniforms: bool,
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

impl PassProgram {
    pub fn new(
        device: &wgpu::Device,
        label: &'static str,
        fragment_source: &str,
        texture_count: u32,
        has_uniforms: bool,
        blend: Option<wgpu::BlendState>,
    ) -> Self {
        let source = format!("{QUAD_SRC}\n{fragment_source}");
        let module = create_shader_module(device, label, &source);
        let bind_group_layout = pass_bind_group_layout(device, label, has_uniforms, texture_count);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        Self {
            label,
            module,
            bind_group_layout,
            pipeline_layout,
            blend,
            has_uniforms,
            pipelines: HashMap::new(),
        }
    }

    pub fn pipeline(
        &mut self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
    ) -> &wgpu::RenderPipeline {
        self.pipelines.entry(format).or_insert_with(|| {
            create_pass_pipeline(
                device,
                self.label,
                &self.module,
                &self.pipeline_layout,
                format,
                self.blend,
            )
        })
    }

    pub fn bind<T: Pod>(
        &self,
        device: &wgpu::Device,
        params: &T,
        textures: &[(&wgpu::TextureView, &wgpu::Sampler)],
    ) -> wgpu::BindGroup {
        debug_assert!(self.has_uniforms);
        let uniforms = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(self.label),
            contents: bytemuck::bytes_of(params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniforms.as_entire_binding(),
        }];
        push_texture_entries(&mut entries, textures);
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.label),
            layout: &self.bind_group_layout,
            entries: &entries,
        })
    }

    pub fn bind_textures(
        &self,
        device: &wgpu::Device,
        textures: &[(&wgpu::TextureView, &wgpu::Sampler)],
    ) -> wgpu::BindGroup {
        debug_assert!(!self.has_uniforms);
        let mut entries = Vec::new();
        push_texture_entries(&mut entries, textures);
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.label),
            layout: &self.bind_group_layout,
            entries: &entries,
        })
    }
}

fn push_texture_entries<'a>(
    entries: &mut Vec<wgpu::BindGroupEntry<'a>>,
    textures: &[(&'a wgpu::TextureView, &'a wgpu::Sampler)],
) {
    for (i, (view, sampler)) in textures.iter().enumerate() {
        let i = i as u32;
        entries.push(wgpu::BindGroupEntry {
            binding: 1 + 2 * i,
            resource: wgpu::BindingResource::TextureView(view),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: 2 + 2 * i,
            resource: wgpu::BindingResource::Sampler(sampler),
        });
    }
}

/// Exact variant key for the display composite. The keyword universe is
/// closed, so the cache key is the keyword set itself rather than a hash
/// of keyword strings; distinct sets can never alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DisplayKeywords {
    pub shading: bool,
    pub bloom: bool,
    pub sunrays: bool,
}

impl DisplayKeywords {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shading: config.shading,
            bloom: config.bloom,
            sunrays: config.sunrays,
        }
    }

    fn header(&self) -> String {
        format!(
            "const SHADING: bool = {};\nconst BLOOM: bool = {};\nconst SUNRAYS: bool = {};\n",
            self.shading, self.bloom, self.sunrays
        )
    }
}

/// Keyword-parameterized program family for the final composite. Variants
/// compile on first request and are memoized; re-selecting the active
/// variant is a no-op.
pub struct DisplayMaterial {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pub format: wgpu::TextureFormat,
    variants: HashMap<DisplayKeywords, wgpu::RenderPipeline>,
    active: DisplayKeywords,
}

impl DisplayMaterial {
    pub fn new(device: &wgpu::Device, format: wgpu::TextureFormat) -> Self {
        let bind_group_layout = pass_bind_group_layout(device, "Display Material", true, 4);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Display Material"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let mut material = Self {
            bind_group_layout,
            pipeline_layout,
            format,
            variants: HashMap::new(),
            active: DisplayKeywords::default(),
        };
        material.set_keywords(device, DisplayKeywords::default());
        material
    }

    pub fn set_keywords(&mut self, device: &wgpu::Device, keywords: DisplayKeywords) {
        if !self.variants.contains_key(&keywords) {
            let source = format!("{}{QUAD_SRC}\n{DISPLAY_SRC}", keywords.header());
            let module = create_shader_module(device, "Display Material", &source);
            let pipeline = create_pass_pipeline(
                device,
                "Display Material",
                &module,
                &self.pipeline_layout,
                self.format,
                Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
            );
            self.variants.insert(keywords, pipeline);
        }
        self.active = keywords;
    }

    pub fn active_keywords(&self) -> DisplayKeywords {
        self.active
    }

    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    pub fn pipeline(&self) -> &wgpu::RenderPipeline {
        &self.variants[&self.active]
    }

    pub fn bind(
        &self,
        device: &wgpu::Device,
        params: &DisplayParams,
        textures: &[(&wgpu::TextureView, &wgpu::Sampler); 4],
    ) -> wgpu::BindGroup {
        let uniforms = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Display Material"),
            contents: bytemuck::bytes_of(params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniforms.as_entire_binding(),
        }];
        push_texture_entries(&mut entries, textures.as_slice());
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Display Material"),
            layout: &self.bind_group_layout,
            entries: &entries,
        })
    }
}

/// All fixed pass programs plus the display material, compiled once at
/// startup.
pub struct Passes {
    pub copy: PassProgram,
    pub clear: PassProgram,
    pub color: PassProgram,
    pub checkerboard: PassProgram,
    pub splat: PassProgram,
    pub advection: PassProgram,
    pub divergence: PassProgram,
    pub curl: PassProgram,
    pub vorticity: PassProgram,
    pub pressure: PassProgram,
    pub gradient_subtract: PassProgram,
    pub blur: PassProgram,
    pub bloom_prefilter: PassProgram,
    pub bloom_blur: PassProgram,
    pub bloom_blur_add: PassProgram,
    pub bloom_final: PassProgram,
    pub sunrays_mask: PassProgram,
    pub sunrays: PassProgram,
    pub display: DisplayMaterial,
}

impl Passes {
    pub fn new(device: &wgpu::Device, display_format: wgpu::TextureFormat) -> Self {
        let premultiplied = Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING);
        Self {
            copy: PassProgram::new(device, "Copy", COPY_SRC, 1, false, None),
            clear: PassProgram::new(device, "Clear", CLEAR_SRC, 1, true, None),
            color: PassProgram::new(device, "Color", COLOR_SRC, 0, true, premultiplied),
            checkerboard: PassProgram::new(
                device,
                "Checkerboard",
                CHECKERBOARD_SRC,
                0,
                true,
                premultiplied,
            ),
            splat: PassProgram::new(device, "Splat", SPLAT_SRC, 1, true, None),
            advection: PassProgram::new(device, "Advection", ADVECTION_SRC, 2, true, None),
            divergence: PassProgram::new(device, "Divergence", DIVERGENCE_SRC, 1, true, None),
            curl: PassProgram::new(device, "Curl", CURL_SRC, 1, true, None),
            vorticity: PassProgram::new(device, "Vorticity", VORTICITY_SRC, 2, true, None),
            pressure: PassProgram::new(device, "Pressure", PRESSURE_SRC, 2, true, None),
            gradient_subtract: PassProgram::new(
                device,
                "Gradient Subtract",
                GRADIENT_SUBTRACT_SRC,
                2,
                true,
                None,
            ),
            blur: PassProgram::new(device, "Blur", BLUR_SRC, 1, true, None),
            bloom_prefilter: PassProgram::new(
                device,
                "Bloom Prefilter",
                BLOOM_PREFILTER_SRC,
                1,
                true,
                None,
            ),
            bloom_blur: PassProgram::new(device, "Bloom Blur", BLOOM_BLUR_SRC, 1, true, None),
            bloom_blur_add: PassProgram::new(
                device,
                "Bloom Blur Add",
                BLOOM_BLUR_SRC,
                1,
                true,
                Some(ADDITIVE_BLEND),
            ),
            bloom_final: PassProgram::new(device, "Bloom Final", BLOOM_FINAL_SRC, 1, true, None),
            sunrays_mask: PassProgram::new(device, "Sunrays Mask", SUNRAYS_MASK_SRC, 1, false, None),
            sunrays: PassProgram::new(device, "Sunrays", SUNRAYS_SRC, 1, true, None),
            display: DisplayMaterial::new(device, display_format),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_sets_with_equal_members_are_one_cache_key() {
        let a = DisplayKeywords {
            shading: true,
            bloom: true,
            sunrays: false,
        };
        let b = DisplayKeywords {
            sunrays: false,
            bloom: true,
            shading: true,
        };
        let mut cache = std::collections::HashMap::new();
        cache.insert(a, 1u32);
        // Same member set reaches the same entry regardless of how the
        // value was assembled.
        assert_eq!(cache.get(&b), Some(&1));
    }

    #[test]
    fn distinct_keyword_sets_never_alias() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for shading in [false, true] {
            for bloom in [false, true] {
                for sunrays in [false, true] {
                    seen.insert(DisplayKeywords {
                        shading,
                        bloom,
                        sunrays,
                    });
                }
            }
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn keywords_track_config_toggles() {
        let mut config = Config::default();
        config.shading = false;
        config.bloom = true;
        config.sunrays = false;
        let kw = DisplayKeywords::from_config(&config);
        assert!(!kw.shading && kw.bloom && !kw.sunrays);
    }
}
