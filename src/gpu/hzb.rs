// src/gpu/hzb.rs
//! GPU depth pyramid: an `R32Float` mip chain rebuilt every frame from the
//! occluder depth attachment.
//!
//! Level 0 is a compute copy of the depth buffer (depth textures cannot be
//! copied into float textures), each further level one max-reduction pass.

use std::sync::Arc;

use log::{debug, warn};

use crate::depth_pyramid::level_count_for;

pub const HZB_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;

const TILE: u32 = 16;

pub struct GpuDepthPyramid {
    device: Arc<wgpu::Device>,

    texture: Option<wgpu::Texture>,
    /// All levels, for sampling.
    view: Option<wgpu::TextureView>,
    /// One single-level view per mip, for the reduction passes.
    mip_views: Vec<wgpu::TextureView>,
    size: (u32, u32),
    level_count: u32,
    built: bool,

    copy_layout: Option<wgpu::BindGroupLayout>,
    copy_pipeline: Option<wgpu::ComputePipeline>,
    reduce_layout: Option<wgpu::BindGroupLayout>,
    reduce_pipeline: Option<wgpu::ComputePipeline>,
}

impl GpuDepthPyramid {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            device,
            texture: None,
            view: None,
            mip_views: Vec::new(),
            size: (0, 0),
            level_count: 0,
            built: false,
            copy_layout: None,
            copy_pipeline: None,
            reduce_layout: None,
            reduce_pipeline: None,
        }
    }

    /// Match the pyramid to the occluder depth size. Reallocates only when
    /// the size changes; call on resize.
    pub fn prepare(&mut self, width: u32, height: u32) {
        self.ensure_pipelines();

        if width == 0 || height == 0 {
            warn!("occluder depth is {width}x{height}, GPU pyramid disabled");
            self.release();
            return;
        }
        if self.texture.is_some() && self.size == (width, height) {
            return;
        }

        let level_count = level_count_for(width, height);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("hzb_texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: level_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: HZB_FORMAT,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });

        self.mip_views = (0..level_count)
            .map(|level| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(&format!("hzb_mip_{level}")),
                    base_mip_level: level,
                    mip_level_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();
        self.view = Some(texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("hzb_view"),
            ..Default::default()
        }));
        self.texture = Some(texture);
        self.size = (width, height);
        self.level_count = level_count;
        self.built = false;

        debug!("GPU pyramid allocated: {width}x{height}, {level_count} levels");
    }

    fn release(&mut self) {
        self.texture = None;
        self.view = None;
        self.mip_views.clear();
        self.size = (0, 0);
        self.level_count = 0;
        self.built = false;
    }

    /// Record the pyramid build. `depth_view` must be a `Depth32Float` (or
    /// other sampleable depth) view of the size passed to [`prepare`](Self::prepare).
    pub fn build(&mut self, encoder: &mut wgpu::CommandEncoder, depth_view: &wgpu::TextureView) {
        let (
            Some(copy_pipeline),
            Some(copy_layout),
            Some(reduce_pipeline),
            Some(reduce_layout),
        ) = (
            &self.copy_pipeline,
            &self.copy_layout,
            &self.reduce_pipeline,
            &self.reduce_layout,
        )
        else {
            return;
        };
        if self.mip_views.is_empty() {
            warn!("GPU pyramid build skipped: no target allocated");
            self.built = false;
            return;
        }

        let copy_bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("hzb_copy_bg"),
            layout: copy_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(depth_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&self.mip_views[0]),
                },
            ],
        });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("hzb_copy_pass"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(copy_pipeline);
            cpass.set_bind_group(0, &copy_bg, &[]);
            cpass.dispatch_workgroups(self.size.0.div_ceil(TILE), self.size.1.div_ceil(TILE), 1);
        }

        let (mut dst_w, mut dst_h) = self.size;
        for dst in 1..self.level_count as usize {
            dst_w = (dst_w / 2).max(1);
            dst_h = (dst_h / 2).max(1);

            let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("hzb_reduce_bg_{dst}")),
                layout: reduce_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&self.mip_views[dst - 1]),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&self.mip_views[dst]),
                    },
                ],
            });

            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("hzb_reduce_pass"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(reduce_pipeline);
            cpass.set_bind_group(0, &bg, &[]);
            cpass.dispatch_workgroups(dst_w.div_ceil(TILE), dst_h.div_ceil(TILE), 1);
        }

        self.built = true;
    }

    /// `true` once a build has been recorded into the current target.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.built && self.view.is_some()
    }

    pub fn view(&self) -> Option<&wgpu::TextureView> {
        self.view.as_ref()
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn level_count(&self) -> u32 {
        self.level_count
    }

    fn ensure_pipelines(&mut self) {
        if self.copy_pipeline.is_some() && self.reduce_pipeline.is_some() {
            return;
        }

        let storage_target = wgpu::BindGroupLayoutEntry {
            binding: 1,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: HZB_FORMAT,
                view_dimension: wgpu::TextureViewDimension::D2,
            },
            count: None,
        };

        let copy_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("hzb_copy_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Depth,
                    },
                    count: None,
                },
                storage_target.clone(),
            ],
        });

        let reduce_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("hzb_reduce_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    },
                    count: None,
                },
                storage_target,
            ],
        });

        self.copy_pipeline = Some(self.compute_pipeline("hzb_copy", HZB_COPY_WGSL, &copy_layout));
        self.reduce_pipeline = Some(self.compute_pipeline("hzb_reduce", HZB_REDUCE_WGSL, &reduce_layout));
        self.copy_layout = Some(copy_layout);
        self.reduce_layout = Some(reduce_layout);
    }

    fn compute_pipeline(
        &self,
        label: &str,
        source: &str,
        layout: &wgpu::BindGroupLayout,
    ) -> wgpu::ComputePipeline {
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[layout],
            push_constant_ranges: &[],
        });
        self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: "main",
            compilation_options: Default::default(),
            cache: None,
        })
    }
}

/// Depth attachment to level 0.
pub const HZB_COPY_WGSL: &str = r#"
@group(0) @binding(0) var src_depth: texture_depth_2d;
@group(0) @binding(1) var dst_mip: texture_storage_2d<r32float, write>;

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let dims = textureDimensions(dst_mip);
    if (gid.x >= dims.x || gid.y >= dims.y) { return; }
    let d = textureLoad(src_depth, vec2<i32>(gid.xy), 0);
    textureStore(dst_mip, vec2<i32>(gid.xy), vec4<f32>(d, 0.0, 0.0, 0.0));
}
"#;

/// Max of the source block; the last row/column also takes the orphaned
/// texel of an odd-sized source.
pub const HZB_REDUCE_WGSL: &str = r#"
@group(0) @binding(0) var src_mip: texture_2d<f32>;
@group(0) @binding(1) var dst_mip: texture_storage_2d<r32float, write>;

fn footprint(dst: u32, dst_size: u32, src_size: u32) -> vec2<u32> {
    let start = min(dst * 2u, src_size - 1u);
    var end = min(dst * 2u + 2u, src_size);
    if (dst + 1u == dst_size) { end = src_size; }
    return vec2<u32>(start, max(end, start + 1u));
}

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let dst_dims = textureDimensions(dst_mip);
    if (gid.x >= dst_dims.x || gid.y >= dst_dims.y) { return; }
    let src_dims = textureDimensions(src_mip, 0);

    let fx = footprint(gid.x, dst_dims.x, src_dims.x);
    let fy = footprint(gid.y, dst_dims.y, src_dims.y);
    var max_depth = 0.0;
    for (var y = fy.x; y < fy.y; y++) {
        for (var x = fx.x; x < fx.y; x++) {
            max_depth = max(max_depth, textureLoad(src_mip, vec2<u32>(x, y), 0).x);
        }
    }
    textureStore(dst_mip, vec2<i32>(gid.xy), vec4<f32>(max_depth, 0.0, 0.0, 0.0));
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shaders_declare_the_bound_format() {
        for source in [HZB_COPY_WGSL, HZB_REDUCE_WGSL] {
            assert!(source.contains("texture_storage_2d<r32float, write>"));
            assert!(source.contains("@workgroup_size(16, 16)"));
        }
        assert_eq!(HZB_FORMAT, wgpu::TextureFormat::R32Float);
        assert_eq!(TILE, 16);
    }
}
