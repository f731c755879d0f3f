// src/gpu/splitter.rs
//! GPU splitter: classify, mark + local scan, chunk scan, finalize, scatter.
//!
//! All five stages share one bind group layout and one shader module; each
//! stage is recorded as its own compute pass. The chunk scan runs strictly
//! after every local scan has published its chunk total, and nothing reads
//! the per-element prefix sums before that.
//!
//! Indirect draws carry the range offset in `first_instance`, which needs
//! `wgpu::Features::INDIRECT_FIRST_INSTANCE`. Without it, bind the counters
//! buffer in the draw shaders and offset the instance index there.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::{debug, warn};
use wgpu::util::DeviceExt;

use super::{dispatch_grid, group_count, map_read, GpuDepthPyramid};
use crate::camera::{Camera, CameraUniform};
use crate::classifier::{Element, GpuElement, Tag};
use crate::compactor::Counter;
use crate::config::SplitterConfig;
use crate::dispatch::{Dispatch, DispatchBuilder, DrawIndexedIndirectArgs, DrawIndirectArgs};
use crate::error::{Error, Result};

pub const FLAG_INSTANCES: u32 = 1 << 0;
pub const FLAG_IMPOSTORS: u32 = 1 << 1;
pub const FLAG_OCCLUSION: u32 = 1 << 2;
pub const FLAG_FRUSTUM: u32 = 1 << 3;
pub const FLAG_BBOX: u32 = 1 << 4;

/// Vertices of the camera-facing quad drawn per impostor.
pub const IMPOSTOR_VERTICES: u32 = 4;
pub const POINT_VERTICES: u32 = 1;

/// Frame parameters (matches the WGSL `Params` struct).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SplitterUniform {
    pub element_count: u32,
    pub flags: u32,
    /// Pyramid levels bound this frame, 0 when occlusion is off.
    pub hzb_levels: u32,
    pub mesh_index_count: u32,
    pub instance_limit: f32,
    pub impostor_limit: f32,
    pub default_radius: f32,
    /// Pyramid level-0 texels per viewport pixel.
    pub hzb_scale: f32,
    pub bbox_min: [f32; 3],
    pub impostor_vertices: u32,
    pub bbox_max: [f32; 3],
    pub point_vertices: u32,
}

impl SplitterUniform {
    pub fn new(config: &SplitterConfig, element_count: u32, mesh_index_count: u32) -> Self {
        let mut flags = 0;
        for (enabled, flag) in [
            (config.enable_instances, FLAG_INSTANCES),
            (config.enable_impostors, FLAG_IMPOSTORS),
            (config.enable_occlusion_culling, FLAG_OCCLUSION),
            (config.enable_frustum_culling, FLAG_FRUSTUM),
            (config.use_bbox, FLAG_BBOX),
        ] {
            if enabled {
                flags |= flag;
            }
        }
        Self {
            element_count,
            flags,
            hzb_levels: 0,
            mesh_index_count,
            instance_limit: config.instance_limit,
            impostor_limit: config.impostor_limit,
            default_radius: config.grain_radius,
            hzb_scale: 0.0,
            bbox_min: config.bbox_min,
            impostor_vertices: IMPOSTOR_VERTICES,
            bbox_max: config.bbox_max,
            point_vertices: POINT_VERTICES,
        }
    }

    /// Enable the occlusion test against a pyramid of `levels` levels whose
    /// base is `base_height` texels tall.
    pub fn with_pyramid(mut self, levels: u32, base_height: u32, viewport_height: u32) -> Self {
        if levels > 0 && viewport_height > 0 && self.flags & FLAG_OCCLUSION != 0 {
            self.hzb_levels = levels;
            self.hzb_scale = base_height as f32 / viewport_height as f32;
        }
        self
    }
}

/// Layout of the indirect buffer written by the finalize pass.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectDraws {
    pub instanced: DrawIndexedIndirectArgs,
    pub impostor: DrawIndirectArgs,
    pub point: DrawIndirectArgs,
}

impl IndirectDraws {
    pub const INSTANCED_OFFSET: u64 = 0;
    pub const IMPOSTOR_OFFSET: u64 = std::mem::size_of::<DrawIndexedIndirectArgs>() as u64;
    pub const POINT_OFFSET: u64 =
        Self::IMPOSTOR_OFFSET + std::mem::size_of::<DrawIndirectArgs>() as u64;
}

/// Bytes per grain of the widest per-grain buffer (`prefix`, one `u32` per tag).
const PREFIX_STRIDE: u64 = (Tag::COUNT * std::mem::size_of::<u32>()) as u64;

/// Fails when `workgroup_size` exceeds what the device can run, including
/// the `vec4<u32>` scan scratch in workgroup memory.
pub fn check_workgroup_size(limits: &wgpu::Limits, workgroup_size: u32) -> Result<()> {
    let max = limits
        .max_compute_invocations_per_workgroup
        .min(limits.max_compute_workgroup_size_x);
    if workgroup_size > max {
        return Err(Error::config(format!(
            "workgroupSize {workgroup_size} exceeds the device limit of {max} invocations"
        )));
    }
    let scratch = workgroup_size as u64 * PREFIX_STRIDE;
    if scratch > limits.max_compute_workgroup_storage_size as u64 {
        return Err(Error::config(format!(
            "workgroupSize {workgroup_size} needs {scratch} bytes of workgroup memory, device allows {}",
            limits.max_compute_workgroup_storage_size
        )));
    }
    Ok(())
}

/// Buffer capacity for `count` grains: the next power of two, clamped so
/// every per-grain buffer still fits in one storage binding.
pub fn buffer_capacity(limits: &wgpu::Limits, count: u32) -> Result<u32> {
    let stride = PREFIX_STRIDE.max(std::mem::size_of::<GpuElement>() as u64);
    let max_binding = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
    let max_grains = (max_binding / stride).min(u32::MAX as u64);
    if count as u64 > max_grains {
        return Err(Error::Resource(format!(
            "{count} grains exceed the device storage binding limit of {max_grains} grains"
        )));
    }
    let capacity = count.checked_next_power_of_two().unwrap_or(count) as u64;
    Ok(capacity.min(max_grains) as u32)
}

/// Per-capacity storage buffers.
struct SplitterBuffers {
    capacity: u32,
    elements: wgpu::Buffer,
    tags: wgpu::Buffer,
    prefix: wgpu::Buffer,
    chunk_sums: wgpu::Buffer,
    counters: wgpu::Buffer,
    compacted: wgpu::Buffer,
    indirect: wgpu::Buffer,
    readback: wgpu::Buffer,
}

impl SplitterBuffers {
    fn new(device: &wgpu::Device, capacity: u32, workgroup_size: u32) -> Self {
        let n = capacity as u64;
        let lanes = PREFIX_STRIDE;
        let chunks = group_count(capacity, workgroup_size).max(1) as u64;
        let counters_size = (Tag::COUNT * std::mem::size_of::<Counter>()) as u64;

        let storage = |label: &str, size: u64, extra: wgpu::BufferUsages| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | extra,
                mapped_at_creation: false,
            })
        };

        Self {
            capacity,
            elements: storage(
                "splitter_elements",
                n * std::mem::size_of::<GpuElement>() as u64,
                wgpu::BufferUsages::COPY_DST,
            ),
            tags: storage("splitter_tags", n * 4, wgpu::BufferUsages::empty()),
            prefix: storage("splitter_prefix", n * lanes, wgpu::BufferUsages::empty()),
            chunk_sums: storage("splitter_chunk_sums", chunks * lanes, wgpu::BufferUsages::empty()),
            counters: storage("splitter_counters", counters_size, wgpu::BufferUsages::COPY_SRC),
            compacted: storage("splitter_compacted", n * 4, wgpu::BufferUsages::VERTEX),
            indirect: storage(
                "splitter_indirect",
                std::mem::size_of::<IndirectDraws>() as u64,
                wgpu::BufferUsages::INDIRECT,
            ),
            readback: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("splitter_counters_readback"),
                size: counters_size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
        }
    }
}

struct SplitterPipelines {
    layout: wgpu::BindGroupLayout,
    classify: wgpu::ComputePipeline,
    mark_scan: wgpu::ComputePipeline,
    scan_chunks: wgpu::ComputePipeline,
    finalize: wgpu::ComputePipeline,
    scatter: wgpu::ComputePipeline,
}

impl SplitterPipelines {
    fn new(device: &wgpu::Device, workgroup_size: u32) -> Self {
        let buffer_entry = |binding: u32, ty: wgpu::BufferBindingType| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let storage = wgpu::BufferBindingType::Storage { read_only: false };

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("splitter_bgl"),
            entries: &[
                buffer_entry(0, wgpu::BufferBindingType::Uniform),
                buffer_entry(1, wgpu::BufferBindingType::Uniform),
                buffer_entry(2, storage),
                buffer_entry(3, storage),
                buffer_entry(4, storage),
                buffer_entry(5, storage),
                buffer_entry(6, storage),
                buffer_entry(7, storage),
                buffer_entry(8, storage),
                wgpu::BindGroupLayoutEntry {
                    binding: 9,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    },
                    count: None,
                },
            ],
        });

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("splitter_cs"),
            source: wgpu::ShaderSource::Wgsl(splitter_source(workgroup_size).into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("splitter_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = |entry_point: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point,
                compilation_options: Default::default(),
                cache: None,
            })
        };

        Self {
            classify: pipeline("classify"),
            mark_scan: pipeline("mark_scan"),
            scan_chunks: pipeline("scan_chunks"),
            finalize: pipeline("finalize"),
            scatter: pipeline("scatter"),
            layout,
        }
    }
}

pub struct GpuSplitter {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    limits: wgpu::Limits,
    config: SplitterConfig,
    /// Index count of the grain mesh drawn for `Instanced`.
    mesh_index_count: u32,

    pipelines: SplitterPipelines,
    params: wgpu::Buffer,
    camera: wgpu::Buffer,
    /// Bound in place of the pyramid when occlusion is off.
    fallback_hzb: wgpu::TextureView,

    buffers: Option<SplitterBuffers>,
    element_count: u32,
}

impl GpuSplitter {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        config: SplitterConfig,
        mesh_index_count: u32,
    ) -> Result<Self> {
        config.validate()?;
        let limits = device.limits();
        check_workgroup_size(&limits, config.workgroup_size)?;

        let pipelines = SplitterPipelines::new(&device, config.workgroup_size);
        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("splitter_params"),
            contents: bytemuck::bytes_of(&SplitterUniform::default()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let camera = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("splitter_camera"),
            contents: bytemuck::bytes_of(&CameraUniform::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let fallback_hzb = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("splitter_fallback_hzb"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: super::hzb::HZB_FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            device,
            queue,
            limits,
            config,
            mesh_index_count,
            pipelines,
            params,
            camera,
            fallback_hzb,
            buffers: None,
            element_count: 0,
        })
    }

    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// Replace the configuration. A new workgroup size rebuilds the pipelines
    /// and drops the buffers sized for the old one.
    pub fn set_config(&mut self, config: SplitterConfig) -> Result<()> {
        config.validate()?;
        check_workgroup_size(&self.limits, config.workgroup_size)?;
        if config.workgroup_size != self.config.workgroup_size {
            self.pipelines = SplitterPipelines::new(&self.device, config.workgroup_size);
            self.buffers = None;
            self.element_count = 0;
        }
        self.config = config;
        Ok(())
    }

    /// Upload this frame's grains, growing the buffers when needed.
    pub fn upload(&mut self, elements: &[Element]) -> Result<()> {
        let count = u32::try_from(elements.len())
            .map_err(|_| Error::config(format!("{} elements do not fit 32-bit indices", elements.len())))?;
        self.element_count = 0;
        if count == 0 {
            return Ok(());
        }

        let needs_alloc = self.buffers.as_ref().map_or(true, |b| b.capacity < count);
        if needs_alloc {
            let capacity = buffer_capacity(&self.limits, count)?;
            debug!("splitter buffers sized for {capacity} grains");
            self.buffers = Some(SplitterBuffers::new(&self.device, capacity, self.config.workgroup_size));
        }
        let buffers = self
            .buffers
            .as_ref()
            .ok_or_else(|| Error::Resource("splitter buffers missing after allocation".into()))?;

        let radius = self.config.grain_radius;
        let gpu: Vec<GpuElement> = elements
            .iter()
            .map(|e| GpuElement::from_element(e, radius))
            .collect();
        self.queue.write_buffer(&buffers.elements, 0, bytemuck::cast_slice(&gpu));
        self.element_count = count;
        Ok(())
    }

    /// Record the five splitter passes for the uploaded grains, plus the copy
    /// of the counters into the readback buffer. Records nothing for N = 0.
    pub fn encode(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        camera: &Camera,
        pyramid: Option<&GpuDepthPyramid>,
    ) -> Result<()> {
        let n = self.element_count;
        if n == 0 {
            return Ok(());
        }
        let buffers = self
            .buffers
            .as_ref()
            .ok_or_else(|| Error::Resource("no grains uploaded".into()))?;

        let mut params = SplitterUniform::new(&self.config, n, self.mesh_index_count);
        let mut hzb_view = &self.fallback_hzb;
        match pyramid.filter(|p| p.is_ready()).and_then(|p| p.view().map(|v| (p, v))) {
            Some((p, view)) if self.config.enable_occlusion_culling => {
                params = params.with_pyramid(p.level_count(), p.size().1, camera.resolution.1);
                hzb_view = view;
            }
            None if self.config.enable_occlusion_culling => {
                warn!("GPU pyramid not ready, classifying without occlusion culling");
            }
            _ => {}
        }
        self.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&params));
        self.queue
            .write_buffer(&self.camera, 0, bytemuck::bytes_of(&CameraUniform::from_camera(camera)));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("splitter_bg"),
            layout: &self.pipelines.layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: self.params.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: self.camera.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: buffers.elements.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: buffers.tags.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: buffers.prefix.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: buffers.chunk_sums.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 6, resource: buffers.counters.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 7, resource: buffers.compacted.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 8, resource: buffers.indirect.as_entire_binding() },
                wgpu::BindGroupEntry {
                    binding: 9,
                    resource: wgpu::BindingResource::TextureView(hzb_view),
                },
            ],
        });

        let element_grid = dispatch_grid(group_count(n, self.config.workgroup_size));
        let passes: [(&str, &wgpu::ComputePipeline, (u32, u32)); 5] = [
            ("splitter_classify", &self.pipelines.classify, element_grid),
            ("splitter_mark_scan", &self.pipelines.mark_scan, element_grid),
            ("splitter_scan_chunks", &self.pipelines.scan_chunks, (1, 1)),
            ("splitter_finalize", &self.pipelines.finalize, (1, 1)),
            ("splitter_scatter", &self.pipelines.scatter, element_grid),
        ];
        for (label, pipeline, (x, y)) in passes {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            cpass.set_pipeline(pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(x, y, 1);
        }

        encoder.copy_buffer_to_buffer(&buffers.counters, 0, &buffers.readback, 0, buffers.readback.size());
        Ok(())
    }

    /// Blocking readback of the counters written by the last submitted
    /// [`encode`](Self::encode).
    pub fn read_counters(&self) -> Result<[Counter; Tag::COUNT]> {
        if self.element_count == 0 {
            return Ok([Counter::default(); Tag::COUNT]);
        }
        let buffers = self
            .buffers
            .as_ref()
            .ok_or_else(|| Error::Resource("no grains uploaded".into()))?;
        let counters: Vec<Counter> = map_read(&self.device, &buffers.readback)?;
        counters
            .get(..Tag::COUNT)
            .and_then(|c| <[Counter; Tag::COUNT]>::try_from(c).ok())
            .ok_or_else(|| Error::Gpu(format!("counter readback returned {} entries", counters.len())))
    }

    /// Draws for the non-empty ranges, from the read-back counters.
    pub fn dispatches(&self) -> Result<Vec<Dispatch>> {
        Ok(DispatchBuilder.from_counters(&self.read_counters()?))
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Original indices grouped by tag; bind as per-instance indirection.
    pub fn compacted_buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffers.as_ref().map(|b| &b.compacted)
    }

    /// [`IndirectDraws`] for the frame.
    pub fn indirect_buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffers.as_ref().map(|b| &b.indirect)
    }

    /// `[Counter; 4]`, for draw shaders that offset instance indices themselves.
    pub fn counters_buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffers.as_ref().map(|b| &b.counters)
    }

    pub fn elements_buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffers.as_ref().map(|b| &b.elements)
    }
}

/// Shader module with the scan workgroup size baked in.
pub fn splitter_source(workgroup_size: u32) -> String {
    SPLITTER_WGSL.replace("{{WORKGROUP_SIZE}}", &workgroup_size.to_string())
}

pub const SPLITTER_WGSL: &str = r#"
const WG: u32 = {{WORKGROUP_SIZE}}u;

const TAG_INSTANCED: u32 = 0u;
const TAG_IMPOSTOR: u32 = 1u;
const TAG_POINT: u32 = 2u;
const TAG_DISCARDED: u32 = 3u;

const FLAG_INSTANCES: u32 = 1u;
const FLAG_IMPOSTORS: u32 = 2u;
const FLAG_OCCLUSION: u32 = 4u;
const FLAG_FRUSTUM: u32 = 8u;
const FLAG_BBOX: u32 = 16u;

struct Params {
    element_count: u32,
    flags: u32,
    hzb_levels: u32,
    mesh_index_count: u32,
    instance_limit: f32,
    impostor_limit: f32,
    default_radius: f32,
    hzb_scale: f32,
    bbox_min: vec3<f32>,
    impostor_vertices: u32,
    bbox_max: vec3<f32>,
    point_vertices: u32,
};

struct Camera {
    view: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    frustum_planes: array<vec4<f32>, 6>,
    position: vec3<f32>,
    focal_length: f32,
    resolution: vec2<f32>,
    near: f32,
    far: f32,
};

struct Grain {
    position: vec3<f32>,
    radius: f32,
};

struct Counter {
    count: u32,
    offset: u32,
};

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<uniform> camera: Camera;
@group(0) @binding(2) var<storage, read_write> grains: array<Grain>;
@group(0) @binding(3) var<storage, read_write> tags: array<u32>;
@group(0) @binding(4) var<storage, read_write> prefix: array<vec4<u32>>;
@group(0) @binding(5) var<storage, read_write> chunk_sums: array<vec4<u32>>;
@group(0) @binding(6) var<storage, read_write> counters: array<Counter, 4>;
@group(0) @binding(7) var<storage, read_write> compacted: array<u32>;
@group(0) @binding(8) var<storage, read_write> draws: array<u32, 13>;
@group(0) @binding(9) var hzb: texture_2d<f32>;

var<workgroup> scratch: array<vec4<u32>, WG>;

fn flat_group(wid: vec3<u32>, nwg: vec3<u32>) -> u32 {
    return wid.y * nwg.x + wid.x;
}

fn has_flag(flag: u32) -> bool {
    return (params.flags & flag) != 0u;
}

fn indicator(tag: u32) -> vec4<u32> {
    return vec4<u32>(vec4<u32>(tag) == vec4<u32>(0u, 1u, 2u, 3u));
}

fn linear_depth(d: f32) -> f32 {
    return camera.near * camera.far / (camera.far - d * (camera.far - camera.near));
}

fn in_frustum(c: vec3<f32>, r: f32) -> bool {
    for (var i = 0u; i < 6u; i++) {
        let p = camera.frustum_planes[i];
        if (dot(p.xyz, c) + p.w < -r) { return false; }
    }
    return true;
}

fn occluded(c: vec3<f32>, r: f32) -> bool {
    if (params.hzb_levels == 0u) { return false; }

    let o = (camera.view * vec4<f32>(c, 1.0)).xyz;
    let r2 = r * r;
    let oz2 = o.z * o.z;
    if (o.z >= 0.0 || oz2 - r2 <= 0.0 || r <= 0.0) { return false; }

    let fl = camera.focal_length;
    let fp = fl * fl * r2 * (dot(o, o) - r2) / (oz2 - r2);
    let outer = sqrt(abs(fp / (r2 - oz2)));
    let h = camera.resolution.y;
    let center_px = o.xy * o.z * fl / (oz2 - r2) * h * vec2<f32>(-1.0, 1.0) + camera.resolution * 0.5;
    let radius_px = outer * h * params.hzb_scale;
    if (!(radius_px > 0.0)) { return false; }

    var max_level = 0.0;
    if (params.hzb_levels >= 2u) { max_level = f32(params.hzb_levels - 2u); }
    let level = i32(clamp(ceil(log2(radius_px) + 1.0), 0.0, max_level));

    let uv = center_px / camera.resolution;
    if (!(all(uv >= vec2<f32>(0.0)) && all(uv <= vec2<f32>(1.0)))) { return false; }
    let size = vec2<i32>(textureDimensions(hzb, level));
    let base = vec2<i32>(floor(uv * vec2<f32>(size) - 0.5));
    let hi = size - vec2<i32>(1);
    let min_dist = length(o) - r;
    for (var dy = 0; dy < 2; dy++) {
        for (var dx = 0; dx < 2; dx++) {
            let texel = clamp(base + vec2<i32>(dx, dy), vec2<i32>(0), hi);
            if (linear_depth(textureLoad(hzb, texel, level).x) >= min_dist) { return false; }
        }
    }
    return true;
}

fn classify_grain(c: vec3<f32>, r: f32) -> u32 {
    if (has_flag(FLAG_BBOX) && (any(c < params.bbox_min) || any(c > params.bbox_max))) {
        return TAG_DISCARDED;
    }
    if (has_flag(FLAG_FRUSTUM) && !in_frustum(c, r)) { return TAG_DISCARDED; }
    if (has_flag(FLAG_OCCLUSION) && occluded(c, r)) { return TAG_DISCARDED; }

    let d = distance(camera.position, c);
    if (has_flag(FLAG_INSTANCES) && d < params.instance_limit) { return TAG_INSTANCED; }
    if (has_flag(FLAG_IMPOSTORS) && d < params.impostor_limit) { return TAG_IMPOSTOR; }
    return TAG_POINT;
}

@compute @workgroup_size(WG)
fn classify(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {
    let i = flat_group(wid, nwg) * WG + lid.x;
    if (i >= params.element_count) { return; }
    let g = grains[i];
    tags[i] = classify_grain(g.position, g.radius);
}

@compute @workgroup_size(WG)
fn mark_scan(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {
    let group = flat_group(wid, nwg);
    let i = group * WG + lid.x;
    var mark = vec4<u32>(0u);
    if (i < params.element_count) { mark = indicator(tags[i]); }
    scratch[lid.x] = mark;
    workgroupBarrier();

    for (var stride = 1u; stride < WG; stride = stride << 1u) {
        var add = vec4<u32>(0u);
        if (lid.x >= stride) { add = scratch[lid.x - stride]; }
        workgroupBarrier();
        scratch[lid.x] += add;
        workgroupBarrier();
    }

    let inclusive = scratch[lid.x];
    if (i < params.element_count) { prefix[i] = inclusive - mark; }
    let chunk_count = (params.element_count + WG - 1u) / WG;
    if (lid.x == WG - 1u && group < chunk_count) { chunk_sums[group] = inclusive; }
}

// One invocation per tag lane; chunk totals become chunk offsets in place.
@compute @workgroup_size(4)
fn scan_chunks(@builtin(local_invocation_id) lid: vec3<u32>) {
    let lane = lid.x;
    let chunk_count = (params.element_count + WG - 1u) / WG;
    var running = 0u;
    for (var c = 0u; c < chunk_count; c++) {
        let total = chunk_sums[c][lane];
        chunk_sums[c][lane] = running;
        running += total;
    }
}

@compute @workgroup_size(1)
fn finalize() {
    let last = params.element_count - 1u;
    // the exclusive scan leaves out the last element itself
    let counts = prefix[last] + chunk_sums[last / WG] + indicator(tags[last]);

    var offset = 0u;
    for (var t = 0u; t < 4u; t++) {
        counters[t] = Counter(counts[t], offset);
        offset += counts[t];
    }

    draws[0] = params.mesh_index_count;
    draws[1] = counts[TAG_INSTANCED];
    draws[2] = 0u;
    draws[3] = 0u;
    draws[4] = counters[TAG_INSTANCED].offset;

    draws[5] = params.impostor_vertices;
    draws[6] = counts[TAG_IMPOSTOR];
    draws[7] = 0u;
    draws[8] = counters[TAG_IMPOSTOR].offset;

    draws[9] = params.point_vertices;
    draws[10] = counts[TAG_POINT];
    draws[11] = 0u;
    draws[12] = counters[TAG_POINT].offset;
}

@compute @workgroup_size(WG)
fn scatter(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {
    let group = flat_group(wid, nwg);
    let i = group * WG + lid.x;
    if (i >= params.element_count) { return; }
    let t = tags[i];
    compacted[counters[t].offset + prefix[i][t] + chunk_sums[group][t]] = i;
}
"#;
