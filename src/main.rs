use std::backtrace::Backtrace;
use std::fs;
use std::panic;
use std::sync::Arc;

use glam::Vec3;
use log::{error, info, warn, LevelFilter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use grain_cull::gpu::{GpuDepthPyramid, GpuSplitter};
use grain_cull::{
    Camera, DepthImage, Element, Error, FrameOutput, FramePipeline, Result, SplitterConfig, StatsWriter, Tag,
};

const GRAIN_COUNT: usize = 200_000;
const SEED: u64 = 0x5a4d;
const RESOLUTION: (u32, u32) = (1280, 720);
/// Index count of the grain mesh used for instanced draws.
const GRAIN_MESH_INDICES: u32 = 240;
/// View distance of the synthetic occluder wall.
const WALL_DISTANCE: f32 = 5.0;
const CRASH_LOG: &str = "grain_cull_crash.log";

fn main() {
    setup_diagnostics();

    info!("Starting grain_cull demo...");

    let stats_path = std::env::args().nth(1);
    if let Err(e) = run(stats_path.as_deref()) {
        error!("grain_cull failed: {e}");
        std::process::exit(1);
    }
}

fn run(stats_path: Option<&str>) -> Result<()> {
    let config = SplitterConfig {
        instance_limit: 4.0,
        impostor_limit: 7.0,
        ..Default::default()
    };
    let camera = Camera::look_at(
        Vec3::new(0.0, 1.5, 6.0),
        Vec3::new(0.0, 0.3, 0.0),
        60f32.to_radians(),
        RESOLUTION,
        0.05,
        100.0,
    );
    let elements = sand_heap(GRAIN_COUNT, SEED);

    let mut pipeline = FramePipeline::new(config.clone())?;
    let mut stats = match stats_path {
        Some(path) => Some(StatsWriter::create(path)?),
        None => None,
    };

    // Frame 0 has no occluder yet; its depth feeds frame 1.
    let first = pipeline.run_frame(&elements, &camera)?;
    report(&first);
    pipeline.submit_occluder_depth(occluder_depth(&camera));
    let second = pipeline.run_frame(&elements, &camera)?;
    report(&second);

    if let Some(writer) = stats.as_mut() {
        writer.write(&first.stats)?;
        writer.write(&second.stats)?;
        writer.flush()?;
    }
    info!("average CPU frame: {:.2} ms", pipeline.average_frame_ms());

    run_gpu(&config, &camera, &elements)
}

fn report(output: &FrameOutput) {
    let s = &output.stats;
    info!(
        "frame {}: {} instanced, {} impostor, {} point, {} discarded (occlusion {})",
        s.frame,
        s.count(Tag::Instanced),
        s.count(Tag::Impostor),
        s.count(Tag::Point),
        s.count(Tag::Discarded),
        if s.occlusion_active { "on" } else { "off" }
    );
    for d in &output.dispatches {
        info!("  draw {:<8} first {:>7} count {:>7}", d.tag.name(), d.first_index, d.count);
    }
}

/// Cone-shaped heap of grains around the origin.
fn sand_heap(count: usize, seed: u64) -> Vec<Element> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (base_radius, height) = (3.0f32, 1.2f32);
    (0..count)
        .map(|_| {
            let r = base_radius * rng.gen::<f32>().sqrt();
            let angle = rng.gen_range(0.0..std::f32::consts::TAU);
            let y = height * (1.0 - r / base_radius) * rng.gen::<f32>();
            let position = Vec3::new(r * angle.cos(), y, r * angle.sin());
            if rng.gen_bool(0.1) {
                Element::with_radius(position, rng.gen_range(0.005..0.02))
            } else {
                Element::new(position)
            }
        })
        .collect()
}

/// Far background with a wall over the left 40% of the view.
fn occluder_depth(camera: &Camera) -> DepthImage {
    let (w, h) = camera.resolution;
    let wall = camera.device_depth(WALL_DISTANCE);
    let mut depth = DepthImage::filled(w, h, 1.0);
    for y in 0..h {
        for x in 0..(w * 2 / 5) {
            depth.set(x, y, wall);
        }
    }
    depth
}

/// Same frame on the GPU, with the pyramid built from a depth attachment
/// cleared to the wall distance. Skipped when no adapter is available.
fn run_gpu(config: &SplitterConfig, camera: &Camera, elements: &[Element]) -> Result<()> {
    let instance = wgpu::Instance::default();
    let Some(adapter) = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
    else {
        warn!("no GPU adapter found, skipping the GPU splitter");
        return Ok(());
    };
    info!("GPU adapter: {}", adapter.get_info().name);

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("grain_cull_device"),
            required_limits: adapter.limits(),
            ..Default::default()
        },
        None,
    ))
    .map_err(|e| Error::Gpu(format!("requesting device: {e}")))?;
    let device = Arc::new(device);
    let queue = Arc::new(queue);

    let (w, h) = camera.resolution;
    let depth_texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("occluder_depth"),
        size: wgpu::Extent3d {
            width: w,
            height: h,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Depth32Float,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    let depth_view = depth_texture.create_view(&wgpu::TextureViewDescriptor::default());

    let mut pyramid = GpuDepthPyramid::new(device.clone());
    pyramid.prepare(w, h);
    let mut splitter = GpuSplitter::new(device.clone(), queue.clone(), config.clone(), GRAIN_MESH_INDICES)?;
    splitter.upload(elements)?;

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("grain_cull_frame"),
    });
    {
        let _clear = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("occluder_clear"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(camera.device_depth(WALL_DISTANCE)),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
    }
    pyramid.build(&mut encoder, &depth_view);
    splitter.encode(&mut encoder, camera, Some(&pyramid))?;
    queue.submit(Some(encoder.finish()));

    for d in splitter.dispatches()? {
        info!("  gpu draw {:<8} first {:>7} count {:>7}", d.tag.name(), d.first_index, d.count);
    }
    Ok(())
}

/// Logger plus a panic hook that reports through `log` and keeps a copy in
/// `CRASH_LOG`.
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let reason = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown location".into());

        error!("grain_cull panicked at {location}: {reason}");
        let report = format!("{reason}\nat {location}\n\n{}", Backtrace::force_capture());
        match fs::write(CRASH_LOG, report) {
            Ok(()) => error!("backtrace written to {CRASH_LOG}"),
            Err(e) => error!("could not write {CRASH_LOG}: {e}"),
        }
    }));
}
