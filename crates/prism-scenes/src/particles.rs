//! Compute-driven particle swarm.
//!
//! A compute pass integrates the particles in a storage buffer that the render
//! pass then draws as instanced billboards. Every few frames a sample of the
//! particles is copied into a pooled readback buffer and summarized on the CPU.
//! When the adapter supports timestamp queries the compute pass is timed as
//! well; without them the scene runs the same, minus the GPU timing.

use bytemuck::{Pod, Zeroable};
use futures::future::LocalBoxFuture;
use prism_engine::device::{ReadbackPool, SurfaceConfig, WgpuBackend};
use prism_engine::scene::{Cleanup, DisposeStack, MountContext, Scene};
use wgpu::util::DeviceExt;

use crate::common::{
    acquire_gpu, aspect, clear_attachment, draw_frame, shader_module, start_loop, uniform_entry,
    Ctx, QuadVertex, SceneSettings, QUAD_INDICES, QUAD_VERTICES,
};

pub const ID: &str = "particles";

const WORKGROUP_SIZE: u32 = 64;
const TIMESTAMP_BYTES: u64 = 2 * 8;

#[derive(Debug, Clone)]
pub struct ParticleOptions {
    pub count: u32,
    pub seed: u64,
    /// Frames between telemetry readbacks.
    pub readback_interval: u64,
    /// Particles copied back per readback.
    pub sample_size: u32,
    pub point_size: f32,
}

impl Default for ParticleOptions {
    fn default() -> Self {
        Self {
            count: 65_536,
            seed: 0x5eed,
            readback_interval: 30,
            sample_size: 256,
            point_size: 0.004,
        }
    }
}

pub struct ParticlesScene {
    pub settings: SceneSettings,
    pub options: ParticleOptions,
}

impl Scene<WgpuBackend> for ParticlesScene {
    fn id(&self) -> &str {
        ID
    }

    fn title(&self) -> &str {
        "Compute particles"
    }

    fn mount(&self, ctx: MountContext<WgpuBackend>) -> LocalBoxFuture<'static, anyhow::Result<Cleanup>> {
        let settings = self.settings;
        let options = self.options.clone();
        Box::pin(async move {
            let mut stack = DisposeStack::new(ID);
            let result = build(&ctx, settings, &options, &mut stack).await;
            stack.finish(result).await
        })
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
struct Particle {
    pos: [f32; 2],
    vel: [f32; 2],
}

impl Particle {
    const ATTRS: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![1 => Float32x2, 2 => Float32x2];

    fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Particle>() as u64,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &Self::ATTRS,
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct SimUniform {
    dt: f32,
    time: f32,
    count: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct DrawUniform {
    params: [f32; 4],
}

/// Summary of one telemetry readback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleStats {
    pub sampled: usize,
    pub mean_speed: f32,
    pub max_radius: f32,
    /// Compute pass duration, when timestamps were recorded.
    pub gpu_time_ms: Option<f64>,
}

/// xorshift64*; deterministic for a given seed.
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_f32(&mut self) -> f32 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        let bits = self.0.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 40;
        bits as f32 / (1u64 << 24) as f32
    }

    /// Uniform in `[-1, 1)`.
    fn signed(&mut self) -> f32 {
        self.next_f32() * 2.0 - 1.0
    }
}

fn seed_particles(count: u32, seed: u64) -> Vec<Particle> {
    let mut rng = Rng::new(seed);
    (0..count)
        .map(|_| Particle {
            pos: [rng.signed() * 0.9, rng.signed() * 0.9],
            vel: [rng.signed() * 0.05, rng.signed() * 0.05],
        })
        .collect()
}

/// Decodes a readback: `sampled` particles, optionally followed by a begin/end
/// timestamp pair in ticks of `period_ns`.
fn summarize(bytes: &[u8], sampled: usize, period_ns: Option<f32>) -> ParticleStats {
    let particle_bytes = (sampled * std::mem::size_of::<Particle>()).min(bytes.len());
    // Mapped bytes carry no alignment guarantee.
    let particles: Vec<Particle> = bytes[..particle_bytes]
        .chunks_exact(std::mem::size_of::<Particle>())
        .map(bytemuck::pod_read_unaligned)
        .collect();

    let (mut speed_sum, mut max_radius) = (0.0f32, 0.0f32);
    for p in &particles {
        speed_sum += (p.vel[0] * p.vel[0] + p.vel[1] * p.vel[1]).sqrt();
        max_radius = max_radius.max((p.pos[0] * p.pos[0] + p.pos[1] * p.pos[1]).sqrt());
    }
    let mean_speed = if particles.is_empty() {
        0.0
    } else {
        speed_sum / particles.len() as f32
    };

    let gpu_time_ms = period_ns.and_then(|period| {
        let stamps = bytes.get(particle_bytes..particle_bytes + TIMESTAMP_BYTES as usize)?;
        let begin = u64::from_le_bytes(stamps[..8].try_into().ok()?);
        let end = u64::from_le_bytes(stamps[8..].try_into().ok()?);
        Some(end.saturating_sub(begin) as f64 * period as f64 / 1.0e6)
    });

    ParticleStats {
        sampled: particles.len(),
        mean_speed,
        max_radius,
        gpu_time_ms,
    }
}

struct Timestamps {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    period_ns: f32,
}

async fn build(
    ctx: &Ctx,
    settings: SceneSettings,
    options: &ParticleOptions,
    stack: &mut DisposeStack,
) -> anyhow::Result<()> {
    let mut device_options = settings.device_options();
    device_options.optional_features = vec![wgpu::Features::TIMESTAMP_QUERY];
    let gpu = acquire_gpu(ctx, stack, ID, device_options, SurfaceConfig::default()).await?;
    let device = gpu.device.clone();
    let queue = gpu.queue.clone();

    let timestamps = if gpu.host.borrow().has_feature(wgpu::Features::TIMESTAMP_QUERY) {
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("particles timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count: 2,
        });
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("particles timestamp resolve"),
            size: TIMESTAMP_BYTES,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let rb = resolve.clone();
        stack.defer("timestamp resolve buffer", move || rb.destroy());
        Some(Timestamps {
            query_set,
            resolve,
            period_ns: queue.get_timestamp_period(),
        })
    } else {
        log::info!("{ID}: timestamp queries unavailable; running without GPU timing");
        None
    };

    let count = options.count.max(1);
    let particles = seed_particles(count, options.seed);
    let particle_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("particles"),
        contents: bytemuck::cast_slice(&particles),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_SRC,
    });
    let sim_ubo = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("particles sim ubo"),
        size: std::mem::size_of::<SimUniform>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let draw_ubo = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("particles draw ubo"),
        size: std::mem::size_of::<DrawUniform>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let quad_vbo = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("particles quad vbo"),
        contents: bytemuck::cast_slice(&QUAD_VERTICES),
        usage: wgpu::BufferUsages::VERTEX,
    });
    let quad_ibo = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("particles quad ibo"),
        contents: bytemuck::cast_slice(&QUAD_INDICES),
        usage: wgpu::BufferUsages::INDEX,
    });
    let buffers = [
        particle_buffer.clone(),
        sim_ubo.clone(),
        draw_ubo.clone(),
        quad_vbo.clone(),
        quad_ibo.clone(),
    ];
    stack.defer("particle buffers", move || buffers.iter().for_each(wgpu::Buffer::destroy));

    // Compute pipeline.
    let sim_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("particles sim bgl"),
        entries: &[
            uniform_entry(0, wgpu::ShaderStages::COMPUTE),
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ],
    });
    let sim_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("particles sim bind group"),
        layout: &sim_bgl,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: sim_ubo.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: particle_buffer.as_entire_binding(),
            },
        ],
    });
    let sim_shader = shader_module(&device, "particles sim", include_str!("shaders/particles_sim.wgsl"));
    let sim_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("particles sim layout"),
        bind_group_layouts: &[&sim_bgl],
        immediate_size: 0,
    });
    let sim_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("particles sim pipeline"),
        layout: Some(&sim_layout),
        module: &sim_shader,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    });

    // Render pipeline.
    let draw_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("particles draw bgl"),
        entries: &[uniform_entry(0, wgpu::ShaderStages::VERTEX)],
    });
    let draw_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("particles draw bind group"),
        layout: &draw_bgl,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: draw_ubo.as_entire_binding(),
        }],
    });
    let draw_shader = shader_module(&device, "particles draw", include_str!("shaders/particles_draw.wgsl"));
    let draw_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("particles draw layout"),
        bind_group_layouts: &[&draw_bgl],
        immediate_size: 0,
    });
    let additive = wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    };
    let draw_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("particles draw pipeline"),
        layout: Some(&draw_layout),
        vertex: wgpu::VertexState {
            module: &draw_shader,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[QuadVertex::layout(), Particle::layout()],
        },
        fragment: Some(wgpu::FragmentState {
            module: &draw_shader,
            entry_point: Some("fs_main"),
            compilation_options: Default::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format: gpu.format,
                blend: Some(wgpu::BlendState {
                    color: additive,
                    alpha: additive,
                }),
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    });

    let readback = ReadbackPool::new(gpu.host.borrow().context());
    let pool = readback.clone();
    stack.defer("readback pool", move || pool.dispose());
    // Without the frame loop nothing polls the device; drive the outstanding
    // map to completion so its continuation runs before the pool goes.
    let d = device.clone();
    let pool = readback.clone();
    stack.push("readback drain", move || {
        Box::pin(async move {
            match d.poll(wgpu::PollType::wait_indefinitely()) {
                Ok(_) => pool.settle().await,
                // The pool's dispose aborts whatever is still mapped.
                Err(err) => log::warn!("{ID}: device poll during teardown failed: {err}"),
            }
            Ok(())
        })
    });

    let sample = options.sample_size.min(count) as usize;
    let sample_bytes = (sample * std::mem::size_of::<Particle>()) as u64;
    let readback_size = sample_bytes + if timestamps.is_some() { TIMESTAMP_BYTES } else { 0 };

    let spawner = ctx.spawner.clone();
    let interval = options.readback_interval.max(1);
    let point_size = options.point_size;
    let surface = gpu.surface.clone();
    start_loop(ctx, stack, &gpu, move |time| {
        // Retire finished map callbacks from earlier frames.
        let _ = device.poll(wgpu::PollType::Poll);

        queue.write_buffer(
            &sim_ubo,
            0,
            bytemuck::bytes_of(&SimUniform {
                dt: time.dt,
                time: time.elapsed,
                count,
                _pad: 0,
            }),
        );

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("particles sim"),
        });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("particles sim pass"),
                timestamp_writes: timestamps.as_ref().map(|ts| wgpu::ComputePassTimestampWrites {
                    query_set: &ts.query_set,
                    beginning_of_pass_write_index: Some(0),
                    end_of_pass_write_index: Some(1),
                }),
            });
            cpass.set_pipeline(&sim_pipeline);
            cpass.set_bind_group(0, &sim_bind_group, &[]);
            cpass.dispatch_workgroups(count.div_ceil(WORKGROUP_SIZE), 1, 1);
        }

        let slot = (time.frame_index % interval == 0)
            .then(|| readback.try_begin(readback_size))
            .flatten();
        if let Some(slot) = &slot {
            encoder.copy_buffer_to_buffer(&particle_buffer, 0, slot.buffer(), 0, sample_bytes);
            if let Some(ts) = &timestamps {
                encoder.resolve_query_set(&ts.query_set, 0..2, &ts.resolve, 0);
                encoder.copy_buffer_to_buffer(&ts.resolve, 0, slot.buffer(), sample_bytes, TIMESTAMP_BYTES);
            }
        }
        queue.submit(std::iter::once(encoder.finish()));

        if let Some(slot) = slot {
            let period = timestamps.as_ref().map(|ts| ts.period_ns);
            readback.finish(slot, &spawner, move |bytes| {
                log::debug!("{ID}: {:?}", summarize(bytes, sample, period));
            });
        }

        draw_frame(&surface, &device, &queue, "particles frame", |encoder, frame| {
            let uniform = DrawUniform {
                params: [point_size, aspect(frame), 0.0, 0.0],
            };
            queue.write_buffer(&draw_ubo, 0, bytemuck::bytes_of(&uniform));

            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("particles draw pass"),
                color_attachments: &[Some(clear_attachment(&frame.color_view, wgpu::Color::BLACK))],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            rpass.set_pipeline(&draw_pipeline);
            rpass.set_bind_group(0, &draw_bind_group, &[]);
            rpass.set_vertex_buffer(0, quad_vbo.slice(..));
            rpass.set_vertex_buffer(1, particle_buffer.slice(..));
            rpass.set_index_buffer(quad_ibo.slice(..), wgpu::IndexFormat::Uint16);
            rpass.draw_indexed(0..6, 0, 0..count);
        })
    });

    log::info!("{ID}: mounted with {count} particles");
    Ok(())
}
