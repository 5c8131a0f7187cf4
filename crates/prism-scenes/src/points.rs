//! Instanced point cloud: a Fibonacci sphere of round billboards that pauses
//! while the window is hidden.

use std::cell::Cell;
use std::rc::Rc;

use bytemuck::{Pod, Zeroable};
use futures::future::LocalBoxFuture;
use glam::{Mat4, Vec3};
use prism_engine::device::{SurfaceConfig, WgpuBackend};
use prism_engine::scene::{Cleanup, DisposeStack, EventKind, MountContext, Scene, WindowSignal};
use wgpu::util::DeviceExt;

use crate::common::{
    acquire_gpu, aspect, clear_attachment, depth_attachment, depth_state, draw_frame,
    shader_module, start_loop, uniform_entry, Ctx, QuadVertex, SceneSettings, DEPTH_FORMAT,
    QUAD_INDICES, QUAD_VERTICES,
};

pub const ID: &str = "points";

#[derive(Debug, Clone)]
pub struct PointsOptions {
    pub count: u32,
    /// Billboard half-size in clip units.
    pub point_size: f32,
    pub spin_speed: f32,
}

impl Default for PointsOptions {
    fn default() -> Self {
        Self {
            count: 20_000,
            point_size: 0.006,
            spin_speed: 0.25,
        }
    }
}

pub struct PointsScene {
    pub settings: SceneSettings,
    pub options: PointsOptions,
}

impl Scene<WgpuBackend> for PointsScene {
    fn id(&self) -> &str {
        ID
    }

    fn title(&self) -> &str {
        "Point cloud"
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
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct PointInstance {
    center: [f32; 3],
    color: [f32; 3],
}

impl PointInstance {
    const ATTRS: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![1 => Float32x3, 2 => Float32x3];

    fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<PointInstance>() as u64,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &Self::ATTRS,
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct ViewUniform {
    view_proj: [[f32; 4]; 4],
    params: [f32; 4],
}

/// `count` points spread evenly over the unit sphere, colored by position.
fn fibonacci_sphere(count: u32) -> Vec<PointInstance> {
    let golden = std::f32::consts::PI * (3.0 - 5f32.sqrt());
    let n = count.max(1) as f32;
    (0..count)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f32 + 0.5) / n;
            let radius = (1.0 - y * y).max(0.0).sqrt();
            let theta = golden * i as f32;
            let center = Vec3::new(theta.cos() * radius, y, theta.sin() * radius);
            let color = center * 0.5 + Vec3::splat(0.5);
            PointInstance {
                center: center.to_array(),
                color: color.to_array(),
            }
        })
        .collect()
}

/// Instance data for the vertex buffer. An empty cloud still gets one zeroed
/// slot so the buffer bound at slot 1 is never zero-sized.
fn instance_data(points: &[PointInstance]) -> Vec<PointInstance> {
    if points.is_empty() {
        vec![PointInstance::zeroed()]
    } else {
        points.to_vec()
    }
}

async fn build(
    ctx: &Ctx,
    settings: SceneSettings,
    options: &PointsOptions,
    stack: &mut DisposeStack,
) -> anyhow::Result<()> {
    let gpu = acquire_gpu(
        ctx,
        stack,
        ID,
        settings.device_options(),
        SurfaceConfig::default().with_depth(DEPTH_FORMAT),
    )
    .await?;
    let device = gpu.device.clone();
    let queue = gpu.queue.clone();

    let instances = fibonacci_sphere(options.count);
    let quad_vbo = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("points quad vbo"),
        contents: bytemuck::cast_slice(&QUAD_VERTICES),
        usage: wgpu::BufferUsages::VERTEX,
    });
    let quad_ibo = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("points quad ibo"),
        contents: bytemuck::cast_slice(&QUAD_INDICES),
        usage: wgpu::BufferUsages::INDEX,
    });
    let instance_vbo = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("points instances"),
        contents: bytemuck::cast_slice(&instance_data(&instances)),
        usage: wgpu::BufferUsages::VERTEX,
    });
    let view_ubo = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("points view ubo"),
        size: std::mem::size_of::<ViewUniform>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let buffers = [
        quad_vbo.clone(),
        quad_ibo.clone(),
        instance_vbo.clone(),
        view_ubo.clone(),
    ];
    stack.defer("point buffers", move || buffers.iter().for_each(wgpu::Buffer::destroy));

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("points bgl"),
        entries: &[uniform_entry(0, wgpu::ShaderStages::VERTEX)],
    });
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("points bind group"),
        layout: &bind_group_layout,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: view_ubo.as_entire_binding(),
        }],
    });

    let shader = shader_module(&device, "points shader", include_str!("shaders/points.wgsl"));
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("points pipeline layout"),
        bind_group_layouts: &[&bind_group_layout],
        immediate_size: 0,
    });
    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("points pipeline"),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[QuadVertex::layout(), PointInstance::layout()],
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            compilation_options: Default::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format: gpu.format,
                blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: Some(depth_state()),
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    });

    // Rotation only advances while visible.
    let visible = Rc::new(Cell::new(true));
    let v = visible.clone();
    let listener = ctx.listeners.add_listener(EventKind::Visibility, move |signal| {
        if let WindowSignal::VisibilityChanged { visible } = signal {
            v.set(*visible);
        }
    });
    let listeners = ctx.listeners.clone();
    stack.defer("visibility listener", move || {
        listeners.remove_listener(listener);
    });

    let count = instances.len() as u32;
    let point_size = options.point_size;
    let spin_speed = options.spin_speed;
    let mut angle = 0.0f32;
    let surface = gpu.surface.clone();
    start_loop(ctx, stack, &gpu, move |time| {
        if visible.get() {
            angle += time.dt * spin_speed;
        }
        draw_frame(&surface, &device, &queue, "points frame", |encoder, frame| {
            let view = Mat4::look_at_rh(Vec3::new(0.0, 0.8, 3.0), Vec3::ZERO, Vec3::Y);
            let proj = Mat4::perspective_rh(45f32.to_radians(), aspect(frame), 0.1, 100.0);
            let uniform = ViewUniform {
                view_proj: (proj * view * Mat4::from_rotation_y(angle)).to_cols_array_2d(),
                params: [point_size, time.elapsed, 0.0, 0.0],
            };
            queue.write_buffer(&view_ubo, 0, bytemuck::bytes_of(&uniform));

            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("points pass"),
                color_attachments: &[Some(clear_attachment(&frame.color_view, wgpu::Color::BLACK))],
                depth_stencil_attachment: frame.depth_view.as_ref().map(depth_attachment),
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            rpass.set_pipeline(&pipeline);
            rpass.set_bind_group(0, &bind_group, &[]);
            rpass.set_vertex_buffer(0, quad_vbo.slice(..));
            rpass.set_vertex_buffer(1, instance_vbo.slice(..));
            rpass.set_index_buffer(quad_ibo.slice(..), wgpu::IndexFormat::Uint16);
            rpass.draw_indexed(0..6, 0, 0..count);
        })
    });

    log::info!("{ID}: mounted with {count} points");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_lie_on_the_unit_sphere() {
        let points = fibonacci_sphere(500);
        assert_eq!(points.len(), 500);
        for p in &points {
            let len = Vec3::from(p.center).length();
            assert!((len - 1.0).abs() < 1e-4, "radius {len}");
            assert!(p.color.iter().all(|c| (0.0..=1.0).contains(c)));
        }
    }

    #[test]
    fn points_cover_both_hemispheres_evenly() {
        let points = fibonacci_sphere(1000);
        let north = points.iter().filter(|p| p.center[1] > 0.0).count();
        assert_eq!(north, 500);
    }

    #[test]
    fn zero_points_is_empty() {
        assert!(fibonacci_sphere(0).is_empty());
    }

    #[test]
    fn empty_cloud_still_fills_the_instance_buffer() {
        let data = instance_data(&fibonacci_sphere(0));
        assert_eq!(data.len(), 1);
        assert!(!bytemuck::cast_slice::<_, u8>(&data).is_empty());
        assert_eq!(instance_data(&fibonacci_sphere(3)).len(), 3);
    }
}
