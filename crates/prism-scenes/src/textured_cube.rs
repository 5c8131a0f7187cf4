//! Spinning cube sampled from a procedural checker texture, depth tested.

use std::rc::Rc;

use bytemuck::{Pod, Zeroable};
use futures::future::LocalBoxFuture;
use glam::{Mat4, Vec3};
use prism_engine::device::{SurfaceConfig, TrackedResource, WgpuBackend};
use prism_engine::scene::{Cleanup, DisposeStack, MountContext, Scene};
use wgpu::util::DeviceExt;

use crate::common::{
    acquire_gpu, aspect, clear_attachment, depth_attachment, depth_state, draw_frame, shader_module,
    start_loop, uniform_entry, Ctx, SceneSettings, DEPTH_FORMAT,
};

pub const ID: &str = "textured-cube";

#[derive(Debug, Clone)]
pub struct CubeOptions {
    /// Radians per second around the vertical axis.
    pub spin_speed: f32,
    pub texture_size: u32,
    /// Checker cells per texture edge.
    pub checker_cells: u32,
}

impl Default for CubeOptions {
    fn default() -> Self {
        Self {
            spin_speed: 0.8,
            texture_size: 256,
            checker_cells: 8,
        }
    }
}

pub struct TexturedCubeScene {
    pub settings: SceneSettings,
    pub options: CubeOptions,
}

impl Scene<WgpuBackend> for TexturedCubeScene {
    fn id(&self) -> &str {
        ID
    }

    fn title(&self) -> &str {
        "Textured cube"
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
struct CubeVertex {
    position: [f32; 3],
    normal: [f32; 3],
    uv: [f32; 2],
}

impl CubeVertex {
    const ATTRS: [wgpu::VertexAttribute; 3] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3, 2 => Float32x2];

    fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<CubeVertex>() as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRS,
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct CameraUniform {
    mvp: [[f32; 4]; 4],
    model: [[f32; 4]; 4],
}

/// (normal, u axis, v axis) per face. `u x v == normal`, so counter-clockwise
/// corners face outward.
const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
    ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
    ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
    ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
    ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
    ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
];

/// Unit cube with per-face normals and uvs: 24 vertices, 36 indices.
fn cube_mesh() -> (Vec<CubeVertex>, Vec<u16>) {
    const CORNERS: [(f32, f32, [f32; 2]); 4] = [
        (-1.0, -1.0, [0.0, 1.0]),
        (1.0, -1.0, [1.0, 1.0]),
        (1.0, 1.0, [1.0, 0.0]),
        (-1.0, 1.0, [0.0, 0.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in FACES {
        let (n, u, v) = (Vec3::from(normal), Vec3::from(u), Vec3::from(v));
        let base = vertices.len() as u16;
        for (su, sv, uv) in CORNERS {
            let position = (n + u * su + v * sv) * 0.5;
            vertices.push(CubeVertex {
                position: position.to_array(),
                normal,
                uv,
            });
        }
        indices.extend([0, 1, 2, 0, 2, 3].map(|i| base + i));
    }
    (vertices, indices)
}

/// RGBA8 checkerboard, `size` x `size` texels.
fn checker_texels(size: u32, cells: u32) -> Vec<u8> {
    let cell = (size / cells.max(1)).max(1);
    let mut texels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / cell) + (y / cell)) % 2 == 0;
            let rgba = if light {
                [235, 225, 205, 255]
            } else {
                [52, 92, 140, 255]
            };
            texels.extend_from_slice(&rgba);
        }
    }
    texels
}

fn camera(elapsed: f32, spin_speed: f32, aspect: f32) -> CameraUniform {
    let model = Mat4::from_rotation_y(elapsed * spin_speed) * Mat4::from_rotation_x(0.45);
    let view = Mat4::look_at_rh(Vec3::new(0.0, 0.6, 2.6), Vec3::ZERO, Vec3::Y);
    let proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 100.0);
    CameraUniform {
        mvp: (proj * view * model).to_cols_array_2d(),
        model: model.to_cols_array_2d(),
    }
}

async fn build(
    ctx: &Ctx,
    settings: SceneSettings,
    options: &CubeOptions,
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

    let mut registry = gpu.host.borrow().create_resource_registry();

    let size = options.texture_size.max(1);
    let extent = wgpu::Extent3d {
        width: size,
        height: size,
        depth_or_array_layers: 1,
    };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("cube checker"),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8UnormSrgb,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let t = texture.clone();
    registry.add(
        TrackedResource::new("checker texture", Rc::new(texture.clone())).on_dispose(move || {
            t.destroy();
            Ok(())
        }),
    );
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &checker_texels(size, options.checker_cells),
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(4 * size),
            rows_per_image: Some(size),
        },
        extent,
    );

    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("cube sampler"),
        address_mode_u: wgpu::AddressMode::Repeat,
        address_mode_v: wgpu::AddressMode::Repeat,
        mag_filter: wgpu::FilterMode::Nearest,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::MipmapFilterMode::Nearest,
        ..Default::default()
    });
    registry.add(TrackedResource::new("checker sampler", Rc::new(sampler.clone())));

    let (vertices, indices) = cube_mesh();
    let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("cube vertices"),
        contents: bytemuck::cast_slice(&vertices),
        usage: wgpu::BufferUsages::VERTEX,
    });
    let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("cube indices"),
        contents: bytemuck::cast_slice(&indices),
        usage: wgpu::BufferUsages::INDEX,
    });
    let camera_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("cube camera"),
        size: std::mem::size_of::<CameraUniform>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    for (id, buffer) in [
        ("cube vertices", &vertex_buffer),
        ("cube indices", &index_buffer),
        ("cube camera", &camera_buffer),
    ] {
        let b = buffer.clone();
        registry.add(TrackedResource::new(id, Rc::new(buffer.clone())).on_dispose(move || {
            b.destroy();
            Ok(())
        }));
    }

    log::debug!("{ID}: {} tracked resources", registry.len());
    stack.push("resource registry", move || {
        Box::pin(async move { registry.dispose_all().await.map_err(anyhow::Error::from) })
    });

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("cube bgl"),
        entries: &[
            uniform_entry(0, wgpu::ShaderStages::VERTEX),
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    });
    let texture_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("cube bind group"),
        layout: &bind_group_layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: camera_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(&texture_view),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::Sampler(&sampler),
            },
        ],
    });

    let shader = shader_module(&device, "cube shader", include_str!("shaders/textured_cube.wgsl"));
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("cube pipeline layout"),
        bind_group_layouts: &[&bind_group_layout],
        immediate_size: 0,
    });
    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("cube pipeline"),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[CubeVertex::layout()],
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            compilation_options: Default::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format: gpu.format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: Some(wgpu::Face::Back),
            ..Default::default()
        },
        depth_stencil: Some(depth_state()),
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    });

    let index_count = indices.len() as u32;
    let spin_speed = options.spin_speed;
    let surface = gpu.surface.clone();
    start_loop(ctx, stack, &gpu, move |time| {
        draw_frame(&surface, &device, &queue, "cube frame", |encoder, frame| {
            let uniform = camera(time.elapsed, spin_speed, aspect(frame));
            queue.write_buffer(&camera_buffer, 0, bytemuck::bytes_of(&uniform));

            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("cube pass"),
                color_attachments: &[Some(clear_attachment(
                    &frame.color_view,
                    wgpu::Color {
                        r: 0.05,
                        g: 0.06,
                        b: 0.08,
                        a: 1.0,
                    },
                ))],
                depth_stencil_attachment: frame.depth_view.as_ref().map(depth_attachment),
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            rpass.set_pipeline(&pipeline);
            rpass.set_bind_group(0, &bind_group, &[]);
            rpass.set_vertex_buffer(0, vertex_buffer.slice(..));
            rpass.set_index_buffer(index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            rpass.draw_indexed(0..index_count, 0, 0..1);
        })
    });

    log::info!("{ID}: mounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_triangle_faces_outward() {
        let (vertices, indices) = cube_mesh();
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);

        for tri in indices.chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(vertices[i as usize].position));
            let face_normal = (b - a).cross(c - a);
            let n = Vec3::from(vertices[tri[0] as usize].normal);
            assert!(face_normal.dot(n) > 0.0, "inward triangle {tri:?}");
            // Centroid lies on the face, half a unit out along its normal.
            let centroid = (a + b + c) / 3.0;
            assert!((centroid.dot(n) - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn checker_alternates_per_cell() {
        let texels = checker_texels(16, 4);
        assert_eq!(texels.len(), 16 * 16 * 4);

        let texel = |x: usize, y: usize| &texels[(y * 16 + x) * 4..(y * 16 + x) * 4 + 4];
        assert_eq!(texel(0, 0), texel(3, 3));
        assert_ne!(texel(0, 0), texel(4, 0));
        assert_eq!(texel(0, 0), texel(4, 4));
    }

    #[test]
    fn camera_keeps_the_cube_in_front() {
        let uniform = camera(0.0, 1.0, 16.0 / 9.0);
        let mvp = Mat4::from_cols_array_2d(&uniform.mvp);
        let clip = mvp * glam::Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc_z = clip.z / clip.w;
        assert!(clip.w > 0.0);
        assert!((0.0..1.0).contains(&ndc_z));
    }
}
