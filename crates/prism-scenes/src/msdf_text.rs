//! Distance-field text.
//!
//! Glyphs are rasterized once with fontdue, converted to signed distance
//! fields and packed into a single-channel atlas. The fragment shader
//! thresholds the interpolated distance, so the text stays crisp while the
//! scene scales it up and down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Context;
use bytemuck::{Pod, Zeroable};
use fontdue::layout::{CoordinateSystem, GlyphRasterConfig, Layout, LayoutSettings, TextStyle};
use futures::future::LocalBoxFuture;
use prism_engine::device::{SurfaceConfig, TrackedResource, WgpuBackend};
use prism_engine::scene::{Cleanup, DisposeStack, MountContext, Scene};
use wgpu::util::DeviceExt;

use crate::common::{
    acquire_gpu, clear_attachment, draw_frame, shader_module, start_loop, uniform_entry, Ctx,
    QuadVertex, SceneSettings, QUAD_INDICES, QUAD_VERTICES,
};

pub const ID: &str = "msdf-text";

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/noto/NotoSans-Regular.ttf",
    "/usr/share/fonts/truetype/noto/NotoSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

#[derive(Debug, Clone)]
pub struct TextOptions {
    pub text: String,
    /// Explicit font file; system fonts are searched when unset.
    pub font_path: Option<PathBuf>,
    /// Pixel size glyphs are rasterized at before distance conversion.
    pub raster_px: f32,
    /// Distance range, in atlas pixels, encoded around each glyph edge.
    pub spread: u32,
    pub atlas_size: u32,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            text: "prism\nsigned distance text".to_string(),
            font_path: None,
            raster_px: 48.0,
            spread: 6,
            atlas_size: 512,
        }
    }
}

pub struct MsdfTextScene {
    pub settings: SceneSettings,
    pub options: TextOptions,
}

impl Scene<WgpuBackend> for MsdfTextScene {
    fn id(&self) -> &str {
        ID
    }

    fn title(&self) -> &str {
        "Distance-field text"
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

/// Loads `explicit`, or the first readable font among the usual system paths.
fn load_font(explicit: Option<&Path>, raster_px: f32) -> anyhow::Result<fontdue::Font> {
    let (path, bytes) = match explicit {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("cannot read font {}", path.display()))?;
            (path.to_path_buf(), bytes)
        }
        None => FONT_CANDIDATES
            .iter()
            .find_map(|p| std::fs::read(p).ok().map(|bytes| (PathBuf::from(p), bytes)))
            .context("no system font found; set a font path")?,
    };

    let settings = fontdue::FontSettings {
        scale: raster_px,
        ..fontdue::FontSettings::default()
    };
    let font = fontdue::Font::from_bytes(bytes, settings)
        .map_err(|e| anyhow::anyhow!("invalid font {}: {e}", path.display()))?;
    log::debug!("{ID}: using font {}", path.display());
    Ok(font)
}

/// Converts an 8-bit coverage bitmap into a signed distance field padded by
/// `spread` on every side.
///
/// 0.5 (128) marks the glyph edge; values rise inside and fall outside,
/// saturating `spread` pixels away from it.
fn signed_distance_field(coverage: &[u8], width: usize, height: usize, spread: usize) -> (Vec<u8>, usize, usize) {
    let (pw, ph) = (width + 2 * spread, height + 2 * spread);
    let inside = |x: isize, y: isize| -> bool {
        if x < 0 || y < 0 || x as usize >= width || y as usize >= height {
            return false;
        }
        coverage[y as usize * width + x as usize] >= 128
    };

    let reach = spread as isize;
    let mut field = Vec::with_capacity(pw * ph);
    for py in 0..ph {
        for px in 0..pw {
            let (sx, sy) = (px as isize - reach, py as isize - reach);
            let here = inside(sx, sy);

            let mut best = (spread * spread) as isize;
            for dy in -reach..=reach {
                for dx in -reach..=reach {
                    let d2 = dx * dx + dy * dy;
                    if d2 < best && inside(sx + dx, sy + dy) != here {
                        best = d2;
                    }
                }
            }

            let distance = (best as f32).sqrt().min(spread as f32);
            let signed = if here { distance } else { -distance };
            let value = 0.5 + signed / (2.0 * spread.max(1) as f32);
            field.push((value.clamp(0.0, 1.0) * 255.0).round() as u8);
        }
    }
    (field, pw, ph)
}

/// Region of the atlas, in texels.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct AtlasRect {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
}

const GLYPH_PADDING: u32 = 1;

/// Shelf packer over a square single-channel atlas.
struct AtlasBuilder {
    size: u32,
    cursor_x: u32,
    cursor_y: u32,
    row_height: u32,
    pixels: Vec<u8>,
}

impl AtlasBuilder {
    fn new(size: u32) -> Self {
        Self {
            size,
            cursor_x: GLYPH_PADDING,
            cursor_y: GLYPH_PADDING,
            row_height: 0,
            pixels: vec![0; (size * size) as usize],
        }
    }

    /// Copies a `w` x `h` bitmap into the next free spot, or returns `None`
    /// when the atlas is full.
    fn place(&mut self, bitmap: &[u8], w: u32, h: u32) -> Option<AtlasRect> {
        if self.cursor_x + w + GLYPH_PADDING > self.size {
            self.cursor_y += self.row_height + GLYPH_PADDING;
            self.cursor_x = GLYPH_PADDING;
            self.row_height = 0;
        }
        if self.cursor_x + w + GLYPH_PADDING > self.size || self.cursor_y + h + GLYPH_PADDING > self.size {
            return None;
        }

        let rect = AtlasRect {
            x: self.cursor_x,
            y: self.cursor_y,
            w,
            h,
        };
        for row in 0..h {
            let src = (row * w) as usize;
            let dst = ((rect.y + row) * self.size + rect.x) as usize;
            self.pixels[dst..dst + w as usize].copy_from_slice(&bitmap[src..src + w as usize]);
        }
        self.cursor_x += w + GLYPH_PADDING;
        self.row_height = self.row_height.max(h);
        Some(rect)
    }

    fn uv(&self, rect: AtlasRect) -> ([f32; 2], [f32; 2]) {
        let s = self.size as f32;
        (
            [rect.x as f32 / s, rect.y as f32 / s],
            [(rect.x + rect.w) as f32 / s, (rect.y + rect.h) as f32 / s],
        )
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct GlyphInstance {
    dst_min: [f32; 2],
    dst_max: [f32; 2],
    uv_min: [f32; 2],
    uv_max: [f32; 2],
    color: [f32; 4],
}

impl GlyphInstance {
    const ATTRS: [wgpu::VertexAttribute; 5] = wgpu::vertex_attr_array![
        1 => Float32x2,
        2 => Float32x2,
        3 => Float32x2,
        4 => Float32x2,
        5 => Float32x4,
    ];

    fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<GlyphInstance>() as u64,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &Self::ATTRS,
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct TextUniform {
    view: [f32; 4],
    params: [f32; 4],
}

/// Laid-out text: glyph quads in layout pixels plus their bounding box.
struct TextMesh {
    instances: Vec<GlyphInstance>,
    min: [f32; 2],
    max: [f32; 2],
    atlas: AtlasBuilder,
}

fn build_text_mesh(font: &fontdue::Font, options: &TextOptions) -> TextMesh {
    let spread = options.spread as usize;
    let mut atlas = AtlasBuilder::new(options.atlas_size);
    let mut placed: HashMap<GlyphRasterConfig, Option<([f32; 2], [f32; 2])>> = HashMap::new();

    let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
    layout.reset(&LayoutSettings::default());
    layout.append(&[font], &TextStyle::new(&options.text, options.raster_px, 0));

    let mut instances = Vec::new();
    let (mut min, mut max) = ([f32::MAX; 2], [f32::MIN; 2]);
    for glyph in layout.glyphs() {
        if !glyph.char_data.rasterize() || glyph.width == 0 || glyph.height == 0 {
            continue;
        }
        let uv = *placed.entry(glyph.key).or_insert_with(|| {
            let (metrics, coverage) = font.rasterize_config(glyph.key);
            let (field, w, h) = signed_distance_field(&coverage, metrics.width, metrics.height, spread);
            let rect = atlas.place(&field, w as u32, h as u32);
            if rect.is_none() {
                log::warn!("{ID}: atlas full, dropping glyph {:?}", glyph.parent);
            }
            rect.map(|r| atlas.uv(r))
        });
        let Some((uv_min, uv_max)) = uv else { continue };

        let pad = options.spread as f32;
        let dst_min = [glyph.x - pad, glyph.y - pad];
        let dst_max = [glyph.x + glyph.width as f32 + pad, glyph.y + glyph.height as f32 + pad];
        for axis in 0..2 {
            min[axis] = min[axis].min(dst_min[axis]);
            max[axis] = max[axis].max(dst_max[axis]);
        }
        instances.push(GlyphInstance {
            dst_min,
            dst_max,
            uv_min,
            uv_max,
            color: [0.92, 0.94, 1.0, 1.0],
        });
    }

    TextMesh {
        instances,
        min,
        max,
        atlas,
    }
}

async fn build(
    ctx: &Ctx,
    settings: SceneSettings,
    options: &TextOptions,
    stack: &mut DisposeStack,
) -> anyhow::Result<()> {
    // Font problems fail the mount before any GPU work.
    let font = load_font(options.font_path.as_deref(), options.raster_px)?;
    let mesh = build_text_mesh(&font, options);
    anyhow::ensure!(!mesh.instances.is_empty(), "text `{}` has no visible glyphs", options.text);

    let gpu = acquire_gpu(ctx, stack, ID, settings.device_options(), SurfaceConfig::default()).await?;
    let device = gpu.device.clone();
    let queue = gpu.queue.clone();
    let mut registry = gpu.host.borrow().create_resource_registry();

    let size = mesh.atlas.size;
    let extent = wgpu::Extent3d {
        width: size,
        height: size,
        depth_or_array_layers: 1,
    };
    let atlas = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("sdf atlas"),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::R8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let a = atlas.clone();
    registry.add(TrackedResource::new("sdf atlas", Rc::new(atlas.clone())).on_dispose(move || {
        a.destroy();
        Ok(())
    }));
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &atlas,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &mesh.atlas.pixels,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(size),
            rows_per_image: Some(size),
        },
        extent,
    );

    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("sdf sampler"),
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::MipmapFilterMode::Nearest,
        ..Default::default()
    });

    let quad_vbo = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("text quad vbo"),
        contents: bytemuck::cast_slice(&QUAD_VERTICES),
        usage: wgpu::BufferUsages::VERTEX,
    });
    let quad_ibo = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("text quad ibo"),
        contents: bytemuck::cast_slice(&QUAD_INDICES),
        usage: wgpu::BufferUsages::INDEX,
    });
    let instance_vbo = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("text glyph instances"),
        contents: bytemuck::cast_slice(&mesh.instances),
        usage: wgpu::BufferUsages::VERTEX,
    });
    let text_ubo = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("text ubo"),
        size: std::mem::size_of::<TextUniform>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    for (id, buffer) in [
        ("text quad vbo", &quad_vbo),
        ("text quad ibo", &quad_ibo),
        ("text glyph instances", &instance_vbo),
        ("text ubo", &text_ubo),
    ] {
        let b = buffer.clone();
        registry.add(TrackedResource::new(id, Rc::new(buffer.clone())).on_dispose(move || {
            b.destroy();
            Ok(())
        }));
    }
    stack.push("resource registry", move || {
        Box::pin(async move { registry.dispose_all().await.map_err(anyhow::Error::from) })
    });

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("text bgl"),
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
    let atlas_view = atlas.create_view(&wgpu::TextureViewDescriptor::default());
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("text bind group"),
        layout: &bind_group_layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: text_ubo.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(&atlas_view),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::Sampler(&sampler),
            },
        ],
    });

    let shader = shader_module(&device, "text shader", include_str!("shaders/msdf_text.wgsl"));
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("text pipeline layout"),
        bind_group_layouts: &[&bind_group_layout],
        immediate_size: 0,
    });
    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("text pipeline"),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[QuadVertex::layout(), GlyphInstance::layout()],
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
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    });

    let glyph_count = mesh.instances.len() as u32;
    let center = [
        (mesh.min[0] + mesh.max[0]) * 0.5,
        (mesh.min[1] + mesh.max[1]) * 0.5,
    ];
    let text_width = (mesh.max[0] - mesh.min[0]).max(1.0);
    let surface = gpu.surface.clone();
    start_loop(ctx, stack, &gpu, move |time| {
        draw_frame(&surface, &device, &queue, "text frame", |encoder, frame| {
            let (w, h) = (frame.size.width as f32, frame.size.height as f32);
            // Fit to most of the width, then breathe to show off the edges.
            let fit = w * 0.8 / text_width;
            let scale = fit * (1.0 + 0.35 * (time.elapsed * 0.9).sin());
            let uniform = TextUniform {
                view: [w, h, center[0], center[1]],
                params: [scale, 0.0, 0.0, 0.0],
            };
            queue.write_buffer(&text_ubo, 0, bytemuck::bytes_of(&uniform));

            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("text pass"),
                color_attachments: &[Some(clear_attachment(
                    &frame.color_view,
                    wgpu::Color {
                        r: 0.08,
                        g: 0.05,
                        b: 0.12,
                        a: 1.0,
                    },
                ))],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            rpass.set_pipeline(&pipeline);
            rpass.set_bind_group(0, &bind_group, &[]);
            rpass.set_vertex_buffer(0, quad_vbo.slice(..));
            rpass.set_vertex_buffer(1, instance_vbo.slice(..));
            rpass.set_index_buffer(quad_ibo.slice(..), wgpu::IndexFormat::Uint16);
            rpass.draw_indexed(0..6, 0, 0..glyph_count);
        })
    });

    log::info!("{ID}: mounted with {glyph_count} glyphs");
    Ok(())
}
