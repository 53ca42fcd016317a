//! wgpu compositing backend rendering into an offscreen texture

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;
use wgpu::{Backends, ExperimentalFeatures, Features, Instance, InstanceDescriptor, MemoryHints, Trace};

use super::effects::RenderOptions;
use super::raster::{RasterBuffer, TileTexture};
use super::renderer::{CanvasMesh, CompositeBackend, PlacedTile};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Mesh vertex: canvas position in NDC and resource pixel position
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 2],
    pub resource: [f32; 2],
}

impl MeshVertex {
    const ATTRIBS: [wgpu::VertexAttribute; 2] = wgpu::vertex_attr_array![
        0 => Float32x2,
        1 => Float32x2,
    ];

    pub fn desc() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBS,
        }
    }
}

/// Per tile uniforms, laid out as in `shader/warp.wgsl`
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct TileUniforms {
    tile_rect: [f32; 4],
    background: [f32; 4],
    params: [f32; 4],
    colorize: [f32; 4],
}

impl TileUniforms {
    fn new<D>(placed: &PlacedTile<D>, options: &RenderOptions) -> Self {
        let region = placed.region;
        let rgb = |c: [u8; 3]| [c[0] as f32 / 255.0, c[1] as f32 / 255.0, c[2] as f32 / 255.0];

        let (background, threshold, hardness) = match &options.remove_background {
            Some(remove) => {
                let [r, g, b] = rgb(remove.color);
                ([r, g, b, 1.0], remove.threshold, remove.hardness)
            }
            None => ([0.0; 4], 0.0, 0.0),
        };
        let colorize = match &options.colorize {
            Some(colorize) => {
                let [r, g, b] = rgb(colorize.color);
                [r, g, b, colorize.strength]
            }
            None => [0.0; 4],
        };

        Self {
            tile_rect: [
                region.x as f32,
                region.y as f32,
                region.width as f32,
                region.height as f32,
            ],
            background,
            params: [threshold, hardness, options.opacity, 0.0],
            colorize,
        }
    }
}

struct Target {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

struct MeshBuffers {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
    index_count: u32,
}

/// Offscreen GPU compositor.
///
/// Every tile is drawn as the full map mesh with a fragment stage that
/// discards everything outside the tile, so each pixel is covered once.
pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    target: Option<Target>,
    mesh: Option<MeshBuffers>,
}

impl GpuBackend {
    /// Headless backend on the default adapter.
    pub fn new() -> anyhow::Result<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> anyhow::Result<Self> {
        let instance = Instance::new(&InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Warp Device"),
                required_features: Features::empty(),
                required_limits: if cfg!(target_arch = "wasm32") {
                    wgpu::Limits::downlevel_webgl2_defaults()
                } else {
                    wgpu::Limits::default()
                },
                experimental_features: ExperimentalFeatures::disabled(),
                memory_hints: MemoryHints::Performance,
                trace: Trace::Off,
            })
            .await?;

        Ok(Self::with_device(device, queue))
    }

    /// Backend on an existing device, e.g. one shared with a window surface.
    pub fn with_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Warp Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shader/warp.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Warp Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Warp Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Warp Render Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[MeshVertex::desc()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        // nearest sampling, same as the software backend
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Warp Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            target: None,
            mesh: None,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    fn target(&self) -> anyhow::Result<&Target> {
        self.target
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("begin_frame was not called"))
    }

    fn tile_bind_group<D: TileTexture>(
        &self,
        placed: &PlacedTile<D>,
        options: &RenderOptions,
    ) -> wgpu::BindGroup {
        let (width, height) = placed.data.dimensions();
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Warp Tile Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            placed.data.rgba(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            size,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let uniforms = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Warp Tile Uniforms"),
            contents: bytemuck::bytes_of(&TileUniforms::new(placed, options)),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Warp Tile Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        })
    }
}

impl CompositeBackend for GpuBackend {
    fn begin_frame(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Warp Frame"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Warp Clear Encoder"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Warp Clear Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));

        self.target = Some(Target {
            texture,
            view,
            width,
            height,
        });
        self.mesh = None;
        Ok(())
    }

    fn upload_mesh(&mut self, mesh: &CanvasMesh) -> anyhow::Result<()> {
        let target = self.target()?;
        let (width, height) = (target.width as f64, target.height as f64);

        let vertices: Vec<MeshVertex> = mesh
            .canvas_points
            .iter()
            .zip(&mesh.resource_points)
            .map(|(canvas, resource)| MeshVertex {
                position: [
                    (canvas.x / width * 2.0 - 1.0) as f32,
                    (1.0 - canvas.y / height * 2.0) as f32,
                ],
                resource: [resource.x as f32, resource.y as f32],
            })
            .collect();
        let indices: Vec<u32> = mesh.triangles.iter().flatten().copied().collect();
        if vertices.is_empty() || indices.is_empty() {
            self.mesh = None;
            return Ok(());
        }

        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Warp Vertex Buffer"),
            contents: bytemuck::cast_slice(&vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Warp Index Buffer"),
            contents: bytemuck::cast_slice(&indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        self.mesh = Some(MeshBuffers {
            vertices: vertex_buffer,
            indices: index_buffer,
            index_count: indices.len() as u32,
        });
        Ok(())
    }

    fn draw_triangles<D: TileTexture>(
        &mut self,
        tiles: &[PlacedTile<D>],
        options: &RenderOptions,
    ) -> anyhow::Result<()> {
        let target = self.target()?;
        let Some(mesh) = &self.mesh else {
            return Ok(());
        };
        let bind_groups: Vec<wgpu::BindGroup> = tiles
            .iter()
            .filter(|placed| placed.data.dimensions().0 > 0 && placed.data.dimensions().1 > 0)
            .map(|placed| self.tile_bind_group(placed, options))
            .collect();

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Warp Draw Encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Warp Draw Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_vertex_buffer(0, mesh.vertices.slice(..));
            pass.set_index_buffer(mesh.indices.slice(..), wgpu::IndexFormat::Uint32);
            for bind_group in &bind_groups {
                pass.set_bind_group(0, bind_group, &[]);
                pass.draw_indexed(0..mesh.index_count, 0, 0..1);
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn readback(&mut self) -> anyhow::Result<RasterBuffer> {
        let target = self.target()?;
        let (width, height) = (target.width, target.height);
        let unpadded = 4 * width;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Warp Readback Buffer"),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Warp Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let mapped = loop {
            self.device.poll(wgpu::PollType::Poll)?;
            match rx.try_recv() {
                Ok(result) => break result,
                Err(std::sync::mpsc::TryRecvError::Empty) => std::thread::yield_now(),
                Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                    anyhow::bail!("readback buffer mapping was dropped")
                }
            }
        };
        mapped?;

        let mut frame = RasterBuffer::new(width, height);
        {
            let data = slice.get_mapped_range();
            for y in 0..height {
                let row = &data[(y * padded) as usize..(y * padded + unpadded) as usize];
                for x in 0..width {
                    let px = &row[(x * 4) as usize..(x * 4 + 4) as usize];
                    frame.pixel_mut(x, y).copy_from_slice(&unpremultiply([px[0], px[1], px[2], px[3]]));
                }
            }
        }
        buffer.unmap();
        Ok(frame)
    }
}

fn unpremultiply(px: [u8; 4]) -> [u8; 4] {
    let a = px[3];
    if a == 0 {
        return [0, 0, 0, 0];
    }
    let scale = |c: u8| ((c as u32 * 255 + a as u32 / 2) / a as u32).min(255) as u8;
    [scale(px[0]), scale(px[1]), scale(px[2]), a]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use crate::map::image_info::{Region, TileZoomLevel};
    use crate::map::tile::Tile;
    use std::sync::Arc;

    #[test]
    fn test_unpremultiply() {
        assert_eq!(unpremultiply([0, 0, 0, 0]), [0, 0, 0, 0]);
        assert_eq!(unpremultiply([64, 0, 128, 128]), [128, 0, 255, 128]);
        assert_eq!(unpremultiply([255, 255, 255, 255]), [255, 255, 255, 255]);
    }

    #[test]
    fn test_draws_tile_when_adapter_available() {
        let Ok(mut backend) = GpuBackend::new() else {
            return; // no adapter on this machine
        };
        let square = vec![
            Point::new(0.0, 0.0),
            Point::new(8.0, 0.0),
            Point::new(8.0, 8.0),
            Point::new(0.0, 8.0),
        ];
        let level = TileZoomLevel::new(8, 8, 8, 8, 1);
        let placed = PlacedTile {
            tile: Tile::new(level, 0, 0),
            region: Region { x: 0, y: 0, width: 8, height: 8 },
            data: Arc::new(RasterBuffer::filled(8, 8, [0, 255, 0, 255])),
        };

        backend.begin_frame(8, 8).unwrap();
        backend
            .upload_mesh(&CanvasMesh {
                canvas_points: square.clone(),
                resource_points: square,
                triangles: vec![[0, 1, 2], [0, 2, 3]],
            })
            .unwrap();
        backend.draw_triangles(&[placed], &RenderOptions::default()).unwrap();
        let frame = backend.readback().unwrap();
        assert_eq!(frame.pixel(4, 4), [0, 255, 0, 255]);
    }
}
