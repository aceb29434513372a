//! GPU compositor: copies the framebuffer into a texture and draws it
//! letterboxed into the host-supplied surface.
//!
//! Runs on its own thread at its own cadence, woken by the dirty signal. The
//! framebuffer snapshot happens under a short lock and the dirty flag is
//! cleared before any GPU work, so protocol-thread writes landing during a
//! draw are never lost. If presentation fails (surface torn down
//! concurrently) the thread exits its loop without touching the graphics
//! context again; it can be restarted later without rebuilding the display
//! instance.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use wgpu::util::DeviceExt;

use crate::display::Shared;

/// How long one dirty wait lasts before re-checking the run flag.
const WAKE_INTERVAL: Duration = Duration::from_millis(100);
/// Idle sleep while dirty but no surface is bound.
const UNBOUND_POLL: Duration = Duration::from_millis(50);

/// Host-supplied presentation target, created on the caller thread at attach
/// time and handed to the compositor thread.
pub(crate) struct PresentTarget {
    pub instance: wgpu::Instance,
    pub surface: wgpu::Surface<'static>,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    tex_coords: [f32; 2],
}

struct GpuState {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    surface_format: wgpu::TextureFormat,
    configured: (u32, u32),
    /// Framebuffer texture, rebuilt when the plugin size changes.
    texture: Option<FrameTexture>,
}

struct FrameTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
}

pub(crate) fn compositor_thread(shared: Arc<Shared>) {
    log::debug!("display {}: compositor thread started", shared.number);
    let mut gpu: Option<GpuState> = None;
    let mut staging: Vec<u32> = Vec::new();

    while shared.compositor_running.load(Ordering::Acquire) {
        if !shared.frame.wait(WAKE_INTERVAL) {
            continue;
        }
        if !shared.compositor_running.load(Ordering::Acquire) {
            break;
        }

        let mut present = shared.present.lock().unwrap();
        let Some(target) = present.as_mut() else {
            // Dirty but nothing to draw into; keep the flag and wait for a
            // surface.
            drop(present);
            thread::sleep(UNBOUND_POLL);
            continue;
        };

        if gpu.is_none() {
            match GpuState::new(target) {
                Ok(state) => gpu = Some(state),
                Err(e) => {
                    log::error!("display {}: gpu init failed: {e:#}", shared.number);
                    drop(present);
                    shared.frame.clear();
                    thread::sleep(UNBOUND_POLL);
                    continue;
                }
            }
        }
        let Some(state) = gpu.as_mut() else {
            continue;
        };

        // Snapshot under the short lock, then clear dirty BEFORE rendering:
        // a PutImage landing mid-draw re-marks the flag instead of being
        // clobbered afterwards.
        let (fw, fh) = {
            let fb = shared.fb.lock().unwrap();
            if !fb.has_content() {
                drop(fb);
                shared.frame.clear();
                continue;
            }
            fb.snapshot_into(&mut staging);
            (fb.width, fb.height)
        };
        shared.frame.clear();

        match state.draw_frame(target, &staging, fw, fh) {
            Ok(()) => {}
            Err(e) => {
                // The surface may have been torn down concurrently; exit the
                // loop without further graphics-context operations.
                log::info!(
                    "display {}: present failed ({e:#}), compositor exiting",
                    shared.number
                );
                break;
            }
        }
    }

    shared.compositor_exited.set();
    log::debug!("display {}: compositor thread exiting", shared.number);
}

impl GpuState {
    fn new(target: &PresentTarget) -> Result<Self> {
        let adapter = futures::executor::block_on(target.instance.request_adapter(
            &wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&target.surface),
                force_fallback_adapter: false,
            },
        ))
        .ok_or_else(|| anyhow!("no compatible gpu adapter"))?;

        let (device, queue) = futures::executor::block_on(
            adapter.request_device(&wgpu::DeviceDescriptor::default(), None),
        )
        .context("request device")?;

        let surface_caps = target.surface.get_capabilities(&adapter);
        let surface_format = *surface_caps
            .formats
            .first()
            .ok_or_else(|| anyhow!("surface reports no formats"))?;

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: target.width.max(1),
            height: target.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: wgpu::CompositeAlphaMode::Auto,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        target.surface.configure(&device, &config);

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("frame bind group layout"),
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
            ],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("frame shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shader.wgsl").into()),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("frame pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("frame pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2],
                }],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: Some(wgpu::BlendState::REPLACE),
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
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            surface_format,
            configured: (target.width.max(1), target.height.max(1)),
            texture: None,
        })
    }

    fn ensure_texture(&mut self, width: u32, height: u32) {
        let stale = self
            .texture
            .as_ref()
            .map(|t| t.width != width || t.height != height)
            .unwrap_or(true);
        if stale {
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("framebuffer"),
                size: wgpu::Extent3d {
                    width: width.max(1),
                    height: height.max(1),
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("framebuffer bind group"),
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
                ],
            });
            self.texture = Some(FrameTexture {
                texture,
                bind_group,
                width,
                height,
            });
        }
    }

    fn draw_frame(
        &mut self,
        target: &PresentTarget,
        staging: &[u32],
        fw: u32,
        fh: u32,
    ) -> Result<()> {
        let (sw, sh) = (target.width.max(1), target.height.max(1));
        if self.configured != (sw, sh) {
            let config = wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                format: self.surface_format,
                width: sw,
                height: sh,
                present_mode: wgpu::PresentMode::AutoVsync,
                alpha_mode: wgpu::CompositeAlphaMode::Auto,
                view_formats: vec![],
                desired_maximum_frame_latency: 2,
            };
            target.surface.configure(&self.device, &config);
            self.configured = (sw, sh);
        }

        self.ensure_texture(fw, fh);
        let Some(frame_tex) = &self.texture else {
            return Ok(());
        };
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &frame_tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(staging),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(fw * 4),
                rows_per_image: Some(fh),
            },
            wgpu::Extent3d {
                width: fw,
                height: fh,
                depth_or_array_layers: 1,
            },
        );

        let vertices = letterbox_quad(fw, fh, sw, sh);
        let vertex_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("frame quad"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });

        let output = target
            .surface
            .get_current_texture()
            .context("acquire surface texture")?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("frame pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: 0.10,
                            g: 0.10,
                            b: 0.15,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &frame_tex.bind_group, &[]);
            pass.set_vertex_buffer(0, vertex_buffer.slice(..));
            pass.draw(0..6, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }
}

/// Aspect-ratio-preserving quad, centered, in clip space.
fn letterbox_quad(fw: u32, fh: u32, sw: u32, sh: u32) -> [Vertex; 6] {
    let (fw, fh, sw, sh) = (fw as f32, fh as f32, sw as f32, sh as f32);
    let scale = (sw / fw).min(sh / fh);
    // Half extents of the letterboxed rect in clip space.
    let hx = (fw * scale) / sw;
    let hy = (fh * scale) / sh;
    let (x0, x1) = (-hx, hx);
    let (y0, y1) = (hy, -hy);
    [
        Vertex {
            position: [x0, y0],
            tex_coords: [0.0, 0.0],
        },
        Vertex {
            position: [x1, y0],
            tex_coords: [1.0, 0.0],
        },
        Vertex {
            position: [x0, y1],
            tex_coords: [0.0, 1.0],
        },
        Vertex {
            position: [x1, y0],
            tex_coords: [1.0, 0.0],
        },
        Vertex {
            position: [x1, y1],
            tex_coords: [1.0, 1.0],
        },
        Vertex {
            position: [x0, y1],
            tex_coords: [0.0, 1.0],
        },
    ]
}

/// Map a point in surface coordinates to framebuffer coordinates, inverting
/// the letterbox transform. Used by the input bridge.
pub(crate) fn surface_to_frame(
    sx: i32,
    sy: i32,
    fw: u32,
    fh: u32,
    sw: u32,
    sh: u32,
) -> (i32, i32) {
    if fw == 0 || fh == 0 || sw == 0 || sh == 0 {
        return (sx, sy);
    }
    let scale = (sw as f32 / fw as f32).min(sh as f32 / fh as f32);
    let x0 = (sw as f32 - fw as f32 * scale) / 2.0;
    let y0 = (sh as f32 - fh as f32 * scale) / 2.0;
    (
        ((sx as f32 - x0) / scale) as i32,
        ((sy as f32 - y0) / scale) as i32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_pillarboxes_wide_surface() {
        // 400x300 frame on an 800x300 surface: full height, centered width.
        let quad = letterbox_quad(400, 300, 800, 300);
        let xs: Vec<f32> = quad.iter().map(|v| v.position[0]).collect();
        let min_x = xs.iter().cloned().fold(f32::MAX, f32::min);
        let max_x = xs.iter().cloned().fold(f32::MIN, f32::max);
        assert!((min_x + 0.5).abs() < 1e-5);
        assert!((max_x - 0.5).abs() < 1e-5);
        let ys: Vec<f32> = quad.iter().map(|v| v.position[1]).collect();
        assert!(ys.iter().any(|&y| (y - 1.0).abs() < 1e-5));
        assert!(ys.iter().any(|&y| (y + 1.0).abs() < 1e-5));
    }

    #[test]
    fn identity_when_sizes_match() {
        assert_eq!(surface_to_frame(50, 60, 400, 300, 400, 300), (50, 60));
    }

    #[test]
    fn surface_to_frame_inverts_scaling() {
        // 2x scale, no padding
        assert_eq!(surface_to_frame(100, 100, 400, 300, 800, 600), (50, 50));
        // pillarbox: 400x300 frame on 800x300 surface, scale 1, x offset 200
        assert_eq!(surface_to_frame(250, 10, 400, 300, 800, 300), (50, 10));
    }

    #[test]
    fn surface_to_frame_without_content_is_identity() {
        assert_eq!(surface_to_frame(7, 8, 0, 0, 800, 600), (7, 8));
    }
}
