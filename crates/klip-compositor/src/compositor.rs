// crates/klip-compositor/src/compositor.rs
//
// GPU-backed compositor. Grounded on examples/xmoezzz-rfvp's
// video-player-wgpu: same device/surface/pipeline bring-up, same
// write_texture row-padding idiom for uploading decoded frames, generalized
// from one full-screen quad into N independently-positioned quads (one per
// active placement) using the timeline's per-placement viewport converted
// to NDC corners.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use crossbeam_channel::Receiver;
use uuid::Uuid;
use wgpu::util::DeviceExt;

use klip_core::helpers::geometry::viewport_to_ndc;
use klip_core::ports::FrameData;
use klip_core::timeline::Timeline;
use klip_core::{KlipError, Result};

use crate::capture::CaptureSurface;

/// Fixed slot count matching the live-preview grid: one connected
/// PlaybackWorker channel per slot.
pub const MAX_SLOTS: usize = 4;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Vertex {
    pos: [f32; 2],
    uv: [f32; 2],
}

const QUAD_INDICES: [u16; 6] = [0, 1, 2, 0, 2, 3];

fn quad_vertices(x0: f32, y0: f32, x1: f32, y1: f32) -> [Vertex; 4] {
    [
        Vertex { pos: [x0, y1], uv: [0.0, 1.0] },
        Vertex { pos: [x1, y1], uv: [1.0, 1.0] },
        Vertex { pos: [x1, y0], uv: [1.0, 0.0] },
        Vertex { pos: [x0, y0], uv: [0.0, 0.0] },
    ]
}

struct Slot {
    clip_id: Option<Uuid>,
    channel: Option<Receiver<FrameData>>,
    texture: Option<wgpu::Texture>,
    bind_group: Option<wgpu::BindGroup>,
    vbuf: wgpu::Buffer,
}

struct PreviewSlot {
    channel: Receiver<FrameData>,
    texture: Option<wgpu::Texture>,
    bind_group: Option<wgpu::BindGroup>,
    vbuf: wgpu::Buffer,
}

/// Owns the GPU surface, the parallel off-screen capture surface, and the
/// per-slot texture state. All methods run on whatever thread the caller
/// dedicates to compositing — the type itself does no thread spawning.
pub struct Compositor {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    capture: CaptureSurface,

    pipeline: wgpu::RenderPipeline,
    ibuf: wgpu::Buffer,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,

    slots: [Slot; MAX_SLOTS],
    preview: HashMap<Uuid, PreviewSlot>,
    timeline: Timeline,
}

impl Compositor {
    /// Bind the GPU context to an already-created surface, compile shaders,
    /// and allocate the parallel capture surface. `surface` is handed to the
    /// compositor once at construction and owned exclusively thereafter.
    pub fn init(
        instance: &wgpu::Instance,
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        pollster::block_on(Self::init_async(instance, surface, width, height))
    }

    async fn init_async(
        instance: &wgpu::Instance,
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| KlipError::Other(anyhow::anyhow!("no compatible GPU adapter")))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: None,
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| KlipError::Other(anyhow::anyhow!("request_device: {e}")))?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps.formats[0];
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        let capture = CaptureSurface::new(&device, width, height);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("klip_compositor_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shader.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("klip_compositor_bgl"),
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
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("klip_compositor_pl"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let vertex_attrs = wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("klip_compositor_pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &vertex_attrs,
                }],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: config.format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        let ibuf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("klip_compositor_ibuf"),
            contents: bytemuck::cast_slice(&QUAD_INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        let make_slot = || Slot {
            clip_id: None,
            channel: None,
            texture: None,
            bind_group: None,
            vbuf: empty_vbuf(&device),
        };

        Ok(Compositor {
            device,
            queue,
            surface,
            config,
            capture,
            pipeline,
            ibuf,
            bind_group_layout,
            sampler,
            slots: std::array::from_fn(|_| make_slot()),
            preview: HashMap::new(),
            timeline: Timeline::default(),
        })
    }

    pub fn set_timeline(&mut self, timeline: Timeline) {
        self.timeline = timeline;
    }

    /// Register a channel for `clip_id`. Frames pushed on it are uploaded on
    /// the next `render`/`render_capture`. Fails with `Exhausted` when all
    /// slots are already connected to a different clip.
    pub fn connect_playback_worker(&mut self, clip_id: Uuid, channel: Receiver<FrameData>) -> Result<()> {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.clip_id == Some(clip_id)) {
            slot.channel = Some(channel);
            return Ok(());
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.clip_id.is_none())
            .ok_or(KlipError::Exhausted)?;
        slot.clip_id = Some(clip_id);
        slot.channel = Some(channel);
        Ok(())
    }

    pub fn disconnect_playback_worker(&mut self, clip_id: Uuid) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.clip_id == Some(clip_id)) {
            slot.clip_id = None;
            slot.channel = None;
            slot.texture = None;
            slot.bind_group = None;
        }
    }

    pub fn set_preview_stream(&mut self, track_id: Uuid, stream: Option<Receiver<FrameData>>) {
        match stream {
            Some(rx) => {
                self.preview.insert(
                    track_id,
                    PreviewSlot {
                        channel: rx,
                        texture: None,
                        bind_group: None,
                        vbuf: empty_vbuf(&self.device),
                    },
                );
            }
            None => {
                self.preview.remove(&track_id);
            }
        }
    }

    /// Direct push alternative to the channel-based intake, for callers that
    /// don't route frames through a PlaybackWorker channel.
    pub fn set_frame(&mut self, clip_id: Uuid, frame: Option<FrameData>) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.clip_id == Some(clip_id)) {
            match frame {
                Some(f) => upload_slot(&self.device, &self.queue, &self.bind_group_layout, &self.sampler, slot, &f),
                None => {
                    slot.texture = None;
                    slot.bind_group = None;
                }
            }
        }
    }

    /// Drain every connected channel, keeping only the latest frame per slot
    /// (older pending frames are dropped, matching the spec's "any pending
    /// frame is dropped/closed" replacement rule), and upload it.
    fn pump_channels(&mut self) {
        for slot in &mut self.slots {
            let Some(rx) = &slot.channel else { continue };
            let mut latest = None;
            while let Ok(f) = rx.try_recv() {
                latest = Some(f);
            }
            if let Some(f) = latest {
                upload_slot(&self.device, &self.queue, &self.bind_group_layout, &self.sampler, slot, &f);
            }
        }
        for slot in self.preview.values_mut() {
            let mut latest = None;
            while let Ok(f) = slot.channel.try_recv() {
                latest = Some(f);
            }
            if let Some(f) = latest {
                upload_preview(&self.device, &self.queue, &self.bind_group_layout, &self.sampler, slot, &f);
            }
        }
    }

    /// Render the current timeline state at `time_s` to the live surface.
    pub fn render(&mut self, time_s: f64) -> Result<()> {
        self.pump_channels();
        let output = self
            .surface
            .get_current_texture()
            .map_err(|e| KlipError::Other(anyhow::anyhow!("get_current_texture: {e}")))?;
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        self.draw_active_placements(time_s, &view, self.config.width, self.config.height, false);

        output.present();
        Ok(())
    }

    /// Render the same scene into the off-screen capture target instead of
    /// the live surface, keyed off the timeline's active placements at
    /// `time_s` exactly like `render` — the pre-renderer drives this with a
    /// synthetic `time_s = i / fps` rather than wall-clock time.
    pub fn render_capture(&mut self, time_s: f64) -> Result<()> {
        self.pump_channels();
        let view = self.capture.texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.draw_active_placements(time_s, &view, self.config.width, self.config.height, true);
        Ok(())
    }

    fn draw_active_placements(&mut self, time_s: f64, view: &wgpu::TextureView, w: u32, h: u32, is_capture: bool) {
        let active = self.timeline.active_placements(time_s);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("klip_compositor_encoder") });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("klip_compositor_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r: 0.08, g: 0.08, b: 0.08, a: 1.0 }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            rpass.set_pipeline(&self.pipeline);

            for ap in &active {
                let Some(slot) = self
                    .slots
                    .iter()
                    .find(|s| s.clip_id == Some(ap.placement.clip_id))
                else {
                    continue;
                };
                let Some(bind_group) = &slot.bind_group else { continue };
                let (x0, y0, x1, y1) = viewport_to_ndc(ap.placement.viewport, w, h);
                self.queue
                    .write_buffer(&slot.vbuf, 0, bytemuck::cast_slice(&quad_vertices(x0, y0, x1, y1)));
                rpass.set_bind_group(0, bind_group, &[]);
                rpass.set_vertex_buffer(0, slot.vbuf.slice(..));
                rpass.set_index_buffer(self.ibuf.slice(..), wgpu::IndexFormat::Uint16);
                rpass.draw_indexed(0..6, 0, 0..1);
            }

            // Overlay preview streams on the 2x2 preview grid, one cell each.
            let cols = 2u32;
            let cell_w = w / cols;
            let cell_h = h / cols;
            for (i, preview) in self.preview.values().enumerate().take((cols * cols) as usize) {
                let Some(bind_group) = &preview.bind_group else { continue };
                let col = i as u32 % cols;
                let row = i as u32 / cols;
                let vp = klip_core::timeline::Viewport {
                    x: (col * cell_w) as i32,
                    y: (row * cell_h) as i32,
                    w: cell_w as i32,
                    h: cell_h as i32,
                };
                let (x0, y0, x1, y1) = viewport_to_ndc(vp, w, h);
                self.queue
                    .write_buffer(&preview.vbuf, 0, bytemuck::cast_slice(&quad_vertices(x0, y0, x1, y1)));
                rpass.set_bind_group(0, bind_group, &[]);
                rpass.set_vertex_buffer(0, preview.vbuf.slice(..));
                rpass.set_index_buffer(self.ibuf.slice(..), wgpu::IndexFormat::Uint16);
                rpass.draw_indexed(0..6, 0, 0..1);
            }
        }

        if is_capture {
            self.capture.copy_to_buffer(&mut encoder);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    /// Draw `clip_id`'s current slot texture stretched across the full
    /// canvas, ignoring the timeline's placements entirely. The fast path
    /// the render loop switches to once a pre-render artifact is active.
    pub fn render_single(&mut self, clip_id: Uuid, _time_s: f64) -> Result<()> {
        self.pump_channels();
        let output = self
            .surface
            .get_current_texture()
            .map_err(|e| KlipError::Other(anyhow::anyhow!("get_current_texture: {e}")))?;
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("klip_compositor_single_encoder") });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("klip_compositor_single_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r: 0.08, g: 0.08, b: 0.08, a: 1.0 }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            rpass.set_pipeline(&self.pipeline);

            if let Some(slot) = self.slots.iter().find(|s| s.clip_id == Some(clip_id)) {
                if let Some(bind_group) = &slot.bind_group {
                    let full = klip_core::timeline::Viewport {
                        x: 0,
                        y: 0,
                        w: self.config.width as i32,
                        h: self.config.height as i32,
                    };
                    let (x0, y0, x1, y1) = viewport_to_ndc(full, self.config.width, self.config.height);
                    self.queue
                        .write_buffer(&slot.vbuf, 0, bytemuck::cast_slice(&quad_vertices(x0, y0, x1, y1)));
                    rpass.set_bind_group(0, bind_group, &[]);
                    rpass.set_vertex_buffer(0, slot.vbuf.slice(..));
                    rpass.set_index_buffer(self.ibuf.slice(..), wgpu::IndexFormat::Uint16);
                    rpass.draw_indexed(0..6, 0, 0..1);
                }
            }
        }

        self.queue.submit(Some(encoder.finish()));
        output.present();
        Ok(())
    }

    pub fn set_capture_frame(&mut self, clip_id: Uuid, frame: Option<FrameData>) {
        self.set_frame(clip_id, frame);
    }

    /// Snapshot the capture canvas, stamped with `timestamp_us`. Must be
    /// called after `render_capture` for the same tick.
    pub fn capture_frame(&mut self, timestamp_us: i64) -> Result<FrameData> {
        self.capture.read_frame(&self.device, timestamp_us)
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(&self.device, &self.config);
        self.capture = CaptureSurface::new(&self.device, width, height);
    }

    /// Drop all connected channels, preview readers, and GPU resources. The
    /// surface itself is dropped along with `self`.
    pub fn destroy(&mut self) {
        for slot in &mut self.slots {
            slot.clip_id = None;
            slot.channel = None;
            slot.texture = None;
            slot.bind_group = None;
        }
        self.preview.clear();
    }
}

impl klip_core::ports::CompositorPort for Compositor {
    fn set_timeline(&mut self, timeline: Timeline) {
        Compositor::set_timeline(self, timeline)
    }
    fn connect_playback_worker(&mut self, clip_id: Uuid, channel: Receiver<FrameData>) -> Result<()> {
        Compositor::connect_playback_worker(self, clip_id, channel)
    }
    fn disconnect_playback_worker(&mut self, clip_id: Uuid) {
        Compositor::disconnect_playback_worker(self, clip_id)
    }
    fn set_preview_stream(&mut self, track_id: Uuid, stream: Option<Receiver<FrameData>>) {
        Compositor::set_preview_stream(self, track_id, stream)
    }
    fn set_capture_frame(&mut self, clip_id: Uuid, frame: Option<FrameData>) {
        Compositor::set_capture_frame(self, clip_id, frame)
    }
    fn render(&mut self, time_s: f64) -> Result<()> {
        Compositor::render(self, time_s)
    }
    fn render_single(&mut self, clip_id: Uuid, time_s: f64) -> Result<()> {
        Compositor::render_single(self, clip_id, time_s)
    }
    fn render_capture(&mut self, time_s: f64) -> Result<()> {
        Compositor::render_capture(self, time_s)
    }
    fn capture_frame(&mut self, timestamp_us: i64) -> Result<FrameData> {
        Compositor::capture_frame(self, timestamp_us)
    }
    fn destroy(&mut self) {
        Compositor::destroy(self)
    }
}

fn empty_vbuf(device: &wgpu::Device) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("klip_compositor_vbuf"),
        size: (std::mem::size_of::<Vertex>() * 4) as u64,
        usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// wgpu requires `bytes_per_row` to be a multiple of 256; our decoded frames
/// are only 128-byte aligned, so re-pad rows that don't already satisfy it.
fn upload_texture(device: &wgpu::Device, queue: &wgpu::Queue, frame: &FrameData) -> wgpu::Texture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("klip_compositor_slot_texture"),
        size: wgpu::Extent3d {
            width: frame.display_width,
            height: frame.display_height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });

    let row_bytes = frame.display_width as usize * 4;
    let src_stride = frame.planes[0].stride;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;
    let padded_row_bytes = (row_bytes + align - 1) / align * align;

    let image_copy = wgpu::ImageCopyTexture {
        texture: &texture,
        mip_level: 0,
        origin: wgpu::Origin3d::ZERO,
        aspect: wgpu::TextureAspect::All,
    };
    let extent = wgpu::Extent3d {
        width: frame.display_width,
        height: frame.display_height,
        depth_or_array_layers: 1,
    };

    if src_stride == padded_row_bytes {
        queue.write_texture(
            image_copy,
            &frame.bytes,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(padded_row_bytes as u32),
                rows_per_image: Some(frame.display_height),
            },
            extent,
        );
        return texture;
    }

    let mut padded = vec![0u8; padded_row_bytes * frame.display_height as usize];
    for row in 0..frame.display_height as usize {
        let src = &frame.bytes[row * src_stride..row * src_stride + row_bytes];
        let dst = &mut padded[row * padded_row_bytes..row * padded_row_bytes + row_bytes];
        dst.copy_from_slice(src);
    }
    queue.write_texture(
        image_copy,
        &padded,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(padded_row_bytes as u32),
            rows_per_image: Some(frame.display_height),
        },
        extent,
    );
    texture
}

fn make_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    sampler: &wgpu::Sampler,
    texture: &wgpu::Texture,
) -> wgpu::BindGroup {
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("klip_compositor_slot_bg"),
        layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&view) },
            wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(sampler) },
        ],
    })
}

fn upload_slot(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    layout: &wgpu::BindGroupLayout,
    sampler: &wgpu::Sampler,
    slot: &mut Slot,
    frame: &FrameData,
) {
    let texture = upload_texture(device, queue, frame);
    slot.bind_group = Some(make_bind_group(device, layout, sampler, &texture));
    slot.texture = Some(texture);
}

fn upload_preview(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    layout: &wgpu::BindGroupLayout,
    sampler: &wgpu::Sampler,
    slot: &mut PreviewSlot,
    frame: &FrameData,
) {
    let texture = upload_texture(device, queue, frame);
    slot.bind_group = Some(make_bind_group(device, layout, sampler, &texture));
    slot.texture = Some(texture);
}
