// crates/klip-compositor/src/capture.rs
//
// Off-screen capture surface: a second, identically-sized render target that
// mirrors the on-screen slot state so the pre-renderer can read pixels back
// without disturbing the live preview surface. Readback uses the standard
// wgpu map_async/poll idiom; only one request is ever in flight.

use klip_core::ports::{aligned_stride, FrameData, PixelFormat, Plane};
use klip_core::{KlipError, Result};

pub struct CaptureSurface {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    readback_buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_row_bytes: u32,
}

impl CaptureSurface {
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("klip_capture_texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let row_bytes = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row_bytes = (row_bytes + align - 1) / align * align;

        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("klip_capture_readback"),
            size: (padded_row_bytes * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        CaptureSurface {
            texture,
            view,
            readback_buffer,
            width,
            height,
            padded_row_bytes,
        }
    }

    /// Copy the capture texture into the readback buffer. Must be called
    /// after the render pass that drew into `self.view` has been submitted.
    pub fn copy_to_buffer(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.readback_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_row_bytes),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Map the readback buffer and produce a `FrameData` snapshot stamped
    /// with `timestamp_us`. Blocks on `device.poll` until the map completes
    /// — there is at most one in-flight capture at a time, so this never
    /// competes with itself.
    pub fn read_frame(&self, device: &wgpu::Device, timestamp_us: i64) -> Result<FrameData> {
        let slice = self.readback_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| KlipError::Other(anyhow::anyhow!("capture map channel: {e}")))?
            .map_err(|e| KlipError::Other(anyhow::anyhow!("capture map failed: {e:?}")))?;

        let row_bytes = self.width as usize * 4;
        let stride = aligned_stride(row_bytes);
        let mut bytes = vec![0u8; stride * self.height as usize];
        {
            let data = slice.get_mapped_range();
            for row in 0..self.height as usize {
                let src_off = row * self.padded_row_bytes as usize;
                let dst_off = row * stride;
                bytes[dst_off..dst_off + row_bytes]
                    .copy_from_slice(&data[src_off..src_off + row_bytes]);
            }
        }
        self.readback_buffer.unmap();

        Ok(FrameData {
            pixel_format: PixelFormat::Rgba8,
            coded_width: self.width,
            coded_height: self.height,
            display_width: self.width,
            display_height: self.height,
            timestamp_us,
            duration_us: 0,
            planes: vec![Plane { offset: 0, stride }],
            bytes,
        })
    }
}
