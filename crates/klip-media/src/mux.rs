// crates/klip-media/src/mux.rs
//
// FfmpegMuxer: implements klip_core::ports::Muxer over a single-track VP9
// WebM output. Fed RGBA capture frames from the Compositor by the
// PreRenderer; converts to YUV420P via SwsContext before handing frames to
// the VP9 encoder, the same encoder-context-then-codecpar-FFI dance the
// multi-clip H.264 pipeline used, narrowed to one video stream.
//
// `Stream::codec()` doesn't exist in this version of ffmpeg-the-third, so
// `avcodec_parameters_from_context` is called directly to populate the
// muxer's codecpar from the opened encoder context.

use std::path::{Path, PathBuf};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::{output as open_output, Pixel};
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use klip_core::ports::{FrameData, Muxer, MuxedArtifact};
use klip_core::{KlipError, Result};

const KEYFRAME_INTERVAL: u32 = 30;
const BIT_RATE: usize = 4_000_000;

pub struct FfmpegMuxer {
    output_path: PathBuf,
    width: u32,
    height: u32,
    fps: u32,
    octx: Option<ffmpeg::format::context::Output>,
    encoder: Option<ffmpeg::encoder::Video>,
    scaler: Option<SwsContext>,
    frame_idx: i64,
    frame_tb: Rational,
}

impl FfmpegMuxer {
    pub fn new(output_path: impl Into<PathBuf>, width: u32, height: u32, fps: u32) -> Self {
        FfmpegMuxer {
            output_path: output_path.into(),
            width,
            height,
            fps,
            octx: None,
            encoder: None,
            scaler: None,
            frame_idx: 0,
            frame_tb: Rational::new(1, fps as i32),
        }
    }

    fn ensure_scaler(&mut self, src_w: u32, src_h: u32) -> Result<&mut SwsContext> {
        if self.scaler.is_none() {
            let scaler = SwsContext::get(
                Pixel::RGBA,
                src_w,
                src_h,
                Pixel::YUV420P,
                self.width,
                self.height,
                Flags::BILINEAR,
            )
            .map_err(|e| KlipError::Other(anyhow::anyhow!("capture scaler: {e}")))?;
            self.scaler = Some(scaler);
        }
        Ok(self.scaler.as_mut().unwrap())
    }
}

impl Muxer for FfmpegMuxer {
    fn pre_init(&mut self) -> Result<()> {
        let mut octx = open_output(&self.output_path)
            .map_err(|e| KlipError::Other(anyhow::anyhow!("open output: {e}")))?;

        let vp9 = encoder::find(CodecId::VP9)
            .ok_or_else(|| KlipError::Other(anyhow::anyhow!("VP9 encoder not found")))?;

        let mut ost = octx
            .add_stream(vp9)
            .map_err(|e| KlipError::Other(anyhow::anyhow!("add video stream: {e}")))?;
        ost.set_time_base(self.frame_tb);

        let enc_ctx = codec::context::Context::new_with_codec(vp9);
        let mut enc = enc_ctx
            .encoder()
            .video()
            .map_err(|e| KlipError::Other(anyhow::anyhow!("create encoder context: {e}")))?;
        enc.set_width(self.width);
        enc.set_height(self.height);
        enc.set_format(Pixel::YUV420P);
        enc.set_time_base(self.frame_tb);
        enc.set_frame_rate(Some(Rational::new(self.fps as i32, 1)));
        enc.set_bit_rate(BIT_RATE);
        enc.set_gop(KEYFRAME_INTERVAL);

        let encoder = enc
            .open_as_with(vp9, ffmpeg::Dictionary::new())
            .map_err(|e| KlipError::Other(anyhow::anyhow!("open VP9 encoder: {e}")))?;

        unsafe {
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (**(*octx.as_mut_ptr()).streams.add(0)).codecpar,
                encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                return Err(KlipError::Other(anyhow::anyhow!(
                    "avcodec_parameters_from_context failed: {ret}"
                )));
            }
        }

        octx.write_header()
            .map_err(|e| KlipError::Other(anyhow::anyhow!("write header: {e}")))?;

        self.encoder = Some(encoder);
        self.octx = Some(octx);
        self.frame_idx = 0;
        Ok(())
    }

    fn add_video_frame(&mut self, frame: FrameData) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(KlipError::WorkersNotReady);
        };

        let mut rgba = VideoFrame::new(Pixel::RGBA, frame.display_width, frame.display_height);
        let stride = frame.planes[0].stride;
        let row_bytes = frame.display_width as usize * 4;
        let dst_stride = rgba.stride(0);
        {
            let dst = rgba.data_mut(0);
            for row in 0..frame.display_height as usize {
                let src_off = row * stride;
                let dst_off = row * dst_stride;
                dst[dst_off..dst_off + row_bytes]
                    .copy_from_slice(&frame.bytes[src_off..src_off + row_bytes]);
            }
        }

        let (w, h) = (frame.display_width, frame.display_height);
        let scaler = self.ensure_scaler(w, h)?;
        let mut yuv = VideoFrame::empty();
        scaler
            .run(&rgba, &mut yuv)
            .map_err(|e| KlipError::Other(anyhow::anyhow!("scale capture frame: {e}")))?;
        yuv.set_pts(Some(self.frame_idx));
        self.frame_idx += 1;

        encoder
            .send_frame(&yuv)
            .map_err(|e| KlipError::Other(anyhow::anyhow!("send frame to encoder: {e}")))?;
        drain_packets(encoder, self.octx.as_mut().unwrap(), self.frame_tb)
    }

    fn finalize(&mut self) -> Result<MuxedArtifact> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(KlipError::WorkersNotReady);
        };
        let octx = self.octx.as_mut().unwrap();

        encoder
            .send_eof()
            .map_err(|e| KlipError::Other(anyhow::anyhow!("send EOF: {e}")))?;
        drain_packets(encoder, octx, self.frame_tb)?;
        octx.write_trailer()
            .map_err(|e| KlipError::Other(anyhow::anyhow!("write trailer: {e}")))?;

        let bytes = std::fs::read(&self.output_path)
            .map_err(|e| KlipError::Other(anyhow::anyhow!("read muxed output: {e}")))?;
        Ok(MuxedArtifact {
            bytes,
            frame_count: self.frame_idx as u64,
        })
    }

    fn reset(&mut self) -> Result<()> {
        self.octx = None;
        self.encoder = None;
        self.scaler = None;
        self.frame_idx = 0;
        Ok(())
    }
}

fn drain_packets(
    encoder: &mut ffmpeg::encoder::Video,
    octx: &mut ffmpeg::format::context::Output,
    frame_tb: Rational,
) -> Result<()> {
    let ost_tb = octx.stream(0).unwrap().time_base();
    let mut pkt = Packet::empty();
    while encoder.receive_packet(&mut pkt).is_ok() {
        pkt.set_stream(0);
        pkt.rescale_ts(frame_tb, ost_tb);
        pkt.write_interleaved(octx)
            .map_err(|e| KlipError::Other(anyhow::anyhow!("write packet: {e}")))?;
    }
    Ok(())
}

/// Open `path` and probe whether ffmpeg recognises a VP9 (or equivalent)
/// encoder on this build, used by the pre-renderer to fail fast with
/// `UnsupportedMedia` instead of discovering the missing codec mid-render.
pub fn vp9_available() -> bool {
    encoder::find(CodecId::VP9).is_some()
}

pub fn default_output_path(job_id: uuid::Uuid, dir: &Path) -> PathBuf {
    dir.join(format!("klip_prerender_{job_id}.webm"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_path_is_namespaced_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let a = default_output_path(uuid::Uuid::new_v4(), dir.path());
        let b = default_output_path(uuid::Uuid::new_v4(), dir.path());
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(dir.path()));
        assert!(a.extension().map(|e| e == "webm").unwrap_or(false));
    }
}
