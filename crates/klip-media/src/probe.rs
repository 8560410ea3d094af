// crates/klip-media/src/probe.rs
//
// In-process ffmpeg probing: duration and video track configuration.
// Called by PlaybackWorker::load before a ClipDecoder is ever opened, so a
// clip with no video stream can be rejected with `UnsupportedMedia` before
// any decode machinery spins up.

use std::path::Path;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::input;
use ffmpeg::media::Type;

use klip_core::{KlipError, Result};

/// Container duration in seconds, falling back to the best video/audio
/// stream's own duration when the container doesn't report one (common for
/// some live-captured or badly muxed files).
pub fn probe_duration(path: &Path) -> Result<f64> {
    let ctx = input(path).map_err(|e| KlipError::UnsupportedMedia(e.to_string()))?;

    let container_dur = ctx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
    if container_dur > 0.0 {
        return Ok(container_dur);
    }

    if let Some(stream) = ctx
        .streams()
        .best(Type::Video)
        .or_else(|| ctx.streams().best(Type::Audio))
    {
        let tb = stream.time_base();
        let d = stream.duration() as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        if d > 0.0 {
            return Ok(d);
        }
    }

    Err(KlipError::UnsupportedMedia("duration unknown".into()))
}

#[derive(Debug, Clone, Copy)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
}

/// The coded width/height of the best video track, without decoding any
/// frames. Returns `UnsupportedMedia` for audio-only sources.
pub fn probe_video_config(path: &Path) -> Result<VideoConfig> {
    let ictx = input(path).map_err(|e| KlipError::UnsupportedMedia(e.to_string()))?;
    let stream = ictx
        .streams()
        .best(Type::Video)
        .ok_or_else(|| KlipError::UnsupportedMedia("no video stream".into()))?;

    let (width, height) = unsafe {
        let p = stream.parameters().as_ptr();
        ((*p).width as u32, (*p).height as u32)
    };
    if width == 0 || height == 0 {
        return Err(KlipError::UnsupportedMedia("zero-sized video track".into()));
    }
    Ok(VideoConfig { width, height })
}
