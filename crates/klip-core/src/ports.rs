// crates/klip-core/src/ports.rs
//
// External collaborators the core calls out to but never implements itself.
// Kept as traits here (not in klip-media) so klip-player can depend on the
// contract without depending on klip-media's ffmpeg-backed implementation,
// and klip-media can implement `Muxer` without depending on klip-player.

use crossbeam_channel::Receiver;
use uuid::Uuid;

use crate::error::Result;
use crate::model::Project;
use crate::timeline::Timeline;

/// A decoded frame ready to be pushed into a Muxer, or captured off a
/// compositor surface. Lives in klip-core (rather than klip-media) because
/// both the RecordStore-facing encode path and the Compositor's capture
/// path need to name the same type without a dependency cycle.
#[derive(Debug, Clone)]
pub struct FrameData {
    pub pixel_format: PixelFormat,
    pub coded_width: u32,
    pub coded_height: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub timestamp_us: i64,
    pub duration_us: i64,
    pub planes: Vec<Plane>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    Yuv420p,
}

/// Offset and stride of one plane within `FrameData::bytes`. Strides are
/// aligned up to a 128-byte boundary so the buffer can be uploaded to a GPU
/// texture without a repack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub offset: usize,
    pub stride: usize,
}

pub const PLANE_ALIGNMENT: usize = 128;

/// Round `width_bytes` up to the plane alignment boundary.
pub fn aligned_stride(width_bytes: usize) -> usize {
    (width_bytes + PLANE_ALIGNMENT - 1) / PLANE_ALIGNMENT * PLANE_ALIGNMENT
}

/// The project record store. The core consumes only these three operations
/// at its edges — listing/publishing/deleting whole projects is a host
/// concern.
pub trait RecordStore: Send + Sync {
    fn get_stem_blob(&self, uri: &str) -> Result<Vec<u8>>;
    fn create_stem(&self, bytes: &[u8], duration_s: f64) -> Result<StemHandle>;
    fn publish_project(&self, project: &Project, clip_bytes: &[u8]) -> Result<ProjectHandle>;
}

#[derive(Debug, Clone)]
pub struct StemHandle {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone)]
pub struct ProjectHandle {
    pub uri: String,
    pub cid: String,
}

/// The recorder/muxer the PreRenderer drives. `add_video_frame` takes
/// ownership of the frame; implementations must not retain it past the
/// call.
pub trait Muxer: Send {
    fn pre_init(&mut self) -> Result<()>;
    fn add_video_frame(&mut self, frame: FrameData) -> Result<()>;
    fn finalize(&mut self) -> Result<MuxedArtifact>;
    fn reset(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MuxedArtifact {
    pub bytes: Vec<u8>,
    pub frame_count: u64,
}

/// The Compositor's contract as seen by `klip-player`. Kept as a trait
/// (rather than a hard dependency on `klip-compositor`'s concrete,
/// wgpu-backed type) so the Player's transport/render-loop logic is
/// testable against an in-memory double that never touches a GPU, the same
/// "ports and adapters" split already used for `RecordStore`/`Muxer` above.
pub trait CompositorPort: Send {
    fn set_timeline(&mut self, timeline: Timeline);
    fn connect_playback_worker(&mut self, clip_id: Uuid, channel: Receiver<FrameData>) -> Result<()>;
    fn disconnect_playback_worker(&mut self, clip_id: Uuid);
    fn set_preview_stream(&mut self, track_id: Uuid, stream: Option<Receiver<FrameData>>);
    fn set_capture_frame(&mut self, clip_id: Uuid, frame: Option<FrameData>);
    fn render(&mut self, time_s: f64) -> Result<()>;
    /// Draw a single connected clip's current frame stretched across the
    /// full canvas, bypassing the timeline's placements. Used by the
    /// Player's render loop when a pre-rendered artifact is active and no
    /// preview stream has invalidated it (spec §4.6.5).
    fn render_single(&mut self, clip_id: Uuid, time_s: f64) -> Result<()>;
    fn render_capture(&mut self, time_s: f64) -> Result<()>;
    fn capture_frame(&mut self, timestamp_us: i64) -> Result<FrameData>;
    fn destroy(&mut self);
}
