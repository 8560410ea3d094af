// crates/klip-player/src/player.rs
//
// Player: composes Clock + TimelineCompiler output + a pool of
// PlaybackWorkers + the Compositor, and runs the render loop. Track/Clip
// entry bookkeeping is new (the teacher has no timeline concept at all —
// it edits one project in place); the parallel-seek-then-play sequencing on
// transport commands is grounded on the teacher's habit of fanning work out
// over `std::thread::scope` wherever a batch of independent blocking calls
// needs to complete before proceeding (see velocut-media's own use of
// dedicated per-operation threads for anything that blocks on ffmpeg).
//
// Compositor and PlaybackWorker are consumed through the `CompositorPort` /
// `PlaybackWorkerPort` traits (klip-core::ports, klip-media::worker) rather
// than their concrete, ffmpeg/wgpu-backed types, so the transport and
// render-loop logic here is testable without a GPU or a real media file —
// see tests/ for the fakes this buys.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use uuid::Uuid;

use klip_core::clock::{Clock, Looped, MonotonicClock};
use klip_core::compile;
use klip_core::model::{AudioEffect, Canvas, Project};
use klip_core::ports::CompositorPort;
use klip_core::timeline::Timeline;
use klip_core::{KlipError, Result};
use klip_media::worker::{ClipState, PlaybackWorkerPort};

use crate::pool::WorkerPool;

/// How long `play()` waits for clips still in `Loading` before proceeding
/// without them (spec §5: "play waits at most 5s for Loading clips").
const LOADING_GRACE: Duration = Duration::from_secs(5);

pub struct TrackEntry {
    pub audio_pipeline: Vec<AudioEffect>,
}

pub struct ClipEntry {
    pub track_id: Uuid,
    pub worker: Option<Box<dyn PlaybackWorkerPort>>,
    pub duration_s: f64,
}

pub struct Player {
    pub(crate) clock: Clock,
    pub(crate) compositor: Box<dyn CompositorPort>,
    pub(crate) pool: WorkerPool,
    pub(crate) tracks: HashMap<Uuid, TrackEntry>,
    pub(crate) clips: HashMap<Uuid, ClipEntry>,
    pub(crate) timeline: Timeline,
    canvas: Canvas,
    /// Set when a PreRenderer run completes and no preview stream has
    /// invalidated it since; the render loop routes to this single clip
    /// instead of the live multi-clip composite when present (spec §4.6.5).
    pub(crate) prerender_clip: Option<Uuid>,
    /// Count of active `setPreviewStream(track, Some(..))` registrations.
    /// A non-zero count means the pre-render fast path must not be used
    /// even if `prerender_clip` is still set (spec §4.6's invalidation
    /// rule is edge-triggered on registration, but the render loop's own
    /// "no preview streams" condition is a live check).
    preview_count: usize,
}

impl Player {
    pub fn new(compositor: Box<dyn CompositorPort>, canvas: Canvas, clock: &dyn MonotonicClock) -> Self {
        Self::with_pool(compositor, canvas, clock, WorkerPool::new())
    }

    /// Construct with a caller-supplied worker pool — used by tests to
    /// inject a pool backed by a synthetic worker factory.
    pub fn with_pool(
        compositor: Box<dyn CompositorPort>,
        canvas: Canvas,
        clock: &dyn MonotonicClock,
        pool: WorkerPool,
    ) -> Self {
        Player {
            clock: Clock::new(clock),
            compositor,
            pool,
            tracks: HashMap::new(),
            clips: HashMap::new(),
            timeline: Timeline::default(),
            canvas,
            prerender_clip: None,
            preview_count: 0,
        }
    }

    /// Recompile `project` and push the new timeline to the compositor.
    /// Any active pre-render is invalidated (spec §4.6: "Project mutation
    /// ... invalidates the pre-render").
    pub fn set_project(&mut self, project: &Project) {
        self.timeline = compile(project, self.canvas);
        self.clock.set_duration(self.timeline.duration);
        self.compositor.set_timeline(self.timeline.clone());
        self.prerender_clip = None;
        for track in &project.tracks {
            self.tracks.entry(track.id).or_insert_with(|| TrackEntry {
                audio_pipeline: track.audio_pipeline.clone(),
            });
        }
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// The speed of the clip's own placement(s) in the current timeline, or
    /// `1.0` if the clip has no placement (e.g. it hasn't been compiled into
    /// a segment, or it's a pre-render artifact clip). A clip's `speed` is
    /// fixed on its source `Clip` record, so every placement for the same
    /// `clip_id` carries the same value; the first match is sufficient.
    fn clip_speed(&self, clip_id: Uuid) -> f64 {
        self.timeline
            .segments
            .iter()
            .flat_map(|seg| &seg.placements)
            .find(|p| p.clip_id == clip_id)
            .map(|p| p.speed)
            .unwrap_or(1.0)
    }

    pub fn clip_entry(&self, clip_id: Uuid) -> Option<&ClipEntry> {
        self.clips.get(&clip_id)
    }

    pub fn compositor_mut(&mut self) -> &mut dyn CompositorPort {
        self.compositor.as_mut()
    }

    /// Whether a pre-rendered fast path is currently active and should be
    /// used by the render loop instead of the multi-clip composite.
    pub fn is_prerendered(&self) -> bool {
        self.prerender_clip.is_some()
    }

    /// Acquire a worker, open `path`, and seek it to the clock's current
    /// position so the first composited frame isn't blank.
    pub fn load_clip(&mut self, track_id: Uuid, path: PathBuf, clip_id: Option<Uuid>) -> Result<Uuid> {
        self.tracks
            .entry(track_id)
            .or_insert_with(|| TrackEntry { audio_pipeline: Vec::new() });

        let clip_id = clip_id.unwrap_or_else(Uuid::new_v4);
        let worker = self.pool.acquire()?;
        self.compositor
            .connect_playback_worker(clip_id, worker.frames_rx())?;

        let duration_s = match worker.load(path) {
            Ok(d) => d,
            Err(e) => {
                self.compositor.disconnect_playback_worker(clip_id);
                self.pool.release(worker);
                return Err(e);
            }
        };
        let _ = worker.seek(self.clock.position());

        self.clips.insert(
            clip_id,
            ClipEntry {
                track_id,
                worker: Some(worker),
                duration_s,
            },
        );
        Ok(clip_id)
    }

    pub fn clear_clip(&mut self, clip_id: Uuid) {
        self.compositor.disconnect_playback_worker(clip_id);
        if let Some(entry) = self.clips.remove(&clip_id) {
            if let Some(worker) = entry.worker {
                // Stop the stream loop before the worker becomes invisible
                // to anything that would otherwise drain its frame channel
                // — `pool.release` resets it fully, but pausing first here
                // stops it from pushing further frames the instant the
                // compositor above has already dropped its receiver.
                let _ = worker.pause();
                self.pool.release(worker);
            }
        }
        if self.prerender_clip == Some(clip_id) {
            self.prerender_clip = None;
        }
    }

    /// Register a live preview stream on `track_id`. A non-null stream
    /// invalidates any active pre-render (spec §4.6).
    pub fn set_preview_stream(
        &mut self,
        track_id: Uuid,
        stream: Option<crossbeam_channel::Receiver<klip_core::ports::FrameData>>,
    ) {
        if stream.is_some() {
            self.prerender_clip = None;
            self.preview_count += 1;
        } else if self.preview_count > 0 {
            self.preview_count -= 1;
        }
        self.compositor.set_preview_stream(track_id, stream);
    }

    /// Mark `clip_id` (already connected to the compositor, per
    /// `load_clip`) as the active pre-render artifact. Called by the
    /// PreRenderer once it has fed the finalised artifact into a fresh
    /// worker and connected it (spec §4.6.5).
    pub fn set_prerendered_clip(&mut self, clip_id: Uuid) {
        if self.preview_count == 0 {
            self.prerender_clip = Some(clip_id);
        }
    }

    pub fn invalidate_prerender(&mut self) {
        self.prerender_clip = None;
    }

    /// Start (or resume) playback at `start` (defaulting to the clock's
    /// current position). Clips still `Loading` are given up to
    /// `LOADING_GRACE` to finish before the transport proceeds without them.
    pub fn play(&mut self, clock: &dyn MonotonicClock, start: Option<f64>) -> Result<()> {
        let start_time = start.unwrap_or_else(|| self.clock.position());

        let deadline = Instant::now() + LOADING_GRACE;
        loop {
            let still_loading = self
                .clips
                .values()
                .filter_map(|c| c.worker.as_ref())
                .any(|w| w.state() == ClipState::Loading);
            if !still_loading || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        std::thread::scope(|scope| {
            for entry in self.clips.values() {
                let Some(worker) = &entry.worker else { continue };
                if matches!(worker.state(), ClipState::Ready | ClipState::Paused) {
                    scope.spawn(move || {
                        let _ = worker.seek(start_time);
                    });
                }
            }
        });

        for (clip_id, entry) in self.clips.iter() {
            let Some(worker) = &entry.worker else { continue };
            if matches!(worker.state(), ClipState::Ready | ClipState::Paused) {
                let _ = worker.play(start_time, self.clip_speed(*clip_id));
            }
        }

        self.clock.play(clock, Some(start_time));
        Ok(())
    }

    pub fn pause(&mut self, clock: &dyn MonotonicClock) {
        for entry in self.clips.values() {
            if let Some(worker) = &entry.worker {
                if worker.state() == ClipState::Playing {
                    let _ = worker.pause();
                }
            }
        }
        self.clock.pause(clock);
    }

    pub fn stop(&mut self) {
        for entry in self.clips.values() {
            let Some(worker) = &entry.worker else { continue };
            if !matches!(worker.state(), ClipState::Idle | ClipState::Loading) {
                let _ = worker.pause();
                let _ = worker.seek(0.0);
            }
        }
        self.clock.stop();
    }

    pub fn seek(&mut self, clock: &dyn MonotonicClock, t: f64) -> Result<()> {
        let was_playing = self.clock.is_playing();
        if was_playing {
            self.pause(clock);
        }
        std::thread::scope(|scope| {
            for entry in self.clips.values() {
                let Some(worker) = &entry.worker else { continue };
                scope.spawn(move || {
                    let _ = worker.seek(t);
                });
            }
        });
        self.clock.seek(clock, t);
        if was_playing {
            for (clip_id, entry) in self.clips.iter() {
                let Some(worker) = &entry.worker else { continue };
                let _ = worker.play(t, self.clip_speed(*clip_id));
            }
        }
        Ok(())
    }

    pub fn set_loop(&mut self, enabled: bool) {
        self.clock.set_loop(enabled);
    }

    pub fn clock_position(&self) -> f64 {
        self.clock.position()
    }

    pub fn is_playing(&self) -> bool {
        self.clock.is_playing()
    }

    /// One iteration of the display-rate render loop.
    pub fn tick(&mut self, clock: &dyn MonotonicClock) -> Result<()> {
        let (t, looped) = self.clock.tick(clock);
        if looped == Some(Looped) {
            for (clip_id, entry) in self.clips.iter() {
                let Some(worker) = &entry.worker else { continue };
                if worker.state() == ClipState::Playing {
                    let _ = worker.seek(0.0);
                    let _ = worker.play(0.0, self.clip_speed(*clip_id));
                }
            }
        }
        match self.prerender_clip {
            Some(clip_id) if self.preview_count == 0 => self.compositor.render_single(clip_id, t),
            _ => self.compositor.render(t),
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.compositor.destroy();
    }
}

/// Errors surfaced by `load_clip` are synchronous per spec §7; this helper
/// exists so callers that don't care about the clip id can ignore it.
pub fn discard_id(r: Result<Uuid>) -> Result<()> {
    r.map(|_| ())
}

#[allow(dead_code)]
fn _assert_err_type(_: KlipError) {}
