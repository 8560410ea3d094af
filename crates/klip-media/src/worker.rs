// crates/klip-media/src/worker.rs
//
// PlaybackWorker: one dedicated thread per clip, owning one ClipDecoder and
// one FrameBuffer. Lifecycle commands (`load`/`play`/`pause`/`seek`/
// `destroy`) are message-passed in over a bounded command channel; decoded
// frames are pushed out over a bounded frame channel with transfer
// semantics — the worker never retains a frame once it has been sent.
//
// Grounded on the command-channel-plus-dedicated-thread shape of the
// teacher's single shared worker, generalized here into one thread per
// pooled clip slot rather than one shared thread multiplexing every clip.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use klip_core::ports::FrameData;
use klip_core::{KlipError, Result};

use crate::buffer::FrameBuffer;
use crate::decode::ClipDecoder;
use crate::probe::{probe_duration, probe_video_config};

pub const BUFFER_AHEAD_SECONDS: f64 = 1.0;
pub const BUFFER_AHEAD_FRAMES: usize = 10;
pub const BUFFER_MAX_FRAMES: usize = 30;
pub const DECODE_TIMEOUT: Duration = Duration::from_secs(5);
const TRIM_RETAIN_SECONDS: f64 = 0.5;
/// Poll interval for the stream loop when idle (not Playing) — keeps the
/// worker thread from spinning a full core while waiting on a command.
const IDLE_POLL: Duration = Duration::from_millis(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Seeking,
}

enum Command {
    Load {
        path: PathBuf,
        reply: Sender<Result<f64>>,
    },
    Play {
        start_s: f64,
        speed: f64,
    },
    Pause,
    Seek {
        t_s: f64,
        reply: Sender<Result<()>>,
    },
    /// Discard the loaded clip and reset the decoder, without tearing down
    /// the thread — what the pool sends before a worker re-enters the free
    /// list (spec §5: "release() resets the worker (destroy load, reset
    /// decoder)").
    Reset {
        reply: Sender<Result<()>>,
    },
    Destroy,
}

/// The PlaybackWorker contract as seen by `klip-player`'s pool and render
/// loop. Kept as a trait (object-safe, `Box<dyn ...>`-able) so Player-level
/// transport tests can substitute a synthetic worker that advances media
/// time deterministically instead of spinning up a real ffmpeg decode
/// thread — grounded on the same ports/adapters split `klip-core::ports`
/// uses for `CompositorPort`/`Muxer`/`RecordStore`.
pub trait PlaybackWorkerPort: Send {
    fn state(&self) -> ClipState;
    fn load(&self, path: PathBuf) -> Result<f64>;
    fn play(&self, start_s: f64, speed: f64) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn seek(&self, t_s: f64) -> Result<()>;
    /// Discard the loaded clip and reset the decoder, leaving the worker
    /// `Idle` and ready to `load` a different clip. Blocks until the worker
    /// thread has actually processed it, so a caller that immediately
    /// returns the worker to a pool can't race the thread's own state
    /// transitions.
    fn reset(&self) -> Result<()>;
    fn frames_rx(&self) -> Receiver<FrameData>;
    fn destroy(self: Box<Self>);
    /// Downcast hook so test doubles can expose extra inspection methods
    /// (transition logs, call counts) that the trait itself has no reason
    /// to carry.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Handle to a running PlaybackWorker thread. Dropping the handle without
/// calling `destroy` leaves the thread running — teardown is explicit, not
/// destructor-driven, so callers control exactly when the decoder closes.
pub struct PlaybackWorkerHandle {
    cmd_tx: Sender<Command>,
    pub frames_rx: Receiver<FrameData>,
    join: Option<JoinHandle<()>>,
    state: Arc<std::sync::Mutex<ClipState>>,
}

impl PlaybackWorkerHandle {
    pub fn spawn() -> Self {
        let (cmd_tx, cmd_rx) = bounded::<Command>(8);
        let (frame_tx, frame_rx) = bounded::<FrameData>(BUFFER_MAX_FRAMES);
        let state = Arc::new(std::sync::Mutex::new(ClipState::Idle));
        let state_thread = state.clone();

        let join = thread::spawn(move || run(cmd_rx, frame_tx, state_thread));

        PlaybackWorkerHandle {
            cmd_tx,
            frames_rx: frame_rx,
            join: Some(join),
            state,
        }
    }

    pub fn state(&self) -> ClipState {
        *self.state.lock().unwrap()
    }

    /// Open `path`, probe its duration, and report it back. Blocks the
    /// caller until the worker thread has opened the decoder.
    pub fn load(&self, path: PathBuf) -> Result<f64> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(Command::Load {
            path,
            reply: reply_tx,
        })?;
        self.await_reply(reply_rx)
    }

    pub fn play(&self, start_s: f64, speed: f64) -> Result<()> {
        self.send(Command::Play { start_s, speed })
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    /// Seek to `t_s`. Blocks until the worker has cleared its buffer, reset
    /// the decoder, and refilled up to `t_s + BUFFER_AHEAD_SECONDS`.
    pub fn seek(&self, t_s: f64) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(Command::Seek {
            t_s,
            reply: reply_tx,
        })?;
        self.await_reply(reply_rx)
    }

    pub fn reset(&self) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(Command::Reset { reply: reply_tx })?;
        self.await_reply(reply_rx)
    }

    pub fn destroy(mut self) {
        let _ = self.cmd_tx.send(Command::Destroy);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| KlipError::Other(anyhow::anyhow!("worker thread gone")))
    }

    fn await_reply<T>(&self, reply_rx: Receiver<Result<T>>) -> Result<T> {
        reply_rx
            .recv()
            .map_err(|_| KlipError::Other(anyhow::anyhow!("worker thread gone")))?
    }
}

impl PlaybackWorkerPort for PlaybackWorkerHandle {
    fn state(&self) -> ClipState {
        PlaybackWorkerHandle::state(self)
    }
    fn load(&self, path: PathBuf) -> Result<f64> {
        PlaybackWorkerHandle::load(self, path)
    }
    fn play(&self, start_s: f64, speed: f64) -> Result<()> {
        PlaybackWorkerHandle::play(self, start_s, speed)
    }
    fn pause(&self) -> Result<()> {
        PlaybackWorkerHandle::pause(self)
    }
    fn seek(&self, t_s: f64) -> Result<()> {
        PlaybackWorkerHandle::seek(self, t_s)
    }
    fn reset(&self) -> Result<()> {
        PlaybackWorkerHandle::reset(self)
    }
    fn frames_rx(&self) -> Receiver<FrameData> {
        self.frames_rx.clone()
    }
    fn destroy(self: Box<Self>) {
        PlaybackWorkerHandle::destroy(*self)
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct WorkerCtx {
    decoder: Option<ClipDecoder>,
    buffer: FrameBuffer,
    path: Option<PathBuf>,
    duration_s: f64,
    start_media_s: f64,
    start_wall: Instant,
    speed: f64,
    last_sent_ts_us: Option<i64>,
    pending_decode_since: Option<Instant>,
    out_w: u32,
    out_h: u32,
}

impl WorkerCtx {
    fn new() -> Self {
        WorkerCtx {
            decoder: None,
            buffer: FrameBuffer::new(BUFFER_MAX_FRAMES),
            path: None,
            duration_s: 0.0,
            start_media_s: 0.0,
            start_wall: Instant::now(),
            speed: 1.0,
            last_sent_ts_us: None,
            pending_decode_since: None,
            out_w: 640,
            out_h: 360,
        }
    }

    fn media_now(&self) -> f64 {
        self.start_media_s + self.start_wall.elapsed().as_secs_f64() * self.speed
    }

    /// Reset the decoder to a keyframe at or before `t_s`, clear the
    /// buffer, and refill it up to `BUFFER_AHEAD_SECONDS` past `t_s`. A
    /// decoder that has just been reset is "not ready" until the first
    /// keyframe passes through `burn_to_pts`; delta packets before that are
    /// discarded by ffmpeg itself.
    fn reopen_at(&mut self, t_s: f64) -> Result<()> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| KlipError::Other(anyhow::anyhow!("no clip loaded")))?;
        let mut decoder = ClipDecoder::open(&path, t_s, self.out_w, self.out_h)?;
        let target_pts = decoder.ts_to_pts(t_s);
        decoder.burn_to_pts(target_pts);

        self.decoder = Some(decoder);
        self.buffer.clear();
        self.last_sent_ts_us = None;
        self.pending_decode_since = None;
        self.buffer_ahead(t_s)
    }

    /// Decode forward, filling the buffer up to `BUFFER_AHEAD_FRAMES`
    /// frames or `media_t + BUFFER_AHEAD_SECONDS`, whichever comes first.
    /// A decode that produces nothing for `DECODE_TIMEOUT` surfaces as a
    /// `DecodeTimeout`; the caller logs it and tries again next tick.
    fn buffer_ahead(&mut self, media_t: f64) -> Result<()> {
        let target = media_t + BUFFER_AHEAD_SECONDS;
        loop {
            let buffered_to = self
                .buffer
                .latest_timestamp_us()
                .map(|us| us as f64 / 1_000_000.0)
                .unwrap_or(media_t - 1.0);
            if self.buffer.len() >= BUFFER_AHEAD_FRAMES || buffered_to >= target {
                self.pending_decode_since = None;
                return Ok(());
            }
            let Some(decoder) = &mut self.decoder else {
                return Ok(());
            };
            match decoder.next_frame() {
                Some(frame) => {
                    self.pending_decode_since = None;
                    self.buffer.insert(frame);
                }
                None => {
                    // Could be real EOF or a transient gap; only escalate to
                    // DecodeTimeout once we've been stuck here a while.
                    let since = *self.pending_decode_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= DECODE_TIMEOUT {
                        return Err(KlipError::DecodeTimeout);
                    }
                    return Ok(());
                }
            }
        }
    }
}

fn run(
    cmd_rx: Receiver<Command>,
    frame_tx: Sender<FrameData>,
    state: Arc<std::sync::Mutex<ClipState>>,
) {
    let mut ctx = WorkerCtx::new();
    let set_state = |s: ClipState| *state.lock().unwrap() = s;

    loop {
        let is_playing = matches!(*state.lock().unwrap(), ClipState::Playing);

        let cmd = if is_playing {
            match cmd_rx.try_recv() {
                Ok(c) => Some(c),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match cmd_rx.recv() {
                Ok(c) => Some(c),
                Err(_) => break,
            }
        };

        match cmd {
            Some(Command::Load { path, reply }) => {
                set_state(ClipState::Loading);
                let result = (|| -> Result<f64> {
                    let duration = probe_duration(&path)?;
                    if let Ok(cfg) = probe_video_config(&path) {
                        ctx.out_w = cfg.width;
                        ctx.out_h = cfg.height;
                    }
                    ctx.path = Some(path.clone());
                    ctx.duration_s = duration;
                    ctx.reopen_at(0.0)?;
                    Ok(duration)
                })();
                set_state(if result.is_ok() {
                    ClipState::Ready
                } else {
                    ClipState::Idle
                });
                let _ = reply.send(result);
            }
            Some(Command::Play { start_s, speed }) => {
                ctx.start_media_s = start_s;
                ctx.start_wall = Instant::now();
                ctx.speed = speed;
                set_state(ClipState::Playing);
            }
            Some(Command::Pause) => set_state(ClipState::Paused),
            Some(Command::Seek { t_s, reply }) => {
                let prev = *state.lock().unwrap();
                set_state(ClipState::Seeking);
                let result = ctx.reopen_at(t_s);
                if result.is_ok() {
                    if let Some(frame) = ctx.buffer.frame_at((t_s * 1_000_000.0) as i64) {
                        let _ = frame_tx.send(frame.clone());
                    }
                }
                set_state(if matches!(prev, ClipState::Playing) {
                    ClipState::Playing
                } else {
                    ClipState::Ready
                });
                let _ = reply.send(result);
            }
            Some(Command::Reset { reply }) => {
                ctx.decoder = None;
                ctx.path = None;
                ctx.duration_s = 0.0;
                ctx.start_media_s = 0.0;
                ctx.speed = 1.0;
                ctx.out_w = 640;
                ctx.out_h = 360;
                ctx.buffer.clear();
                ctx.last_sent_ts_us = None;
                ctx.pending_decode_since = None;
                set_state(ClipState::Idle);
                let _ = reply.send(Ok(()));
            }
            Some(Command::Destroy) => {
                set_state(ClipState::Idle);
                return;
            }
            None => {}
        }

        if matches!(*state.lock().unwrap(), ClipState::Playing) {
            if !step_stream_loop(&mut ctx, &frame_tx, &state) {
                // Channel closed: spec §4.3 — the stream loop exits cleanly
                // and the worker goes Idle rather than spinning forever
                // pushing to a receiver nobody will ever drain.
                set_state(ClipState::Idle);
                return;
            }
        } else {
            thread::sleep(IDLE_POLL);
        }
    }
}

/// One iteration of the stream loop, run only while Playing. Returns `false`
/// if the frame channel was found closed, signalling the caller to stop the
/// worker thread.
fn step_stream_loop(
    ctx: &mut WorkerCtx,
    frame_tx: &Sender<FrameData>,
    state: &Arc<std::sync::Mutex<ClipState>>,
) -> bool {
    let media_t = ctx.media_now();

    if ctx.duration_s > 0.0 && media_t >= ctx.duration_s {
        *state.lock().unwrap() = ClipState::Paused;
        return true;
    }

    let media_t_us = (media_t * 1_000_000.0) as i64;
    if let Some(frame) = ctx.buffer.frame_at(media_t_us) {
        if ctx.last_sent_ts_us != Some(frame.timestamp_us) {
            let ts = frame.timestamp_us;
            match frame_tx.send(frame.clone()) {
                Ok(()) => ctx.last_sent_ts_us = Some(ts),
                Err(_) => return false,
            }
        }
    }

    ctx.buffer
        .evict_before(media_t_us, (TRIM_RETAIN_SECONDS * 1_000_000.0) as i64);

    if let Err(KlipError::DecodeTimeout) = ctx.buffer_ahead(media_t) {
        log::warn!(
            target: "klip_media::worker",
            "decode timed out at t={media_t:.3}s, decoder marked not-ready"
        );
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use klip_core::ports::{PixelFormat, Plane};

    fn frame(ts_us: i64) -> FrameData {
        FrameData {
            pixel_format: PixelFormat::Rgba8,
            coded_width: 4,
            coded_height: 4,
            display_width: 4,
            display_height: 4,
            timestamp_us: ts_us,
            duration_us: 0,
            planes: vec![Plane { offset: 0, stride: 16 }],
            bytes: vec![0; 64],
        }
    }

    // spec §4.3: "Channel closed: stream loop exits cleanly; state -> Idle."
    #[test]
    fn step_stream_loop_reports_closed_channel() {
        let mut ctx = WorkerCtx::new();
        ctx.buffer.insert(frame(0));
        ctx.start_media_s = 0.0;
        ctx.start_wall = Instant::now();
        ctx.speed = 1.0;

        let (tx, rx) = bounded::<FrameData>(1);
        drop(rx);
        let state = Arc::new(std::sync::Mutex::new(ClipState::Playing));

        assert!(!step_stream_loop(&mut ctx, &tx, &state));
    }

    #[test]
    fn step_stream_loop_sends_once_per_distinct_frame() {
        let mut ctx = WorkerCtx::new();
        ctx.buffer.insert(frame(0));
        ctx.start_media_s = 0.0;
        ctx.start_wall = Instant::now();
        ctx.speed = 1.0;

        let (tx, rx) = bounded::<FrameData>(4);
        let state = Arc::new(std::sync::Mutex::new(ClipState::Playing));

        assert!(step_stream_loop(&mut ctx, &tx, &state));
        assert!(step_stream_loop(&mut ctx, &tx, &state));
        assert_eq!(rx.try_iter().count(), 1, "same frame should only be pushed once");
    }

    #[test]
    fn step_stream_loop_pauses_past_duration() {
        let mut ctx = WorkerCtx::new();
        ctx.duration_s = 1.0;
        ctx.start_media_s = 2.0;
        ctx.start_wall = Instant::now();
        ctx.speed = 1.0;

        let (tx, _rx) = bounded::<FrameData>(1);
        let state = Arc::new(std::sync::Mutex::new(ClipState::Playing));

        assert!(step_stream_loop(&mut ctx, &tx, &state));
        assert_eq!(*state.lock().unwrap(), ClipState::Paused);
    }
}
