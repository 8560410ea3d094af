// crates/klip-media/src/buffer.rs
//
// FrameBuffer: an ordered, time-keyed buffer of decoded frames with bounded
// size. Owned exclusively by one PlaybackWorker; frames are inserted in
// decode order (which may arrive slightly out of order across B-frames) and
// always read back in timestamp order.

use klip_core::ports::FrameData;

pub struct FrameBuffer {
    frames: Vec<FrameData>,
    max_frames: usize,
}

impl FrameBuffer {
    pub fn new(max_frames: usize) -> Self {
        FrameBuffer {
            frames: Vec::with_capacity(max_frames),
            max_frames,
        }
    }

    /// Insert a frame, keeping the buffer sorted by `timestamp_us`. If the
    /// buffer is at capacity, the oldest frame is dropped first.
    pub fn insert(&mut self, frame: FrameData) {
        let pos = self
            .frames
            .partition_point(|f| f.timestamp_us <= frame.timestamp_us);
        self.frames.insert(pos, frame);
        while self.frames.len() > self.max_frames {
            self.frames.remove(0);
        }
    }

    /// The latest frame with `timestamp_us <= media_t_us`, if any.
    pub fn frame_at(&self, media_t_us: i64) -> Option<&FrameData> {
        let pos = self.frames.partition_point(|f| f.timestamp_us <= media_t_us);
        if pos == 0 {
            None
        } else {
            self.frames.get(pos - 1)
        }
    }

    /// Evict frames older than `media_t_us - retain_us`, always keeping the
    /// single latest frame at or before `media_t_us` even if it falls
    /// outside the retain window, so a small back-seek still has something
    /// to show.
    pub fn evict_before(&mut self, media_t_us: i64, retain_us: i64) {
        let keep_from = media_t_us - retain_us;
        let pinned = self
            .frames
            .iter()
            .rposition(|f| f.timestamp_us <= media_t_us);
        let mut i = 0;
        self.frames.retain(|f| {
            let keep = f.timestamp_us >= keep_from || Some(i) == pinned;
            i += 1;
            keep
        });
    }

    pub fn latest_timestamp_us(&self) -> Option<i64> {
        self.frames.last().map(|f| f.timestamp_us)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use klip_core::ports::{Plane, PixelFormat};

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

    #[test]
    fn frame_at_returns_latest_not_after() {
        let mut buf = FrameBuffer::new(30);
        buf.insert(frame(0));
        buf.insert(frame(1_000_000));
        buf.insert(frame(2_000_000));
        assert_eq!(buf.frame_at(1_500_000).unwrap().timestamp_us, 1_000_000);
        assert_eq!(buf.frame_at(0).unwrap().timestamp_us, 0);
        assert!(buf.frame_at(-1).is_none());
    }

    #[test]
    fn insert_keeps_sorted_order_out_of_order_arrivals() {
        let mut buf = FrameBuffer::new(30);
        buf.insert(frame(2_000_000));
        buf.insert(frame(1_000_000));
        buf.insert(frame(3_000_000));
        assert_eq!(buf.frame_at(1_500_000).unwrap().timestamp_us, 1_000_000);
        assert_eq!(buf.frame_at(2_500_000).unwrap().timestamp_us, 2_000_000);
    }

    #[test]
    fn caps_at_max_frames_dropping_oldest() {
        let mut buf = FrameBuffer::new(3);
        for i in 0..5 {
            buf.insert(frame(i * 1_000_000));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.frame_at(0).map(|f| f.timestamp_us), None);
    }
}
