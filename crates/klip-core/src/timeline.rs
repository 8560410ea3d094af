// crates/klip-core/src/timeline.rs
//
// The compiled Timeline: a flat, time-indexed segment list with per-clip
// viewports. Produced only by `timeline::compiler::compile`; everything
// here is a plain data holder plus the read-only queries the Player and
// PreRenderer run against it.

use uuid::Uuid;

/// Axis-aligned rectangle on the canvas, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// A clip's contribution to a segment: its viewport, source window, and
/// speed. `in`/`out` are source-time seconds; `out = in + duration_s *
/// speed` (see design notes — duration is timeline duration, not source
/// duration).
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub clip_id: Uuid,
    pub track_id: Uuid,
    pub viewport: Viewport,
    pub in_s: f64,
    pub out_s: f64,
    pub speed: f64,
    /// This placement's own timeline extent, used by `activePlacements` to
    /// compute local source time relative to the *placement*, not the
    /// segment (a clip can span several segments).
    pub timeline_start_s: f64,
}

/// A half-open time interval `[start, end)` during which the set of active
/// placements is constant.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutSegment {
    pub start: f64,
    pub end: f64,
    pub placements: Vec<Placement>,
}

/// The compiled, flat representation of a Project's temporal/spatial
/// layout. Segments are sorted by `start`, contiguous, and non-overlapping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Timeline {
    pub segments: Vec<LayoutSegment>,
    pub duration: f64,
    pub canvas: crate::model::Canvas,
}

/// A placement together with the local source time resolved for a specific
/// query instant `t`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivePlacement<'a> {
    pub placement: &'a Placement,
    pub local_time_s: f64,
}

impl Timeline {
    /// Binary search for the segment containing `t`. Half-open; `None`
    /// outside `[0, duration)`.
    pub fn segment_at(&self, t: f64) -> Option<&LayoutSegment> {
        let idx = self
            .segments
            .binary_search_by(|seg| {
                if t < seg.start {
                    std::cmp::Ordering::Greater
                } else if t >= seg.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()?;
        self.segments.get(idx)
    }

    /// Placements active at `t`, each annotated with the local source time
    /// `in + (t - timelineStart) * speed`.
    pub fn active_placements(&self, t: f64) -> Vec<ActivePlacement<'_>> {
        match self.segment_at(t) {
            Some(seg) => seg
                .placements
                .iter()
                .map(|p| ActivePlacement {
                    placement: p,
                    local_time_s: p.in_s + (t - p.timeline_start_s) * p.speed,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Placements active anywhere in `[a, b)`, deduplicated by clip id,
    /// preserving first-seen order. Used to decide what to pre-buffer.
    pub fn placements_in_range(&self, a: f64, b: f64) -> Vec<&Placement> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for seg in &self.segments {
            if seg.end <= a || seg.start >= b {
                continue;
            }
            for p in &seg.placements {
                if seen.insert(p.clip_id) {
                    out.push(p);
                }
            }
        }
        out
    }

    /// The earliest segment boundary strictly greater than `t`, annotated
    /// with the clips starting and ending at that instant (clips present in
    /// the following segment but not the preceding one, and vice versa).
    pub fn next_transition(&self, t: f64) -> Option<Transition> {
        let idx = self.segments.iter().position(|seg| seg.start > t)?;
        let next = &self.segments[idx];
        let prev_placements: &[Placement] = match idx.checked_sub(1) {
            Some(i) if self.segments[i].end == next.start => &self.segments[i].placements,
            _ => &[],
        };
        let prev_ids: std::collections::HashSet<Uuid> =
            prev_placements.iter().map(|p| p.clip_id).collect();
        let next_ids: std::collections::HashSet<Uuid> =
            next.placements.iter().map(|p| p.clip_id).collect();

        Some(Transition {
            at: next.start,
            starting: next_ids.difference(&prev_ids).copied().collect(),
            ending: prev_ids.difference(&next_ids).copied().collect(),
        })
    }
}

/// A segment boundary annotated with which clips start/end there. A clip
/// whose placement spans the boundary unchanged appears in neither list.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub at: f64,
    pub starting: Vec<Uuid>,
    pub ending: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement(clip_id: Uuid, timeline_start_s: f64) -> Placement {
        Placement {
            clip_id,
            track_id: Uuid::new_v4(),
            viewport: Viewport { x: 0, y: 0, w: 10, h: 10 },
            in_s: 0.0,
            out_s: 1.0,
            speed: 1.0,
            timeline_start_s,
        }
    }

    #[test]
    fn next_transition_reports_clip_starting_and_ending_at_the_boundary() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let timeline = Timeline {
            segments: vec![
                LayoutSegment { start: 0.0, end: 2.0, placements: vec![placement(a, 0.0)] },
                LayoutSegment { start: 2.0, end: 4.0, placements: vec![placement(b, 2.0)] },
            ],
            duration: 4.0,
            canvas: crate::model::Canvas { width: 100, height: 100 },
        };

        let t = timeline.next_transition(0.0).unwrap();
        assert_eq!(t.at, 2.0);
        assert_eq!(t.starting, vec![b]);
        assert_eq!(t.ending, vec![a]);

        assert!(timeline.next_transition(2.0).is_none());
    }

    #[test]
    fn next_transition_omits_a_clip_whose_placement_spans_the_boundary() {
        let shared = Uuid::new_v4();
        let only_second = Uuid::new_v4();
        let timeline = Timeline {
            segments: vec![
                LayoutSegment { start: 0.0, end: 2.0, placements: vec![placement(shared, 0.0)] },
                LayoutSegment {
                    start: 2.0,
                    end: 4.0,
                    placements: vec![placement(shared, 0.0), placement(only_second, 2.0)],
                },
            ],
            duration: 4.0,
            canvas: crate::model::Canvas { width: 100, height: 100 },
        };

        let t = timeline.next_transition(0.0).unwrap();
        assert_eq!(t.starting, vec![only_second]);
        assert!(t.ending.is_empty());
    }
}
