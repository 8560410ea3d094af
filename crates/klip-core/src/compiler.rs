// crates/klip-core/src/compiler.rs
//
// TimelineCompiler: a pure function, Project -> Timeline. No I/O, no
// channels, no failure mode — malformed input (dangling ids, empty groups)
// just yields fewer placements, never an error. Linear scans throughout;
// real timelines here are a handful of tracks and clips, so there's no
// payoff in an interval tree the way there might be for velocut's own
// `add_to_timeline` track-row search.

use crate::model::{Canvas, Group, Layout, Member, Project};
use crate::timeline::{LayoutSegment, Placement, Timeline, Viewport};
use uuid::Uuid;

struct ClipInfo {
    clip_id: Uuid,
    track_id: Uuid,
    viewport: Viewport,
    timeline_start: f64,
    timeline_end: f64,
    in_s: f64,
    speed: f64,
}

/// Compile a Project into a flat Timeline for the given canvas.
pub fn compile(project: &Project, canvas: Canvas) -> Timeline {
    let root = match project.root() {
        Some(g) => g,
        None => {
            return Timeline {
                segments: Vec::new(),
                duration: 0.0,
                canvas,
            }
        }
    };

    let clip_infos = collect_clip_infos(project, root, canvas);
    let duration = clip_infos
        .iter()
        .map(|c| c.timeline_end)
        .fold(0.0_f64, f64::max);

    let mut boundaries: Vec<f64> = vec![0.0];
    for c in &clip_infos {
        boundaries.push(c.timeline_start);
        boundaries.push(c.timeline_end);
    }
    boundaries.sort_by(|a, b| a.partial_cmp(b).unwrap());
    boundaries.dedup_by(|a, b| (*a - *b).abs() < 1e-9);

    let mut segments = Vec::new();
    for window in boundaries.windows(2) {
        let (a, b) = (window[0], window[1]);
        if b <= a {
            continue;
        }
        let placements: Vec<Placement> = clip_infos
            .iter()
            .filter(|c| c.timeline_start < b && c.timeline_end > a)
            .map(|c| Placement {
                clip_id: c.clip_id,
                track_id: c.track_id,
                viewport: c.viewport,
                in_s: c.in_s,
                out_s: c.in_s + (c.timeline_end - c.timeline_start) * c.speed,
                speed: c.speed,
                timeline_start_s: c.timeline_start,
            })
            .collect();
        if placements.is_empty() {
            continue;
        }
        segments.push(LayoutSegment {
            start: a,
            end: b,
            placements,
        });
    }

    Timeline {
        segments,
        duration,
        canvas,
    }
}

fn collect_clip_infos(project: &Project, root: &Group, canvas: Canvas) -> Vec<ClipInfo> {
    let mut out = Vec::new();
    walk_group(project, root, full_canvas_viewport(canvas), canvas, &mut out);
    out
}

fn full_canvas_viewport(canvas: Canvas) -> Viewport {
    Viewport {
        x: 0,
        y: 0,
        w: canvas.width as i32,
        h: canvas.height as i32,
    }
}

/// Recursively resolve member viewports for one group, pushing ClipInfos
/// for any member that resolves to a Track. Nested groups recurse with
/// their member's own viewport as the new bounding rect (so a grid cell
/// containing a sub-group gets subdivided further only if that sub-group
/// has its own layout; with no layout, stacked semantics give every member
/// the full bounding rect it was handed).
fn walk_group(
    project: &Project,
    group: &Group,
    bounds: Viewport,
    canvas: Canvas,
    out: &mut Vec<ClipInfo>,
) {
    match &group.layout {
        Some(Layout::Absolute) => {
            for am in &group.absolute_members {
                let vp = absolute_viewport(bounds, am.x, am.y, am.w, am.h);
                resolve_member(project, &am.member, vp, canvas, out);
            }
        }
        Some(Layout::Grid {
            cols,
            rows,
            gap,
            padding,
        }) => {
            let cells = grid_cells(bounds, *cols, *rows, *gap, *padding);
            for (member, vp) in group.members.iter().zip(cells.into_iter()) {
                resolve_member(project, member, vp, canvas, out);
            }
        }
        Some(Layout::Stacked) | None => {
            for member in &group.members {
                resolve_member(project, member, bounds, canvas, out);
            }
        }
    }
}

fn resolve_member(
    project: &Project,
    member: &Member,
    viewport: Viewport,
    canvas: Canvas,
    out: &mut Vec<ClipInfo>,
) {
    match member {
        Member::Void => {}
        Member::Group { id } => {
            if let Some(g) = project.group(*id) {
                walk_group(project, g, viewport, canvas, out);
            }
        }
        Member::Track { id } => {
            if let Some(track) = project.track(*id) {
                for clip in &track.clips {
                    out.push(ClipInfo {
                        clip_id: clip.id,
                        track_id: track.id,
                        viewport,
                        timeline_start: clip.offset_s,
                        timeline_end: clip.timeline_end_s(),
                        in_s: clip.source_offset_s,
                        speed: clip.speed,
                    });
                }
            }
        }
    }
}

fn absolute_viewport(bounds: Viewport, x: f64, y: f64, w: f64, h: f64) -> Viewport {
    Viewport {
        x: bounds.x + (x * bounds.w as f64).round() as i32,
        y: bounds.y + (y * bounds.h as f64).round() as i32,
        w: (w * bounds.w as f64).round() as i32,
        h: (h * bounds.h as f64).round() as i32,
    }
}

/// Grid cells across `bounds`, in row-major order, skipping gap/padding.
/// Void members still consume a cell — callers zip members 1:1 against
/// this list.
fn grid_cells(bounds: Viewport, cols: u32, rows: u32, gap: f64, padding: f64) -> Vec<Viewport> {
    if cols == 0 || rows == 0 {
        return Vec::new();
    }
    let pad_x = (bounds.w as f64 * padding).round();
    let pad_y = (bounds.h as f64 * padding).round();
    let avail_w = bounds.w as f64 - 2.0 * pad_x;
    let avail_h = bounds.h as f64 - 2.0 * pad_y;
    let gap_x = bounds.w as f64 * gap;
    let gap_y = bounds.h as f64 * gap;

    let cell_w = (avail_w - gap_x * (cols as f64 - 1.0)) / cols as f64;
    let cell_h = (avail_h - gap_y * (rows as f64 - 1.0)) / rows as f64;

    let mut cells = Vec::with_capacity((cols * rows) as usize);
    for row in 0..rows {
        for col in 0..cols {
            let x = bounds.x as f64 + pad_x + col as f64 * (cell_w + gap_x);
            let y = bounds.y as f64 + pad_y + row as f64 * (cell_h + gap_y);
            cells.push(Viewport {
                x: x.round() as i32,
                y: y.round() as i32,
                w: cell_w.round() as i32,
                h: cell_h.round() as i32,
            });
        }
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AudioEffect, Canvas, Clip, ClipSource, Group, Layout, Member, Project, Track};
    use uuid::Uuid;

    fn track(id: Uuid, clips: Vec<Clip>) -> Track {
        Track {
            id,
            clips,
            audio_pipeline: Vec::<AudioEffect>::new(),
        }
    }

    fn clip(id: Uuid, offset_s: f64, duration_s: f64) -> Clip {
        Clip {
            id,
            source: ClipSource::Local {
                blob_id: "x".into(),
            },
            offset_s,
            source_offset_s: 0.0,
            duration_s,
            speed: 1.0,
            label: None,
        }
    }

    // E1: 2x2 grid, three clips.
    #[test]
    fn grid_2x2_three_clips() {
        let (t0, t1, t2, t3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (c0, c1, c2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let root = Uuid::new_v4();

        let project = Project {
            version: 1,
            title: "t".into(),
            canvas: Canvas {
                width: 640,
                height: 360,
            },
            tracks: vec![
                track(t0, vec![clip(c0, 0.0, 10.0)]),
                track(t1, vec![clip(c1, 0.0, 15.0)]),
                track(t2, vec![clip(c2, 5.0, 10.0)]),
                track(t3, vec![]),
            ],
            groups: vec![Group {
                id: root,
                layout: Some(Layout::Grid {
                    cols: 2,
                    rows: 2,
                    gap: 0.0,
                    padding: 0.0,
                }),
                members: vec![
                    Member::Track { id: t0 },
                    Member::Track { id: t1 },
                    Member::Track { id: t2 },
                    Member::Track { id: t3 },
                ],
                absolute_members: vec![],
            }],
            root_group: Some(root),
        };

        let timeline = compile(&project, project.canvas);
        assert_eq!(timeline.duration, 15.0);
        assert_eq!(timeline.segments.len(), 3);

        assert_eq!(timeline.segments[0].start, 0.0);
        assert_eq!(timeline.segments[0].end, 5.0);
        let ids: Vec<Uuid> = timeline.segments[0].placements.iter().map(|p| p.clip_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&c0) && ids.contains(&c1));

        assert_eq!(timeline.segments[1].start, 5.0);
        assert_eq!(timeline.segments[1].end, 10.0);
        assert_eq!(timeline.segments[1].placements.len(), 3);

        assert_eq!(timeline.segments[2].start, 10.0);
        assert_eq!(timeline.segments[2].end, 15.0);
        let ids: Vec<Uuid> = timeline.segments[2].placements.iter().map(|p| p.clip_id).collect();
        assert!(ids.contains(&c1) && ids.contains(&c2) && !ids.contains(&c0));

        let p0 = timeline.segments[0]
            .placements
            .iter()
            .find(|p| p.clip_id == c0)
            .unwrap();
        assert_eq!(p0.viewport, Viewport { x: 0, y: 0, w: 320, h: 180 });
        let p1 = timeline.segments[0]
            .placements
            .iter()
            .find(|p| p.clip_id == c1)
            .unwrap();
        assert_eq!(p1.viewport, Viewport { x: 320, y: 0, w: 320, h: 180 });
        let p2 = timeline.segments[1]
            .placements
            .iter()
            .find(|p| p.clip_id == c2)
            .unwrap();
        assert_eq!(p2.viewport, Viewport { x: 0, y: 180, w: 320, h: 180 });
    }

    // E2: void cell shifts the grid assignment.
    #[test]
    fn grid_void_cell_shifts_assignment() {
        let (t0, t1) = (Uuid::new_v4(), Uuid::new_v4());
        let (c0, c1) = (Uuid::new_v4(), Uuid::new_v4());
        let root = Uuid::new_v4();

        let project = Project {
            version: 1,
            title: "t".into(),
            canvas: Canvas {
                width: 640,
                height: 360,
            },
            tracks: vec![
                track(t0, vec![clip(c0, 0.0, 10.0)]),
                track(t1, vec![clip(c1, 0.0, 10.0)]),
            ],
            groups: vec![Group {
                id: root,
                layout: Some(Layout::Grid {
                    cols: 2,
                    rows: 2,
                    gap: 0.0,
                    padding: 0.0,
                }),
                members: vec![
                    Member::Track { id: t0 },
                    Member::Void,
                    Member::Track { id: t1 },
                ],
                absolute_members: vec![],
            }],
            root_group: Some(root),
        };

        let timeline = compile(&project, project.canvas);
        let p1 = timeline.segments[0]
            .placements
            .iter()
            .find(|p| p.clip_id == c1)
            .unwrap();
        assert_eq!(p1.viewport, Viewport { x: 0, y: 180, w: 320, h: 180 });
    }

    // E3: stacked layout gives every member the full canvas.
    #[test]
    fn stacked_layout_full_canvas() {
        let (t0, t1) = (Uuid::new_v4(), Uuid::new_v4());
        let (c0, c1) = (Uuid::new_v4(), Uuid::new_v4());
        let root = Uuid::new_v4();

        let project = Project {
            version: 1,
            title: "t".into(),
            canvas: Canvas {
                width: 800,
                height: 600,
            },
            tracks: vec![
                track(t0, vec![clip(c0, 0.0, 5.0)]),
                track(t1, vec![clip(c1, 0.0, 5.0)]),
            ],
            groups: vec![Group {
                id: root,
                layout: None,
                members: vec![Member::Track { id: t0 }, Member::Track { id: t1 }],
                absolute_members: vec![],
            }],
            root_group: Some(root),
        };

        let timeline = compile(&project, project.canvas);
        for p in &timeline.segments[0].placements {
            assert_eq!(p.viewport, Viewport { x: 0, y: 0, w: 800, h: 600 });
        }
    }

    // E4: sequential clips on one track resolve to disjoint active sets.
    #[test]
    fn sequential_clips_one_track() {
        let t0 = Uuid::new_v4();
        let (c0a, c0b) = (Uuid::new_v4(), Uuid::new_v4());
        let root = Uuid::new_v4();

        let project = Project {
            version: 1,
            title: "t".into(),
            canvas: Canvas {
                width: 320,
                height: 180,
            },
            tracks: vec![track(
                t0,
                vec![clip(c0a, 0.0, 5.0), clip(c0b, 5.0, 5.0)],
            )],
            groups: vec![Group {
                id: root,
                layout: None,
                members: vec![Member::Track { id: t0 }],
                absolute_members: vec![],
            }],
            root_group: Some(root),
        };

        let timeline = compile(&project, project.canvas);
        let at2 = timeline.active_placements(2.0);
        assert_eq!(at2.len(), 1);
        assert_eq!(at2[0].placement.clip_id, c0a);

        let at7 = timeline.active_placements(7.0);
        assert_eq!(at7.len(), 1);
        assert_eq!(at7[0].placement.clip_id, c0b);
    }

    // Universal property 1: segments are sorted, contiguous, non-overlapping.
    #[test]
    fn segments_are_contiguous_and_sorted() {
        let t0 = Uuid::new_v4();
        let (c0, c1) = (Uuid::new_v4(), Uuid::new_v4());
        let root = Uuid::new_v4();
        let project = Project {
            version: 1,
            title: "t".into(),
            canvas: Canvas {
                width: 100,
                height: 100,
            },
            tracks: vec![track(t0, vec![clip(c0, 0.0, 3.0), clip(c1, 3.0, 4.0)])],
            groups: vec![Group {
                id: root,
                layout: None,
                members: vec![Member::Track { id: t0 }],
                absolute_members: vec![],
            }],
            root_group: Some(root),
        };
        let timeline = compile(&project, project.canvas);
        for w in timeline.segments.windows(2) {
            assert!(w[0].end <= w[1].start);
            assert!(w[0].start < w[0].end);
        }
    }
}
