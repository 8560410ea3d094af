// crates/klip-core/src/model.rs
//
// The Project data model: what a host hands to TimelineCompiler::compile.
// Read-only to the core — the host owns mutation and produces a new
// snapshot on every edit.
//
// All numeric parameters that cross the serialised boundary (opacity, gain,
// pan, speed, x, y, width, height, gap, padding) are integers scaled by 100
// on the wire (50 = 0.5). `ingest::unscale` is the single conversion point;
// every type below stores the already-unscaled f64/f32.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Output framebuffer dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

/// Where a clip's source bytes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClipSource {
    /// An externally hosted encoded media blob, referenced by rkey/uri.
    Stem { rkey: String },
    /// A locally addressable blob (already resident, e.g. a recording).
    Local { blob_id: String },
}

/// A placement of a source on a Track with offset and duration in timeline
/// time, all stored in seconds (already unscaled from the wire's
/// milliseconds/scaled-integers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: Uuid,
    pub source: ClipSource,
    /// Start time on the timeline. Wire units are whole milliseconds
    /// (`offset_ms`); stored internally in seconds.
    #[serde(rename = "offset_ms", with = "crate::ingest::millis")]
    pub offset_s: f64,
    /// Start time within the source. Wire units are whole milliseconds
    /// (`source_offset_ms`, default 0); stored internally in seconds.
    #[serde(rename = "source_offset_ms", with = "crate::ingest::millis", default)]
    pub source_offset_s: f64,
    /// Duration on the timeline. Wire units are whole milliseconds
    /// (`duration_ms`); `speed > 0`; source consumption is `duration_s *
    /// speed`, not `duration_s` (see design notes).
    #[serde(rename = "duration_ms", with = "crate::ingest::millis")]
    pub duration_s: f64,
    /// Wire units are `floor(speed * 100)` (100 = 1.0x), default 100.
    #[serde(with = "crate::ingest::scaled100", default = "default_speed")]
    pub speed: f64,
    /// Purely descriptive; never read by the core.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_speed() -> f64 {
    1.0
}

impl Clip {
    pub fn timeline_end_s(&self) -> f64 {
        self.offset_s + self.duration_s
    }
}

/// A per-track audio effect. `Custom` passes its `params` through unread,
/// per the deserialiser rule that opaque custom-effect params are accepted
/// and forwarded rather than validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudioEffect {
    /// Wire `value` is `floor(gain * 100)` (100 = unity); stored internally
    /// as a linear multiplier.
    Gain {
        #[serde(with = "crate::ingest::scaled100_f32")]
        value: f32,
    },
    /// Wire `value` is `floor(pan * 100)` (-100..=100); stored internally
    /// as a ratio in -1.0..=1.0.
    Pan {
        #[serde(with = "crate::ingest::scaled100_f32")]
        value: f32,
    },
    Custom {
        #[serde(default)]
        params: serde_json::Value,
    },
}

/// A Track is an ordered list of non-overlapping-by-convention clips (the
/// schema permits overlap; see design notes on draw order) plus its audio
/// pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: Uuid,
    #[serde(default)]
    pub clips: Vec<Clip>,
    #[serde(default)]
    pub audio_pipeline: Vec<AudioEffect>,
}

/// A reference inside a Group's member list: a Track, a nested Group, or an
/// empty cell that still consumes a layout slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Member {
    Track { id: Uuid },
    Group { id: Uuid },
    Void,
}

/// Grid/stacked/absolute layout rules, mapping a Group's members to
/// viewports on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layout {
    Grid {
        cols: u32,
        rows: u32,
        /// Wire units are `floor(gap * 100)`, default 0.
        #[serde(with = "crate::ingest::scaled100", default)]
        gap: f64,
        /// Wire units are `floor(padding * 100)`, default 0.
        #[serde(with = "crate::ingest::scaled100", default)]
        padding: f64,
    },
    Stacked,
    Absolute,
}

/// An absolute-layout member carries its own normalised rectangle
/// (fractions of the canvas, 0.0..=1.0) alongside the member reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsoluteMember {
    #[serde(flatten)]
    pub member: Member,
    /// Wire units are `floor(x * 100)` fractions of the bounding rect.
    #[serde(with = "crate::ingest::scaled100", default)]
    pub x: f64,
    #[serde(with = "crate::ingest::scaled100", default)]
    pub y: f64,
    #[serde(with = "crate::ingest::scaled100", default)]
    pub w: f64,
    #[serde(with = "crate::ingest::scaled100", default)]
    pub h: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    #[serde(default)]
    pub layout: Option<Layout>,
    /// Plain member refs, used by grid/stacked layouts.
    #[serde(default)]
    pub members: Vec<Member>,
    /// Present only when `layout == Absolute`; one rect per member.
    #[serde(default)]
    pub absolute_members: Vec<AbsoluteMember>,
}

/// Schema version tag. Unknown top-level Project fields are ignored on
/// deserialise (forward-compat); unknown discriminator tags inside closed
/// enums (`ClipSource`, `AudioEffect`, `Layout`) are rejected by serde's
/// default behaviour for `#[serde(tag = "kind")]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub version: u32,
    pub title: String,
    pub canvas: Canvas,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub root_group: Option<Uuid>,
}

impl Project {
    pub fn track(&self, id: Uuid) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn group(&self, id: Uuid) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// The group to compile from: the explicit `rootGroup`, falling back to
    /// the first group in document order.
    pub fn root(&self) -> Option<&Group> {
        match self.root_group {
            Some(id) => self.group(id),
            None => self.groups.first(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // spec §6: clip offset/sourceOffset/duration travel as whole
    // milliseconds; speed travels as floor(speed * 100).
    #[test]
    fn clip_deserializes_scaled_wire_fields_into_seconds_and_ratios() {
        let json = serde_json::json!({
            "id": Uuid::nil(),
            "source": {"kind": "local", "blob_id": "b"},
            "offset_ms": 5000,
            "duration_ms": 10000,
            "speed": 150,
        });
        let clip: Clip = serde_json::from_value(json).unwrap();
        assert_eq!(clip.offset_s, 5.0);
        assert_eq!(clip.source_offset_s, 0.0);
        assert_eq!(clip.duration_s, 10.0);
        assert_eq!(clip.speed, 1.5);
    }

    #[test]
    fn audio_effect_gain_and_pan_unscale_from_wire() {
        let json = serde_json::json!({"kind": "gain", "value": 50});
        let gain: AudioEffect = serde_json::from_value(json).unwrap();
        assert_eq!(gain, AudioEffect::Gain { value: 0.5 });

        let json = serde_json::json!({"kind": "pan", "value": -100});
        let pan: AudioEffect = serde_json::from_value(json).unwrap();
        assert_eq!(pan, AudioEffect::Pan { value: -1.0 });
    }

    // spec §6: opaque custom-effect params are accepted and passed through
    // unread rather than validated against a schema.
    #[test]
    fn audio_effect_custom_passes_through_opaque_params() {
        let json = serde_json::json!({"kind": "custom", "params": {"whatever": 1}});
        let effect: AudioEffect = serde_json::from_value(json).unwrap();
        match effect {
            AudioEffect::Custom { params } => assert_eq!(params["whatever"], 1),
            _ => panic!("expected Custom"),
        }
    }

    // spec §6: the deserialiser rejects unknown discriminator tags where a
    // closed set is expected.
    #[test]
    fn unknown_discriminator_tag_is_rejected() {
        let json = serde_json::json!({"kind": "reverb", "value": 10});
        let result: std::result::Result<AudioEffect, _> = serde_json::from_value(json);
        assert!(result.is_err());
    }

    #[test]
    fn grid_layout_unscales_gap_and_padding() {
        let json = serde_json::json!({"kind": "grid", "cols": 2, "rows": 2, "gap": 5, "padding": 10});
        let layout: Layout = serde_json::from_value(json).unwrap();
        match layout {
            Layout::Grid { gap, padding, .. } => {
                assert_eq!(gap, 0.05);
                assert_eq!(padding, 0.1);
            }
            _ => panic!("expected Grid"),
        }
    }

    // Unknown top-level Project fields are forward-compat no-ops.
    #[test]
    fn project_ignores_unknown_top_level_fields() {
        let json = serde_json::json!({
            "title": "t",
            "canvas": {"width": 640, "height": 360},
            "futureField": "whatever-a-newer-host-writes",
        });
        let project: Project = serde_json::from_value(json).unwrap();
        assert_eq!(project.title, "t");
        assert_eq!(project.version, 0);
        assert!(project.tracks.is_empty());
    }
}
