// crates/klip-media/src/helpers/mod.rs
//
// Internal helper modules for klip-media.
// Not re-exported from lib.rs — these are encode/decode implementation
// details, not part of the public API consumed by klip-player.

pub mod seek;