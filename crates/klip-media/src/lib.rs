// crates/klip-media/src/lib.rs

pub mod buffer;
pub mod decode;
pub mod mux;
pub mod probe;
pub mod worker;
mod helpers; // internal — not pub, not re-exported

pub use decode::ClipDecoder;
pub use mux::FfmpegMuxer;
pub use worker::PlaybackWorkerHandle;
