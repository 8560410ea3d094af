// crates/klip-player/src/lib.rs
//
// Player orchestration: worker pool, render loop, transport commands, and
// the PreRenderer driver. The crate a host (CLI, UI, test harness) depends
// on — see `player::Player` for the public surface.

pub mod player;
pub mod pool;
pub mod prerender;

pub use player::Player;
pub use pool::WorkerPool;
pub use prerender::PreRenderer;
