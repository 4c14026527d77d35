//! USB attachment watching and accessory access

mod accessory;
mod gate;
mod watcher;

pub use accessory::DevNodeOpener;
pub use gate::DetachGate;
pub use watcher::spawn_accessory_watcher;
