pub mod directory;
pub mod node;
pub mod rpc;
pub mod watcher;

pub use directory::*;
pub use node::*;
pub use rpc::*;
pub use watcher::*;
