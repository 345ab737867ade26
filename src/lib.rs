pub mod api;
pub mod args;
pub mod audio;
pub mod decoders;
pub mod io;
pub mod player;
pub mod registry;
pub mod session;
pub mod sink;

pub use registry::PluginRegistry;
pub use session::{Session, SessionState};
