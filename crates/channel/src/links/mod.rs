//! Node link implementations
//!
//! Contains LogLink and LocalLink.

mod local;
mod log;

pub use self::local::LocalLink;
pub use self::log::LogLink;
