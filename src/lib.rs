pub mod core;
pub mod storage;

#[cfg(test)]
mod testing;

pub use crate::core::queue::{DownloadEngine, EngineDeps};
