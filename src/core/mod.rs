pub mod direct_downloader;
pub mod filename;
pub mod hls_downloader;
pub mod http_client;
pub mod notifier;
pub mod outcome;
pub mod queue;
pub mod registry;
pub mod transfer;
