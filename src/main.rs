use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use streamsave_core::core::events::DownloadState;
use streamsave_core::fs_paths::DesktopPaths;
use streamsave_core::models::download::{DownloadItem, EpisodeId, EpisodeMetadata, ExtractorLink};
use streamsave_lib::core::http_client::ReqwestHttp;
use streamsave_lib::core::notifier::LogNotifier;
use streamsave_lib::core::queue::ChannelScheduler;
use streamsave_lib::storage::{config, persistence::JsonFileStore, provider::storage_for};
use streamsave_lib::{DownloadEngine, EngineDeps};

#[derive(Debug, Parser)]
#[command(name = "streamsave", version, about = "Resumable downloader for byte-range and HLS sources")]
struct Cli {
    /// Media or playlist URL. Without one, only interrupted downloads are resumed.
    url: Option<String>,

    /// Episode name used for the output file. Defaults to the URL's file stem.
    name: Option<String>,

    /// Overrides the configured number of concurrent downloads.
    #[arg(short = 'j', long = "max-concurrent")]
    max_concurrent: Option<u32>,
}

/// Stable across runs so an interrupted item resumes under the same id.
fn id_for(url: &str) -> EpisodeId {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in url.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash >> 1) as EpisodeId
}

fn name_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .map(|last| match last.rsplit_once('.') {
            Some((stem, _)) => stem.to_string(),
            None => last,
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

fn cli_item(url: &str, name: Option<String>) -> DownloadItem {
    let name = name.unwrap_or_else(|| name_from_url(url));
    DownloadItem {
        source: "cli".into(),
        folder: None,
        ep: EpisodeMetadata {
            id: id_for(url),
            name,
            season: None,
            episode: None,
            poster: None,
            source: "cli".into(),
        },
        links: vec![ExtractorLink {
            source: "cli".into(),
            name: "cli".into(),
            url: url.to_string(),
            referer: String::new(),
            quality: 0,
            is_m3u8: url.contains(".m3u8"),
            headers: HashMap::new(),
            keepalive: None,
        }],
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let paths = DesktopPaths;
    let mut settings = config::load_settings(&config::settings_path(&paths));
    if let Some(max) = cli.max_concurrent {
        settings.advanced.max_concurrent_downloads = max.max(1);
    }
    let store = Arc::new(JsonFileStore::open(config::state_path(&paths))?);
    let storage = storage_for(&settings.download, &paths);
    let http = Arc::new(ReqwestHttp::new(&settings.proxy)?);
    let (scheduler, rx) = ChannelScheduler::new();

    let engine = DownloadEngine::new(EngineDeps {
        http,
        storage,
        store,
        notifier: Arc::new(LogNotifier),
        scheduler: Arc::new(scheduler),
        keepalive: None,
        settings,
    });

    let restored = engine.restore();
    let target = cli.url.map(|url| {
        let item = cli_item(&url, cli.name);
        let id = item.id();
        engine.enqueue(item);
        id
    });
    if target.is_none() && restored == 0 {
        tracing::info!("nothing to download");
        return Ok(true);
    }

    let driver = engine.clone();
    tokio::spawn(async move { driver.drive(rx).await });

    let registry = engine.registry();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, unfinished downloads resume on the next run");
                return Ok(false);
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
        if registry.active_count() == 0 && registry.queued().is_empty() {
            break;
        }
    }

    Ok(match target {
        Some(id) => engine.status(id) == Some(DownloadState::Done),
        None => true,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
