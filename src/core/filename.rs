use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

use streamsave_core::models::download::{EpisodeMetadata, ExtractorLink};

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "avi", "mov", "m4v", "flv", "wmv"];

pub fn sanitize_path_component(name: &str) -> String {
    let name: String = name.nfc().collect();
    let name = name.trim().replace(['\t', '\n', '\r'], "");
    let name = WS_RE.replace_all(&name, " ");
    let name = name.replace(" | ", "｜");

    let name = name.trim_end_matches([' ', '-', '.', ';']);

    let forbidden: &[(char, char)] = &[
        ('<', '＜'),
        ('>', '＞'),
        (':', '꞉'),
        ('"', '＂'),
        ('/', '⧸'),
        ('\\', '＼'),
        ('|', '｜'),
        ('?', '？'),
        ('*', ' '),
    ];

    let mut result = name.to_string();
    for (from, to) in forbidden {
        result = result.replace(*from, &to.to_string());
    }

    result.trim().to_string()
}

pub fn episode_display_name(ep: &EpisodeMetadata) -> String {
    let base = sanitize_path_component(&ep.name);
    let base = if base.is_empty() {
        format!("Episode {}", ep.id)
    } else {
        base
    };
    match (ep.season, ep.episode) {
        (Some(s), Some(e)) => format!("{} S{:02}E{:02}", base, s, e),
        (None, Some(e)) => format!("{} Ep{:02}", base, e),
        _ => base,
    }
}

pub fn url_extension(url: &str) -> Option<String> {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn link_extension(link: &ExtractorLink) -> String {
    if link.is_m3u8 {
        return "ts".into();
    }
    match url_extension(&link.url) {
        Some(ext) if VIDEO_EXTENSIONS.contains(&ext.as_str()) => ext,
        _ => "mp4".into(),
    }
}

/// File name an episode is saved under. Two links that map to the same
/// name share the same partial file.
pub fn destination_name(ep: &EpisodeMetadata, link: &ExtractorLink) -> String {
    format!("{}.{}", episode_display_name(ep), link_extension(link))
}

pub fn is_video_name(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
