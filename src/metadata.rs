//! Session metadata resolution.
//!
//! Derives a human title, a stable broadcast id and an optional thumbnail
//! URL from unreliable signals: the locator itself and a best-effort page
//! scrape. Always returns something usable; network failures degrade to
//! synthesized fallbacks and a warning.

use std::sync::OnceLock;

use anyhow::Result;
use chrono::Local;
use regex::Regex;
use tracing::{debug, warn};

use crate::probe::MediaLocator;

/// Maximum title length kept in filenames and embedded metadata.
const MAX_TITLE_LEN: usize = 50;

/// Fetches a page body for scraping. Implemented over HTTP in `tools`,
/// and by fixtures in tests.
pub trait PageFetch {
    fn get(&self, url: &str) -> Result<String>;
}

/// Identity of one detected live session. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    /// Sanitized, length-capped title
    pub title: String,
    /// Broadcast id; a timestamp when undiscoverable
    pub session_id: String,
    pub thumbnail_url: Option<String>,
    /// True when title or id had to be synthesized
    pub degraded: bool,
}

impl SessionMetadata {
    /// Metadata fields embedded into the final container.
    pub fn embed_fields(&self, target: &str, target_url: &str) -> Vec<(String, String)> {
        let now = Local::now();
        vec![
            ("title".to_string(), self.title.clone()),
            ("artist".to_string(), target.to_string()),
            ("date".to_string(), now.format("%Y-%m-%d").to_string()),
            (
                "comment".to_string(),
                format!(
                    "Recorded from {} on {}",
                    target_url,
                    now.format("%Y-%m-%d %H:%M:%S")
                ),
            ),
        ]
    }
}

fn movie_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/movie/(\d+)").unwrap())
}

fn meta_content_re(names: &'static str) -> Regex {
    // og/twitter meta tags, property-before-content attribute order
    Regex::new(&format!(
        r#"<meta[^>]*(?:property|name)\s*=\s*["'](?:{})["'][^>]*content\s*=\s*["']([^"']+)["']"#,
        names
    ))
    .unwrap()
}

/// Resolves session identity from the locator plus a page scrape.
pub struct MetadataResolver<P> {
    fetch: P,
}

impl<P: PageFetch> MetadataResolver<P> {
    pub fn new(fetch: P) -> Self {
        Self { fetch }
    }

    /// Resolve title, id and thumbnail for a freshly detected session.
    ///
    /// Precedence for the id: locator-carried id, then an id pattern in the
    /// locator URL, then the page scrape, then a timestamp. This never
    /// fails; every missing piece has a fallback.
    pub fn resolve(&self, target: &str, target_url: &str, locator: &MediaLocator) -> SessionMetadata {
        let mut title = None;
        let mut thumbnail_url = None;

        let mut session_id = locator
            .session_id()
            .map(str::to_string)
            .or_else(|| extract_movie_id(locator.capture_url()));

        match self.fetch.get(target_url) {
            Ok(html) => {
                title = extract_title(&html);
                thumbnail_url = extract_thumbnail(&html);
                if session_id.is_none() {
                    session_id = extract_movie_id(&html);
                }
            }
            Err(err) => {
                warn!(target, error = %err, "failed to fetch stream page for metadata");
            }
        }

        let mut degraded = false;

        let title = match title {
            Some(t) => sanitize_title(&t),
            None => {
                degraded = true;
                warn!(target, "title undiscoverable, using fallback");
                sanitize_title(&format!("{}'s stream", target))
            }
        };

        let session_id = match session_id {
            Some(id) => id,
            None => {
                degraded = true;
                let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
                warn!(target, fallback_id = %stamp, "stream id undiscoverable, using timestamp");
                stamp
            }
        };

        debug!(target, %title, %session_id, thumbnail = ?thumbnail_url, "resolved session metadata");

        SessionMetadata {
            title,
            session_id,
            thumbnail_url,
            degraded,
        }
    }
}

/// Pull a numeric broadcast id out of a URL or page body.
pub fn extract_movie_id(text: &str) -> Option<String> {
    movie_id_re()
        .captures(text)
        .map(|caps| caps[1].to_string())
}

fn extract_title(html: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| meta_content_re("og:title|twitter:title"));
    re.captures(html)
        .map(|caps| caps[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

fn extract_thumbnail(html: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| meta_content_re("og:image|twitter:image"));
    re.captures(html)
        .map(|caps| caps[1].trim().to_string())
        .filter(|u| u.starts_with("http"))
}

/// Make a title safe for filesystem use: strip forbidden characters,
/// collapse whitespace, cap the length.
pub fn sanitize_title(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|c| !c.is_control())
        .collect();

    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.is_empty() {
        return "untitled".to_string();
    }

    collapsed.chars().take(MAX_TITLE_LEN).collect()
}
