//! Liveness detection for the monitored target.
//!
//! Two independent strategies are chained: a direct resolver (fast path,
//! authoritative when it succeeds) and a page/API fallback that reports a
//! live flag plus a map of stream variants. Probing never fails upward --
//! any error reduces to an `Offline` verdict and the polling loop carries
//! on.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::Quality;
use crate::session::CancelToken;

/// A resolved reference usable to start a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaLocator {
    /// Ready-to-use media URL (e.g. an HLS playlist)
    DirectUrl(String),
    /// Watch page plus the broadcast id found on it; the capture tool
    /// resolves the media stream itself
    PageRef { page_url: String, session_id: String },
}

impl MediaLocator {
    /// URL handed to the capture process.
    pub fn capture_url(&self) -> &str {
        match self {
            MediaLocator::DirectUrl(url) => url,
            MediaLocator::PageRef { page_url, .. } => page_url,
        }
    }

    /// Broadcast id carried by the locator itself, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            MediaLocator::DirectUrl(_) => None,
            MediaLocator::PageRef { session_id, .. } => Some(session_id),
        }
    }
}

/// Outcome of one liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessVerdict {
    Offline,
    Live(MediaLocator),
}

impl LivenessVerdict {
    pub fn is_live(&self) -> bool {
        matches!(self, LivenessVerdict::Live(_))
    }
}

/// Fast-path strategy: resolve the target straight to a locator.
pub trait DirectResolver {
    fn resolve(&self, target: &str, quality: Quality) -> Result<MediaLocator>;
}

/// What the page/API fallback reports for a target.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct FallbackStatus {
    pub live: bool,
    /// Stream variant URLs keyed by quality name
    #[serde(default)]
    pub streams: BTreeMap<String, String>,
    /// Broadcast id, when the page exposes one
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Fallback strategy: structured live flag + variant map.
pub trait FallbackProbe {
    fn status(&self, target: &str) -> Result<FallbackStatus>;
}

/// Chains the direct resolver and the fallback probe into one verdict.
pub struct LivenessProbe<A, B> {
    direct: A,
    fallback: B,
    quality: Quality,
    jitter_max: Duration,
    cancel: CancelToken,
}

impl<A: DirectResolver, B: FallbackProbe> LivenessProbe<A, B> {
    pub fn new(
        direct: A,
        fallback: B,
        quality: Quality,
        jitter_max: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            direct,
            fallback,
            quality,
            jitter_max,
            cancel,
        }
    }

    /// Check whether the target is currently broadcasting.
    ///
    /// Strategy order: direct resolver first (authoritative on success),
    /// then the page/API fallback. Both failing, or the fallback reporting
    /// offline or a malformed variant map, yields `Offline`. A shutdown
    /// arriving during the jitter sleep skips the probe entirely.
    pub fn check(&self, target: &str) -> LivenessVerdict {
        if !self.sleep_jitter() {
            return LivenessVerdict::Offline;
        }

        match self.direct.resolve(target, self.quality) {
            Ok(locator) => {
                info!(target, "live via direct resolver");
                return LivenessVerdict::Live(locator);
            }
            Err(err) => {
                debug!(target, error = %err, "direct resolver failed, trying fallback");
            }
        }

        match self.fallback.status(target) {
            Ok(status) if status.live => match select_variant(&status.streams, self.quality) {
                Some(url) => {
                    info!(target, "live via fallback probe");
                    match status.session_id {
                        Some(session_id) => LivenessVerdict::Live(MediaLocator::PageRef {
                            page_url: url,
                            session_id,
                        }),
                        None => LivenessVerdict::Live(MediaLocator::DirectUrl(url)),
                    }
                }
                None => {
                    // Live flag without a usable variant: fail closed
                    warn!(target, "fallback reports live but no usable stream variant");
                    LivenessVerdict::Offline
                }
            },
            Ok(_) => {
                debug!(target, "fallback reports offline");
                LivenessVerdict::Offline
            }
            Err(err) => {
                debug!(target, error = %err, "fallback probe failed");
                LivenessVerdict::Offline
            }
        }
    }
}

/// Pick a stream variant by quality preference with ordered fallback.
///
/// Only well-formed http(s) URLs count; a present-but-garbage variant is
/// skipped rather than recorded.
pub fn select_variant(streams: &BTreeMap<String, String>, quality: Quality) -> Option<String> {
    for wanted in quality.fallback_order() {
        if let Some(url) = streams.get(wanted.as_str()) {
            if is_valid_media_url(url) {
                return Some(url.clone());
            }
            debug!(quality = wanted.as_str(), url, "skipping malformed stream variant");
        }
    }
    None
}

fn is_valid_media_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl<A, B> LivenessProbe<A, B> {
    /// Short pseudo-random delay before network calls, interruptible by
    /// cancellation. Returns false when cancelled during the sleep.
    ///
    /// Derived from the clock's subsecond nanos; good enough to
    /// de-synchronize many instances without pulling in an RNG.
    fn sleep_jitter(&self) -> bool {
        if self.jitter_max.is_zero() {
            return !self.cancel.is_cancelled();
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let jitter_ms = nanos % (self.jitter_max.as_millis() as u64).max(1);
        self.cancel.sleep(Duration::from_millis(jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct DirectOk(MediaLocator);
    impl DirectResolver for DirectOk {
        fn resolve(&self, _target: &str, _quality: Quality) -> Result<MediaLocator> {
            Ok(self.0.clone())
        }
    }

    struct DirectFail;
    impl DirectResolver for DirectFail {
        fn resolve(&self, _target: &str, _quality: Quality) -> Result<MediaLocator> {
            bail!("resolver exploded")
        }
    }

    struct FallbackWith(FallbackStatus);
    impl FallbackProbe for FallbackWith {
        fn status(&self, _target: &str) -> Result<FallbackStatus> {
            Ok(self.0.clone())
        }
    }

    struct FallbackFail;
    impl FallbackProbe for FallbackFail {
        fn status(&self, _target: &str) -> Result<FallbackStatus> {
            bail!("fallback exploded")
        }
    }

    fn streams(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn direct_success_is_authoritative() {
        let locator = MediaLocator::DirectUrl("https://x/a.m3u8".to_string());
        let probe = LivenessProbe::new(
            DirectOk(locator.clone()),
            FallbackFail,
            Quality::Best,
            Duration::ZERO,
            CancelToken::new(),
        );
        assert_eq!(probe.check("alice"), LivenessVerdict::Live(locator));
    }

    #[test]
    fn fallback_used_when_direct_fails() {
        let status = FallbackStatus {
            live: true,
            streams: streams(&[("high", "https://x/u1.m3u8")]),
            session_id: None,
        };
        let probe = LivenessProbe::new(
            DirectFail,
            FallbackWith(status),
            Quality::Best,
            Duration::ZERO,
            CancelToken::new(),
        );
        assert_eq!(
            probe.check("alice"),
            LivenessVerdict::Live(MediaLocator::DirectUrl("https://x/u1.m3u8".to_string()))
        );
    }

    #[test]
    fn both_strategies_failing_is_offline() {
        let probe = LivenessProbe::new(
            DirectFail,
            FallbackFail,
            Quality::Best,
            Duration::ZERO,
            CancelToken::new(),
        );
        assert_eq!(probe.check("alice"), LivenessVerdict::Offline);
    }

    #[test]
    fn fallback_offline_is_offline() {
        let probe = LivenessProbe::new(
            DirectFail,
            FallbackWith(FallbackStatus::default()),
            Quality::Best,
            Duration::ZERO,
            CancelToken::new(),
        );
        assert_eq!(probe.check("alice"), LivenessVerdict::Offline);
    }

    #[test]
    fn live_without_variants_fails_closed() {
        let status = FallbackStatus {
            live: true,
            streams: BTreeMap::new(),
            session_id: None,
        };
        let probe = LivenessProbe::new(
            DirectFail,
            FallbackWith(status),
            Quality::Best,
            Duration::ZERO,
            CancelToken::new(),
        );
        assert_eq!(probe.check("alice"), LivenessVerdict::Offline);
    }

    #[test]
    fn malformed_variant_fails_closed() {
        let status = FallbackStatus {
            live: true,
            streams: streams(&[("high", "not a url")]),
            session_id: None,
        };
        let probe = LivenessProbe::new(
            DirectFail,
            FallbackWith(status),
            Quality::Best,
            Duration::ZERO,
            CancelToken::new(),
        );
        assert_eq!(probe.check("alice"), LivenessVerdict::Offline);
    }

    #[test]
    fn fallback_session_id_becomes_page_ref() {
        let status = FallbackStatus {
            live: true,
            streams: streams(&[("high", "https://x/u1.m3u8")]),
            session_id: Some("555".to_string()),
        };
        let probe = LivenessProbe::new(
            DirectFail,
            FallbackWith(status),
            Quality::Best,
            Duration::ZERO,
            CancelToken::new(),
        );
        match probe.check("alice") {
            LivenessVerdict::Live(locator) => {
                assert_eq!(locator.session_id(), Some("555"));
                assert_eq!(locator.capture_url(), "https://x/u1.m3u8");
            }
            other => panic!("expected live, got {:?}", other),
        }
    }

    #[test]
    fn cancelled_token_skips_probing_entirely() {
        let locator = MediaLocator::DirectUrl("https://x/a.m3u8".to_string());
        let cancel = CancelToken::new();
        cancel.trigger();
        let probe = LivenessProbe::new(
            DirectOk(locator),
            FallbackFail,
            Quality::Best,
            Duration::from_secs(60),
            cancel,
        );
        let started = std::time::Instant::now();
        assert_eq!(probe.check("alice"), LivenessVerdict::Offline);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn select_variant_walks_fallback_order() {
        let map = streams(&[("medium", "https://x/m.m3u8"), ("low", "https://x/l.m3u8")]);
        assert_eq!(
            select_variant(&map, Quality::Best),
            Some("https://x/m.m3u8".to_string())
        );
        assert_eq!(
            select_variant(&map, Quality::Low),
            Some("https://x/l.m3u8".to_string())
        );
    }

    #[test]
    fn select_variant_skips_malformed_entries() {
        let map = streams(&[("high", "garbage"), ("medium", "https://x/m.m3u8")]);
        assert_eq!(
            select_variant(&map, Quality::Best),
            Some("https://x/m.m3u8".to_string())
        );
    }

    #[test]
    fn select_variant_empty_map_is_none() {
        assert_eq!(select_variant(&BTreeMap::new(), Quality::Best), None);
    }
}
