//! Human-readable location for alert messages and ledger rows.
//!
//! A source with a configured location always uses it. Otherwise the public
//! IP is geolocated (ipinfo-style JSON) and cached; any failure yields the
//! configured fallback, "Unknown Location" by default. A failed lookup is
//! cached as the fallback for the shorter retry window.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::LocationConfig;

#[derive(Debug, Deserialize)]
struct IpInfo {
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
}

impl IpInfo {
    fn label(&self) -> Option<String> {
        let parts: Vec<&str> = [&self.city, &self.region, &self.country]
            .into_iter()
            .filter_map(|p| p.as_deref().map(str::trim))
            .filter(|p| !p.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(", "))
    }
}

pub struct LocationResolver {
    client: Option<reqwest::Client>,
    lookup_url: String,
    fallback: String,
    cache_ttl: Duration,
    retry_after: Duration,
    cache: Mutex<Option<Cached>>,
}

struct Cached {
    label: String,
    expires: Instant,
}

impl Cached {
    fn fresh(&self) -> Option<&str> {
        (Instant::now() < self.expires).then_some(self.label.as_str())
    }
}

impl LocationResolver {
    pub fn new(cfg: &LocationConfig) -> Self {
        let client = if cfg.lookup_url.is_empty() {
            None
        } else {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.timeout_seconds.max(1)))
                .build()
                .map_err(|e| warn!("Location lookup disabled, HTTP client init failed: {}", e))
                .ok()
        };

        Self {
            client,
            lookup_url: cfg.lookup_url.clone(),
            fallback: cfg.fallback.clone(),
            cache_ttl: Duration::from_secs(cfg.cache_seconds),
            retry_after: Duration::from_secs(cfg.retry_seconds.min(cfg.cache_seconds)),
            cache: Mutex::new(None),
        }
    }

    /// Resolver that never touches the network.
    pub fn fixed_fallback(fallback: impl Into<String>) -> Self {
        Self {
            client: None,
            lookup_url: String::new(),
            fallback: fallback.into(),
            cache_ttl: Duration::ZERO,
            retry_after: Duration::ZERO,
            cache: Mutex::new(None),
        }
    }

    pub async fn resolve(&self, configured: Option<&str>) -> String {
        if let Some(loc) = configured.map(str::trim).filter(|l| !l.is_empty()) {
            return loc.to_string();
        }
        let Some(client) = &self.client else {
            return self.fallback.clone();
        };

        // Lock held across the lookup so concurrent alerts share one request
        let mut cache = self.cache.lock().await;
        if let Some(label) = cache.as_ref().and_then(Cached::fresh) {
            return label.to_string();
        }

        let (label, ttl) = match self.lookup(client).await {
            Ok(loc) => {
                debug!(location = %loc, "Location resolved");
                (loc, self.cache_ttl)
            }
            Err(e) => {
                warn!(
                    "Location lookup failed ({}), using '{}' for {}s",
                    e,
                    self.fallback,
                    self.retry_after.as_secs()
                );
                (self.fallback.clone(), self.retry_after)
            }
        };
        *cache = Some(Cached {
            label: label.clone(),
            expires: Instant::now() + ttl,
        });
        label
    }

    async fn lookup(&self, client: &reqwest::Client) -> anyhow::Result<String> {
        let info: IpInfo = client
            .get(&self.lookup_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info.label()
            .ok_or_else(|| anyhow::anyhow!("lookup returned no city/region/country"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn ipinfo_label_skips_missing_parts() {
        let info: IpInfo =
            serde_json::from_str(r#"{"ip":"1.2.3.4","city":"Dehradun","region":"Uttarakhand","country":"IN"}"#)
                .unwrap();
        assert_eq!(info.label().as_deref(), Some("Dehradun, Uttarakhand, IN"));

        let partial: IpInfo = serde_json::from_str(r#"{"city":" ","country":"IN"}"#).unwrap();
        assert_eq!(partial.label().as_deref(), Some("IN"));

        let empty: IpInfo = serde_json::from_str("{}").unwrap();
        assert!(empty.label().is_none());
    }

    #[tokio::test]
    async fn configured_location_wins() {
        let r = LocationResolver::fixed_fallback("Unknown Location");
        assert_eq!(r.resolve(Some("Plant 3, Bay 7")).await, "Plant 3, Bay 7");
        assert_eq!(r.resolve(Some("  ")).await, "Unknown Location");
        assert_eq!(r.resolve(None).await, "Unknown Location");
    }

    #[tokio::test]
    async fn failed_lookup_falls_back() {
        let cfg = LocationConfig {
            lookup_url: "http://127.0.0.1:9/json".into(),
            timeout_seconds: 1,
            cache_seconds: 600,
            retry_seconds: 30,
            fallback: "Unknown Location".into(),
        };
        let r = LocationResolver::new(&cfg);
        assert_eq!(r.resolve(None).await, "Unknown Location");
    }

    /// Accepts connections and never answers, so every lookup times out.
    fn silent_endpoint() -> (String, Arc<AtomicUsize>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        std::thread::spawn(move || {
            let mut held = Vec::new();
            for conn in listener.incoming().flatten() {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(conn);
            }
        });
        (format!("http://{}/json", addr), accepted)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_lookup_is_not_repeated_per_alert() {
        let (url, accepted) = silent_endpoint();
        let cfg = LocationConfig {
            lookup_url: url,
            timeout_seconds: 1,
            cache_seconds: 600,
            retry_seconds: 30,
            fallback: "Unknown Location".into(),
        };
        let r = Arc::new(LocationResolver::new(&cfg));

        let first = Instant::now();
        assert_eq!(r.resolve(None).await, "Unknown Location");
        assert!(first.elapsed() >= Duration::from_millis(900));

        // a burst of alerts inside the retry window
        let start = Instant::now();
        let burst: Vec<_> = (0..5)
            .map(|_| {
                let r = r.clone();
                tokio::spawn(async move { r.resolve(None).await })
            })
            .collect();
        for h in burst {
            assert_eq!(h.await.unwrap(), "Unknown Location");
        }
        assert!(start.elapsed() < Duration::from_millis(500), "{:?}", start.elapsed());
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_window_capped_by_cache_ttl() {
        let cfg = LocationConfig {
            lookup_url: "http://127.0.0.1:9/json".into(),
            timeout_seconds: 1,
            cache_seconds: 10,
            retry_seconds: 60,
            fallback: "Unknown Location".into(),
        };
        let r = LocationResolver::new(&cfg);
        assert_eq!(r.retry_after, Duration::from_secs(10));
    }
}
