//! Configuration of the now-playing service.
//!
//! Settings are read from the persisted store as loosely typed, optional
//! values ([`Settings`]) and resolved into immutable snapshots such as
//! [`ConnectionConfig`]. A snapshot is replaced wholesale on every reload and
//! never mutated in place, so a component holding one never sees a mix of
//! old and new values.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

/// Keys of the `[radio]` section, as written back to the store.
pub mod keys {
    pub const SECTION: &str = "radio";
    pub const WEBSOCKET_URL: &str = "websocket-url";
    pub const STATION_SHORTCODE: &str = "station-shortcode";
    pub const ANNOUNCEMENT_ENABLED: &str = "announcement-enabled";
}

pub const DEFAULT_ENDPOINT_URL: &str =
    "wss://radio.sanctuaryunited.net/api/live/nowplaying/websocket";
pub const DEFAULT_DISPLAY_URL: &str = "https://radio.sanctuaryunited.net/public/sanctuary_radio";
pub const DEFAULT_TOPIC: &str = "sanctuary_radio";
pub const DEFAULT_URL_LABEL: &str = "Listen Now";
pub const DEFAULT_MESSAGE_FORMAT: &str =
    "<gold>[Radio]</gold> <yellow>{song}</yellow> <gray>-</gray> <aqua>{url}</aqua>";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Upper bound for every configured period, so timer deadlines stay
/// representable.
pub const MAX_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Path prefix under which the service exposes now-playing endpoints.
const NOW_PLAYING_PATH_PREFIX: &str = "/api/live/nowplaying/";

/// Canonical WebSocket endpoint path.
const WEBSOCKET_PATH: &str = "/api/live/nowplaying/websocket";

/// Path segments naming a transport rather than a station.
const TRANSPORT_SEGMENTS: [&str; 2] = ["websocket", "sse"];

/// Everything the store holds, section by section.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub radio: RadioSettings,
    pub status: StatusSettings,
    pub metrics: MetricsSettings,
}

/// The `[radio]` section. Every field is optional; blank strings count as
/// absent.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct RadioSettings {
    pub enabled: Option<bool>,
    pub debug_logging: Option<bool>,
    pub websocket_url: Option<String>,
    pub station_url: Option<String>,
    pub url_label: Option<String>,
    pub station_shortcode: Option<String>,
    pub message_format: Option<String>,
    pub reconnect_delay_seconds: Option<i64>,
    pub announcement_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct StatusSettings {
    pub enabled: Option<bool>,
    pub format: Option<String>,
    pub interval_seconds: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct MetricsSettings {
    pub enabled: Option<bool>,
    pub log_interval_minutes: Option<i64>,
}

/// Immutable snapshot of everything the connection needs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionConfig {
    pub enabled: bool,
    /// Log full error detail for transport failures.
    pub debug_logging: bool,
    pub endpoint_url: String,
    pub subscription_topic: String,
    /// Public page of the station, linked from announcements.
    pub display_url: String,
    /// Link text for `display_url` in rich announcements.
    pub url_label: String,
    pub message_format: String,
    /// At least one second.
    pub reconnect_delay: Duration,
    pub announcements_enabled: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debug_logging: false,
            endpoint_url: DEFAULT_ENDPOINT_URL.to_owned(),
            subscription_topic: DEFAULT_TOPIC.to_owned(),
            display_url: DEFAULT_DISPLAY_URL.to_owned(),
            url_label: DEFAULT_URL_LABEL.to_owned(),
            message_format: DEFAULT_MESSAGE_FORMAT.to_owned(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            announcements_enabled: true,
        }
    }
}

impl ConnectionConfig {
    /// Checks that a connection can be attempted with this configuration.
    ///
    /// # Errors
    ///
    /// * `FailedPrecondition` if the endpoint or the topic is blank
    /// * `InvalidArgument` if the endpoint is not a URL
    pub fn validate(&self) -> Result<Url> {
        let endpoint = self.endpoint_url.trim();
        if endpoint.is_empty() {
            return Err(Error::failed_precondition("websocket URL is not configured"));
        }
        if self.subscription_topic.trim().is_empty() {
            return Err(Error::failed_precondition(
                "station shortcode is not configured",
            ));
        }

        let url = Url::parse(endpoint)?;
        Ok(url)
    }

    /// Names of the fields that differ between `self` and `other`.
    #[must_use]
    pub fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        let mut check = |name, differs: bool| {
            if differs {
                changed.push(name);
            }
        };

        check("enabled", self.enabled != other.enabled);
        check("debug_logging", self.debug_logging != other.debug_logging);
        check("endpoint_url", self.endpoint_url != other.endpoint_url);
        check(
            "subscription_topic",
            self.subscription_topic != other.subscription_topic,
        );
        check("display_url", self.display_url != other.display_url);
        check("url_label", self.url_label != other.url_label);
        check("message_format", self.message_format != other.message_format);
        check("reconnect_delay", self.reconnect_delay != other.reconnect_delay);
        check(
            "announcements_enabled",
            self.announcements_enabled != other.announcements_enabled,
        );

        changed
    }
}

/// A resolved configuration plus the values that should be written back to
/// the store once.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolved {
    pub config: ConnectionConfig,
    pub updates: Vec<(&'static str, toml::Value)>,
}

/// Resolves the `[radio]` section into a [`ConnectionConfig`].
///
/// The subscription topic is taken from, in order:
/// 1. a non-blank `station-shortcode`, even if it equals the default;
/// 2. the last path segment of `websocket-url` as configured;
/// 3. the last path segment of `station-url`;
/// 4. [`DEFAULT_TOPIC`].
///
/// A derived topic is reported in [`Resolved::updates`] so it is persisted.
/// Legacy endpoint URLs are not rewritten here; that is part of applying the
/// configuration, after the topic has been taken from the URL.
#[must_use]
pub fn resolve(settings: &RadioSettings) -> Resolved {
    let endpoint_url = non_blank(settings.websocket_url.as_deref())
        .unwrap_or_else(|| DEFAULT_ENDPOINT_URL.to_owned());
    let display_url = non_blank(settings.station_url.as_deref())
        .unwrap_or_else(|| DEFAULT_DISPLAY_URL.to_owned());

    let mut updates = Vec::new();
    let subscription_topic = match non_blank(settings.station_shortcode.as_deref()) {
        Some(topic) => topic,
        None => {
            let derived = topic_from_url(&endpoint_url)
                .or_else(|| topic_from_url(&display_url))
                .unwrap_or_else(|| DEFAULT_TOPIC.to_owned());
            debug!("derived station shortcode {derived}");
            updates.push((
                keys::STATION_SHORTCODE,
                toml::Value::String(derived.clone()),
            ));
            derived
        }
    };

    let reconnect_delay = settings
        .reconnect_delay_seconds
        .map_or(DEFAULT_RECONNECT_DELAY, |seconds| {
            period(seconds, 1)
        });

    let config = ConnectionConfig {
        enabled: settings.enabled.unwrap_or(false),
        debug_logging: settings.debug_logging.unwrap_or(false),
        endpoint_url,
        subscription_topic,
        display_url,
        url_label: non_blank(settings.url_label.as_deref())
            .unwrap_or_else(|| DEFAULT_URL_LABEL.to_owned()),
        message_format: non_blank(settings.message_format.as_deref())
            .unwrap_or_else(|| DEFAULT_MESSAGE_FORMAT.to_owned()),
        reconnect_delay,
        announcements_enabled: settings.announcement_enabled.unwrap_or(true),
    };

    Resolved { config, updates }
}

/// `count` units of `unit_seconds`, at least one unit and at most
/// [`MAX_PERIOD`].
fn period(count: i64, unit_seconds: u64) -> Duration {
    let seconds = count.max(1).unsigned_abs().saturating_mul(unit_seconds);
    Duration::from_secs(seconds).min(MAX_PERIOD)
}

/// Trims `value`, treating blank as absent.
fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// Takes a station name from the last path segment of `url`.
///
/// Query strings and trailing slashes are ignored. Segments that name a
/// transport (`websocket`, `sse`) are not station names.
#[must_use]
pub fn topic_from_url(url: &str) -> Option<String> {
    let url = Url::parse(url.trim()).ok()?;
    let segment = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()?;

    if TRANSPORT_SEGMENTS
        .iter()
        .any(|transport| segment.eq_ignore_ascii_case(transport))
    {
        return None;
    }

    Some(segment.to_owned())
}

/// Rewrites a legacy per-station endpoint to the shared WebSocket endpoint.
///
/// `wss://host/api/live/nowplaying/<station>?q` becomes
/// `wss://host/api/live/nowplaying/websocket?q`. Returns `None` when `url` is
/// not in the legacy form.
#[must_use]
pub fn migrate_legacy_url(url: &str) -> Option<String> {
    let url = url.trim();
    let (base, query) = match url.find('?') {
        Some(index) => url.split_at(index),
        None => (url, ""),
    };

    let prefix = base.find(NOW_PLAYING_PATH_PREFIX)?;
    let tail = &base[prefix + NOW_PLAYING_PATH_PREFIX.len()..];
    if tail.is_empty()
        || TRANSPORT_SEGMENTS
            .iter()
            .any(|transport| tail.starts_with(*transport))
    {
        return None;
    }

    Some(format!("{}{WEBSOCKET_PATH}{query}", &base[..prefix]))
}

/// Resolved `[status]` section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusConfig {
    pub enabled: bool,
    pub format: String,
    pub interval: Duration,
}

impl StatusConfig {
    pub const DEFAULT_FORMAT: &'static str = "Now Playing: {song}";
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
}

impl From<&StatusSettings> for StatusConfig {
    fn from(settings: &StatusSettings) -> Self {
        Self {
            enabled: settings.enabled.unwrap_or(true),
            format: non_blank(settings.format.as_deref())
                .unwrap_or_else(|| Self::DEFAULT_FORMAT.to_owned()),
            interval: settings
                .interval_seconds
                .map_or(Self::DEFAULT_INTERVAL, |seconds| period(seconds, 1)),
        }
    }
}

/// Resolved `[metrics]` section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub log_interval: Duration,
}

impl MetricsConfig {
    pub const DEFAULT_LOG_INTERVAL_MINUTES: i64 = 10;
}

impl From<&MetricsSettings> for MetricsConfig {
    fn from(settings: &MetricsSettings) -> Self {
        let minutes = settings
            .log_interval_minutes
            .unwrap_or(Self::DEFAULT_LOG_INTERVAL_MINUTES);

        Self {
            // A non-positive interval turns metrics off.
            enabled: settings.enabled.unwrap_or(false) && minutes > 0,
            log_interval: period(minutes, 60),
        }
    }
}
