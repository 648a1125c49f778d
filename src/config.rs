use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by every endpoint of an [`Api`](crate::Api).
///
/// Durations are (de)serialized as integer milliseconds so a host can keep the
/// configuration in JSON or TOML:
///
/// ```
/// use cloudburst::ApiConfig;
/// use std::time::Duration;
///
/// let config: ApiConfig = serde_json::from_str(
///     r#"{ "name": "blog", "keep_unused_data_for": 5000, "refetch_on_focus": true }"#,
/// )
/// .unwrap();
/// assert_eq!(config.keep_unused_data_for, Duration::from_secs(5));
/// assert!(config.refetch_on_focus);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Name of the API, used in log events.
    pub name: String,

    /// How long a query entry without subscribers is retained before removal.
    #[serde(with = "millis")]
    pub keep_unused_data_for: Duration,

    /// Age after which fulfilled data is refetched by the next `initiate`.
    ///
    /// `None` means data never goes stale by age; only invalidation, polling
    /// and host signals refetch it.
    #[serde(with = "millis_opt")]
    pub stale_time: Option<Duration>,

    /// Default for refetching active queries when the host regains focus.
    pub refetch_on_focus: bool,

    /// Default for refetching active queries when the host comes back online.
    pub refetch_on_reconnect: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            name: "api".to_string(),
            keep_unused_data_for: Duration::from_secs(60),
            stale_time: None,
            refetch_on_focus: false,
            refetch_on_reconnect: false,
        }
    }
}

impl ApiConfig {
    /// Creates a configuration with the given retention period and stale time.
    #[must_use]
    pub const fn new(name: String, keep_unused_data_for: Duration, stale_time: Option<Duration>) -> Self {
        Self {
            name,
            keep_unused_data_for,
            stale_time,
            refetch_on_focus: false,
            refetch_on_reconnect: false,
        }
    }

    /// Sets the name used in log events.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets how long entries without subscribers are kept.
    #[must_use]
    pub fn with_keep_unused_data_for(mut self, duration: Duration) -> Self {
        self.keep_unused_data_for = duration;
        self
    }

    /// Marks data older than `stale_time` as stale.
    #[must_use]
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Sets [`refetch_on_focus`](Self::refetch_on_focus).
    #[must_use]
    pub fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = enabled;
        self
    }

    /// Sets [`refetch_on_reconnect`](Self::refetch_on_reconnect).
    #[must_use]
    pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = enabled;
        self
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub(crate) mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation, clippy::ref_option)]
    pub fn serialize<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
