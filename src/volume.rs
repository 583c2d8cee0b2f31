//! Volume data model

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Free-form string properties used for discovery queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(HashMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff every key in `query` is present here with an equal value
    pub fn has_properties(&self, query: &Properties) -> bool {
        query
            .0
            .iter()
            .all(|(key, value)| self.0.get(key) == Some(value))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Time to live in whole seconds; zero never expires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ttl(u64);

impl Ttl {
    pub const UNLIMITED: Ttl = Ttl(0);

    pub fn from_secs(seconds: u64) -> Self {
        Self(seconds)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }

    /// Expiry when counting down from `from`
    pub fn expires_at(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let seconds = i64::try_from(self.0).unwrap_or(i64::MAX);
        ChronoDuration::try_seconds(seconds)
            .and_then(|ttl| from.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")
        } else {
            write!(f, "{}s", self.0)
        }
    }
}

/// Persisted lifecycle state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Creating,
    Active,
    Destroyed,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeState::Creating => write!(f, "creating"),
            VolumeState::Active => write!(f, "active"),
            VolumeState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// A live volume as seen by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub handle: String,
    pub path: PathBuf,
    pub properties: Properties,
    pub ttl: Ttl,
    pub expires_at: DateTime<Utc>,
    pub privileged: bool,
}

impl Volume {
    /// Whether the volume's TTL has run out at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.ttl.is_unlimited() && self.expires_at <= now
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Driver-reported usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub size_in_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_has_properties_matches_itself_and_empty_query() {
        let p = props(&[("a", "1"), ("b", "2")]);
        assert!(p.has_properties(&p));
        assert!(p.has_properties(&Properties::new()));
        assert!(Properties::new().has_properties(&Properties::new()));
    }

    #[test]
    fn test_has_properties_subset() {
        let p = props(&[("a", "1"), ("b", "2")]);
        assert!(p.has_properties(&props(&[("a", "1")])));
    }

    #[test]
    fn test_has_properties_rejects_missing_or_different() {
        let p = props(&[("a", "1")]);
        assert!(!p.has_properties(&props(&[("a", "2")])));
        assert!(!p.has_properties(&props(&[("c", "1")])));
        assert!(!p.has_properties(&props(&[("a", "1"), ("b", "2")])));
    }

    #[test]
    fn test_properties_serialize_as_flat_map() {
        let p = props(&[("k", "v")]);
        assert_eq!(serde_json::to_string(&p).unwrap(), r#"{"k":"v"}"#);
    }

    #[test]
    fn test_ttl() {
        assert!(Ttl::UNLIMITED.is_unlimited());
        assert_eq!(Ttl::from_secs(5).duration(), Duration::from_secs(5));
        assert_eq!(Ttl::from_secs(5).to_string(), "5s");
        assert_eq!(Ttl::UNLIMITED.to_string(), "unlimited");

        let now = Utc::now();
        assert_eq!(Ttl::from_secs(10).expires_at(now), now + ChronoDuration::seconds(10));
        assert_eq!(Ttl::UNLIMITED.expires_at(now), now);
    }

    #[test]
    fn test_ttl_expiry_saturates() {
        let now = Utc::now();
        assert_eq!(Ttl::from_secs(u64::MAX).expires_at(now), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_volume_expiry() {
        let now = Utc::now();
        let mut volume = Volume {
            handle: "h".to_string(),
            path: PathBuf::from("/live/h/volume"),
            properties: Properties::new(),
            ttl: Ttl::from_secs(1),
            expires_at: now - ChronoDuration::seconds(1),
            privileged: false,
        };
        assert!(volume.is_expired(now));
        assert_eq!(volume.remaining(now), Duration::ZERO);

        volume.ttl = Ttl::UNLIMITED;
        assert!(!volume.is_expired(now));
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&VolumeState::Active).unwrap(),
            r#""active""#
        );
        let state: VolumeState = serde_json::from_str(r#""destroyed""#).unwrap();
        assert_eq!(state, VolumeState::Destroyed);
    }
}
