//! Records moved between the backing store and snapshot archives.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Archive entry name reserved for the release descriptor.
///
/// When present it is always the first entry of an archive and is never
/// replayed into the backing store.
pub const SNAPSHOT_RELEASE_KEY: &str = "/vcp/snapshot/release";

/// Prefix of the host/virtual object name mappings a control plane keeps
/// for its own cluster. Meaningless to a newly created control plane.
pub const MAPPINGS_PREFIX: &str = "/vcp/mappings/";

/// One key/value pair of the backing store.
///
/// Keys are opaque bytes (hierarchical paths in practice); values are written
/// and replayed verbatim.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyValueRecord {
    /// The key.
    pub key: Vec<u8>,
    /// The value.
    pub data: Vec<u8>,
}

impl KeyValueRecord {
    /// Create a record from anything byte-like.
    pub fn new(key: impl Into<Vec<u8>>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
        }
    }

    /// The key rendered for logs and error messages.
    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

impl fmt::Debug for KeyValueRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueRecord")
            .field("key", &self.key_lossy())
            .field("size", &self.data.len())
            .finish()
    }
}

/// One member of a key/value cluster, as reported by a membership call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Member {
    /// Cluster-assigned member ID.
    pub id: u64,
    /// Human-readable member name.
    pub name: String,
    /// URLs clients connect to.
    pub client_urls: Vec<String>,
}

/// The helm release a virtual cluster was installed from.
///
/// Stored out of band as the first archive entry so a snapshot can recreate
/// the virtual cluster with the same chart and values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDescriptor {
    /// Helm release name.
    pub release_name: String,
    /// Namespace of the helm release.
    pub release_namespace: String,
    /// Chart name.
    pub chart_name: String,
    /// Chart version.
    pub chart_version: String,
    /// Raw values file; base64 in JSON.
    #[serde(with = "base64_bytes", default)]
    pub values: Vec<u8>,
}

impl ReleaseDescriptor {
    /// Encode as the JSON body of the reserved archive entry.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode the JSON body of the reserved archive entry.
    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_values_are_base64() {
        let release = ReleaseDescriptor {
            release_name: "team-a".to_string(),
            release_namespace: "vcp-team-a".to_string(),
            chart_name: "vcp".to_string(),
            chart_version: "1.2.3".to_string(),
            values: b"sync:\n  toHost: {}\n".to_vec(),
        };
        let json: serde_json::Value = serde_json::from_slice(&release.to_json().unwrap()).unwrap();
        assert_eq!(json["chartVersion"], "1.2.3");
        assert_eq!(json["values"], "c3luYzoKICB0b0hvc3Q6IHt9Cg==");

        let decoded = ReleaseDescriptor::from_json(&release.to_json().unwrap()).unwrap();
        assert_eq!(decoded, release);
    }

    #[test]
    fn test_release_rejects_bad_base64() {
        let raw = br#"{"releaseName":"a","releaseNamespace":"b","chartName":"c","chartVersion":"d","values":"***"}"#;
        assert!(ReleaseDescriptor::from_json(raw).is_err());
    }

    #[test]
    fn test_record_debug_hides_value() {
        let record = KeyValueRecord::new("/registry/secrets/default/token", b"secret".to_vec());
        let debug = format!("{record:?}");
        assert!(debug.contains("/registry/secrets/default/token"));
        assert!(!debug.contains("secret\""));
        assert!(debug.contains("size: 6"));
    }
}
