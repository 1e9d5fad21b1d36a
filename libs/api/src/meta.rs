//! Object metadata shared by every kind.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use fleetplane_id::ResourceVersion;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Namespace used when an object does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Identity and bookkeeping common to all stored objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// System-assigned, kind-prefixed id. Empty until first stored.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    #[serde(default)]
    pub resource_version: ResourceVersion,

    /// Bumped by the store whenever the spec changes.
    #[serde(default)]
    pub generation: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl Default for ObjectMeta {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: default_namespace(),
            uid: String::new(),
            resource_version: ResourceVersion::NONE,
            generation: 0,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner: None,
            creation_timestamp: None,
        }
    }
}

impl ObjectMeta {
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// True when `owner` is the controlling owner of this object.
    pub fn is_owned_by(&self, owner_uid: &str) -> bool {
        self.owner.as_ref().is_some_and(|o| o.uid == owner_uid)
    }
}

/// Back-reference from an owned object to its single owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl OwnerReference {
    pub fn of<R: Resource>(owner: &R) -> Self {
        Self {
            kind: R::KIND.to_string(),
            name: owner.meta().name.clone(),
            uid: owner.meta().uid.clone(),
        }
    }
}

/// Namespace plus name; the unit of work for every controller queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A stored kind.
pub trait Resource:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind name, as written in owner references and events.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Fresh uid in this kind's id format.
    fn new_uid() -> String;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }

    /// Value compared to decide whether a write changes the spec; the store
    /// bumps `generation` when it differs.
    fn spec_fingerprint(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Implements [`Resource`] for a struct with a `metadata` field.
macro_rules! impl_resource {
    ($ty:ty, $kind:literal, $id:ty) => {
        impl_resource!($ty, $kind, $id, |_obj| None);
    };
    ($ty:ty, $kind:literal, $id:ty, spec) => {
        impl_resource!($ty, $kind, $id, |obj: &$ty| serde_json::to_value(&obj.spec).ok());
    };
    ($ty:ty, $kind:literal, $id:ty, $fingerprint:expr) => {
        impl $crate::meta::Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &$crate::meta::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::meta::ObjectMeta {
                &mut self.metadata
            }

            fn new_uid() -> String {
                <$id>::new().to_string()
            }

            fn spec_fingerprint(&self) -> Option<serde_json::Value> {
                let f: fn(&$ty) -> Option<serde_json::Value> = $fingerprint;
                f(self)
            }
        }
    };
}

pub(crate) use impl_resource;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_defaults_namespace() {
        let meta: ObjectMeta = serde_json::from_str(r#"{"name":"f"}"#).unwrap();
        assert_eq!(meta.namespace, DEFAULT_NAMESPACE);
        assert!(meta.resource_version.is_none());
        assert_eq!(meta.key().to_string(), "default/f");
    }

    #[test]
    fn test_labels_builder() {
        let meta = ObjectMeta::named("ns", "a").with_label("app", "f");
        assert_eq!(meta.label("app"), Some("f"));
        assert_eq!(meta.label("missing"), None);
    }
}
