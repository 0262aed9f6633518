use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Capability token granted on a permission key.
///
/// Tokens are matched case-insensitively; unknown tokens are kept verbatim
/// (upper-cased) so custom module actions still match.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    View,
    Edit,
    Delete,
    Insert,
    Other(String),
}

impl Capability {
    /// Parses a capability token, ignoring case and surrounding whitespace.
    pub fn parse(value: &str) -> Self {
        let upper = value.trim().to_ascii_uppercase();
        match upper.as_str() {
            "VIEW" => Self::View,
            "EDIT" => Self::Edit,
            "DELETE" => Self::Delete,
            "INSERT" => Self::Insert,
            _ => Self::Other(upper),
        }
    }

    /// Returns the canonical upper-case token.
    pub fn as_str(&self) -> &str {
        match self {
            Self::View => "VIEW",
            Self::Edit => "EDIT",
            Self::Delete => "DELETE",
            Self::Insert => "INSERT",
            Self::Other(value) => value,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

/// Value stored under a permission key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Grant {
    /// A list of capability tokens; may be empty.
    Capabilities(Vec<Capability>),
    /// The stored value was not a list. Never grants anything.
    Malformed,
}

impl Grant {
    fn allows(&self, capability: &Capability) -> bool {
        match self {
            Self::Capabilities(list) => list.contains(capability),
            Self::Malformed => false,
        }
    }
}

/// Permission map attached to a user's role: key -> capability tokens.
///
/// Keys form a `/`-separated hierarchy. A key without `/` is a parent of every
/// `key/...`; a key ending in `/*` covers every key under its prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionMap {
    entries: BTreeMap<String, Grant>,
}

impl PermissionMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from a JSON value without failing.
    ///
    /// Objects are read key by key; a JSON string is parsed first (role rows
    /// often store the map as text). Anything else yields an empty map.
    /// Non-array values become [`Grant::Malformed`], non-string array items
    /// are skipped.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(object) => {
                let entries = object
                    .iter()
                    .map(|(key, value)| {
                        let grant = match value {
                            Value::Array(items) => Grant::Capabilities(
                                items
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(Capability::parse)
                                    .collect(),
                            ),
                            _ => Grant::Malformed,
                        };
                        (key.clone(), grant)
                    })
                    .collect();
                Self { entries }
            }
            Value::String(text) => serde_json::from_str::<Value>(text)
                .map(|parsed| match parsed {
                    Value::String(_) => Self::default(),
                    other => Self::from_value(&other),
                })
                .unwrap_or_default(),
            _ => Self::default(),
        }
    }

    /// Grants `capabilities` on `key`, replacing any previous grant.
    pub fn insert<I, C>(&mut self, key: impl Into<String>, capabilities: I)
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        self.entries.insert(
            key.into(),
            Grant::Capabilities(capabilities.into_iter().map(Into::into).collect()),
        );
    }

    /// Builder-style [`PermissionMap::insert`].
    pub fn with<I, C>(mut self, key: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        self.insert(key, capabilities);
        self
    }

    /// Returns the grant stored under `key`, if the key is present.
    pub fn get(&self, key: &str) -> Option<&Grant> {
        self.entries.get(key)
    }

    /// Returns whether the map has no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Keeps only the keys accepted by `keep`.
    pub fn retain_keys(&self, mut keep: impl FnMut(&str) -> bool) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|(key, _)| keep(key))
            .map(|(key, grant)| (key.clone(), grant.clone()))
            .collect();
        Self { entries }
    }

    /// See [`has_capability`].
    pub fn grants(&self, required: &RequiredKeys, capability: &str) -> bool {
        has_capability(self, required, capability)
    }

    fn to_value(&self) -> Value {
        let object = self
            .entries
            .iter()
            .map(|(key, grant)| {
                let value = match grant {
                    Grant::Capabilities(list) => Value::Array(
                        list.iter()
                            .map(|cap| Value::String(cap.as_str().to_string()))
                            .collect(),
                    ),
                    Grant::Malformed => Value::Null,
                };
                (key.clone(), value)
            })
            .collect();
        Value::Object(object)
    }
}

impl Serialize for PermissionMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PermissionMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}

/// Keys a route requires; any one of them is enough.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequiredKeys {
    One(String),
    Any(Vec<String>),
}

impl RequiredKeys {
    /// Iterates over the required keys.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::One(key) => std::slice::from_ref(key),
            Self::Any(keys) => keys,
        };
        slice.iter().map(String::as_str)
    }
}

impl From<&str> for RequiredKeys {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

impl From<String> for RequiredKeys {
    fn from(value: String) -> Self {
        Self::One(value)
    }
}

impl From<Vec<&str>> for RequiredKeys {
    fn from(value: Vec<&str>) -> Self {
        Self::Any(value.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for RequiredKeys {
    fn from(value: [&str; N]) -> Self {
        Self::Any(value.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<String>> for RequiredKeys {
    fn from(value: Vec<String>) -> Self {
        Self::Any(value)
    }
}

/// Returns whether a granted `key` covers the `required` key.
pub(crate) fn key_matches(key: &str, required: &str) -> bool {
    if key == required {
        return true;
    }
    if let Some(prefix) = key.strip_suffix("/*")
        && required
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
    {
        return true;
    }
    !key.contains('/')
        && required
            .strip_prefix(key)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Checks whether `map` grants `capability` on any of the `required` keys.
///
/// Keys compare case-sensitively, capability tokens case-insensitively.
/// Malformed grants and empty maps never match; the function never panics.
pub fn has_capability(map: &PermissionMap, required: &RequiredKeys, capability: &str) -> bool {
    if map.is_empty() {
        return false;
    }
    let wanted = Capability::parse(capability);
    map.entries.iter().any(|(key, grant)| {
        required.iter().any(|level| key_matches(key, level)) && grant.allows(&wanted)
    })
}
