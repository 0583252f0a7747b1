//! ordered header map with case-insensitive names, plus cookies

use crate::http::HttpError;

/// Header map preserving insertion order. Names are lowercased on the
/// way in; lookups are case-insensitive. Once a response has been
/// parsed the map is sealed read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
    readonly: bool,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub(crate) fn freeze(&mut self) {
        self.readonly = true;
    }

    /// First value under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces the first value under `name` (or appends). Returns
    /// false without touching anything when the map is read-only.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> bool {
        if self.readonly {
            return false;
        }
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
        true
    }

    /// Appends a value, keeping existing ones under the same name.
    pub fn append(&mut self, name: &str, value: impl Into<String>) -> bool {
        if self.readonly {
            return false;
        }
        self.entries.push((name.to_ascii_lowercase(), value.into()));
        true
    }

    /// Removes every value under `name`, returning the first.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        if self.readonly {
            return None;
        }
        let name = name.to_ascii_lowercase();
        let first = self
            .entries
            .iter()
            .position(|(key, _)| *key == name)
            .map(|pos| self.entries[pos].1.clone());
        self.entries.retain(|(key, _)| *key != name);
        first
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

/// A cookie from a `set-cookie` header: the pair plus whatever
/// attributes followed it, verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub attributes: String,
}

pub(crate) fn parse_set_cookie(raw: &str) -> Result<Cookie, HttpError> {
    let (pair, attributes) = match raw.split_once(';') {
        Some((pair, attributes)) => (pair, attributes.trim()),
        None => (raw, ""),
    };
    let (name, value) = pair.split_once('=').ok_or(HttpError::InvalidResponseCookie)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(HttpError::InvalidResponseCookie);
    }
    Ok(Cookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        attributes: attributes.to_string(),
    })
}
