//! Header multimap with case-insensitive lookup.
//!
//! Entries keep their arrival order so they can be echoed back exactly
//! (the `/dynamic/info` endpoint does this), while lookups ignore ASCII case
//! per RFC 9110 §5.1.

use std::fmt;

/// A case-insensitive, order-preserving, multi-value header map.
///
/// # Examples
///
/// ```
/// use rivet::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.append("Connection", "Keep-Alive, Upgrade");
///
/// assert!(headers.has_token("connection", "keep-alive"));
/// assert!(!headers.has_token("connection", "close"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Appends an entry. Existing values for the same name are kept.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value for `name` with a single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Returns the first value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `name` in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if any value of the comma-separated header `name` contains
    /// `token`, compared case-insensitively.
    ///
    /// Used for list-valued headers such as `Connection`, where
    /// `Connection: keep-alive, Upgrade` and two separate `Connection` lines mean
    /// the same thing.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Removes every entry named `name`. Returns `true` if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.entries.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Number of entries (not unique names).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

/// Wire form: one `Name: value\r\n` line per entry.
impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut h = Headers::new();
        h.append("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn value_outlives_the_name_used_to_find_it() {
        let h: Headers = [("Content-Length", "12")].into_iter().collect();
        let value = {
            let name = String::from("content-length");
            h.get(&name)
        };
        assert_eq!(value, Some("12"));
    }

    #[test]
    fn append_keeps_every_value_in_order() {
        let mut h = Headers::new();
        h.append("Set-Cookie", "a=1");
        h.append("X-Other", "x");
        h.append("set-cookie", "b=2");
        let vals: Vec<_> = h.get_all("Set-Cookie").collect();
        assert_eq!(vals, vec!["a=1", "b=2"]);
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn set_replaces_all_values() {
        let mut h = Headers::new();
        h.append("Connection", "keep-alive");
        h.append("connection", "upgrade");
        h.set("Connection", "close");
        assert_eq!(h.get_all("connection").count(), 1);
        assert_eq!(h.get("connection"), Some("close"));
    }

    #[test]
    fn tokens_span_lines_and_commas() {
        let h: Headers = [("Connection", "Upgrade"), ("connection", " Close ")]
            .into_iter()
            .collect();
        assert!(h.has_token("Connection", "close"));
        assert!(h.has_token("Connection", "upgrade"));
        assert!(!h.has_token("Connection", "keep-alive"));
    }

    #[test]
    fn display_is_wire_format() {
        let h: Headers = [("A", "1"), ("B", "2")].into_iter().collect();
        assert_eq!(h.to_string(), "A: 1\r\nB: 2\r\n");
    }

    #[test]
    fn remove_reports_whether_anything_went() {
        let mut h = Headers::new();
        h.append("X-Foo", "bar");
        assert!(h.remove("x-foo"));
        assert!(h.is_empty());
        assert!(!h.remove("x-foo"));
    }
}
