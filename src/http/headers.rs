//! HTTP header map with case-insensitive name lookup.

/// A case-insensitive, order-preserving, multi-value header map.
///
/// # Examples
///
/// ```
/// use fanhub::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Connection", "keep-alive, Upgrade");
///
/// assert_eq!(headers.get("connection"), Some("keep-alive, Upgrade"));
/// assert!(headers.has_token("Connection", "upgrade"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all values for the given header name (case-insensitive).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if any value of `name`, read as a comma-separated token
    /// list, contains `token` (case-insensitive).
    ///
    /// `Connection` and `Upgrade` are list-valued, so browsers send things like
    /// `Connection: keep-alive, Upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.insert("Sec-WebSocket-Key", "abc");
        assert_eq!(h.get("sec-websocket-key"), Some("abc"));
        assert_eq!(h.get("SEC-WEBSOCKET-KEY"), Some("abc"));
        assert!(h.contains("Sec-Websocket-Key"));
        assert!(!h.contains("origin"));
    }

    #[test]
    fn value_outlives_lookup_name() {
        let mut h = Headers::new();
        h.insert("Origin", "http://example.com");
        let value = {
            let name = String::from("origin");
            h.get(&name)
        };
        assert_eq!(value, Some("http://example.com"));
    }

    #[test]
    fn token_lists() {
        let mut h = Headers::new();
        h.insert("Connection", "keep-alive, Upgrade");
        h.insert("Upgrade", "websocket");
        assert!(h.has_token("connection", "upgrade"));
        assert!(h.has_token("connection", "Keep-Alive"));
        assert!(h.has_token("upgrade", "WebSocket"));
        assert!(!h.has_token("connection", "close"));
        assert!(!h.has_token("x-missing", "anything"));
    }

    #[test]
    fn token_across_repeated_headers() {
        let mut h = Headers::new();
        h.insert("Connection", "keep-alive");
        h.insert("Connection", "upgrade");
        assert!(h.has_token("connection", "upgrade"));
        assert_eq!(h.len(), 2);
    }
}
