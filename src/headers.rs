//! Headers container.
//!
//! `Headers` keeps header lines in insertion order, permits duplicate
//! names, and looks names up without regard to ASCII case. It is immutable
//! once built; edits go through [`HeadersBuilder`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;

/// An ordered multimap of HTTP header lines.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Builds headers from name/value pairs, in order. A convenience for
    /// known-good literals; runtime input belongs on
    /// [`HeadersBuilder::add`], which reports invalid lines instead.
    ///
    /// # Panics
    ///
    /// Panics if a pair fails [`HeadersBuilder::add`] validation.
    pub fn of(pairs: &[(&str, &str)]) -> Headers {
        let mut builder = Headers::builder();
        for &(name, value) in pairs {
            builder.add(name, value).expect("invalid header pair");
        }
        builder.build()
    }

    /// Returns an empty builder.
    pub fn builder() -> HeadersBuilder {
        HeadersBuilder {
            entries: Vec::new(),
        }
    }

    /// Returns a builder seeded with a copy of these headers.
    pub fn new_builder(&self) -> HeadersBuilder {
        HeadersBuilder {
            entries: self.entries.clone(),
        }
    }

    /// Returns the last value for `name`, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns all values for `name` in insertion order.
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns the name at position `i`.
    pub fn name(&self, i: usize) -> &str {
        &self.entries[i].0
    }

    /// Returns the value at position `i`.
    pub fn value(&self, i: usize) -> &str {
        &self.entries[i].1
    }

    /// Returns the distinct header names, lowercased.
    pub fn names(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .map(|(n, _)| n.to_ascii_lowercase())
            .collect()
    }

    /// The number of header lines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no header lines.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Groups values by lowercased name, preserving per-name order.
    pub fn to_multimap(&self) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in &self.entries {
            map.entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.clone());
        }
        map
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(n, v)| (n, v)))
            .finish()
    }
}

impl fmt::Display for Headers {
    /// Formats as wire lines, each terminated by CRLF.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

/// Builds a [`Headers`].
#[derive(Clone, Debug, Default)]
pub struct HeadersBuilder {
    entries: Vec<(String, String)>,
}

impl HeadersBuilder {
    /// Adds a header line, validating the name and value: the name must
    /// be non-empty and neither part may contain a NUL byte. Caller
    /// input that fails validation is reported, never trusted.
    pub fn add(&mut self, name: &str, value: &str) -> crate::Result<&mut HeadersBuilder> {
        check_name(name)?;
        check_value(name, value)?;
        self.entries
            .push((name.to_owned(), value.trim().to_owned()));
        Ok(self)
    }

    /// Adds a `name: value` line, split at the first colon. Fails when
    /// the line has no colon or `add` validation rejects it.
    pub fn add_line(&mut self, line: &str) -> crate::Result<&mut HeadersBuilder> {
        match line.find(':') {
            Some(idx) => self.add(&line[..idx], &line[idx + 1..]),
            None => Err(invalid_header(format!("unexpected header: {:?}", line))),
        }
    }

    /// Adds a line from the wire or the cache without validation.
    ///
    /// Tolerates an empty name and a leading colon, which occur in legacy
    /// peer data. Must only be used for input from a remote peer or from
    /// the cache, never for caller-supplied headers.
    pub fn add_lenient(&mut self, line: &str) -> &mut HeadersBuilder {
        // A leading colon is part of the name (old SPDY pseudo-fields), so
        // search for the separator from the second byte.
        let idx = if line.starts_with(':') {
            line[1..].find(':').map(|i| i + 1)
        } else {
            line.find(':')
        };
        match idx {
            Some(i) => self.add_lenient_pair(&line[..i], line[i + 1..].trim()),
            None => self.add_lenient_pair("", line.trim()),
        }
    }

    pub(crate) fn add_lenient_pair(&mut self, name: &str, value: &str) -> &mut HeadersBuilder {
        self.entries
            .push((name.to_owned(), value.trim().to_owned()));
        self
    }

    /// Sets `name` to a single `value`, replacing any prior lines.
    /// Validates like [`add`](HeadersBuilder::add); prior lines survive a
    /// rejected value.
    pub fn set(&mut self, name: &str, value: &str) -> crate::Result<&mut HeadersBuilder> {
        check_name(name)?;
        check_value(name, value)?;
        self.remove_all(name);
        self.entries
            .push((name.to_owned(), value.trim().to_owned()));
        Ok(self)
    }

    /// Removes every line named `name`, ignoring ASCII case.
    pub fn remove_all(&mut self, name: &str) -> &mut HeadersBuilder {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self
    }

    /// Returns the last value for `name`, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Finishes the build.
    pub fn build(&mut self) -> Headers {
        Headers {
            entries: std::mem::take(&mut self.entries),
        }
    }
}

fn check_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(invalid_header("header name must not be empty"));
    }
    if name.contains('\0') {
        return Err(invalid_header(format!(
            "header name must not contain NUL: {:?}",
            name
        )));
    }
    Ok(())
}

fn check_value(name: &str, value: &str) -> crate::Result<()> {
    if value.contains('\0') {
        return Err(invalid_header(format!(
            "value for header {:?} must not contain NUL",
            name
        )));
    }
    Ok(())
}

fn invalid_header<M: Into<String>>(message: M) -> crate::Error {
    crate::Error::new_request(io::Error::new(io::ErrorKind::InvalidInput, message.into()))
}

#[cfg(test)]
mod tests {
    use super::Headers;

    #[test]
    fn lookup_ignores_case() {
        let headers = Headers::of(&[("Content-Type", "text/plain")]);
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn get_returns_last_value() {
        let headers = Headers::of(&[("Warning", "first"), ("warning", "second")]);
        assert_eq!(headers.get("Warning"), Some("second"));
        assert_eq!(headers.values("WARNING"), vec!["first", "second"]);
    }

    #[test]
    fn builder_round_trip_preserves_order() {
        let headers = Headers::of(&[("B", "1"), ("a", "2"), ("B", "3")]);
        let copy = headers.new_builder().build();
        assert_eq!(headers, copy);
        assert_eq!(copy.name(0), "B");
        assert_eq!(copy.name(1), "a");
        assert_eq!(copy.value(2), "3");
    }

    #[test]
    fn values_are_trimmed_names_are_not() {
        let mut builder = Headers::builder();
        builder.add("Host", "  example.com  ").unwrap();
        let headers = builder.build();
        assert_eq!(headers.get("Host"), Some("example.com"));
        assert_eq!(headers.name(0), "Host");
    }

    #[test]
    fn set_replaces_all() {
        let mut builder = Headers::of(&[("Cookie", "a"), ("cookie", "b")]).new_builder();
        builder.set("Cookie", "c").unwrap();
        let headers = builder.build();
        assert_eq!(headers.values("cookie"), vec!["c"]);
    }

    #[test]
    fn lenient_tolerates_empty_name_and_leading_colon() {
        let mut builder = Headers::builder();
        builder.add_lenient(":status: 200");
        builder.add_lenient("just a value");
        let headers = builder.build();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.name(0), ":status");
        assert_eq!(headers.value(0), "200");
        assert_eq!(headers.name(1), "");
        assert_eq!(headers.value(1), "just a value");
    }

    #[test]
    fn add_line_splits_at_first_colon() {
        let mut builder = Headers::builder();
        builder.add_line("Location: http://example.com/a:b").unwrap();
        let headers = builder.build();
        assert_eq!(headers.get("Location"), Some("http://example.com/a:b"));
    }

    #[test]
    fn add_line_requires_a_colon() {
        assert!(Headers::builder().add_line("no separator here").is_err());
    }

    #[test]
    fn names_is_case_insensitive_set() {
        let headers = Headers::of(&[("Accept", "a"), ("ACCEPT", "b"), ("Host", "h")]);
        let names = headers.names();
        assert_eq!(names.len(), 2);
        assert!(names.contains("accept"));
        assert!(names.contains("host"));
    }

    #[test]
    fn multimap_groups_by_lowercase_name() {
        let headers = Headers::of(&[("Vary", "Accept"), ("VARY", "Cookie")]);
        let map = headers.to_multimap();
        assert_eq!(map["vary"], vec!["Accept", "Cookie"]);
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = Headers::builder().add("", "value").unwrap_err();
        assert!(err.is_request());
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(Headers::builder().add("Name", "a\0b").is_err());
        assert!(Headers::builder().add("Na\0me", "value").is_err());
        assert!(Headers::builder().set("Name", "a\0b").is_err());
    }

    #[test]
    fn rejected_set_keeps_prior_lines() {
        let mut builder = Headers::of(&[("Cookie", "a")]).new_builder();
        assert!(builder.set("Cookie", "bad\0value").is_err());
        assert_eq!(builder.build().values("Cookie"), vec!["a"]);
    }
}
