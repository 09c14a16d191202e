use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

/// The parsed framed request header: a case-sensitive key/value map plus the
/// raw on-wire `key\0value\0` block it was decoded from.
///
/// Mutations mark the set as modified; [`HeaderSet::rebuild_data`] then
/// regenerates the wire form so the block forwarded to the application
/// reflects the mutated map.
#[derive(Debug, Clone)]
pub struct HeaderSet {
    map: BTreeMap<String, Bytes>,
    raw: Bytes,
    modified: bool,
}

impl HeaderSet {
    pub(crate) fn new(map: BTreeMap<String, Bytes>, raw: Bytes) -> Self {
        Self { map, raw, modified: false }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.map.get(key).map(|value| value.as_ref())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Boolean option lookup: the literal value `"true"` is true, anything
    /// else (including absence) falls back to `default`.
    pub fn bool_option(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => value == b"true",
            None => default,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.map.insert(key.into(), value.into());
        self.modified = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<Bytes> {
        let removed = self.map.remove(key);
        if removed.is_some() {
            self.modified = true;
        }
        removed
    }

    /// Moves `HTTP_CONTENT_LENGTH`/`HTTP_CONTENT_TYPE` to their non-`HTTP_`
    /// names. When both forms are present the non-`HTTP_` one wins and the
    /// `HTTP_` form is dropped. Returns whether anything changed.
    ///
    /// The result is idempotent: a second pass is always a no-op.
    pub fn normalize_entity_headers(&mut self) -> bool {
        let mut changed = false;
        for (http_key, plain_key) in
            [("HTTP_CONTENT_LENGTH", "CONTENT_LENGTH"), ("HTTP_CONTENT_TYPE", "CONTENT_TYPE")]
        {
            if let Some(value) = self.map.remove(http_key) {
                if !self.map.contains_key(plain_key) {
                    self.map.insert(plain_key.to_string(), value);
                }
                changed = true;
            }
        }
        if changed {
            self.modified = true;
        }
        changed
    }

    /// Regenerates the on-wire `key\0value\0` block from the map.
    ///
    /// A no-op unless `force` is passed or the map was mutated since the
    /// last rebuild; the block as received from the front-end is kept
    /// byte-identical otherwise.
    pub fn rebuild_data(&mut self, force: bool) {
        if !force && !self.modified {
            return;
        }
        let mut out = BytesMut::with_capacity(self.raw.len() + 16);
        for (key, value) in &self.map {
            out.put_slice(key.as_bytes());
            out.put_u8(0);
            out.put_slice(value);
            out.put_u8(0);
        }
        self.raw = out.freeze();
        self.modified = false;
    }

    /// The on-wire form of the header block, as last (re)built.
    pub fn header_data(&self) -> &Bytes {
        &self.raw
    }
}
