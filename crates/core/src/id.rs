// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed identifiers for runs, tasks, and approvals.
//!
//! An id is a short type prefix plus 19 characters of nanoid entropy,
//! stored inline and zero-padded so the broker's correlation maps key
//! on `Copy` values and can still be probed with `&str`. The phantom
//! tag keeps the id spaces apart at compile time: a `TaskId` never
//! lands in a run table by accident.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Inline id capacity: 4-char prefix + 19-char random body.
pub const ID_CAP: usize = 23;

/// Entropy length of a generated id body.
const BODY_LEN: usize = 19;

/// Ties an id space to its wire prefix.
pub trait IdTag {
    /// Short type tag, e.g. `run-`.
    const PREFIX: &'static str;
}

/// Inline, zero-padded identifier in the `K` id space.
pub struct Id<K> {
    /// Valid UTF-8 with no interior NUL; zero bytes pad the tail.
    bytes: [u8; ID_CAP],
    _tag: PhantomData<K>,
}

impl<K: IdTag> Id<K> {
    /// Generate a fresh random id with the space's prefix.
    pub fn new() -> Self {
        Self::from_string(format!("{}{}", K::PREFIX, nanoid::nanoid!(BODY_LEN)))
    }

    /// The id without its type prefix.
    pub fn body(&self) -> &str {
        let s = self.as_str();
        s.strip_prefix(K::PREFIX).unwrap_or(s)
    }
}

impl<K> Id<K> {
    /// Parse an id from wire text. Anything past the inline capacity
    /// (or past a NUL byte) is dropped at the nearest char boundary;
    /// ids the daemon generates always fit exactly.
    pub fn from_string(s: impl AsRef<str>) -> Self {
        let s = s.as_ref();
        let s = match s.find('\0') {
            Some(nul) => &s[..nul],
            None => s,
        };
        let mut end = s.len().min(ID_CAP);
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; ID_CAP];
        bytes[..end].copy_from_slice(&s.as_bytes()[..end]);
        Self { bytes, _tag: PhantomData }
    }

    pub fn as_str(&self) -> &str {
        let end = self.bytes.iter().position(|b| *b == 0).unwrap_or(ID_CAP);
        match std::str::from_utf8(&self.bytes[..end]) {
            Ok(s) => s,
            // from_string only stores str prefixes cut on char boundaries.
            Err(_) => unreachable!("id bytes hold valid UTF-8"),
        }
    }
}

impl<K> Clone for Id<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Id<K> {}

impl<K> PartialEq for Id<K> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<K> Eq for Id<K> {}

impl<K> Hash for Id<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash only the active bytes so it matches str::hash, which is
        // required for Borrow<str> HashMap lookups.
        self.as_str().hash(state);
    }
}

impl<K> Borrow<str> for Id<K> {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl<K> AsRef<str> for Id<K> {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl<K> fmt::Debug for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl<K> fmt::Display for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<K> PartialEq<str> for Id<K> {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl<K> PartialEq<&str> for Id<K> {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl<K> serde::Serialize for Id<K> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de, K> serde::Deserialize<'de> for Id<K> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Owned, so ids decode from escaped JSON and from
        // `serde_json::Value` alike.
        let s = String::deserialize(deserializer)?;
        if s.len() > ID_CAP {
            return Err(serde::de::Error::custom(format!(
                "id exceeds {ID_CAP} bytes: {s:?}"
            )));
        }
        Ok(Self::from_string(s))
    }
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
