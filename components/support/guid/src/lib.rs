/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![warn(rust_2018_idioms)]

#[cfg(feature = "rusqlite_support")]
mod rusqlite_support;

#[cfg(feature = "serde_support")]
mod serde_support;

#[cfg(feature = "random")]
mod random;

use std::{fmt, ops};

/// A guid used to identify a row across devices. It's a newtype over String
/// rather than a bare String so that:
///
/// 1. It's explicit about what is being stored, and prevents bugs where a
///    guid is passed to a function expecting other text.
///
/// 2. Guids are guaranteed immutable once created.
#[derive(Clone, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Guid(String);

impl Guid {
    #[inline]
    pub fn new(s: &str) -> Self {
        Guid(s.into())
    }

    #[inline]
    pub fn empty() -> Self {
        Guid(String::new())
    }

    #[inline]
    pub fn from_string(s: String) -> Self {
        Guid(s)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl<'a> From<&'a str> for Guid {
    #[inline]
    fn from(s: &'a str) -> Guid {
        Guid::new(s)
    }
}

impl<'a> From<&'a String> for Guid {
    #[inline]
    fn from(s: &'a String) -> Guid {
        Guid::new(s)
    }
}

impl From<String> for Guid {
    #[inline]
    fn from(s: String) -> Guid {
        Guid::from_string(s)
    }
}

impl From<Guid> for String {
    #[inline]
    fn from(guid: Guid) -> String {
        guid.into_string()
    }
}

impl AsRef<str> for Guid {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl ops::Deref for Guid {
    type Target = str;
    #[inline]
    fn deref(&self) -> &str {
        self.as_str()
    }
}

// The default Debug impl is pretty unhelpful here.
impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:?})", self.as_str())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_str(), f)
    }
}

impl PartialEq<str> for Guid {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&'_ str> for Guid {
    fn eq(&self, other: &&'_ str) -> bool {
        self.as_str() == *other
    }
}

impl PartialEq<String> for Guid {
    fn eq(&self, other: &String) -> bool {
        self.as_str() == other.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison() {
        let guid = Guid::from("abcdabcdabcd");
        assert_eq!(guid, "abcdabcdabcd");
        assert_eq!(guid, "abcdabcdabcd".to_string());
        assert_ne!(guid, "ABCDabcdabcd");
        assert!(Guid::from("aaa") < Guid::from("bbb"));
    }

    #[test]
    fn test_empty() {
        assert!(Guid::empty().is_empty());
        assert!(!Guid::from("a").is_empty());
    }
}
