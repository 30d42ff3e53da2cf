/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::Guid;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

impl Guid {
    /// Create a random guid: 9 random bytes base64url-encoded into 12
    /// characters. Collision odds are comfortably past anything a single
    /// install will ever produce.
    pub fn random() -> Self {
        let bytes: [u8; 9] = rand::random();
        Guid(URL_SAFE_NO_PAD.encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random() {
        let g = Guid::random();
        assert_eq!(g.len(), 12);
        assert!(g
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
        assert_ne!(Guid::random(), Guid::random());
    }
}
