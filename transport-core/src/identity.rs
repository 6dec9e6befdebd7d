/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::InvalidFormatError;
use crate::util::{from_hex, to_hex};

/// Size of a peer identity in bytes.
pub const PEER_IDENTITY_SIZE: usize = 32;

/// The opaque 32-byte identifier of an overlay participant.
///
/// The cryptographic identity layer that produces and verifies these lives
/// outside this crate family; here they are only compared, hashed, and
/// carried on the wire. Equality is byte equality.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PeerIdentity(pub [u8; PEER_IDENTITY_SIZE]);

impl PeerIdentity {
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8; PEER_IDENTITY_SIZE] {
        &self.0
    }

    pub fn from_bytes(b: &[u8]) -> Option<PeerIdentity> {
        if b.len() == PEER_IDENTITY_SIZE {
            Some(PeerIdentity(b.try_into().unwrap()))
        } else {
            None
        }
    }

    /// Abbreviated form for log output: first eight hex digits.
    pub fn to_short_string(&self) -> String {
        to_hex(&self.0[0..4])
    }
}

impl Hash for PeerIdentity {
    #[inline(always)]
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The identity is already uniformly distributed output of a hash
        // function, so the first eight bytes suffice.
        state.write_u64(u64::from_ne_bytes(self.0[0..8].try_into().unwrap()));
    }
}

impl Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(to_hex(&self.0).as_str())
    }
}

impl Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.to_short_string().as_str())
    }
}

impl FromStr for PeerIdentity {
    type Err = InvalidFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        from_hex(s.trim()).and_then(|b| PeerIdentity::from_bytes(b.as_slice())).ok_or(InvalidFormatError)
    }
}

impl Serialize for PeerIdentity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_string().as_str())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

struct PeerIdentityVisitor;

impl<'de> serde::de::Visitor<'de> for PeerIdentityVisitor {
    type Value = PeerIdentity;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a 32-byte peer identity")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        PeerIdentity::from_bytes(v).ok_or_else(|| E::custom("object too large"))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        PeerIdentity::from_str(v).map_err(|e| E::custom(e.to_string()))
    }
}

impl<'de> Deserialize<'de> for PeerIdentity {
    fn deserialize<D>(deserializer: D) -> Result<PeerIdentity, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(PeerIdentityVisitor)
        } else {
            deserializer.deserialize_bytes(PeerIdentityVisitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        let mut b = [0u8; PEER_IDENTITY_SIZE];
        for (i, x) in b.iter_mut().enumerate() {
            *x = i as u8;
        }
        let id = PeerIdentity(b);
        assert_eq!(PeerIdentity::from_str(id.to_string().as_str()).unwrap(), id);
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(PeerIdentity::from_bytes(&[0u8; 31]).is_none());
        assert!(PeerIdentity::from_bytes(&[0u8; 33]).is_none());
        assert!(PeerIdentity::from_str("abcd").is_err());
    }
}
