//! Primitive value types shared by channels, proposals and the node.

use core::{fmt, str::FromStr};

use rand::{distributions::Standard, prelude::Distribution};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uint::construct_uint;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

macro_rules! bytesN {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, Hash, Copy, Clone, PartialOrd, Ord)]
        pub struct $T(pub [u8; $N]);

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                $T(rng.gen())
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl FromStr for $T {
            type Err = ParseBytesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let digits = s.strip_prefix("0x").unwrap_or(s);
                let mut buf = [0u8; $N];
                hex::decode_to_slice(digits, &mut buf).map_err(|_| ParseBytesError {
                    expected: $N,
                    input: s.to_string(),
                })?;
                Ok(Self(buf))
            }
        }

        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }

        impl_hex_debug!($T);
    };
}

/// Returned when a hex string does not describe exactly the expected number
/// of bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected} hex-encoded bytes, got {input:?}")]
pub struct ParseBytesError {
    pub expected: usize,
    pub input: String,
}

// On-chain address, also used as the Perun identity of a peer.
bytesN!(Address, 20);
bytesN!(Hash, 32);
bytesN!(Bytes32, 32);

/// Identity of a counterparty. Currently the same as its on-chain address.
pub type PeerIdentity = Address;

construct_uint! {
    pub struct U256(4);
}

impl U256 {
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}
