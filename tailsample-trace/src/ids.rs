// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Error returned when parsing a trace or span identifier from text.
#[derive(Debug, PartialEq)]
pub struct ParseIdError {
    expected_chars: usize,
}

impl ParseIdError {
    fn new(expected_chars: usize) -> Self {
        Self { expected_chars }
    }
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected {} lowercase hex characters",
            self.expected_chars
        )
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! impl_id {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        ///
        /// The textual form is the lowercase hex encoding of the raw bytes,
        /// which is also how the id appears on the wire.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// True if every byte is zero. Zero ids are representable; the
            /// core trusts upstream to assign identifiers.
            pub fn is_zero(&self) -> bool {
                self.0 == [0; $len]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(s, &mut bytes)
                    .map_err(|_| ParseIdError::new($len * 2))?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                text.parse().map_err(de::Error::custom)
            }
        }
    };
}

impl_id!(TraceId, 16, "A 128-bit trace identifier.");
impl_id!(SpanId, 8, "A 64-bit span identifier.");
