use std::fmt;
use std::str::FromStr;

use human_size::{Byte, Size, SpecificSize};
use serde::de;

pub use human_size::ParsingError as ByteSizeParseError;

/// Multiples tried when formatting, from the largest to the smallest.
const MULTIPLES: &[(u64, &str)] = &[
    (1_000_000, "MB"),
    (1 << 20, "MiB"),
    (1000, "kB"),
    (1 << 10, "KiB"),
];

/// Represents a size in bytes.
///
/// Parses plain integers as bytes and human readable sizes such as `100KiB` or `1MB`.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Create a byte size from bytes.
    pub const fn bytes(value: u64) -> Self {
        Self(value)
    }

    /// Create a byte size from kibibytes.
    pub const fn kibibytes(value: u64) -> Self {
        Self(value * 1024)
    }

    /// Return the value in bytes.
    pub fn as_bytes(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl FromStr for ByteSize {
    type Err = ByteSizeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Ok(bytes) = value.parse::<u64>() {
            return Ok(Self(bytes));
        }

        let size = value.parse::<Size>()?;
        let bytes: SpecificSize<Byte> = size.into();
        Ok(Self(bytes.value() as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &(multiple, unit) in MULTIPLES {
            if self.0 >= multiple && self.0 % multiple == 0 {
                return write!(f, "{}{unit}", self.0 / multiple);
            }
        }

        write!(f, "{}B", self.0)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteSize({self})")
    }
}

impl From<u64> for ByteSize {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

courier_common::impl_str_ser!(ByteSize);

impl<'de> de::Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct V;

        impl de::Visitor<'_> for V {
            type Value = ByteSize;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a data size such as 100KiB")
            }

            fn visit_u64<E>(self, value: u64) -> Result<ByteSize, E>
            where
                E: de::Error,
            {
                Ok(ByteSize(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<ByteSize, E>
            where
                E: de::Error,
            {
                u64::try_from(value)
                    .map(ByteSize)
                    .map_err(|_| de::Error::invalid_value(de::Unexpected::Signed(value), &self))
            }

            fn visit_str<E>(self, value: &str) -> Result<ByteSize, E>
            where
                E: de::Error,
            {
                value
                    .parse()
                    .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_any(V)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_human_sizes() {
        let size: ByteSize = "100KiB".parse().unwrap();
        assert_eq!(size.as_bytes(), 102_400);

        let size: ByteSize = "64kB".parse().unwrap();
        assert_eq!(size.as_bytes(), 64_000);

        let size: ByteSize = "42".parse().unwrap();
        assert_eq!(size.as_bytes(), 42);
    }

    #[test]
    fn test_display_picks_exact_multiple() {
        assert_eq!(ByteSize::kibibytes(100).to_string(), "100KiB");
        assert_eq!(ByteSize::bytes(1_000_000).to_string(), "1MB");
        assert_eq!(ByteSize::bytes(1025).to_string(), "1025B");
    }

    #[test]
    fn test_serde_roundtrip_yaml() {
        let size: ByteSize = serde_yaml::from_str("1000").unwrap();
        assert_eq!(size.as_bytes(), 1000);

        let size: ByteSize = serde_yaml::from_str("2MiB").unwrap();
        assert_eq!(size.as_bytes(), 2 * 1024 * 1024);
        assert_eq!(serde_yaml::to_string(&size).unwrap().trim(), "2MiB");
    }

    #[test]
    fn test_parse_invalid() {
        assert!("lots".parse::<ByteSize>().is_err());
    }
}
