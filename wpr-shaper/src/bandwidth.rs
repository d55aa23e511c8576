use std::{fmt, str::FromStr};

use crate::ConfigError;

/// A bandwidth cap in bits per second. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bandwidth(u64);

impl Bandwidth {
    pub const UNLIMITED: Self = Self(0);

    pub const fn from_bits_per_sec(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn from_bytes_per_sec(bytes: u64) -> Self {
        Self(bytes.saturating_mul(8))
    }

    #[inline]
    pub const fn bits_per_sec(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_unlimited(&self) -> bool {
        self.0 == 0
    }
}

impl FromStr for Bandwidth {
    type Err = ConfigError;

    /// Parses `<n>`, `<n>bit/s`, `<n>Byte/s` with an optional `K` or `M` (decimal) prefix.
    /// Units are case-sensitive: `KBit/s` and `Mbyte/s` are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Bandwidth(s.to_string());

        let digits = s.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(invalid());
        }

        let value: u64 = s[..digits].parse().map_err(|_| invalid())?;
        let unit = &s[digits..];
        if unit.is_empty() {
            return Ok(Self(value));
        }

        let (multiplier, unit) = match unit.as_bytes()[0] {
            b'K' => (1_000, &unit[1..]),
            b'M' => (1_000_000, &unit[1..]),
            _ => (1, unit),
        };

        let bits_per_unit = match unit {
            "bit/s" => 1,
            "Byte/s" => 8,
            _ => return Err(invalid()),
        };

        value
            .checked_mul(multiplier * bits_per_unit)
            .map(Self)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "unlimited"),
            bits if bits % 1_000_000 == 0 => write!(f, "{}Mbit/s", bits / 1_000_000),
            bits if bits % 1_000 == 0 => write!(f, "{}Kbit/s", bits / 1_000),
            bits => write!(f, "{bits}bit/s"),
        }
    }
}
