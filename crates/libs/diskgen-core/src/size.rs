//! Byte sizes and offsets which may still be undefined.
//!
//! A [`SizeType`] is either a concrete number of bytes or _undefined_. Undefined values
//! are used for region starts and sizes which are only determined during layout. Any
//! arithmetic or conversion involving an undefined value fails with
//! [`SizeError::Undefined`].

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Size or offset in bytes which may be undefined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SizeType {
    bytes: Option<u64>,
}

impl SizeType {
    /// The undefined size.
    pub const UNDEFINED: SizeType = SizeType { bytes: None };

    /// Zero bytes.
    pub const ZERO: SizeType = SizeType::new(0);

    /// Create a defined size from the given number of bytes.
    pub const fn new(bytes: u64) -> Self {
        Self { bytes: Some(bytes) }
    }

    /// Create a defined size from the given number of sectors.
    pub const fn from_sectors(sectors: u64) -> Self {
        Self::new(sectors * SECTOR_SIZE)
    }

    /// Indicates whether the size is undefined.
    pub const fn is_undefined(self) -> bool {
        self.bytes.is_none()
    }

    /// Indicates whether the size is defined.
    pub const fn is_defined(self) -> bool {
        self.bytes.is_some()
    }

    /// The number of bytes.
    pub fn bytes(self) -> Result<u64, SizeError> {
        self.bytes.ok_or(SizeError::Undefined)
    }

    /// The number of bytes, if defined.
    pub const fn get(self) -> Option<u64> {
        self.bytes
    }

    /// The exact number of sectors.
    ///
    /// Fails if the size is not a multiple of [`SECTOR_SIZE`].
    pub fn sectors(self) -> Result<u64, SizeError> {
        let bytes = self.bytes()?;
        if bytes % SECTOR_SIZE != 0 {
            return Err(SizeError::NotSectorAligned { bytes });
        }
        Ok(bytes / SECTOR_SIZE)
    }

    /// Round the size up to the next multiple of `alignment`.
    pub fn align_up(self, alignment: u64) -> Result<Self, SizeError> {
        let bytes = self.bytes()?;
        bytes
            .checked_next_multiple_of(alignment)
            .map(Self::new)
            .ok_or(SizeError::Overflow)
    }

    /// Compare two sizes, failing if one of them is undefined.
    pub fn try_cmp(self, other: Self) -> Result<Ordering, SizeError> {
        Ok(self.bytes()?.cmp(&other.bytes()?))
    }

    /// Key for sorting which orders undefined values after all defined ones.
    pub fn sort_key(self) -> (bool, u64) {
        (self.is_undefined(), self.bytes.unwrap_or(0))
    }

    /// Format as zero-padded hexadecimal byte offset, e.g., `0x00000200`.
    pub fn hex_bytes(self) -> String {
        match self.bytes {
            Some(bytes) => format!("0x{bytes:08x}"),
            None => "undefined".to_owned(),
        }
    }
}

impl From<u64> for SizeType {
    fn from(bytes: u64) -> Self {
        Self::new(bytes)
    }
}

impl std::ops::Add for SizeType {
    type Output = Result<SizeType, SizeError>;

    fn add(self, rhs: Self) -> Self::Output {
        self.bytes()?
            .checked_add(rhs.bytes()?)
            .map(SizeType::new)
            .ok_or(SizeError::Overflow)
    }
}

impl std::ops::Sub for SizeType {
    type Output = Result<SizeType, SizeError>;

    fn sub(self, rhs: Self) -> Self::Output {
        self.bytes()?
            .checked_sub(rhs.bytes()?)
            .map(SizeType::new)
            .ok_or(SizeError::Underflow)
    }
}

/// Error using a size.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizeError {
    /// The size is undefined.
    #[error("undefined value")]
    Undefined,
    #[error("size overflow")]
    Overflow,
    #[error("size underflow")]
    Underflow,
    /// The size is not a whole number of sectors.
    #[error("{bytes} B is not a multiple of the sector size")]
    NotSectorAligned { bytes: u64 },
}

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;

impl fmt::Display for SizeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(bytes) = self.bytes else {
            return f.write_str("undefined");
        };
        for (unit, factor) in [("GB", GIB), ("MB", MIB), ("KB", KIB)] {
            if bytes >= factor {
                let value = bytes as f64 / factor as f64;
                return if bytes % factor == 0 {
                    write!(f, "{} {unit}", bytes / factor)
                } else {
                    write!(f, "{value:.2} {unit}")
                };
            }
        }
        write!(f, "{bytes} B")
    }
}

/// Invalid size string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidSize {
    #[error("empty size string")]
    Empty,
    #[error("invalid character at position {pos}")]
    InvalidChar { pos: usize },
    #[error("unknown unit {unit:?}")]
    UnknownUnit { unit: String },
    #[error("size is too large")]
    Overflow,
}

/// Parse the multiplier of a unit suffix.
///
/// All multiples are binary, i.e., `1M` is `1048576` bytes.
fn unit_factor(unit: &str) -> Option<u64> {
    let factor = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "s" => SECTOR_SIZE,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        "t" | "tb" | "tib" => TIB,
        _ => return None,
    };
    Some(factor)
}

impl FromStr for SizeType {
    type Err = InvalidSize;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(InvalidSize::Empty);
        }
        let offset = s.len() - s.trim_start().len();
        let (radix, digits_start) = if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
            (16, 2)
        } else {
            (10, 0)
        };
        let mut value: u64 = 0;
        let mut seen_digit = false;
        let mut unit_start = trimmed.len();
        for (pos, char) in trimmed.char_indices().skip(digits_start) {
            if char == '_' {
                continue;
            }
            match char.to_digit(radix) {
                Some(digit) => {
                    seen_digit = true;
                    value = value
                        .checked_mul(radix.into())
                        .and_then(|value| value.checked_add(digit.into()))
                        .ok_or(InvalidSize::Overflow)?;
                }
                None => {
                    unit_start = pos;
                    break;
                }
            }
        }
        if !seen_digit {
            return Err(InvalidSize::InvalidChar {
                pos: offset + unit_start.min(digits_start),
            });
        }
        let unit = trimmed[unit_start..].trim_start();
        if radix == 16 && !unit.is_empty() {
            return Err(InvalidSize::InvalidChar {
                pos: offset + unit_start,
            });
        }
        if let Some(pos) = unit.find(|c: char| !c.is_ascii_alphabetic()) {
            return Err(InvalidSize::InvalidChar {
                pos: offset + trimmed.len() - unit.len() + pos,
            });
        }
        let factor = unit_factor(unit).ok_or_else(|| InvalidSize::UnknownUnit {
            unit: unit.to_owned(),
        })?;
        value
            .checked_mul(factor)
            .map(SizeType::new)
            .ok_or(InvalidSize::Overflow)
    }
}

impl<'de> serde::Deserialize<'de> for SizeType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct SizeVisitor;

        impl serde::de::Visitor<'_> for SizeVisitor {
            type Value = SizeType;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a size in bytes or a size string like \"4M\"")
            }

            fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(SizeType::new(value))
            }

            fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<Self::Value, E> {
                u64::try_from(value).map(SizeType::new).map_err(|_| {
                    E::invalid_value(serde::de::Unexpected::Signed(value), &self)
                })
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!("512".parse(), Ok(SizeType::new(512)));
        assert_eq!("0x200".parse(), Ok(SizeType::new(512)));
        assert_eq!("4S".parse(), Ok(SizeType::new(2048)));
        assert_eq!("1K".parse(), Ok(SizeType::new(1024)));
        assert_eq!("1M".parse(), Ok(SizeType::new(1 << 20)));
        assert_eq!("1 MiB".parse(), Ok(SizeType::new(1 << 20)));
        assert_eq!("2GB".parse(), Ok(SizeType::new(2 << 30)));
        assert_eq!(" 1_000 ".parse(), Ok(SizeType::new(1000)));
        assert_eq!("".parse::<SizeType>(), Err(InvalidSize::Empty));
        assert_eq!(
            "12X".parse::<SizeType>(),
            Err(InvalidSize::UnknownUnit {
                unit: "X".to_owned()
            })
        );
        assert!("M".parse::<SizeType>().is_err());
        assert!("99999999999999999999".parse::<SizeType>().is_err());
    }

    #[test]
    fn test_undefined_arithmetic() {
        let defined = SizeType::new(512);
        assert_eq!(defined + SizeType::UNDEFINED, Err(SizeError::Undefined));
        assert_eq!(SizeType::UNDEFINED - defined, Err(SizeError::Undefined));
        assert_eq!(SizeType::UNDEFINED.bytes(), Err(SizeError::Undefined));
        assert_eq!(defined + defined, Ok(SizeType::new(1024)));
        assert_eq!(defined - SizeType::new(1024), Err(SizeError::Underflow));
    }

    #[test]
    fn test_sectors() {
        assert_eq!(SizeType::new(1024).sectors(), Ok(2));
        assert_eq!(
            SizeType::new(1000).sectors(),
            Err(SizeError::NotSectorAligned { bytes: 1000 })
        );
        assert_eq!(SizeType::new(1025).align_up(SECTOR_SIZE), Ok(SizeType::new(1536)));
    }

    #[test]
    fn test_sort_key() {
        let mut sizes = vec![SizeType::UNDEFINED, SizeType::new(1024), SizeType::new(0)];
        sizes.sort_by_key(|size| size.sort_key());
        assert_eq!(
            sizes,
            vec![SizeType::new(0), SizeType::new(1024), SizeType::UNDEFINED]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(SizeType::new(512).to_string(), "512 B");
        assert_eq!(SizeType::new(4 << 20).to_string(), "4 MB");
        assert_eq!(SizeType::new(1536).to_string(), "1.50 KB");
        assert_eq!(SizeType::new(512).hex_bytes(), "0x00000200");
        assert_eq!(SizeType::UNDEFINED.to_string(), "undefined");
    }
}
