//! Human-readable size and duration wrappers for the TOML config surface.

use std::fmt::{self, Display, Formatter};
use std::ops::{Div, Mul};
use std::time::Duration;

use serde::de::{self, Unexpected, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const UNIT: u64 = 1;
const KIB: u64 = UNIT * 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    pub const fn kb(count: u64) -> ReadableSize {
        ReadableSize(count * KIB)
    }

    pub const fn mb(count: u64) -> ReadableSize {
        ReadableSize(count * MIB)
    }

    pub const fn gb(count: u64) -> ReadableSize {
        ReadableSize(count * GIB)
    }

    pub const fn as_mb(self) -> u64 {
        self.0 / MIB
    }
}

impl Div<u64> for ReadableSize {
    type Output = ReadableSize;

    fn div(self, rhs: u64) -> ReadableSize {
        ReadableSize(self.0 / rhs)
    }
}

impl Mul<u64> for ReadableSize {
    type Output = ReadableSize;

    fn mul(self, rhs: u64) -> ReadableSize {
        ReadableSize(self.0 * rhs)
    }
}

impl Display for ReadableSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0 >= GIB && self.0 % GIB == 0 {
            write!(f, "{}GiB", self.0 / GIB)
        } else if self.0 >= MIB && self.0 % MIB == 0 {
            write!(f, "{}MiB", self.0 / MIB)
        } else if self.0 >= KIB && self.0 % KIB == 0 {
            write!(f, "{}KiB", self.0 / KIB)
        } else {
            write!(f, "{}B", self.0)
        }
    }
}

impl Serialize for ReadableSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<ReadableSize, D::Error> {
        struct SizeVisitor;

        impl<'de> Visitor<'de> for SizeVisitor {
            type Value = ReadableSize;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("valid size")
            }

            fn visit_u64<E: de::Error>(self, size: u64) -> Result<ReadableSize, E> {
                Ok(ReadableSize(size))
            }

            fn visit_i64<E: de::Error>(self, size: i64) -> Result<ReadableSize, E> {
                if size >= 0 {
                    Ok(ReadableSize(size as u64))
                } else {
                    Err(E::invalid_value(Unexpected::Signed(size), &self))
                }
            }

            fn visit_str<E: de::Error>(self, size_str: &str) -> Result<ReadableSize, E> {
                let size_str = size_str.trim();
                let split = size_str
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(size_str.len());
                let (digits, unit) = size_str.split_at(split);
                let number: u64 = digits
                    .parse()
                    .map_err(|_| E::invalid_value(Unexpected::Str(size_str), &self))?;
                let mul = match unit.trim() {
                    "" | "B" => UNIT,
                    "KB" | "KiB" => KIB,
                    "MB" | "MiB" => MIB,
                    "GB" | "GiB" => GIB,
                    _ => return Err(E::invalid_value(Unexpected::Str(size_str), &self)),
                };
                Ok(ReadableSize(number * mul))
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadableDuration(pub Duration);

impl ReadableDuration {
    pub const fn millis(millis: u64) -> ReadableDuration {
        ReadableDuration(Duration::from_millis(millis))
    }

    pub const fn secs(secs: u64) -> ReadableDuration {
        ReadableDuration(Duration::from_secs(secs))
    }

    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }

    pub fn is_zero(&self) -> bool {
        self.0.as_nanos() == 0
    }
}

impl From<ReadableDuration> for Duration {
    fn from(d: ReadableDuration) -> Duration {
        d.0
    }
}

impl Display for ReadableDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis() as u64;
        if ms >= 1000 && ms % 1000 == 0 {
            write!(f, "{}s", ms / 1000)
        } else {
            write!(f, "{}ms", ms)
        }
    }
}

impl Serialize for ReadableDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReadableDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<ReadableDuration, D::Error> {
        struct DurVisitor;

        impl<'de> Visitor<'de> for DurVisitor {
            type Value = ReadableDuration;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("valid duration")
            }

            fn visit_u64<E: de::Error>(self, millis: u64) -> Result<ReadableDuration, E> {
                Ok(ReadableDuration::millis(millis))
            }

            fn visit_str<E: de::Error>(self, dur_str: &str) -> Result<ReadableDuration, E> {
                let dur_str = dur_str.trim();
                let split = dur_str
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(dur_str.len());
                let (digits, unit) = dur_str.split_at(split);
                let number: u64 = digits
                    .parse()
                    .map_err(|_| E::invalid_value(Unexpected::Str(dur_str), &self))?;
                let dur = match unit.trim() {
                    "ms" => Duration::from_millis(number),
                    "" | "s" => Duration::from_secs(number),
                    "m" => Duration::from_secs(number * 60),
                    "h" => Duration::from_secs(number * 3600),
                    _ => return Err(E::invalid_value(Unexpected::Str(dur_str), &self)),
                };
                Ok(ReadableDuration(dur))
            }
        }

        deserializer.deserialize_any(DurVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct SizeHolder {
        s: ReadableSize,
        d: ReadableDuration,
    }

    #[test]
    fn test_readable_round_trip() {
        let holder: SizeHolder = toml::from_str("s = \"20MiB\"\nd = \"50ms\"").unwrap();
        assert_eq!(holder.s, ReadableSize::mb(20));
        assert_eq!(holder.d, ReadableDuration::millis(50));

        let text = toml::to_string(&holder).unwrap();
        let back: SizeHolder = toml::from_str(&text).unwrap();
        assert_eq!(back.s, holder.s);
        assert_eq!(back.d.0, holder.d.0);
    }

    #[test]
    fn test_plain_numbers() {
        let holder: SizeHolder = toml::from_str("s = 20\nd = 1500").unwrap();
        assert_eq!(holder.s.0, 20);
        assert_eq!(holder.d.as_millis(), 1500);
    }
}
