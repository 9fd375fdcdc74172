/*
 * CHAPPS postfix policy delegate
 * Copyright (C) 2023 The CHAPPS developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
 */

/// Grace margin added on top of an outbound quota limit.
///
/// Written as an integer it is an absolute message count; as a float below
/// `1.0` it is a fraction of the limit; as a float in `[1, 100)` it is a
/// percentage. A float of 100 or more is refused at configuration load: it
/// would no longer be a margin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Margin {
    /// Flat message count.
    Absolute(u64),
    /// Fraction of the limit, `0.0 <= f < 1.0`.
    Fraction(f64),
    /// Percentage of the limit, `1.0 <= p < 100.0`.
    Percent(f64),
}

impl Default for Margin {
    fn default() -> Self {
        Self::Absolute(0)
    }
}

impl Margin {
    /// The number of extra messages this margin grants over `limit`,
    /// rounded down.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn effective(&self, limit: i64) -> i64 {
        match *self {
            Self::Absolute(count) => i64::try_from(count).unwrap_or(i64::MAX),
            Self::Fraction(fraction) => (limit as f64 * fraction).floor() as i64,
            Self::Percent(percent) => (limit as f64 * percent / 100.0).floor() as i64,
        }
    }

    fn from_float(value: f64) -> Result<Self, String> {
        if !value.is_finite() || value < 0.0 {
            return Err(format!("margin must be a non-negative number, got {value}"));
        }
        if value < 1.0 {
            Ok(Self::Fraction(value))
        } else if value < 100.0 {
            Ok(Self::Percent(value))
        } else {
            Err(format!(
                "a margin of {value} would be 100% of the quota or more",
            ))
        }
    }
}

impl std::str::FromStr for Margin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(count) = s.parse::<u64>() {
            return Ok(Self::Absolute(count));
        }
        s.parse::<f64>()
            .map_err(|_| format!("margin is neither an integer nor a float: {s:?}"))
            .and_then(Self::from_float)
    }
}

impl<'de> serde::Deserialize<'de> for Margin {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MarginVisitor;

        impl serde::de::Visitor<'_> for MarginVisitor {
            type Value = Margin;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("an integer, or a float below 100")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Margin::Absolute(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(Margin::Absolute)
                    .map_err(|_| E::custom("margin must be non-negative"))
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Margin::from_float(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(MarginVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn integers_are_absolute() {
        assert_eq!("0".parse::<Margin>().unwrap(), Margin::Absolute(0));
        assert_eq!("25".parse::<Margin>().unwrap(), Margin::Absolute(25));
        assert_eq!(Margin::Absolute(25).effective(10), 25);
    }

    #[test]
    fn small_floats_are_fractions() {
        let margin = "0.1".parse::<Margin>().unwrap();
        assert_eq!(margin, Margin::Fraction(0.1));
        assert_eq!(margin.effective(10), 1);
        assert_eq!(margin.effective(9), 0);
    }

    #[test]
    fn larger_floats_are_percentages() {
        let margin = "25.0".parse::<Margin>().unwrap();
        assert_eq!(margin, Margin::Percent(25.0));
        assert_eq!(margin.effective(200), 50);
    }

    #[test]
    fn a_full_quota_margin_is_refused() {
        assert!("100.0".parse::<Margin>().is_err());
        assert!("250.5".parse::<Margin>().is_err());
        assert!("-0.5".parse::<Margin>().is_err());
    }
}
