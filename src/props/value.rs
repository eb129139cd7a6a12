use std::fmt;
use std::str::FromStr;

/// A property value as read from or written to a host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Bool(bool),
    Int(u64),
    Str(String),
}

impl Value {
    pub const fn as_int(&self) -> Option<u64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Render the value in the unit of its property.
    pub fn display(&self, unit: Unit) -> String {
        match (self, unit) {
            (Self::Int(hz), Unit::Hz) => format_hz(*hz),
            (Self::Int(us), Unit::Microseconds) => format!("{us} us"),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("on"),
            Self::Bool(false) => f.write_str("off"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

/// Unit of an integer property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unit {
    #[default]
    None,
    Hz,
    Microseconds,
}

/// Keywords accepted in place of a number for some properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Special {
    /// The lowest value the hardware allows.
    Min,
    /// The highest value the hardware allows.
    Max,
    /// The middle of the allowed range, rounded to the hardware's step.
    Mdl,
    /// The base frequency, also called HFM or P1.
    Base,
    /// The maximum efficiency frequency, also called LFM or Pn.
    Eff,
}

impl fmt::Display for Special {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Mdl => "mdl",
            Self::Base => "base",
            Self::Eff => "eff",
        })
    }
}

impl FromStr for Special {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "mdl" => Ok(Self::Mdl),
            "base" | "hfm" | "p1" => Ok(Self::Base),
            "eff" | "lfm" | "pn" => Ok(Self::Eff),
            _ => Err(()),
        }
    }
}

/// What a write request asks for before specials are resolved against the hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteValue {
    Exact(Value),
    Special(Special),
}

impl fmt::Display for WriteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(value) => value.fmt(f),
            Self::Special(special) => special.fmt(f),
        }
    }
}

pub fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "on" | "enable" | "true" => Some(true),
        "off" | "disable" | "false" => Some(false),
        _ => None,
    }
}

/// Parse a frequency such as `2.1GHz`, `800 MHz` or `1200000kHz` into Hz. A bare number is
/// taken as Hz.
pub fn parse_frequency(input: &str) -> Option<u64> {
    parse_scaled(
        input,
        &[("ghz", 1_000_000_000), ("mhz", 1_000_000), ("khz", 1_000), ("hz", 1)],
        1,
    )
}

/// Parse a latency such as `10us` or `2ms` into microseconds. A bare number is taken as
/// microseconds.
pub fn parse_latency(input: &str) -> Option<u64> {
    parse_scaled(input, &[("us", 1), ("ms", 1_000)], 1)
}

fn parse_scaled(input: &str, units: &[(&str, u64)], default_scale: u64) -> Option<u64> {
    let lower = input.trim().to_ascii_lowercase();

    let (number, scale) = units
        .iter()
        .find_map(|(suffix, scale)| lower.strip_suffix(suffix).map(|num| (num.trim(), *scale)))
        .unwrap_or((lower.as_str(), default_scale));

    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }

    match number.split_once('.') {
        None => number.parse::<u64>().ok()?.checked_mul(scale),
        Some((whole, frac)) => {
            if frac.contains('.') {
                return None;
            }
            let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
            let mut value = whole.checked_mul(scale)?;
            // Apply the fraction digit by digit so `2.1GHz` is exactly 2100000000.
            let mut step = scale;
            for digit in frac.bytes() {
                step /= 10;
                if step == 0 {
                    break;
                }
                value = value.checked_add(u64::from(digit - b'0') * step)?;
            }
            Some(value)
        }
    }
}

/// Render a frequency in the largest unit that keeps it exact.
pub fn format_hz(hz: u64) -> String {
    if hz >= 1_000_000_000 && hz % 1_000_000 == 0 {
        let mhz = hz / 1_000_000;
        if mhz % 1000 == 0 {
            format!("{} GHz", mhz / 1000)
        } else {
            format!("{} MHz", mhz)
        }
    } else if hz >= 1_000_000 && hz % 1_000_000 == 0 {
        format!("{} MHz", hz / 1_000_000)
    } else if hz >= 1_000 && hz % 1_000 == 0 {
        format!("{} kHz", hz / 1_000)
    } else {
        format!("{hz} Hz")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequencies() {
        assert_eq!(parse_frequency("2.1GHz"), Some(2_100_000_000));
        assert_eq!(parse_frequency("2.1 ghz"), Some(2_100_000_000));
        assert_eq!(parse_frequency("800MHz"), Some(800_000_000));
        assert_eq!(parse_frequency("1200000kHz"), Some(1_200_000_000));
        assert_eq!(parse_frequency("1000"), Some(1000));
        assert_eq!(parse_frequency("1000Hz"), Some(1000));
        assert_eq!(parse_frequency(".5GHz"), Some(500_000_000));
        assert_eq!(parse_frequency("GHz"), None);
        assert_eq!(parse_frequency("-1MHz"), None);
        assert_eq!(parse_frequency("1.2.3MHz"), None);
        assert_eq!(parse_frequency("fast"), None);
    }

    #[test]
    fn latencies() {
        assert_eq!(parse_latency("10us"), Some(10));
        assert_eq!(parse_latency("2ms"), Some(2000));
        assert_eq!(parse_latency("1.5ms"), Some(1500));
        assert_eq!(parse_latency("7"), Some(7));
        assert_eq!(parse_latency("7s"), None);
    }

    #[test]
    fn booleans() {
        for on in ["on", "ON", "enable", "true"] {
            assert_eq!(parse_bool(on), Some(true));
        }
        for off in ["off", "disable", "False"] {
            assert_eq!(parse_bool(off), Some(false));
        }
        assert_eq!(parse_bool("1"), None);
    }

    #[test]
    fn formatting() {
        assert_eq!(format_hz(2_000_000_000), "2 GHz");
        assert_eq!(format_hz(2_100_000_000), "2100 MHz");
        assert_eq!(format_hz(800_000_000), "800 MHz");
        assert_eq!(format_hz(1_500), "1500 Hz");
        assert_eq!(format_hz(2_000), "2 kHz");
        assert_eq!(Value::Int(800_000_000).display(Unit::Hz), "800 MHz");
        assert_eq!(Value::Bool(false).display(Unit::None), "off");
    }

    #[test]
    fn specials() {
        assert_eq!("MDL".parse::<Special>(), Ok(Special::Mdl));
        assert!("mid".parse::<Special>().is_err());
        assert_eq!("P1".parse::<Special>(), Ok(Special::Base));
        assert_eq!("hfm".parse::<Special>(), Ok(Special::Base));
        assert_eq!("Pn".parse::<Special>(), Ok(Special::Eff));
        assert_eq!("lfm".parse::<Special>(), Ok(Special::Eff));
        assert_eq!(WriteValue::Special(Special::Eff).to_string(), "eff");
        assert_eq!(WriteValue::Special(Special::Max).to_string(), "max");
    }
}
