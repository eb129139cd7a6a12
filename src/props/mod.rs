//! The static catalog of properties: what each one is called, which level of the hierarchy it
//! lives at, how its values look and which mechanisms can reach it, most preferred first.

mod value;

pub use value::{Special, Unit, Value, WriteValue, format_hz, parse_bool, parse_frequency, parse_latency};

pub use crate::topology::Scope;
use crate::util::error::PropertyError;
use std::fmt;
use std::str::FromStr;

/// A way of reaching a property on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mechanism {
    /// Plain files under `/sys`.
    Sysfs,
    /// Memory-mapped feature registers exposed through debugfs.
    Tpmi,
    /// Model specific registers through `/dev/cpu/N/msr`.
    Msr,
    /// Character devices such as `/dev/cpu_dma_latency`.
    Cdev,
}

impl Mechanism {
    pub const ALL: &'static [Self] = &[Self::Sysfs, Self::Tpmi, Self::Msr, Self::Cdev];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Sysfs => "sysfs",
            Self::Tpmi => "tpmi",
            Self::Msr => "msr",
            Self::Cdev => "cdev",
        }
    }

    /// Parse a comma-separated list such as `msr,sysfs`, keeping the given order.
    pub fn parse_list(input: &str) -> Result<Vec<Self>, PropertyError> {
        let mut list = Vec::new();
        for name in input.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            let mechanism = name.parse()?;
            if !list.contains(&mechanism) {
                list.push(mechanism);
            }
        }
        if list.is_empty() {
            return Err(PropertyError::UnknownMechanism {
                name: input.to_string(),
                available: names(Self::ALL),
            });
        }
        Ok(list)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mechanism {
    type Err = PropertyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|mechanism| mechanism.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PropertyError::UnknownMechanism {
                name: s.to_string(),
                available: names(Self::ALL),
            })
    }
}

fn names(mechanisms: &[Mechanism]) -> String {
    mechanisms
        .iter()
        .map(|m| m.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The shape of a property's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int(Unit),
    /// Free-form text, validated by the mechanism against what the host offers.
    Str,
    /// One of a fixed set of words.
    Choice(&'static [&'static str]),
}

/// Static metadata describing one property.
#[derive(Debug, PartialEq, Eq)]
pub struct Property {
    pub name: &'static str,
    pub title: &'static str,
    pub scope: Scope,
    pub kind: ValueKind,
    pub mechanisms: &'static [Mechanism],
    pub writable: bool,
    pub specials: &'static [Special],
    /// Names of the properties holding the lowest and highest allowed value, used to resolve
    /// specials.
    pub limits: Option<(&'static str, &'static str)>,
}

const FREQ_SPECIALS: &[Special] = &[Special::Min, Special::Max, Special::Base, Special::Eff];
const UNCORE_SPECIALS: &[Special] = &[Special::Min, Special::Max, Special::Mdl];
const ASPM_POLICIES: &[&str] = &["default", "performance", "powersave", "powersupersave"];

use Mechanism::{Cdev, Msr, Sysfs, Tpmi};

pub static PROPERTIES: &[Property] = &[
    Property {
        name: "min_freq",
        title: "Minimum CPU frequency",
        scope: Scope::Cpu,
        kind: ValueKind::Int(Unit::Hz),
        mechanisms: &[Sysfs, Msr],
        writable: true,
        specials: FREQ_SPECIALS,
        limits: Some(("min_freq_limit", "max_freq_limit")),
    },
    Property {
        name: "max_freq",
        title: "Maximum CPU frequency",
        scope: Scope::Cpu,
        kind: ValueKind::Int(Unit::Hz),
        mechanisms: &[Sysfs, Msr],
        writable: true,
        specials: FREQ_SPECIALS,
        limits: Some(("min_freq_limit", "max_freq_limit")),
    },
    Property {
        name: "min_freq_limit",
        title: "Minimum supported CPU frequency",
        scope: Scope::Cpu,
        kind: ValueKind::Int(Unit::Hz),
        mechanisms: &[Sysfs],
        writable: false,
        specials: &[],
        limits: None,
    },
    Property {
        name: "max_freq_limit",
        title: "Maximum supported CPU frequency",
        scope: Scope::Cpu,
        kind: ValueKind::Int(Unit::Hz),
        mechanisms: &[Sysfs],
        writable: false,
        specials: &[],
        limits: None,
    },
    Property {
        name: "base_freq",
        title: "Base CPU frequency",
        scope: Scope::Cpu,
        kind: ValueKind::Int(Unit::Hz),
        mechanisms: &[Sysfs, Msr],
        writable: false,
        specials: &[],
        limits: None,
    },
    Property {
        name: "max_eff_freq",
        title: "Maximum CPU efficiency frequency",
        scope: Scope::Cpu,
        kind: ValueKind::Int(Unit::Hz),
        mechanisms: &[Msr],
        writable: false,
        specials: &[],
        limits: None,
    },
    Property {
        name: "turbo",
        title: "Turbo",
        scope: Scope::Global,
        kind: ValueKind::Bool,
        mechanisms: &[Sysfs],
        writable: true,
        specials: &[],
        limits: None,
    },
    Property {
        name: "governor",
        title: "CPU frequency governor",
        scope: Scope::Cpu,
        kind: ValueKind::Str,
        mechanisms: &[Sysfs],
        writable: true,
        specials: &[],
        limits: None,
    },
    Property {
        name: "driver",
        title: "CPU frequency driver",
        scope: Scope::Global,
        kind: ValueKind::Str,
        mechanisms: &[Sysfs],
        writable: false,
        specials: &[],
        limits: None,
    },
    Property {
        name: "epp",
        title: "Energy Performance Preference",
        scope: Scope::Cpu,
        kind: ValueKind::Str,
        mechanisms: &[Sysfs, Msr],
        writable: true,
        specials: &[],
        limits: None,
    },
    Property {
        name: "epb",
        title: "Energy Performance Bias",
        scope: Scope::Cpu,
        kind: ValueKind::Int(Unit::None),
        mechanisms: &[Sysfs, Msr],
        writable: true,
        specials: &[],
        limits: None,
    },
    Property {
        name: "pkg_cstate_limit",
        title: "Package C-state limit",
        scope: Scope::Core,
        kind: ValueKind::Int(Unit::None),
        mechanisms: &[Msr],
        writable: true,
        specials: &[],
        limits: None,
    },
    Property {
        name: "c1_demotion",
        title: "C1 demotion",
        scope: Scope::Core,
        kind: ValueKind::Bool,
        mechanisms: &[Msr],
        writable: true,
        specials: &[],
        limits: None,
    },
    Property {
        name: "c1e_autopromote",
        title: "C1E autopromote",
        scope: Scope::Package,
        kind: ValueKind::Bool,
        mechanisms: &[Msr],
        writable: true,
        specials: &[],
        limits: None,
    },
    Property {
        name: "idle_driver",
        title: "Idle driver",
        scope: Scope::Global,
        kind: ValueKind::Str,
        mechanisms: &[Sysfs],
        writable: false,
        specials: &[],
        limits: None,
    },
    Property {
        name: "idle_governor",
        title: "Idle governor",
        scope: Scope::Global,
        kind: ValueKind::Str,
        mechanisms: &[Sysfs],
        writable: true,
        specials: &[],
        limits: None,
    },
    Property {
        name: "latency_limit",
        title: "Linux per-CPU PM QoS latency limit",
        scope: Scope::Cpu,
        kind: ValueKind::Int(Unit::Microseconds),
        mechanisms: &[Sysfs],
        writable: true,
        specials: &[],
        limits: None,
    },
    Property {
        name: "global_latency_limit",
        title: "Linux global PM QoS latency limit",
        scope: Scope::Global,
        kind: ValueKind::Int(Unit::Microseconds),
        mechanisms: &[Cdev],
        writable: false,
        specials: &[],
        limits: None,
    },
    Property {
        name: "aspm_policy",
        title: "PCI ASPM policy",
        scope: Scope::Global,
        kind: ValueKind::Choice(ASPM_POLICIES),
        mechanisms: &[Sysfs],
        writable: true,
        specials: &[],
        limits: None,
    },
    Property {
        name: "uncore_min_freq",
        title: "Minimum uncore frequency",
        scope: Scope::Die,
        kind: ValueKind::Int(Unit::Hz),
        mechanisms: &[Sysfs, Tpmi],
        writable: true,
        specials: UNCORE_SPECIALS,
        limits: Some(("uncore_min_freq_limit", "uncore_max_freq_limit")),
    },
    Property {
        name: "uncore_max_freq",
        title: "Maximum uncore frequency",
        scope: Scope::Die,
        kind: ValueKind::Int(Unit::Hz),
        mechanisms: &[Sysfs, Tpmi],
        writable: true,
        specials: UNCORE_SPECIALS,
        limits: Some(("uncore_min_freq_limit", "uncore_max_freq_limit")),
    },
    Property {
        name: "uncore_min_freq_limit",
        title: "Minimum supported uncore frequency",
        scope: Scope::Die,
        kind: ValueKind::Int(Unit::Hz),
        mechanisms: &[Sysfs],
        writable: false,
        specials: &[],
        limits: None,
    },
    Property {
        name: "uncore_max_freq_limit",
        title: "Maximum supported uncore frequency",
        scope: Scope::Die,
        kind: ValueKind::Int(Unit::Hz),
        mechanisms: &[Sysfs],
        writable: false,
        specials: &[],
        limits: None,
    },
];

/// Look up a property by name.
pub fn lookup(name: &str) -> Result<&'static Property, PropertyError> {
    PROPERTIES
        .iter()
        .find(|prop| prop.name == name)
        .ok_or_else(|| PropertyError::Unknown {
            name: name.to_string(),
            available: PROPERTIES
                .iter()
                .map(|prop| prop.name)
                .collect::<Vec<_>>()
                .join(", "),
        })
}

impl Property {
    pub fn unit(&self) -> Unit {
        match self.kind {
            ValueKind::Int(unit) => unit,
            _ => Unit::None,
        }
    }

    /// Parse a user supplied value for a write.
    pub fn parse_value(&self, input: &str) -> Result<WriteValue, PropertyError> {
        if !self.writable {
            return Err(PropertyError::NotWritable(self.name.to_string()));
        }

        let input = input.trim();
        if let Ok(special) = input.parse::<Special>() {
            if self.specials.contains(&special) {
                return Ok(WriteValue::Special(special));
            }
        }

        let parsed = match self.kind {
            ValueKind::Bool => parse_bool(input).map(Value::Bool),
            ValueKind::Int(Unit::Hz) => parse_frequency(input).map(Value::Int),
            ValueKind::Int(Unit::Microseconds) => parse_latency(input).map(Value::Int),
            ValueKind::Int(Unit::None) => input.parse::<u64>().ok().map(Value::Int),
            ValueKind::Str => (!input.is_empty()).then(|| Value::Str(input.to_string())),
            ValueKind::Choice(choices) => choices
                .iter()
                .find(|choice| choice.eq_ignore_ascii_case(input))
                .map(|choice| Value::Str((*choice).to_string())),
        };

        parsed
            .map(WriteValue::Exact)
            .ok_or_else(|| PropertyError::BadValue {
                property: self.name.to_string(),
                value: input.to_string(),
                expected: self.expected(),
            })
    }

    /// Describe accepted values for error messages.
    pub fn expected(&self) -> String {
        let mut expected = match self.kind {
            ValueKind::Bool => "on, off, enable, disable, true or false".to_string(),
            ValueKind::Int(Unit::Hz) => "a frequency, such as 800MHz or 2.1GHz".to_string(),
            ValueKind::Int(Unit::Microseconds) => "a latency, such as 10us or 2ms".to_string(),
            ValueKind::Int(Unit::None) => "a non-negative integer".to_string(),
            ValueKind::Str => "a non-empty string".to_string(),
            ValueKind::Choice(choices) => format!("one of: {}", choices.join(", ")),
        };
        if !self.specials.is_empty() {
            let specials: Vec<String> = self.specials.iter().map(ToString::to_string).collect();
            expected.push_str(&format!(", or {}", specials.join(", ")));
        }
        expected
    }

    /// Check a caller's mechanism preference against what this property supports. `None`
    /// means the registered order.
    pub fn mechanism_order(&self, preferred: Option<&[Mechanism]>) -> Result<Vec<Mechanism>, PropertyError> {
        let Some(preferred) = preferred else {
            return Ok(self.mechanisms.to_vec());
        };

        if let Some(bad) = preferred.iter().find(|m| !self.mechanisms.contains(m)) {
            return Err(PropertyError::UnsupportedMechanism {
                property: self.name.to_string(),
                mechanism: bad.to_string(),
                supported: names(self.mechanisms),
            });
        }
        Ok(preferred.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_well_formed() {
        for (idx, prop) in PROPERTIES.iter().enumerate() {
            assert!(!prop.mechanisms.is_empty(), "{}", prop.name);
            assert!(
                PROPERTIES[idx + 1..].iter().all(|other| other.name != prop.name),
                "duplicate {}",
                prop.name
            );
            if let Some((min, max)) = prop.limits {
                for limit in [min, max] {
                    let limit = lookup(limit).unwrap();
                    assert_eq!(limit.scope, prop.scope, "{}", prop.name);
                    assert!(limit.mechanisms.contains(&Mechanism::Sysfs));
                }
            }
            if !prop.specials.is_empty() {
                assert!(prop.limits.is_some(), "{}", prop.name);
            }
        }
    }

    #[test]
    fn unknown_property() {
        let err = lookup("freq").unwrap_err();
        assert!(err.to_string().contains("min_freq"));
    }

    #[test]
    fn value_parsing() {
        let max_freq = lookup("max_freq").unwrap();
        assert_eq!(
            max_freq.parse_value("2GHz").unwrap(),
            WriteValue::Exact(Value::Int(2_000_000_000))
        );
        assert_eq!(
            max_freq.parse_value("max").unwrap(),
            WriteValue::Special(Special::Max)
        );
        // `mdl` is only meaningful for uncore frequencies.
        assert!(matches!(
            max_freq.parse_value("mdl"),
            Err(PropertyError::BadValue { .. })
        ));

        assert_eq!(max_freq.parse_value("P1").unwrap(), WriteValue::Special(Special::Base));
        assert_eq!(max_freq.parse_value("lfm").unwrap(), WriteValue::Special(Special::Eff));

        let uncore = lookup("uncore_max_freq").unwrap();
        assert_eq!(uncore.parse_value("mdl").unwrap(), WriteValue::Special(Special::Mdl));
        assert!(uncore.parse_value("base").is_err());

        let turbo = lookup("turbo").unwrap();
        assert_eq!(turbo.parse_value("off").unwrap(), WriteValue::Exact(Value::Bool(false)));
        assert!(turbo.parse_value("maybe").is_err());

        let aspm = lookup("aspm_policy").unwrap();
        assert_eq!(
            aspm.parse_value("PowerSave").unwrap(),
            WriteValue::Exact(Value::Str("powersave".to_string()))
        );
        assert!(aspm.parse_value("fast").is_err());

        let latency = lookup("latency_limit").unwrap();
        assert_eq!(latency.parse_value("2ms").unwrap(), WriteValue::Exact(Value::Int(2000)));
    }

    #[test]
    fn read_only_properties_reject_writes() {
        assert!(matches!(
            lookup("base_freq").unwrap().parse_value("1GHz"),
            Err(PropertyError::NotWritable(_))
        ));
    }

    #[test]
    fn mechanism_preferences() {
        let prop = lookup("epp").unwrap();
        assert_eq!(prop.mechanism_order(None).unwrap(), vec![Mechanism::Sysfs, Mechanism::Msr]);
        assert_eq!(
            prop.mechanism_order(Some(&[Mechanism::Msr, Mechanism::Sysfs])).unwrap(),
            vec![Mechanism::Msr, Mechanism::Sysfs]
        );
        assert!(matches!(
            prop.mechanism_order(Some(&[Mechanism::Tpmi])),
            Err(PropertyError::UnsupportedMechanism { .. })
        ));
    }

    #[test]
    fn mechanism_lists() {
        assert_eq!(
            Mechanism::parse_list("msr, sysfs,msr").unwrap(),
            vec![Mechanism::Msr, Mechanism::Sysfs]
        );
        assert!(Mechanism::parse_list("msr,pci").is_err());
        assert!(Mechanism::parse_list("").is_err());
    }
}
