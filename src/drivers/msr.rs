use super::{Context, Driver, MechanismOutcome, Target, expect_bool, expect_int, read_only, unsupported};
use crate::host::Host;
use crate::props::{Mechanism, Property, Value};

const MSR_PLATFORM_INFO: u32 = 0xCE;
const MSR_PKG_CST_CONFIG_CONTROL: u32 = 0xE2;
const MSR_ENERGY_PERF_BIAS: u32 = 0x1B0;
const MSR_POWER_CTL: u32 = 0x1FC;
const MSR_PM_ENABLE: u32 = 0x770;
const MSR_HWP_REQUEST: u32 = 0x774;

const HWP_ENABLE: u64 = 1;
const CST_LIMIT_MASK: u64 = 0b111;
const CST_CFG_LOCK: u64 = 1 << 15;
const C1_DEMOTION: u64 = 1 << 26;
const C1E_AUTOPROMOTE: u64 = 1 << 1;

/// Ratios in performance registers count 100 MHz steps.
pub(crate) const BUS_CLOCK_HZ: u64 = 100_000_000;

// Named EPP levels and the numbers the kernel writes for them.
const EPP_LEVELS: &[(&str, u64)] = &[
    ("performance", 0),
    ("balance_performance", 128),
    ("balance_power", 192),
    ("power", 255),
];

/// A bit field inside a register.
#[derive(Debug, Clone, Copy)]
struct Field {
    shift: u32,
    width: u32,
}

impl Field {
    const fn new(low: u32, high: u32) -> Self {
        Self {
            shift: low,
            width: high - low + 1,
        }
    }

    const fn mask(self) -> u64 {
        ((1u64 << self.width) - 1) << self.shift
    }

    const fn get(self, reg: u64) -> u64 {
        (reg & self.mask()) >> self.shift
    }

    const fn max(self) -> u64 {
        (1u64 << self.width) - 1
    }
}

const HWP_MIN: Field = Field::new(0, 7);
const HWP_MAX: Field = Field::new(8, 15);
const HWP_EPP: Field = Field::new(24, 31);
const BASE_RATIO: Field = Field::new(8, 15);
const MAX_EFF_RATIO: Field = Field::new(40, 47);
const EPB: Field = Field::new(0, 3);

/// Model specific registers through `/dev/cpu/N/msr`.
#[derive(Debug)]
pub struct MsrDriver;

type Res = Result<Value, MechanismOutcome>;

fn read(host: &dyn Host, cpu: u32, address: u32) -> Result<u64, MechanismOutcome> {
    Ok(host.read_register(cpu, address)?)
}

fn write_field(host: &dyn Host, cpu: u32, address: u32, field: Field, value: u64) -> Result<(), MechanismOutcome> {
    if value > field.max() {
        return Err(MechanismOutcome::Unsupported(format!(
            "{value} does not fit MSR {address:#x} bits {}:{}",
            field.shift + field.width - 1,
            field.shift
        )));
    }
    Ok(host.write_register(cpu, address, value << field.shift, field.mask())?)
}

fn write_flag(host: &dyn Host, cpu: u32, address: u32, bit: u64, on: bool) -> Result<(), MechanismOutcome> {
    Ok(host.write_register(cpu, address, if on { bit } else { 0 }, bit)?)
}

/// HWP fields only mean something once hardware P-states are enabled.
fn require_hwp(host: &dyn Host, cpu: u32) -> Result<(), MechanismOutcome> {
    if read(host, cpu, MSR_PM_ENABLE)? & HWP_ENABLE == 0 {
        return Err(MechanismOutcome::Unsupported(format!(
            "hardware P-states are disabled on CPU {cpu}"
        )));
    }
    Ok(())
}

fn hz_to_ratio(hz: u64) -> u64 {
    hz / BUS_CLOCK_HZ
}

/// The name sysfs uses for `epp`, or the number itself when it has none.
fn epp_name(epp: u64) -> String {
    EPP_LEVELS
        .iter()
        .find(|(_, number)| *number == epp)
        .map_or_else(|| epp.to_string(), |(name, _)| (*name).to_string())
}

fn epp_number(value: &Value) -> Result<u64, MechanismOutcome> {
    let text = value.to_string();
    if let Ok(number) = text.parse::<u64>() {
        return Ok(number);
    }
    EPP_LEVELS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(&text))
        .map(|(_, number)| *number)
        .ok_or_else(|| {
            MechanismOutcome::Unsupported(format!(
                "EPP '{text}' has no register encoding, use 0-255 or one of: {}",
                EPP_LEVELS.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(", ")
            ))
        })
}

impl MsrDriver {
    fn do_read(ctx: &Context<'_>, prop: &Property, target: &Target) -> Res {
        let host = ctx.host;
        let cpu = target.require_cpu()?;
        match prop.name {
            "min_freq" | "max_freq" | "epp" => {
                require_hwp(host, cpu)?;
                let reg = read(host, cpu, MSR_HWP_REQUEST)?;
                Ok(match prop.name {
                    "min_freq" => Value::Int(HWP_MIN.get(reg) * BUS_CLOCK_HZ),
                    "max_freq" => Value::Int(HWP_MAX.get(reg) * BUS_CLOCK_HZ),
                    _ => Value::Str(epp_name(HWP_EPP.get(reg))),
                })
            }
            "base_freq" => {
                let reg = read(host, cpu, MSR_PLATFORM_INFO)?;
                Ok(Value::Int(BASE_RATIO.get(reg) * BUS_CLOCK_HZ))
            }
            "max_eff_freq" => {
                let ratio = MAX_EFF_RATIO.get(read(host, cpu, MSR_PLATFORM_INFO)?);
                if ratio == 0 {
                    return Err(MechanismOutcome::Unsupported(format!(
                        "CPU {cpu} does not report a maximum efficiency ratio"
                    )));
                }
                Ok(Value::Int(ratio * BUS_CLOCK_HZ))
            }
            "epb" => Ok(Value::Int(EPB.get(read(host, cpu, MSR_ENERGY_PERF_BIAS)?))),
            "pkg_cstate_limit" => Ok(Value::Int(
                read(host, cpu, MSR_PKG_CST_CONFIG_CONTROL)? & CST_LIMIT_MASK,
            )),
            "c1_demotion" => Ok(Value::Bool(
                read(host, cpu, MSR_PKG_CST_CONFIG_CONTROL)? & C1_DEMOTION != 0,
            )),
            "c1e_autopromote" => Ok(Value::Bool(
                read(host, cpu, MSR_POWER_CTL)? & C1E_AUTOPROMOTE != 0,
            )),
            _ => Err(unsupported(prop, Mechanism::Msr)),
        }
    }

    fn do_write(ctx: &Context<'_>, prop: &Property, target: &Target, value: &Value) -> Res {
        let host = ctx.host;
        if !prop.writable {
            return Err(read_only(prop));
        }
        let cpu = target.require_cpu()?;
        match prop.name {
            "min_freq" | "max_freq" => {
                require_hwp(host, cpu)?;
                let ratio = hz_to_ratio(expect_int(prop, value)?);
                let field = if prop.name == "min_freq" { HWP_MIN } else { HWP_MAX };
                write_field(host, cpu, MSR_HWP_REQUEST, field, ratio)?;
                Ok(Value::Int(ratio * BUS_CLOCK_HZ))
            }
            "epp" => {
                require_hwp(host, cpu)?;
                let epp = epp_number(value)?;
                write_field(host, cpu, MSR_HWP_REQUEST, HWP_EPP, epp)?;
                Ok(Value::Str(epp_name(epp)))
            }
            "epb" => {
                let epb = expect_int(prop, value)?;
                write_field(host, cpu, MSR_ENERGY_PERF_BIAS, EPB, epb)?;
                Ok(Value::Int(epb))
            }
            "pkg_cstate_limit" => {
                let limit = expect_int(prop, value)?;
                // The lock bit freezes bits 15:0 until the next reset.
                if read(host, cpu, MSR_PKG_CST_CONFIG_CONTROL)? & CST_CFG_LOCK != 0 {
                    return Err(MechanismOutcome::Denied(format!(
                        "MSR {MSR_PKG_CST_CONFIG_CONTROL:#x} is locked by firmware on CPU {cpu}"
                    )));
                }
                write_field(host, cpu, MSR_PKG_CST_CONFIG_CONTROL, Field::new(0, 2), limit)?;
                Ok(Value::Int(limit))
            }
            "c1_demotion" => {
                let on = expect_bool(prop, value)?;
                write_flag(host, cpu, MSR_PKG_CST_CONFIG_CONTROL, C1_DEMOTION, on)?;
                Ok(Value::Bool(on))
            }
            "c1e_autopromote" => {
                let on = expect_bool(prop, value)?;
                write_flag(host, cpu, MSR_POWER_CTL, C1E_AUTOPROMOTE, on)?;
                Ok(Value::Bool(on))
            }
            _ => Err(unsupported(prop, Mechanism::Msr)),
        }
    }
}

impl Driver for MsrDriver {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Msr
    }

    fn read(&self, ctx: &Context<'_>, prop: &Property, target: &Target) -> MechanismOutcome {
        Self::do_read(ctx, prop, target).into()
    }

    fn write(&self, ctx: &Context<'_>, prop: &Property, target: &Target, value: &Value) -> MechanismOutcome {
        Self::do_write(ctx, prop, target, value).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixtureHost;
    use crate::props::lookup;
    use crate::topology::{CoreKey, DieKey, ScopeInstance, Snapshot, synthetic};
    use crate::util::error::HostError;

    const REGISTERS: &str = r#"
        [[registers]]
        cpu = 0
        address = 0x770
        value = "0x1"

        [[registers]]
        cpu = 0
        address = 0x774
        value = "0x80002010"

        [[registers]]
        cpu = 0
        address = 0xce
        value = "0x1800"

        [[registers]]
        cpu = 0
        address = 0x1b0
        value = "0x6"

        [[registers]]
        cpu = 0
        address = 0xe2
        value = "0x4000003"

        [[registers]]
        cpu = 0
        address = 0x1fc
        value = "0x2"

        [[registers]]
        cpu = 1
        address = 0x770
        value = "0x0"

        [[registers]]
        cpu = 1
        address = 0xe2
        value = "0x8003"
    "#;

    fn setup() -> (FixtureHost, Snapshot) {
        (FixtureHost::from_toml(REGISTERS).unwrap(), synthetic(1, 2, 1, &[]))
    }

    fn cpu(cpu: u32) -> Target {
        Target {
            instance: ScopeInstance::Cpu(cpu),
            cpu: Some(cpu),
        }
    }

    fn core(cpu: u32) -> Target {
        Target {
            instance: ScopeInstance::Core(CoreKey { package: 0, core: cpu }),
            cpu: Some(cpu),
        }
    }

    fn read(host: &FixtureHost, topo: &Snapshot, name: &str, target: Target) -> MechanismOutcome {
        let ctx = Context { host, topology: topo };
        MsrDriver.read(&ctx, lookup(name).unwrap(), &target)
    }

    fn write(host: &FixtureHost, topo: &Snapshot, name: &str, target: Target, value: Value) -> MechanismOutcome {
        let ctx = Context { host, topology: topo };
        MsrDriver.write(&ctx, lookup(name).unwrap(), &target, &value)
    }

    #[test]
    fn hwp_request_fields() {
        let (host, topo) = setup();
        assert!(matches!(
            read(&host, &topo, "min_freq", cpu(0)),
            MechanismOutcome::Success(Value::Int(1_600_000_000))
        ));
        assert!(matches!(
            read(&host, &topo, "max_freq", cpu(0)),
            MechanismOutcome::Success(Value::Int(3_200_000_000))
        ));
        assert!(matches!(
            read(&host, &topo, "epp", cpu(0)),
            MechanismOutcome::Success(Value::Str(ref epp)) if epp == "balance_performance"
        ));
        assert!(matches!(
            read(&host, &topo, "base_freq", cpu(0)),
            MechanismOutcome::Success(Value::Int(2_400_000_000))
        ));
    }

    #[test]
    fn frequency_writes_round_down_to_ratio() {
        let (host, topo) = setup();
        assert!(matches!(
            write(&host, &topo, "max_freq", cpu(0), Value::Int(2_750_000_000)),
            MechanismOutcome::Success(Value::Int(2_700_000_000))
        ));
        assert_eq!(host.register(0, MSR_HWP_REQUEST), Some(0x8000_1B10));

        write(&host, &topo, "epp", cpu(0), Value::Str("power".to_string()));
        assert_eq!(host.register(0, MSR_HWP_REQUEST), Some(0xFF00_1B10));
    }

    #[test]
    fn epp_uses_sysfs_names() {
        let (host, topo) = setup();
        assert!(matches!(
            write(&host, &topo, "epp", cpu(0), Value::Int(192)),
            MechanismOutcome::Success(Value::Str(ref epp)) if epp == "balance_power"
        ));
        assert!(matches!(
            write(&host, &topo, "epp", cpu(0), Value::Int(77)),
            MechanismOutcome::Success(Value::Str(ref epp)) if epp == "77"
        ));
        assert!(matches!(
            read(&host, &topo, "epp", cpu(0)),
            MechanismOutcome::Success(Value::Str(ref epp)) if epp == "77"
        ));
    }

    #[test]
    fn max_efficiency_frequency() {
        let (host, topo) = setup();
        assert!(matches!(
            read(&host, &topo, "max_eff_freq", cpu(0)),
            MechanismOutcome::Unsupported(_)
        ));

        let host = FixtureHost::from_toml(
            r#"
            [[registers]]
            cpu = 0
            address = 0xce
            value = "0x80000001800"
            "#,
        )
        .unwrap();
        assert!(matches!(
            read(&host, &topo, "max_eff_freq", cpu(0)),
            MechanismOutcome::Success(Value::Int(800_000_000))
        ));
    }

    #[test]
    fn hwp_disabled_is_unsupported() {
        let (host, topo) = setup();
        assert!(matches!(
            read(&host, &topo, "max_freq", cpu(1)),
            MechanismOutcome::Unsupported(_)
        ));
    }

    #[test]
    fn locked_cstate_limit_is_denied() {
        let (host, topo) = setup();
        assert!(matches!(
            read(&host, &topo, "pkg_cstate_limit", core(1)),
            MechanismOutcome::Success(Value::Int(3))
        ));
        assert!(matches!(
            write(&host, &topo, "pkg_cstate_limit", core(1), Value::Int(0)),
            MechanismOutcome::Denied(_)
        ));
        assert_eq!(host.register(1, MSR_PKG_CST_CONFIG_CONTROL), Some(0x8003));

        assert!(matches!(
            write(&host, &topo, "pkg_cstate_limit", core(0), Value::Int(1)),
            MechanismOutcome::Success(Value::Int(1))
        ));
        assert_eq!(host.register(0, MSR_PKG_CST_CONFIG_CONTROL), Some(0x4000001));
    }

    #[test]
    fn flags() {
        let (host, topo) = setup();
        assert!(matches!(
            read(&host, &topo, "c1_demotion", core(0)),
            MechanismOutcome::Success(Value::Bool(true))
        ));
        write(&host, &topo, "c1_demotion", core(0), Value::Bool(false));
        assert_eq!(host.register(0, MSR_PKG_CST_CONFIG_CONTROL), Some(0x3));

        let package = Target {
            instance: ScopeInstance::Package(0),
            cpu: Some(0),
        };
        assert!(matches!(
            read(&host, &topo, "c1e_autopromote", package),
            MechanismOutcome::Success(Value::Bool(true))
        ));
    }

    #[test]
    fn out_of_range_values() {
        let (host, topo) = setup();
        assert!(matches!(
            write(&host, &topo, "epb", cpu(0), Value::Int(16)),
            MechanismOutcome::Unsupported(_)
        ));
        assert!(matches!(
            write(&host, &topo, "epp", cpu(0), Value::Str("turbo".to_string())),
            MechanismOutcome::Unsupported(_)
        ));
    }

    #[test]
    fn missing_registers_and_targets() {
        let (host, topo) = setup();
        assert!(matches!(
            read(&host, &topo, "epb", cpu(1)),
            MechanismOutcome::TransportError(HostError::ReadError(_))
        ));
        let die = Target {
            instance: ScopeInstance::Die(DieKey { package: 0, die: 2 }),
            cpu: None,
        };
        assert!(matches!(
            read(&host, &topo, "c1e_autopromote", die),
            MechanismOutcome::Unsupported(_)
        ));
        assert!(matches!(
            read(&host, &topo, "turbo", cpu(0)),
            MechanismOutcome::Unsupported(_)
        ));
        assert!(matches!(
            write(&host, &topo, "base_freq", cpu(0), Value::Int(1)),
            MechanismOutcome::Unsupported(_)
        ));
    }
}
