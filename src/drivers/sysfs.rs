use super::{Context, Driver, MechanismOutcome, Target, expect_bool, expect_int, read_only, unsupported};
use crate::host::Host;
use crate::props::{Mechanism, Property, Value};
use crate::topology::ScopeInstance;
use crate::util::error::HostError;
use crate::util::sysfs::{read_sysfs_parsed, read_sysfs_value, read_sysfs_words, write_sysfs_value};
use log::debug;

const CPU_SYSFS: &str = "/sys/devices/system/cpu";
const UNCORE_SYSFS: &str = "/sys/devices/system/cpu/intel_uncore_frequency";
const ASPM_POLICY: &str = "/sys/module/pcie_aspm/parameters/policy";

// Turbo control files, most specific first.
const PSTATE_NO_TURBO: &str = "/sys/devices/system/cpu/intel_pstate/no_turbo";
const AMD_PSTATE_BOOST: &str = "/sys/devices/system/cpu/amd_pstate/cpufreq/boost";
const CPUFREQ_BOOST: &str = "/sys/devices/system/cpu/cpufreq/boost";

// The kernel reports "n/a" when no per-CPU resume latency constraint is set.
const NO_LATENCY_CONSTRAINT: &str = "n/a";

/// Plain sysfs files.
#[derive(Debug)]
pub struct SysfsDriver;

type Res = Result<Value, MechanismOutcome>;

fn cpufreq(cpu: u32, attr: &str) -> String {
    format!("{CPU_SYSFS}/cpu{cpu}/cpufreq/{attr}")
}

fn uncore(target: &Target, attr: &str) -> Result<String, MechanismOutcome> {
    match target.instance {
        ScopeInstance::Die(key) => Ok(format!(
            "{UNCORE_SYSFS}/package_{:02}_die_{:02}/{attr}",
            key.package, key.die
        )),
        other => Err(MechanismOutcome::Unsupported(format!(
            "uncore frequency is per die, got {other}"
        ))),
    }
}

fn read_khz(host: &dyn Host, path: &str) -> Res {
    let khz: u64 = read_sysfs_parsed(host, path)?;
    Ok(Value::Int(khz * 1000))
}

fn write_khz(host: &dyn Host, path: &str, hz: u64) -> Res {
    let khz = hz / 1000;
    write_sysfs_value(host, path, &khz.to_string())?;
    Ok(Value::Int(khz * 1000))
}

fn read_str(host: &dyn Host, path: &str) -> Res {
    Ok(Value::Str(read_sysfs_value(host, path)?))
}

/// Which file controls turbo on this host, and whether it holds the inverse (`no_turbo`).
fn turbo_control(host: &dyn Host) -> Result<(&'static str, bool), MechanismOutcome> {
    for (path, inverted) in [
        (PSTATE_NO_TURBO, true),
        (AMD_PSTATE_BOOST, false),
        (CPUFREQ_BOOST, false),
    ] {
        match read_sysfs_value(host, path) {
            Ok(_) => return Ok((path, inverted)),
            Err(HostError::PathMissing(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(MechanismOutcome::Unsupported(
        "no supported CPU boost control file found".to_string(),
    ))
}

fn read_turbo(host: &dyn Host) -> Res {
    let (path, inverted) = turbo_control(host)?;
    let raw: u8 = read_sysfs_parsed(host, path)?;
    Ok(Value::Bool((raw != 0) != inverted))
}

fn write_turbo(host: &dyn Host, on: bool) -> Res {
    let (path, inverted) = turbo_control(host)?;
    let raw = if on != inverted { "1" } else { "0" };
    write_sysfs_value(host, path, raw)?;
    Ok(Value::Bool(on))
}

/// Check `value` against a list file such as `scaling_available_governors`, case-insensitively.
/// Returns the spelling the kernel uses.
fn validate_choice(host: &dyn Host, list_path: &str, value: &str, what: &str) -> Result<String, MechanismOutcome> {
    let available = read_sysfs_words(host, list_path)?;
    available
        .iter()
        .find(|choice| choice.eq_ignore_ascii_case(value))
        .cloned()
        .ok_or_else(|| {
            MechanismOutcome::Unsupported(format!(
                "{what} '{value}' is not available on {}. Available: {}",
                host.name(),
                available.join(", ")
            ))
        })
}

fn read_latency(host: &dyn Host, cpu: u32) -> Res {
    let path = format!("{CPU_SYSFS}/cpu{cpu}/power/pm_qos_resume_latency_us");
    let raw = read_sysfs_value(host, &path)?;
    if raw == NO_LATENCY_CONSTRAINT {
        return Ok(Value::Int(0));
    }
    raw.parse().map(Value::Int).map_err(|e| {
        MechanismOutcome::TransportError(HostError::ParseError(format!(
            "Path: {path:?}, Value: '{raw}', Error: {e}"
        )))
    })
}

/// The ASPM policy file lists every policy with the active one in brackets.
fn parse_aspm_policy(raw: &str) -> Option<String> {
    raw.split_whitespace()
        .find_map(|word| word.strip_prefix('[').and_then(|w| w.strip_suffix(']')))
        .map(ToString::to_string)
}

fn read_idle_governor(host: &dyn Host) -> Res {
    let base = format!("{CPU_SYSFS}/cpuidle");
    match read_sysfs_value(host, format!("{base}/current_governor")) {
        Ok(governor) => Ok(Value::Str(governor)),
        // Kernels without governor switching only expose the read-only variant.
        Err(HostError::PathMissing(_)) => read_str(host, &format!("{base}/current_governor_ro")),
        Err(e) => Err(e.into()),
    }
}

impl SysfsDriver {
    fn do_read(ctx: &Context<'_>, prop: &Property, target: &Target) -> Res {
        let host = ctx.host;
        match prop.name {
            "min_freq" => read_khz(host, &cpufreq(target.require_cpu()?, "scaling_min_freq")),
            "max_freq" => read_khz(host, &cpufreq(target.require_cpu()?, "scaling_max_freq")),
            "min_freq_limit" => read_khz(host, &cpufreq(target.require_cpu()?, "cpuinfo_min_freq")),
            "max_freq_limit" => read_khz(host, &cpufreq(target.require_cpu()?, "cpuinfo_max_freq")),
            "base_freq" => read_khz(host, &cpufreq(target.require_cpu()?, "base_frequency")),
            "turbo" => read_turbo(host),
            "governor" => read_str(host, &cpufreq(target.require_cpu()?, "scaling_governor")),
            "driver" => read_str(host, &cpufreq(target.require_cpu()?, "scaling_driver")),
            "epp" => read_str(
                host,
                &cpufreq(target.require_cpu()?, "energy_performance_preference"),
            ),
            "epb" => {
                let path = format!("{CPU_SYSFS}/cpu{}/power/energy_perf_bias", target.require_cpu()?);
                Ok(Value::Int(read_sysfs_parsed(host, path)?))
            }
            "idle_driver" => read_str(host, &format!("{CPU_SYSFS}/cpuidle/current_driver")),
            "idle_governor" => read_idle_governor(host),
            "latency_limit" => read_latency(host, target.require_cpu()?),
            "aspm_policy" => {
                let raw = read_sysfs_value(host, ASPM_POLICY)?;
                parse_aspm_policy(&raw).map(Value::Str).ok_or_else(|| {
                    MechanismOutcome::TransportError(HostError::ParseError(format!(
                        "no active policy in '{raw}'"
                    )))
                })
            }
            "uncore_min_freq" => read_khz(host, &uncore(target, "min_freq_khz")?),
            "uncore_max_freq" => read_khz(host, &uncore(target, "max_freq_khz")?),
            "uncore_min_freq_limit" => read_khz(host, &uncore(target, "initial_min_freq_khz")?),
            "uncore_max_freq_limit" => read_khz(host, &uncore(target, "initial_max_freq_khz")?),
            _ => Err(unsupported(prop, Mechanism::Sysfs)),
        }
    }

    fn do_write(ctx: &Context<'_>, prop: &Property, target: &Target, value: &Value) -> Res {
        let host = ctx.host;
        match prop.name {
            "min_freq" => write_khz(
                host,
                &cpufreq(target.require_cpu()?, "scaling_min_freq"),
                expect_int(prop, value)?,
            ),
            "max_freq" => write_khz(
                host,
                &cpufreq(target.require_cpu()?, "scaling_max_freq"),
                expect_int(prop, value)?,
            ),
            "turbo" => write_turbo(host, expect_bool(prop, value)?),
            "governor" => {
                let cpu = target.require_cpu()?;
                let governor = validate_choice(
                    host,
                    &cpufreq(cpu, "scaling_available_governors"),
                    &value.to_string(),
                    "governor",
                )?;
                write_sysfs_value(host, cpufreq(cpu, "scaling_governor"), &governor)?;
                Ok(Value::Str(governor))
            }
            "epp" => {
                let cpu = target.require_cpu()?;
                let requested = value.to_string();
                // Raw numbers are accepted by the kernel without being listed.
                let epp = if requested.parse::<u8>().is_ok() {
                    requested
                } else {
                    match validate_choice(
                        host,
                        &cpufreq(cpu, "energy_performance_available_preferences"),
                        &requested,
                        "EPP",
                    ) {
                        Err(MechanismOutcome::TransportError(HostError::PathMissing(_))) => {
                            debug!("No EPP preference list on {}, writing '{requested}' as is", host.name());
                            requested
                        }
                        other => other?,
                    }
                };
                write_sysfs_value(host, cpufreq(cpu, "energy_performance_preference"), &epp)?;
                Ok(Value::Str(epp))
            }
            "epb" => {
                let epb = expect_int(prop, value)?;
                if epb > 15 {
                    return Err(MechanismOutcome::Unsupported(format!(
                        "EPB must be between 0 and 15, got {epb}"
                    )));
                }
                let path = format!("{CPU_SYSFS}/cpu{}/power/energy_perf_bias", target.require_cpu()?);
                write_sysfs_value(host, path, &epb.to_string())?;
                Ok(Value::Int(epb))
            }
            "idle_governor" => {
                let base = format!("{CPU_SYSFS}/cpuidle");
                let governor = validate_choice(
                    host,
                    &format!("{base}/available_governors"),
                    &value.to_string(),
                    "idle governor",
                )?;
                write_sysfs_value(host, format!("{base}/current_governor"), &governor)?;
                Ok(Value::Str(governor))
            }
            "latency_limit" => {
                let us = expect_int(prop, value)?;
                let path = format!(
                    "{CPU_SYSFS}/cpu{}/power/pm_qos_resume_latency_us",
                    target.require_cpu()?
                );
                write_sysfs_value(host, path, &us.to_string())?;
                Ok(Value::Int(us))
            }
            "aspm_policy" => {
                let policy = value.to_string();
                write_sysfs_value(host, ASPM_POLICY, &policy)?;
                Ok(Value::Str(policy))
            }
            "uncore_min_freq" => write_khz(host, &uncore(target, "min_freq_khz")?, expect_int(prop, value)?),
            "uncore_max_freq" => write_khz(host, &uncore(target, "max_freq_khz")?, expect_int(prop, value)?),
            _ if !prop.writable => Err(read_only(prop)),
            _ => Err(unsupported(prop, Mechanism::Sysfs)),
        }
    }
}

impl Driver for SysfsDriver {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Sysfs
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
    use crate::topology::{DieKey, Snapshot, synthetic};

    const FILES: &str = r#"
        [files]
        "/sys/devices/system/cpu/intel_pstate/no_turbo" = "1\n"
        "/sys/devices/system/cpu/cpu1/cpufreq/scaling_max_freq" = "3500000\n"
        "/sys/devices/system/cpu/cpu1/cpufreq/scaling_governor" = "powersave\n"
        "/sys/devices/system/cpu/cpu1/cpufreq/scaling_available_governors" = "performance powersave\n"
        "/sys/devices/system/cpu/cpu1/cpufreq/energy_performance_preference" = "balance_performance\n"
        "/sys/devices/system/cpu/cpu1/cpufreq/energy_performance_available_preferences" = "default performance balance_performance balance_power power\n"
        "/sys/devices/system/cpu/cpu1/power/pm_qos_resume_latency_us" = "n/a\n"
        "/sys/devices/system/cpu/cpuidle/current_governor_ro" = "menu\n"
        "/sys/module/pcie_aspm/parameters/policy" = "default performance [powersave] powersupersave\n"
        "/sys/devices/system/cpu/intel_uncore_frequency/package_00_die_01/max_freq_khz" = "2400000\n"
    "#;

    fn setup() -> (FixtureHost, Snapshot) {
        (FixtureHost::from_toml(FILES).unwrap(), synthetic(1, 2, 1, &[]))
    }

    fn cpu1() -> Target {
        Target {
            instance: ScopeInstance::Cpu(1),
            cpu: Some(1),
        }
    }

    fn global() -> Target {
        Target {
            instance: ScopeInstance::Global,
            cpu: Some(0),
        }
    }

    fn read(host: &FixtureHost, topo: &Snapshot, name: &str, target: Target) -> MechanismOutcome {
        let ctx = Context { host, topology: topo };
        SysfsDriver.read(&ctx, lookup(name).unwrap(), &target)
    }

    fn write(host: &FixtureHost, topo: &Snapshot, name: &str, target: Target, value: Value) -> MechanismOutcome {
        let ctx = Context { host, topology: topo };
        SysfsDriver.write(&ctx, lookup(name).unwrap(), &target, &value)
    }

    #[test]
    fn frequencies_are_in_hz() {
        let (host, topo) = setup();
        assert!(matches!(
            read(&host, &topo, "max_freq", cpu1()),
            MechanismOutcome::Success(Value::Int(3_500_000_000))
        ));
        assert!(matches!(
            write(&host, &topo, "max_freq", cpu1(), Value::Int(2_000_000_000)),
            MechanismOutcome::Success(_)
        ));
        assert_eq!(
            host.file("/sys/devices/system/cpu/cpu1/cpufreq/scaling_max_freq").unwrap(),
            "2000000"
        );
    }

    #[test]
    fn missing_files_are_transport_errors() {
        let (host, topo) = setup();
        assert!(matches!(
            read(&host, &topo, "min_freq", cpu1()),
            MechanismOutcome::TransportError(HostError::PathMissing(_))
        ));
    }

    #[test]
    fn turbo_is_inverted_for_intel_pstate() {
        let (host, topo) = setup();
        assert!(matches!(
            read(&host, &topo, "turbo", global()),
            MechanismOutcome::Success(Value::Bool(false))
        ));
        write(&host, &topo, "turbo", global(), Value::Bool(true));
        assert_eq!(host.file(PSTATE_NO_TURBO).unwrap(), "0");
    }

    #[test]
    fn governors_are_validated() {
        let (host, topo) = setup();
        match write(&host, &topo, "governor", cpu1(), Value::Str("ondemand".to_string())) {
            MechanismOutcome::Unsupported(msg) => assert!(msg.contains("performance, powersave")),
            other => panic!("unexpected {other}"),
        }
        assert!(matches!(
            write(&host, &topo, "governor", cpu1(), Value::Str("Performance".to_string())),
            MechanismOutcome::Success(Value::Str(ref g)) if g == "performance"
        ));
        assert_eq!(
            host.file("/sys/devices/system/cpu/cpu1/cpufreq/scaling_governor").unwrap(),
            "performance"
        );
    }

    #[test]
    fn epp_accepts_names_and_numbers() {
        let (host, topo) = setup();
        assert!(matches!(
            write(&host, &topo, "epp", cpu1(), Value::Str("power".to_string())),
            MechanismOutcome::Success(_)
        ));
        assert!(matches!(
            write(&host, &topo, "epp", cpu1(), Value::Str("128".to_string())),
            MechanismOutcome::Success(_)
        ));
        assert!(matches!(
            write(&host, &topo, "epp", cpu1(), Value::Str("turbo".to_string())),
            MechanismOutcome::Unsupported(_)
        ));
    }

    #[test]
    fn special_formats() {
        let (host, topo) = setup();
        assert!(matches!(
            read(&host, &topo, "latency_limit", cpu1()),
            MechanismOutcome::Success(Value::Int(0))
        ));
        assert!(matches!(
            read(&host, &topo, "aspm_policy", global()),
            MechanismOutcome::Success(Value::Str(ref p)) if p == "powersave"
        ));
        assert!(matches!(
            read(&host, &topo, "idle_governor", global()),
            MechanismOutcome::Success(Value::Str(ref g)) if g == "menu"
        ));
    }

    #[test]
    fn uncore_needs_no_cpu() {
        let (host, topo) = setup();
        let die = Target {
            instance: ScopeInstance::Die(DieKey { package: 0, die: 1 }),
            cpu: None,
        };
        assert!(matches!(
            read(&host, &topo, "uncore_max_freq", die),
            MechanismOutcome::Success(Value::Int(2_400_000_000))
        ));
        assert!(matches!(
            read(&host, &topo, "max_freq", die),
            MechanismOutcome::Unsupported(_)
        ));
    }

    #[test]
    fn read_only_and_foreign_properties() {
        let (host, topo) = setup();
        assert!(matches!(
            write(&host, &topo, "base_freq", cpu1(), Value::Int(1)),
            MechanismOutcome::Unsupported(_)
        ));
        assert!(matches!(
            read(&host, &topo, "pkg_cstate_limit", cpu1()),
            MechanismOutcome::Unsupported(_)
        ));
    }

    #[test]
    fn aspm_parsing() {
        assert_eq!(
            parse_aspm_policy("[default] performance powersave").as_deref(),
            Some("default")
        );
        assert_eq!(parse_aspm_policy("default performance"), None);
    }
}
