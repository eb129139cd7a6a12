use super::msr::BUS_CLOCK_HZ;
use super::{Context, Driver, MechanismOutcome, Target, expect_int, read_only, unsupported};
use crate::host::Host;
use crate::props::{Mechanism, Property, Value};
use crate::topology::{DieKey, ScopeInstance, Snapshot};
use crate::util::error::HostError;
use crate::util::sysfs::{read_sysfs_value, write_sysfs_value};
use log::debug;
use std::collections::BTreeMap;
use std::path::Path;

const DEBUGFS: &str = "/sys/kernel/debug";
const DEVICE_PREFIX: &str = "tpmi-";
/// Uncore frequency scaling feature.
const UFS_FEATURE: &str = "tpmi-id-02";

const UFS_CONTROL: u32 = 0x18;
const MAX_RATIO_SHIFT: u32 = 8;
const MIN_RATIO_SHIFT: u32 = 15;
const RATIO_MASK: u32 = 0x7F;

/// Memory-mapped feature registers, reached through the debugfs files of the TPMI driver.
#[derive(Debug)]
pub struct TpmiDriver;

type Res = Result<Value, MechanismOutcome>;

/// Register contents from a `mem_dump` file: instance, then offset, then the 32-bit word.
type MemDump = BTreeMap<u32, BTreeMap<u32, u32>>;

/// Parse a `mem_dump` file. Every instance starts with a `TPMI Instance:N offset:0x...` line,
/// followed by hex dump lines such as ` 00000020: 013afd40 00004000` or `[00000020] 013afd40`.
fn parse_mem_dump(text: &str) -> Result<MemDump, String> {
    let mut dump = MemDump::new();
    let mut instance = None;

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(rest) = line.strip_prefix("TPMI Instance:") {
            let number = rest.split_whitespace().next().unwrap_or_default();
            let number = number
                .parse()
                .map_err(|_| format!("bad instance number in '{line}'"))?;
            instance = Some(number);
            dump.entry(number).or_default();
            continue;
        }

        let Some(current) = instance else {
            return Err(format!("data before the first instance header: '{line}'"));
        };
        let (offset, words) = line
            .strip_prefix('[')
            .and_then(|rest| rest.split_once(']'))
            .or_else(|| line.split_once(':'))
            .ok_or_else(|| format!("unrecognized line '{line}'"))?;
        let offset = u32::from_str_radix(offset.trim(), 16)
            .map_err(|_| format!("bad offset in '{line}'"))?;

        let regs = dump.entry(current).or_default();
        for (idx, word) in (0u32..).zip(words.split_whitespace()) {
            let value = u32::from_str_radix(word, 16).map_err(|_| format!("bad word '{word}' in '{line}'"))?;
            let address = idx
                .checked_mul(4)
                .and_then(|delta| offset.checked_add(delta))
                .ok_or_else(|| format!("offset overflow in '{line}'"))?;
            regs.insert(address, value);
        }
    }
    Ok(dump)
}

/// The debugfs directory of `package`'s TPMI device. Devices are numbered in the order of
/// their directory names.
fn device_dir(host: &dyn Host, package: u32) -> Result<String, MechanismOutcome> {
    let mut devices: Vec<String> = match host.list_dir(Path::new(DEBUGFS)) {
        Ok(entries) => entries
            .into_iter()
            .filter(|name| name.starts_with(DEVICE_PREFIX))
            .collect(),
        Err(HostError::PathMissing(_)) => {
            return Err(MechanismOutcome::Unsupported(format!(
                "debugfs is not mounted at {DEBUGFS} on {}",
                host.name()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    devices.sort();

    let idx = usize::try_from(package).unwrap_or(usize::MAX);
    devices
        .get(idx)
        .map(|device| format!("{DEBUGFS}/{device}/{UFS_FEATURE}"))
        .ok_or_else(|| {
            MechanismOutcome::Unsupported(format!(
                "no TPMI device for package {package} on {} ({} found)",
                host.name(),
                devices.len()
            ))
        })
}

/// The TPMI instance of a die is its position among the dies of its package.
fn instance(topology: &Snapshot, key: DieKey) -> Result<u32, MechanismOutcome> {
    topology
        .package_dies(key.package)
        .iter()
        .position(|&die| die == key.die)
        .and_then(|idx| u32::try_from(idx).ok())
        .ok_or_else(|| {
            MechanismOutcome::Unsupported(format!(
                "package {} die {} is not in the topology",
                key.package, key.die
            ))
        })
}

fn die_key(target: &Target) -> Result<DieKey, MechanismOutcome> {
    match target.instance {
        ScopeInstance::Die(key) => Ok(key),
        other => Err(MechanismOutcome::Unsupported(format!(
            "uncore frequency is per die, got {other}"
        ))),
    }
}

fn ratio_shift(prop: &Property) -> Option<u32> {
    match prop.name {
        "uncore_min_freq" => Some(MIN_RATIO_SHIFT),
        "uncore_max_freq" => Some(MAX_RATIO_SHIFT),
        _ => None,
    }
}

/// Locate the UFS control register of a die and return the feature directory, instance and
/// current register value.
fn ufs_control(ctx: &Context<'_>, target: &Target) -> Result<(String, u32, u32), MechanismOutcome> {
    let key = die_key(target)?;
    let dir = device_dir(ctx.host, key.package)?;
    let instance = instance(ctx.topology, key)?;

    let text = read_sysfs_value(ctx.host, format!("{dir}/mem_dump"))?;
    let dump = parse_mem_dump(&text).map_err(|e| {
        MechanismOutcome::TransportError(HostError::ParseError(format!("{dir}/mem_dump: {e}")))
    })?;
    let value = dump
        .get(&instance)
        .and_then(|regs| regs.get(&UFS_CONTROL))
        .copied()
        .ok_or_else(|| {
            MechanismOutcome::Unsupported(format!(
                "TPMI instance {instance} has no UFS control register in {dir}"
            ))
        })?;
    Ok((dir, instance, value))
}

impl TpmiDriver {
    fn do_read(ctx: &Context<'_>, prop: &Property, target: &Target) -> Res {
        let shift = ratio_shift(prop).ok_or_else(|| unsupported(prop, Mechanism::Tpmi))?;
        let (_, _, control) = ufs_control(ctx, target)?;
        Ok(Value::Int(u64::from((control >> shift) & RATIO_MASK) * BUS_CLOCK_HZ))
    }

    fn do_write(ctx: &Context<'_>, prop: &Property, target: &Target, value: &Value) -> Res {
        if !prop.writable {
            return Err(read_only(prop));
        }
        let shift = ratio_shift(prop).ok_or_else(|| unsupported(prop, Mechanism::Tpmi))?;
        let ratio = expect_int(prop, value)? / BUS_CLOCK_HZ;
        let ratio = u32::try_from(ratio)
            .ok()
            .filter(|&ratio| ratio <= RATIO_MASK)
            .ok_or_else(|| {
                MechanismOutcome::Unsupported(format!("uncore ratio {ratio} does not fit 7 bits"))
            })?;

        let (dir, instance, control) = ufs_control(ctx, target)?;
        let updated = (control & !(RATIO_MASK << shift)) | (ratio << shift);
        debug!(
            "{}: TPMI instance {instance} UFS control {control:#010x} -> {updated:#010x}",
            ctx.host.name()
        );
        write_sysfs_value(
            ctx.host,
            format!("{dir}/mem_write"),
            &format!("{instance},{UFS_CONTROL:#x},{updated:#x}"),
        )?;
        Ok(Value::Int(u64::from(ratio) * BUS_CLOCK_HZ))
    }
}

impl Driver for TpmiDriver {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Tpmi
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
    use crate::topology::{build, synthetic_report};

    const DUMP: &str = "TPMI Instance:0 offset:0x40000\n \
         00000000: 00000002 00000000 00000000 00000000\n \
         00000010: 00000000 00000000 00081808 00000000\n\
         TPMI Instance:1 offset:0x40100\n\
         [00000010] 00000000 00000000 000c1e0c 00000000\n";

    fn setup() -> (FixtureHost, Snapshot) {
        let host = FixtureHost::from_toml(&format!(
            r#"
            [files]
            "/sys/kernel/debug/tpmi-0000:00:03.1/tpmi-id-02/mem_dump" = """{DUMP}"""
            "/sys/kernel/debug/tpmi-0000:00:03.1/tpmi-id-02/mem_write" = ""
            "#
        ))
        .unwrap();
        let mut report = synthetic_report(1, 2, 1, &[]);
        report.noncomp_dies.push(DieKey { package: 0, die: 1 });
        (host, build(report).unwrap())
    }

    fn die(die: u32) -> Target {
        Target {
            instance: ScopeInstance::Die(DieKey { package: 0, die }),
            cpu: (die == 0).then_some(0),
        }
    }

    #[test]
    fn mem_dump_parsing() {
        let dump = parse_mem_dump(DUMP).unwrap();
        assert_eq!(dump[&0][&0], 2);
        assert_eq!(dump[&0][&0x18], 0x0008_1808);
        assert_eq!(dump[&1][&0x18], 0x000c_1e0c);
        assert!(parse_mem_dump(" 00000000: 00000001").is_err());
        assert!(parse_mem_dump("TPMI Instance:0 offset:0x0\n00000000 zz").is_err());
    }

    #[test]
    fn mem_dump_offsets_at_the_top_of_the_address_space() {
        let dump = parse_mem_dump("TPMI Instance:0 offset:0x0\nfffffffc: 00000001").unwrap();
        assert_eq!(dump[&0][&0xffff_fffc], 1);

        let err = parse_mem_dump("TPMI Instance:0 offset:0x0\nfffffffc: 00000001 00000002").unwrap_err();
        assert!(err.contains("overflow"), "{err}");
    }

    #[test]
    fn reads_ratios() {
        let (host, topo) = setup();
        let ctx = Context { host: &host, topology: &topo };
        // 0x81808: max ratio 0x18, min ratio 0x10.
        assert!(matches!(
            TpmiDriver.read(&ctx, lookup("uncore_max_freq").unwrap(), &die(0)),
            MechanismOutcome::Success(Value::Int(2_400_000_000))
        ));
        assert!(matches!(
            TpmiDriver.read(&ctx, lookup("uncore_min_freq").unwrap(), &die(0)),
            MechanismOutcome::Success(Value::Int(1_600_000_000))
        ));
        // Dies without CPUs are reachable too.
        assert!(matches!(
            TpmiDriver.read(&ctx, lookup("uncore_max_freq").unwrap(), &die(1)),
            MechanismOutcome::Success(Value::Int(3_000_000_000))
        ));
    }

    #[test]
    fn writes_go_to_mem_write() {
        let (host, topo) = setup();
        let ctx = Context { host: &host, topology: &topo };
        assert!(matches!(
            TpmiDriver.write(
                &ctx,
                lookup("uncore_max_freq").unwrap(),
                &die(1),
                &Value::Int(2_000_000_000)
            ),
            MechanismOutcome::Success(Value::Int(2_000_000_000))
        ));
        assert_eq!(
            host.file("/sys/kernel/debug/tpmi-0000:00:03.1/tpmi-id-02/mem_write").unwrap(),
            "1,0x18,0xc140c"
        );
    }

    #[test]
    fn unavailable_cases() {
        let (host, topo) = setup();
        let ctx = Context { host: &host, topology: &topo };
        let other_package = Target {
            instance: ScopeInstance::Die(DieKey { package: 1, die: 0 }),
            cpu: None,
        };
        assert!(matches!(
            TpmiDriver.read(&ctx, lookup("uncore_max_freq").unwrap(), &other_package),
            MechanismOutcome::Unsupported(_)
        ));
        assert!(matches!(
            TpmiDriver.read(&ctx, lookup("max_freq").unwrap(), &die(0)),
            MechanismOutcome::Unsupported(_)
        ));

        let bare = FixtureHost::from_toml("").unwrap();
        let ctx = Context { host: &bare, topology: &topo };
        assert!(matches!(
            TpmiDriver.read(&ctx, lookup("uncore_max_freq").unwrap(), &die(0)),
            MechanismOutcome::Unsupported(_)
        ));
    }
}
