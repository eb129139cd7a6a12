use crate::host::Host;
use crate::range;
use crate::util::error::HostError;
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

/// Read a sysfs file through `host` and return its trimmed contents.
///
/// # Errors
///
/// Returns a `HostError` variant based on the specific error:
/// - `HostError::PermissionDenied` if permission is denied
/// - `HostError::PathMissing` if the path doesn't exist
/// - `HostError::ReadError` if the contents are not valid UTF-8 or the read failed
pub fn read_sysfs_value(host: &dyn Host, path: impl AsRef<Path>) -> Result<String, HostError> {
    let p = path.as_ref();
    let bytes = host.read_file(p)?;
    String::from_utf8(bytes)
        .map(|s| s.trim().to_string())
        .map_err(|e| HostError::ReadError(format!("Path: {:?}, Error: {}", p.display(), e)))
}

/// Read a sysfs file and parse it into `T`.
///
/// # Errors
///
/// Same as [`read_sysfs_value`], plus `HostError::ParseError` if the contents don't parse.
pub fn read_sysfs_parsed<T>(host: &dyn Host, path: impl AsRef<Path>) -> Result<T, HostError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let p = path.as_ref();
    let value = read_sysfs_value(host, p)?;
    value.parse::<T>().map_err(|e| {
        HostError::ParseError(format!("Path: {:?}, Value: '{}', Error: {}", p.display(), value, e))
    })
}

/// Read a kernel CPU list file such as `/sys/devices/system/cpu/online`.
pub fn read_sysfs_cpulist(host: &dyn Host, path: impl AsRef<Path>) -> Result<BTreeSet<u32>, HostError> {
    let p = path.as_ref();
    let value = read_sysfs_value(host, p)?;
    range::parse_cpulist(&value)
        .map_err(|e| HostError::ParseError(format!("Path: {:?}, Error: {}", p.display(), e)))
}

/// Write a value to a sysfs file through `host`.
///
/// # Arguments
///
/// * `host` - The host to write on
/// * `path` - The file path to write to
/// * `value` - The string value to write
pub fn write_sysfs_value(host: &dyn Host, path: impl AsRef<Path>, value: &str) -> Result<(), HostError> {
    host.write_file(path.as_ref(), value.as_bytes())
}

/// Read an optional sysfs file, mapping a missing path to `None`.
pub fn read_optional(host: &dyn Host, path: impl AsRef<Path>) -> Result<Option<String>, HostError> {
    match read_sysfs_value(host, path) {
        Ok(value) => Ok(Some(value)),
        Err(HostError::PathMissing(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Split a whitespace-separated list file such as `scaling_available_governors`.
pub fn read_sysfs_words(host: &dyn Host, path: impl AsRef<Path>) -> Result<Vec<String>, HostError> {
    Ok(read_sysfs_value(host, path)?
        .split_whitespace()
        .map(ToString::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixtureHost;

    fn host() -> FixtureHost {
        FixtureHost::from_toml(
            r#"
            [files]
            "/sys/devices/system/cpu/online" = "0-3,6\n"
            "/sys/devices/system/cpu/cpu0/cpufreq/scaling_max_freq" = "3200000\n"
            "/sys/devices/system/cpu/cpu0/cpufreq/scaling_available_governors" = "performance powersave\n"
            "/sys/devices/system/cpu/cpu0/cpufreq/scaling_driver" = "intel_pstate"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn reads_are_trimmed_and_parsed() {
        let host = host();
        assert_eq!(
            read_sysfs_value(&host, "/sys/devices/system/cpu/cpu0/cpufreq/scaling_driver").unwrap(),
            "intel_pstate"
        );
        let khz: u64 =
            read_sysfs_parsed(&host, "/sys/devices/system/cpu/cpu0/cpufreq/scaling_max_freq").unwrap();
        assert_eq!(khz, 3_200_000);
        assert_eq!(
            read_sysfs_cpulist(&host, "/sys/devices/system/cpu/online").unwrap(),
            [0, 1, 2, 3, 6].into_iter().collect()
        );
        assert_eq!(
            read_sysfs_words(
                &host,
                "/sys/devices/system/cpu/cpu0/cpufreq/scaling_available_governors"
            )
            .unwrap(),
            vec!["performance", "powersave"]
        );
    }

    #[test]
    fn missing_files() {
        let host = host();
        assert!(matches!(
            read_sysfs_value(&host, "/sys/nope"),
            Err(HostError::PathMissing(_))
        ));
        assert_eq!(read_optional(&host, "/sys/nope").unwrap(), None);
    }

    #[test]
    fn bad_numbers_are_parse_errors() {
        let host = host();
        let res: Result<u32, _> =
            read_sysfs_parsed(&host, "/sys/devices/system/cpu/cpu0/cpufreq/scaling_driver");
        assert!(matches!(res, Err(HostError::ParseError(_))));
    }
}
