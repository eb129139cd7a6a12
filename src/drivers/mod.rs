//! One driver per access mechanism. A driver reads or writes one property on one scope
//! instance and reports what happened as a [`MechanismOutcome`] rather than an error, so the
//! engine can decide whether to fall back to the next mechanism.

mod cdev;
mod msr;
mod sysfs;
mod tpmi;

pub use cdev::CdevDriver;
pub use msr::MsrDriver;
pub use sysfs::SysfsDriver;
pub use tpmi::TpmiDriver;

use crate::host::Host;
use crate::props::{Mechanism, Property, Value};
use crate::topology::{ScopeInstance, Snapshot};
use crate::util::error::HostError;
use std::fmt;

/// The result of one attempt by one mechanism.
#[derive(Debug)]
pub enum MechanismOutcome {
    /// The value read, or the value actually written.
    Success(Value),
    /// The mechanism cannot handle this property on this host.
    Unsupported(String),
    /// The target exists but refuses the operation, for example a register locked by firmware.
    Denied(String),
    /// Reaching the target failed: missing file, failed command, timeout.
    TransportError(HostError),
}

impl fmt::Display for MechanismOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(value) => write!(f, "success: {value}"),
            Self::Unsupported(reason) => write!(f, "unsupported: {reason}"),
            Self::Denied(reason) => write!(f, "denied: {reason}"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl From<HostError> for MechanismOutcome {
    fn from(e: HostError) -> Self {
        Self::TransportError(e)
    }
}

impl From<Result<Value, MechanismOutcome>> for MechanismOutcome {
    fn from(res: Result<Value, MechanismOutcome>) -> Self {
        match res {
            Ok(value) => Self::Success(value),
            Err(outcome) => outcome,
        }
    }
}

/// What a driver operates on: a scope instance and the CPU that represents it. Dies without
/// CPUs have no representative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub instance: ScopeInstance,
    pub cpu: Option<u32>,
}

impl Target {
    pub(crate) fn require_cpu(&self) -> Result<u32, MechanismOutcome> {
        self.cpu.ok_or_else(|| {
            MechanismOutcome::Unsupported(format!("{} has no CPU to address", self.instance))
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.instance, self.cpu) {
            (ScopeInstance::Cpu(_), _) | (_, None) => write!(f, "{}", self.instance),
            (instance, Some(cpu)) => write!(f, "{instance} (via CPU {cpu})"),
        }
    }
}

/// Everything a driver may consult.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub host: &'a dyn Host,
    pub topology: &'a Snapshot,
}

pub trait Driver: Sync {
    fn mechanism(&self) -> Mechanism;

    fn read(&self, ctx: &Context<'_>, prop: &Property, target: &Target) -> MechanismOutcome;

    fn write(
        &self,
        ctx: &Context<'_>,
        prop: &Property,
        target: &Target,
        value: &Value,
    ) -> MechanismOutcome;
}

/// The driver implementing `mechanism`.
pub fn driver(mechanism: Mechanism) -> &'static dyn Driver {
    match mechanism {
        Mechanism::Sysfs => &SysfsDriver,
        Mechanism::Tpmi => &TpmiDriver,
        Mechanism::Msr => &MsrDriver,
        Mechanism::Cdev => &CdevDriver,
    }
}

pub(crate) fn unsupported(prop: &Property, mechanism: Mechanism) -> MechanismOutcome {
    MechanismOutcome::Unsupported(format!(
        "property '{}' is not available through {mechanism}",
        prop.name
    ))
}

pub(crate) fn read_only(prop: &Property) -> MechanismOutcome {
    MechanismOutcome::Unsupported(format!("property '{}' is read-only", prop.name))
}

pub(crate) fn expect_int(prop: &Property, value: &Value) -> Result<u64, MechanismOutcome> {
    value.as_int().ok_or_else(|| {
        MechanismOutcome::Unsupported(format!("'{value}' is not a number, {} needs one", prop.name))
    })
}

pub(crate) fn expect_bool(prop: &Property, value: &Value) -> Result<bool, MechanismOutcome> {
    value.as_bool().ok_or_else(|| {
        MechanismOutcome::Unsupported(format!("'{value}' is not on/off, {} needs one", prop.name))
    })
}
