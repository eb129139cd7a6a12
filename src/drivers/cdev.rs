use super::{Context, Driver, MechanismOutcome, Target, read_only, unsupported};
use crate::props::{Mechanism, Property, Value};
use crate::util::error::HostError;
use std::path::Path;

const CPU_DMA_LATENCY: &str = "/dev/cpu_dma_latency";

/// Character devices. The PM QoS device holds the global latency limit as a binary 32-bit
/// integer in microseconds. A request written to it only lasts while the file stays open, so
/// the limit is read-only here.
#[derive(Debug)]
pub struct CdevDriver;

fn read_dma_latency(ctx: &Context<'_>) -> Result<Value, MechanismOutcome> {
    let bytes = ctx.host.read_file(Path::new(CPU_DMA_LATENCY))?;
    let raw: [u8; 4] = bytes.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(|| {
        HostError::ReadError(format!(
            "Path: {CPU_DMA_LATENCY:?}, Error: expected 4 bytes, got {}",
            bytes.len()
        ))
    })?;
    let us = i32::from_ne_bytes(raw);
    u64::try_from(us).map(Value::Int).map_err(|_| {
        HostError::ParseError(format!("Path: {CPU_DMA_LATENCY:?}, Value: {us}")).into()
    })
}

impl Driver for CdevDriver {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Cdev
    }

    fn read(&self, ctx: &Context<'_>, prop: &Property, _target: &Target) -> MechanismOutcome {
        match prop.name {
            "global_latency_limit" => read_dma_latency(ctx).into(),
            _ => unsupported(prop, Mechanism::Cdev),
        }
    }

    fn write(&self, _ctx: &Context<'_>, prop: &Property, _target: &Target, _value: &Value) -> MechanismOutcome {
        match prop.name {
            "global_latency_limit" => read_only(prop),
            _ => unsupported(prop, Mechanism::Cdev),
        }
    }
}
