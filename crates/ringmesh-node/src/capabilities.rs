//! Device-capability probe (§6 "Capability probe interface").
//!
//! Real hardware introspection (GPU model, chip family, available
//! memory, peak FLOPS) is platform-specific and out of scope for this
//! specification — only the output type matters to the orchestrator.
//! This stand-in reports what the OS can tell us cheaply and leaves the
//! FLOPS fields at zero.

use ringmesh_proto::{DeviceCapabilities, DeviceFlops};

/// Single-shot probe, called once at startup.
pub fn detect() -> DeviceCapabilities {
    let memory_mib = available_memory_mib().unwrap_or(0);
    DeviceCapabilities {
        model: std::env::consts::ARCH.to_string(),
        chip: std::env::consts::OS.to_string(),
        memory_mib,
        flops: DeviceFlops::ZERO,
    }
}

#[cfg(target_os = "linux")]
fn available_memory_mib() -> Option<u32> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = contents.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some((kib / 1024) as u32)
}

#[cfg(not(target_os = "linux"))]
fn available_memory_mib() -> Option<u32> {
    None
}
