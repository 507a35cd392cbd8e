// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Binds the PSCI core to a concrete Apple-silicon SoC.
//!
//! Exactly one of the `m1`, `m1-pro-max`, `m1-ultra`, `m2` features (or, implicitly, under
//! `cfg(test)`, the `test` platform) should be enabled at build time.

#[cfg(all(feature = "m1", not(test)))]
mod m1;
#[cfg(all(feature = "m1-pro-max", not(any(feature = "m1", test))))]
mod m1_pro_max;
#[cfg(all(
    feature = "m1-ultra",
    not(any(feature = "m1", feature = "m1-pro-max", test))
))]
mod m1_ultra;
#[cfg(all(
    feature = "m2",
    not(any(feature = "m1", feature = "m1-pro-max", feature = "m1-ultra", test))
))]
mod m2;
pub mod test;

use crate::{logger::LogSink, services::psci::topology::Topology};
use arm_psci::Mpidr;
use arm_sysregs::read_mpidr_el1;

#[cfg(all(feature = "m1", not(test)))]
pub use m1::M1 as PlatformImpl;
#[cfg(all(feature = "m1-pro-max", not(any(feature = "m1", test))))]
pub use m1_pro_max::M1ProMax as PlatformImpl;
#[cfg(all(
    feature = "m1-ultra",
    not(any(feature = "m1", feature = "m1-pro-max", test))
))]
pub use m1_ultra::M1Ultra as PlatformImpl;
#[cfg(all(
    feature = "m2",
    not(any(feature = "m1", feature = "m1-pro-max", feature = "m1-ultra", test))
))]
pub use m2::M2 as PlatformImpl;
#[cfg(test)]
pub use test::TestPlatform as PlatformImpl;

/// Type alias for convenience, to avoid having to use the complicated type name everywhere.
pub type LogSinkImpl = <PlatformImpl as Platform>::LogSinkImpl;

/// The ADT-derived identity of one physical CPU.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CpuIdentity {
    /// The MPIDR value this CPU presents, read from the ADT `cpu-id`/`reg` properties.
    pub mpidr: u64,
    /// Index of the die this CPU lives on (0 for single-die SoCs).
    pub die_index: usize,
    /// Index of the cluster this CPU lives in, within its die.
    pub cluster_index: usize,
    /// The CPU's position within its cluster's "CPU start" bitmap.
    pub local_core_number: usize,
}

/// The hooks PSCI needs from the concrete SoC and board.
///
/// # Safety
///
/// `TOPOLOGY` must describe a tree whose CPU-level leaf count equals `CORE_COUNT`, and
/// `cpu_identities()` must return exactly `CORE_COUNT` entries, each with a `local_core_number`
/// less than `CORES_PER_CLUSTER`.
pub unsafe trait Platform {
    /// The number of CPU cores.
    const CORE_COUNT: usize;

    /// The breadth-first child-count topology table (C1).
    const TOPOLOGY: Topology;

    /// The bitmask of PSCI function IDs this platform supports (C8).
    const CAPABILITIES: u64;

    /// Base address of the `/arm-io/pmgr` MMIO region.
    const PMGR_BASE: usize;

    /// Per-SoC "CPU start" register offset from `PMGR_BASE`.
    const CPU_START_OFFSET: usize;

    /// Stride in bytes between consecutive dies' "CPU start" registers.
    const DIE_STRIDE: usize;

    /// Number of cores per cluster, used to compute the CPU-start bitmap position.
    const CORES_PER_CLUSTER: usize;

    /// Platform-dependent `LogSink` implementation type for the logger.
    type LogSinkImpl: LogSink;

    /// Performs early platform-specific initialisation, including installing the logger.
    fn init();

    /// Returns the ADT-derived identity of every CPU, in the same order as the CPU level of
    /// `TOPOLOGY`.
    fn cpu_identities() -> &'static [CpuIdentity];

    /// Writes `value` to the "CPU start" MMIO register for `die_index`.
    ///
    /// # Safety
    ///
    /// Must only be called with a `die_index` less than the number of dies described by
    /// `TOPOLOGY`, and only as the last step before entering deep sleep on the calling core.
    unsafe fn write_cpu_start(die_index: usize, value: u32);

    /// Requests that the platform power off permanently. Does not return.
    fn system_off() -> !;

    /// Requests that the platform reset. Does not return.
    fn system_reset() -> !;
}

/// The bitmask of PSCI function IDs every concrete Apple-silicon platform supports: the 10
/// functions this crate implements (see [`crate::services::psci`]), keyed by the low 5 bits of
/// each function's SMC ID.
pub const SUPPORTED_FUNCTION_BITMAP: u64 = (1 << 0x00)
    | (1 << 0x01)
    | (1 << 0x02)
    | (1 << 0x03)
    | (1 << 0x04)
    | (1 << 0x08)
    | (1 << 0x09)
    | (1 << 0x0a)
    | (1 << 0x13)
    | (1 << 0x14);

/// Mask of the Aff0-Aff3 fields of `MPIDR_EL1`, the CPU affinity value PSCI callers use to
/// name a target CPU.
const AFFINITY_MASK: u64 = arm_sysregs::MpidrEl1::AFF0_MASK
    | arm_sysregs::MpidrEl1::AFF1_MASK
    | arm_sysregs::MpidrEl1::AFF2_MASK
    | arm_sysregs::MpidrEl1::AFF3_MASK;

/// Returns the index into [`Platform::cpu_identities`] of the CPU this code is running on,
/// determined from its current `MPIDR_EL1` value.
pub fn current_core_index() -> usize {
    let mpidr = read_mpidr_el1().bits() & AFFINITY_MASK;
    try_core_index_by_mpidr(mpidr).expect("current CPU is not listed in this platform's ADT")
}

/// Looks up the core index of the CPU identified by `mpidr`, a raw MPIDR affinity value.
pub fn try_core_index_by_mpidr(mpidr: u64) -> Option<usize> {
    PlatformImpl::cpu_identities()
        .iter()
        .position(|identity| identity.mpidr == mpidr)
}

/// Looks up the core index of the CPU identified by a PSCI `Mpidr` argument.
pub fn try_core_index_by_psci_mpidr(mpidr: Mpidr) -> Option<usize> {
    try_core_index_by_mpidr(u64::from(mpidr) & AFFINITY_MASK)
}
