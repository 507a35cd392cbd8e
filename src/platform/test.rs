// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! A fake platform used only by this crate's own test suite.
//!
//! Two CPUs in a single cluster are enough to exercise every coordination path (standby,
//! power-down, last-CPU denial) without needing a real SoC's topology.

use super::{CpuIdentity, Platform};
use crate::{logger::inmemory::SharedMemoryLogger, services::psci::topology::Topology};

/// The fake platform's topology: one cluster of two CPUs.
const TOPOLOGY: Topology = Topology(&[1, 1, 2]);

/// CPU 0's MPIDR is zero to match the default value the `arm_sysregs` `fakes` register bank
/// reports for `MPIDR_EL1` before any test sets it explicitly.
const CPU_IDENTITIES: [CpuIdentity; 2] = [
    CpuIdentity {
        mpidr: 0x0,
        die_index: 0,
        cluster_index: 0,
        local_core_number: 0,
    },
    CpuIdentity {
        mpidr: 0x1,
        die_index: 0,
        cluster_index: 0,
        local_core_number: 1,
    },
];

/// The fake platform used by this crate's own tests.
pub struct TestPlatform;

// SAFETY: `TOPOLOGY`'s CPU-level leaf count (2) equals `CORE_COUNT`, and `CPU_IDENTITIES` has
// exactly `CORE_COUNT` entries, each with a `local_core_number` less than `CORES_PER_CLUSTER`.
unsafe impl Platform for TestPlatform {
    const CORE_COUNT: usize = 2;
    const TOPOLOGY: Topology = TOPOLOGY;
    const CAPABILITIES: u64 = super::SUPPORTED_FUNCTION_BITMAP;
    const PMGR_BASE: usize = 0;
    const CPU_START_OFFSET: usize = 0;
    const DIE_STRIDE: usize = 0;
    const CORES_PER_CLUSTER: usize = 2;

    type LogSinkImpl = SharedMemoryLogger<4096>;

    fn init() {
        let _ = crate::logger::init(SharedMemoryLogger::new());
    }

    fn cpu_identities() -> &'static [CpuIdentity] {
        &CPU_IDENTITIES
    }

    unsafe fn write_cpu_start(_die_index: usize, _value: u32) {}

    fn system_off() -> ! {
        panic!("system_off");
    }

    fn system_reset() -> ! {
        panic!("system_reset");
    }
}
