// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Apple M1 (t8103): one die, two clusters, 4 efficiency + 4 performance cores.

use super::{CpuIdentity, Platform};
use crate::{
    logger::{self, LockedWriter},
    services::psci::topology::{self, Topology},
};
use arm_pl011_uart::{PL011Registers, Uart, UniqueMmioPointer};
use core::ptr::NonNull;

/// Base of the `/arm-io/pmgr` MMIO region, as read from the ADT on real hardware; fixed here
/// since this crate ships one binary per chip rather than parsing the ADT at boot.
const PMGR_BASE: usize = 0x2_3b70_0000;
/// Offset of the per-die "CPU start" register within `PMGR_BASE`.
const CPU_START_OFFSET: usize = 0x5000;
const DIE_STRIDE: usize = 0;
const CORES_PER_CLUSTER: usize = 4;

/// Treated as a PL011-compatible MMIO UART for logging purposes; the real Apple UART IP differs
/// but exposes an equivalent register model at this offset.
const UART_BASE: *mut PL011Registers = 0x2_3510_0000 as _;

const CPU_IDENTITIES: [CpuIdentity; 8] = [
    CpuIdentity {
        mpidr: 0x000,
        die_index: 0,
        cluster_index: 0,
        local_core_number: 0,
    },
    CpuIdentity {
        mpidr: 0x001,
        die_index: 0,
        cluster_index: 0,
        local_core_number: 1,
    },
    CpuIdentity {
        mpidr: 0x002,
        die_index: 0,
        cluster_index: 0,
        local_core_number: 2,
    },
    CpuIdentity {
        mpidr: 0x003,
        die_index: 0,
        cluster_index: 0,
        local_core_number: 3,
    },
    CpuIdentity {
        mpidr: 0x100,
        die_index: 0,
        cluster_index: 1,
        local_core_number: 0,
    },
    CpuIdentity {
        mpidr: 0x101,
        die_index: 0,
        cluster_index: 1,
        local_core_number: 1,
    },
    CpuIdentity {
        mpidr: 0x102,
        die_index: 0,
        cluster_index: 1,
        local_core_number: 2,
    },
    CpuIdentity {
        mpidr: 0x103,
        die_index: 0,
        cluster_index: 1,
        local_core_number: 3,
    },
];

pub struct M1;

// SAFETY: `topology::M1`'s CPU-level leaf count (8) equals `CORE_COUNT`, and `CPU_IDENTITIES` has
// exactly `CORE_COUNT` entries, each with a `local_core_number` less than `CORES_PER_CLUSTER`.
unsafe impl Platform for M1 {
    const CORE_COUNT: usize = 8;
    const TOPOLOGY: Topology = topology::M1;
    const CAPABILITIES: u64 = super::SUPPORTED_FUNCTION_BITMAP;
    const PMGR_BASE: usize = PMGR_BASE;
    const CPU_START_OFFSET: usize = CPU_START_OFFSET;
    const DIE_STRIDE: usize = DIE_STRIDE;
    const CORES_PER_CLUSTER: usize = CORES_PER_CLUSTER;

    type LogSinkImpl = LockedWriter<Uart<'static>>;

    fn init() {
        // SAFETY: `UART_BASE` is the base address of the boot console's UART, and nothing else
        // accesses that address range.
        let uart_pointer = unsafe { UniqueMmioPointer::new(NonNull::new(UART_BASE).unwrap()) };
        logger::init(LockedWriter::new(Uart::new(uart_pointer)))
            .expect("failed to initialise logger");
    }

    fn cpu_identities() -> &'static [CpuIdentity] {
        &CPU_IDENTITIES
    }

    unsafe fn write_cpu_start(die_index: usize, value: u32) {
        assert_eq!(die_index, 0);
        let register = (PMGR_BASE + CPU_START_OFFSET) as *mut u32;
        // SAFETY: the caller guarantees this is the last step before deep sleep, and
        // `die_index` has just been checked against this single-die platform.
        unsafe {
            register.write_volatile(value);
        }
    }

    fn system_off() -> ! {
        loop {
            crate::aarch64::wfi();
        }
    }

    fn system_reset() -> ! {
        loop {
            crate::aarch64::wfi();
        }
    }
}
