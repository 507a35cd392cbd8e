// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Apple M1 Ultra (t6002): two M1 Max dies bridged together, giving four clusters (2 efficiency +
//! 8 performance cores on each die).

use super::{CpuIdentity, Platform};
use crate::{
    logger::{self, LockedWriter},
    services::psci::topology::{self, Topology},
};
use arm_pl011_uart::{PL011Registers, Uart, UniqueMmioPointer};
use core::ptr::NonNull;

const PMGR_BASE: usize = 0x2_8e08_0000;
const CPU_START_OFFSET: usize = 0x5000;
/// Stride between the two dies' "CPU start" registers.
const DIE_STRIDE: usize = 0x4_0000_0000;
const CORES_PER_CLUSTER: usize = 8;

/// Treated as a PL011-compatible MMIO UART for logging purposes; the real Apple UART IP differs
/// but exposes an equivalent register model at this offset.
const UART_BASE: *mut PL011Registers = 0x2_9110_0000 as _;

const fn die0_identities() -> [CpuIdentity; 10] {
    [
        CpuIdentity {
            mpidr: 0x0000,
            die_index: 0,
            cluster_index: 0,
            local_core_number: 0,
        },
        CpuIdentity {
            mpidr: 0x0001,
            die_index: 0,
            cluster_index: 0,
            local_core_number: 1,
        },
        CpuIdentity {
            mpidr: 0x0100,
            die_index: 0,
            cluster_index: 1,
            local_core_number: 0,
        },
        CpuIdentity {
            mpidr: 0x0101,
            die_index: 0,
            cluster_index: 1,
            local_core_number: 1,
        },
        CpuIdentity {
            mpidr: 0x0102,
            die_index: 0,
            cluster_index: 1,
            local_core_number: 2,
        },
        CpuIdentity {
            mpidr: 0x0103,
            die_index: 0,
            cluster_index: 1,
            local_core_number: 3,
        },
        CpuIdentity {
            mpidr: 0x0104,
            die_index: 0,
            cluster_index: 1,
            local_core_number: 4,
        },
        CpuIdentity {
            mpidr: 0x0105,
            die_index: 0,
            cluster_index: 1,
            local_core_number: 5,
        },
        CpuIdentity {
            mpidr: 0x0106,
            die_index: 0,
            cluster_index: 1,
            local_core_number: 6,
        },
        CpuIdentity {
            mpidr: 0x0107,
            die_index: 0,
            cluster_index: 1,
            local_core_number: 7,
        },
    ]
}

/// Die 1's identities mirror die 0's, shifted into clusters 2/3 and tagged `die_index: 1`.
const fn die1_identities() -> [CpuIdentity; 10] {
    let die0 = die0_identities();
    let mut die1 = die0;
    let mut i = 0;
    while i < die1.len() {
        die1[i].die_index = 1;
        die1[i].cluster_index += 2;
        die1[i].mpidr |= 0x1_0000;
        i += 1;
    }
    die1
}

const CPU_IDENTITIES: [CpuIdentity; 20] = {
    let die0 = die0_identities();
    let die1 = die1_identities();
    let mut all = [die0[0]; 20];
    let mut i = 0;
    while i < 10 {
        all[i] = die0[i];
        all[10 + i] = die1[i];
        i += 1;
    }
    all
};

pub struct M1Ultra;

// SAFETY: `topology::M1_ULTRA`'s CPU-level leaf count (20) equals `CORE_COUNT`, and
// `CPU_IDENTITIES` has exactly `CORE_COUNT` entries, each with a `local_core_number` less than
// `CORES_PER_CLUSTER`.
unsafe impl Platform for M1Ultra {
    const CORE_COUNT: usize = 20;
    const TOPOLOGY: Topology = topology::M1_ULTRA;
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
        assert!(die_index < 2);
        let register = (PMGR_BASE + CPU_START_OFFSET + die_index * DIE_STRIDE) as *mut u32;
        // SAFETY: the caller guarantees this is the last step before deep sleep, and
        // `die_index` has just been checked against this platform's two dies.
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
