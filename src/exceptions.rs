// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The EL2 synchronous exception trap frame and dispatch (C12).
//!
//! The vector table and general-purpose register save/restore are treated as an external
//! collaborator (see the module documentation in `aarch64`); this module covers what happens
//! once x0-x3, SPSR_EL2, ELR_EL2, ESR_EL2 and FAR_EL2 have already been saved to the stack.

use crate::services::Services;
use arm_sysregs::{EsrEl2, read_elr_el2, write_elr_el2};
use log::trace;

/// The `EC` (exception class) field of `ESR_ELx`, bits [31:26].
const ESR_EC_SHIFT: u64 = 26;
const ESR_EC_MASK: u64 = 0x3f;

/// `EC` value for an SMC instruction executed in AArch64 state.
const EC_SMC64: u64 = 0x17;

/// The AArch64 general-purpose and special-purpose register state saved across a trap into EL2.
///
/// Only `x0`-`x3` are saved because PSCI (and the wider SMCCC fast-call convention this crate
/// supports) never reads or returns more than four registers.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub spsr_el2: u64,
    pub elr_el2: u64,
    pub esr_el2: u64,
    pub far_el2: u64,
    pub sp_el0: u64,
    pub sp_el1: u64,
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
}

impl TrapFrame {
    fn esr(&self) -> EsrEl2 {
        EsrEl2::from_bits_retain(self.esr_el2)
    }

    fn exception_class(&self) -> u64 {
        (self.esr_el2 >> ESR_EC_SHIFT) & ESR_EC_MASK
    }
}

/// Dispatches a synchronous exception taken to EL2.
///
/// Returns `true` if the trap was handled (in which case `frame` has been updated with the
/// result and the caller should return to the guest), or `false` if nothing in this crate
/// recognised the trap and the caller must fall back to its own default handling.
pub fn handle_sync_exception(frame: &mut TrapFrame) -> bool {
    if frame.exception_class() != EC_SMC64 {
        trace!(
            "Unhandled synchronous exception, ESR_EL2 = {:#x?}",
            frame.esr()
        );
        return false;
    }

    let regs = [frame.x0, frame.x1, frame.x2, frame.x3];
    let result = Services::get().handle_smc(&regs);

    let values = result.values();
    frame.x0 = values.first().copied().unwrap_or(0);
    frame.x1 = values.get(1).copied().unwrap_or(0);
    frame.x2 = values.get(2).copied().unwrap_or(0);
    frame.x3 = values.get(3).copied().unwrap_or(0);

    // SMC is a 4-byte instruction in AArch64 state; advance past it so the guest resumes after
    // the call rather than re-trapping on the same instruction.
    frame.elr_el2 = frame.elr_el2.wrapping_add(4);

    true
}

/// Advances `ELR_EL2` by one instruction, for use outside the trap-frame-based entry path (for
/// example, after completing a suspend that parked the CPU with `WFI` rather than trapping).
#[cfg(not(test))]
pub fn skip_current_instruction() {
    // SAFETY: advancing ELR_EL2 by one instruction width is a valid value to resume
    // execution at, matching the SMC skip-ahead done in `handle_sync_exception`.
    unsafe {
        write_elr_el2(read_elr_el2() + 4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm_psci::Version;

    fn smc_frame(x0: u64, x1: u64, x2: u64, x3: u64) -> TrapFrame {
        TrapFrame {
            esr_el2: EC_SMC64 << ESR_EC_SHIFT,
            elr_el2: 0x1000,
            x0,
            x1,
            x2,
            x3,
            ..Default::default()
        }
    }

    #[test]
    fn psci_version_handled() {
        let mut frame = smc_frame(u32::from(arm_psci::FunctionId::PsciVersion) as u64, 0, 0, 0);
        assert!(handle_sync_exception(&mut frame));
        assert_eq!(frame.x0, u32::from(Version { major: 1, minor: 1 }) as u64);
        assert_eq!(frame.elr_el2, 0x1004);
    }

    #[test]
    fn non_smc_trap_not_handled() {
        let mut frame = TrapFrame {
            esr_el2: 0,
            ..Default::default()
        };
        assert!(!handle_sync_exception(&mut frame));
    }
}
