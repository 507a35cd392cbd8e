// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The PSCI service (C5/C6/C8): SMC dispatch, the per-CPU lifecycle operations, and the
//! power-domain tree they coordinate through.

pub mod power_domain_tree;
pub mod topology;

use crate::{
    aarch64::{
        clean_invalidate_dcache_all, clean_invalidate_dcache_object, disable_dcache, dsb_sy,
        enable_dcache, interrupt_pending, sev, wfi,
    },
    platform::{self, Platform, PlatformImpl},
    smccc::SmcReturn,
};
use arm_psci::{
    AffinityInfo, EntryPoint, ErrorCode, Function, FunctionId, MemProtectRange, Mpidr, PowerState,
    Version,
};
use log::info;
use power_domain_tree::{
    AncestorPowerDomains, CompositePowerState, CpuPowerNode, LocalPowerState, PowerDomainTree,
    CPU_POWER_LEVEL, MAX_POWER_LEVEL,
};

/// Width in bits of one level's packed state-ID field within a PSCI extended power-state value.
///
/// This is a property of how this implementation packs per-level state into the guest-facing
/// `power_state` argument, not an architectural constant; Arm leaves the encoding of the
/// `StateID` field to the platform.
const LEVEL_STATE_WIDTH: u32 = 4;
const LEVEL_STATE_MASK: u32 = (1 << LEVEL_STATE_WIDTH) - 1;

/// Parses the packed per-level state-ID field of a PSCI extended power-state value.
///
/// Level 0 occupies the low nibble, each subsequent level the next nibble up. A nibble value of
/// 0 means `ON`; 1 means `IDLE_STANDBY` for a standby/retention request or `OFF` for a power-down
/// request; any other value is rejected as not present in the whitelist.
fn decode_power_state(
    raw_state: u32,
    is_power_down: bool,
) -> Result<CompositePowerState, ErrorCode> {
    let mut composite = CompositePowerState::ON;

    for level in 0..=MAX_POWER_LEVEL {
        let nibble = (raw_state >> (level as u32 * LEVEL_STATE_WIDTH)) & LEVEL_STATE_MASK;
        composite.states[level] = match nibble {
            0 => LocalPowerState::On,
            1 if is_power_down => LocalPowerState::Off,
            1 => LocalPowerState::IdleStandby,
            _ => return Err(ErrorCode::InvalidParameters),
        };
    }

    if composite.is_valid_suspend_request(is_power_down) {
        Ok(composite)
    } else {
        Err(ErrorCode::InvalidParameters)
    }
}

/// Rejects entry points the guest could not possibly execute: the null address, and anything not
/// 4-byte aligned (every AArch64 instruction is 4 bytes).
fn validate_entry_point(entry: &EntryPoint) -> Result<(), ErrorCode> {
    let address = match *entry {
        EntryPoint::Entry64 {
            entry_point_address,
            ..
        } => entry_point_address,
        EntryPoint::Entry32 {
            entry_point_address,
            ..
        } => entry_point_address as u64,
    };

    if address == 0 || address % 4 != 0 {
        Err(ErrorCode::InvalidAddress)
    } else {
        Ok(())
    }
}

/// Parks this core forever, the terminal step of `CPU_OFF`.
///
/// Under test this panics instead of looping, since a bare-metal "does not return" function
/// cannot otherwise be observed from a hosted test binary; callers use `catch_unwind` to assert
/// it was reached.
#[cfg(not(test))]
fn power_down() -> ! {
    dsb_sy();
    loop {
        wfi();
    }
}

#[cfg(test)]
fn power_down() -> ! {
    panic!("reached power_down");
}

/// The PSCI implementation: owns the power-domain tree and dispatches SMC calls into it.
pub struct Psci {
    tree: PowerDomainTree,
}

impl Psci {
    /// Builds the power-domain tree and marks the calling CPU as the running primary.
    ///
    /// Must be called exactly once, before any other CPU has started, as the first thing this
    /// core does once it is safe to take the power-domain locks.
    pub fn new() -> Self {
        info!("Initializing PSCI for {} cores", PlatformImpl::CORE_COUNT);

        let tree = PowerDomainTree::new(PlatformImpl::TOPOLOGY);
        let cpu_index = platform::current_core_index();
        let mut cpu = tree.locked_cpu_node(cpu_index);

        tree.with_ancestors_locked(&mut cpu, |cpu, mut ancestors| {
            cpu.set_affinity_info(AffinityInfo::On);
            cpu.set_local_state(LocalPowerState::On);
            for node in ancestors.iter_mut() {
                node.set_requested_power_state(cpu_index, LocalPowerState::On);
                node.set_local_state(LocalPowerState::On);
            }
        });
        drop(cpu);

        Self { tree }
    }

    /// Cleans and invalidates the cache lines backing `cpu` and every locked ancestor, the
    /// post-condition every state-mutating tree operation owes its readers.
    fn flush_coordinated(cpu: &CpuPowerNode, ancestors: &AncestorPowerDomains) {
        clean_invalidate_dcache_object(cpu);
        for node in ancestors.iter() {
            clean_invalidate_dcache_object(&**node);
        }
    }

    /// Decodes and dispatches a raw SMC register file, returning the value(s) to write back.
    pub fn handle_smc(&self, regs: &[u64; 4]) -> SmcReturn {
        let result: u64 = match Function::try_from(regs) {
            Ok(function) => match self.dispatch(function) {
                Ok(value) => value,
                Err(error) => error.into(),
            },
            Err(error) => error.into(),
        };
        SmcReturn::from(result)
    }

    fn dispatch(&self, function: Function) -> Result<u64, ErrorCode> {
        const SUCCESS: u64 = 0;

        match function {
            Function::Version => Ok(u32::from(Version { major: 1, minor: 1 }) as u64),
            Function::CpuSuspend { state, entry } => self.cpu_suspend(state, entry),
            Function::CpuOff => self.cpu_off(),
            Function::CpuOn { target_cpu, entry } => self.cpu_on(target_cpu, entry),
            Function::AffinityInfo {
                mpidr,
                lowest_affinity_level,
            } => {
                let affinity_info = self.affinity_info(mpidr, lowest_affinity_level)?;
                Ok(u32::from(affinity_info) as u64)
            }
            Function::SystemOff => self.system_off(),
            Function::SystemReset => self.system_reset(),
            Function::Features { psci_func_id } => self.features(psci_func_id),
            Function::MemProtect { enabled } => {
                let previous = self.mem_protect(enabled)?;
                Ok(if previous { 1 } else { 0 })
            }
            Function::MemProtectCheckRange { range } => {
                self.mem_protect_check_range(range)?;
                Ok(SUCCESS)
            }
            _ => Err(ErrorCode::NotSupported),
        }
    }

    /// Handles `CPU_SUSPEND`.
    ///
    /// A standby request that only touches the CPU level is the fast path: set the local state,
    /// `WFI`, restore `ON`. Anything deeper coordinates the affected ancestors under lock first.
    /// This core stays powered through the suspend (no CPU-start MMIO is programmed, unlike
    /// `cpu_off`), so a power-down request also resumes synchronously within this call rather
    /// than through a fresh boot entry point.
    fn cpu_suspend(&self, power_state: PowerState, entry: EntryPoint) -> Result<u64, ErrorCode> {
        const SUCCESS: u64 = 0;

        let cpu_index = platform::current_core_index();
        let (raw_state, is_power_down) = match power_state {
            PowerState::PowerDown(raw) => (raw, true),
            PowerState::StandbyOrRetention(raw) => (raw, false),
        };
        let mut composite = decode_power_state(raw_state, is_power_down)?;

        let highest_affected_level = composite
            .find_highest_non_run_level()
            .expect("validated composite power state always has a non-running level");

        if !is_power_down && highest_affected_level == CPU_POWER_LEVEL {
            let standby_state = composite.cpu_level_state();
            self.tree
                .locked_cpu_node(cpu_index)
                .set_local_state(standby_state);

            dsb_sy();
            wfi();

            self.tree
                .locked_cpu_node(cpu_index)
                .set_local_state(LocalPowerState::On);

            return Ok(SUCCESS);
        }

        if is_power_down {
            validate_entry_point(&entry)?;
        }

        let mut cpu = self.tree.locked_cpu_node(cpu_index);
        let has_pending_interrupt = self.tree.with_ancestors_locked_to_max_level(
            &mut cpu,
            highest_affected_level,
            |cpu, mut ancestors| {
                if interrupt_pending() {
                    return true;
                }

                composite.coordinate_state(cpu_index, &mut ancestors);
                cpu.set_local_state(composite.cpu_level_state());
                Self::flush_coordinated(cpu, &ancestors);

                if is_power_down {
                    disable_dcache();
                    clean_invalidate_dcache_all();
                }

                false
            },
        );
        drop(cpu);

        if has_pending_interrupt {
            return Ok(SUCCESS);
        }

        dsb_sy();
        wfi();

        if is_power_down {
            enable_dcache();
        }

        let mut cpu = self.tree.locked_cpu_node(cpu_index);
        let mut wake_state = CompositePowerState::ON;
        self.tree.with_ancestors_locked_to_max_level(
            &mut cpu,
            highest_affected_level,
            |cpu, mut ancestors| {
                wake_state.coordinate_state(cpu_index, &mut ancestors);
                cpu.set_local_state(wake_state.cpu_level_state());
                Self::flush_coordinated(cpu, &ancestors);
            },
        );

        Ok(SUCCESS)
    }

    /// Handles `CPU_OFF`. On success, the current CPU is powered down and this never returns.
    ///
    /// Denied if this is the last running CPU: there would be nothing left to bring the system
    /// back from `CPU_OFF`.
    fn cpu_off(&self) -> Result<u64, ErrorCode> {
        let cpu_index = platform::current_core_index();

        if self.tree.is_last_cpu(cpu_index) {
            return Err(ErrorCode::Denied);
        }

        let mut cpu = self.tree.locked_cpu_node(cpu_index);
        let mut composite = CompositePowerState::OFF;
        self.tree
            .with_ancestors_locked(&mut cpu, |cpu, mut ancestors| {
                cpu.set_local_state(LocalPowerState::Off);
                composite.coordinate_state(cpu_index, &mut ancestors);
                Self::flush_coordinated(cpu, &ancestors);
            });
        cpu.set_affinity_info(AffinityInfo::Off);
        clean_invalidate_dcache_object(&*cpu);
        drop(cpu);

        disable_dcache();
        clean_invalidate_dcache_all();

        let identity = PlatformImpl::cpu_identities()[cpu_index];
        let bitmap = 1u32 << (4 * identity.cluster_index + identity.local_core_number);
        // SAFETY: this is the last step before the core below enters deep sleep, as required.
        unsafe {
            PlatformImpl::write_cpu_start(identity.die_index, bitmap);
        }

        info!("CPU {cpu_index} powering off");
        power_down();
    }

    /// Handles `CPU_ON`. Only the spintable boot path is implemented: the entry point is written
    /// to the target CPU's node and a `SEV` wakes any core parked in `WFE` on it.
    fn cpu_on(&self, target_cpu: Mpidr, entry: EntryPoint) -> Result<u64, ErrorCode> {
        const SUCCESS: u64 = 0;

        let cpu_index = platform::try_core_index_by_psci_mpidr(target_cpu)
            .ok_or(ErrorCode::InvalidParameters)?;
        validate_entry_point(&entry)?;

        let mut cpu = self.tree.locked_cpu_node(cpu_index);
        if cpu.affinity_info() == AffinityInfo::On {
            return Err(ErrorCode::AlreadyOn);
        }

        cpu.set_entry_point(entry);
        cpu.set_affinity_info(AffinityInfo::On);
        clean_invalidate_dcache_object(&*cpu);
        drop(cpu);

        sev();

        Ok(SUCCESS)
    }

    /// Handles `AFFINITY_INFO`.
    fn affinity_info(
        &self,
        target_affinity: Mpidr,
        lowest_affinity_level: u32,
    ) -> Result<AffinityInfo, ErrorCode> {
        if lowest_affinity_level as usize > CPU_POWER_LEVEL {
            return Err(ErrorCode::InvalidParameters);
        }

        let cpu_index = platform::try_core_index_by_psci_mpidr(target_affinity)
            .ok_or(ErrorCode::InvalidParameters)?;

        Ok(self.tree.locked_cpu_node(cpu_index).affinity_info())
    }

    /// Handles `SYSTEM_OFF`. Never returns.
    fn system_off(&self) -> ! {
        info!("SYSTEM_OFF");
        PlatformImpl::system_off()
    }

    /// Handles `SYSTEM_RESET`. Never returns.
    fn system_reset(&self) -> ! {
        info!("SYSTEM_RESET");
        PlatformImpl::system_reset()
    }

    /// Handles `PSCI_FEATURES`.
    ///
    /// Every in-scope function with a 64-bit SMC form routes to the same handler as its 32-bit
    /// form (see the dispatch table in `dispatch`), so `CAPABILITIES` already doubles as the
    /// 64-bit presence mask and no second lookup is needed.
    fn features(&self, psci_func_id: FunctionId) -> Result<u64, ErrorCode> {
        let number = u32::from(psci_func_id) & 0x1f;
        if PlatformImpl::CAPABILITIES & (1 << number) != 0 {
            Ok(0)
        } else {
            Err(ErrorCode::NotSupported)
        }
    }

    /// Handles `MEM_PROTECT`. Stub: reports memory protection as permanently disabled.
    fn mem_protect(&self, _enabled: bool) -> Result<bool, ErrorCode> {
        Ok(false)
    }

    /// Handles `MEM_PROTECT_CHECK_RANGE`. Stub: every range is reported as unprotected.
    fn mem_protect_check_range(&self, _range: MemProtectRange) -> Result<(), ErrorCode> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::TestPlatform;
    use std::panic::catch_unwind;

    const VERSION32: u64 = 0x8400_0000;
    const CPU_SUSPEND32: u64 = 0x8400_0001;
    const CPU_OFF32: u64 = 0x8400_0002;
    const CPU_ON32: u64 = 0x8400_0003;
    const AFFINITY_INFO32: u64 = 0x8400_0004;
    const SYSTEM_OFF32: u64 = 0x8400_0008;
    const FEATURES32: u64 = 0x8400_000a;

    fn current_mpidr() -> u64 {
        TestPlatform::cpu_identities()[0].mpidr
    }

    fn other_mpidr() -> u64 {
        TestPlatform::cpu_identities()[1].mpidr
    }

    #[test]
    fn version() {
        let psci = Psci::new();
        let result = psci.handle_smc(&[VERSION32, 0, 0, 0]);
        assert_eq!(result.values(), [0x0001_0001]);
    }

    #[test]
    fn unknown_function() {
        let psci = Psci::new();
        let result = psci.handle_smc(&[0x8400_0099, 0, 0, 0]);
        assert_eq!(result.values(), [0xffff_ffff_ffff_ffffu64]);
    }

    #[test]
    fn invalid_power_state() {
        let psci = Psci::new();
        let result = psci.handle_smc(&[CPU_SUSPEND32, 0x0000_000f, 0, 0]);
        assert_eq!(result.values(), [0xffff_ffff_ffff_fffeu64]);
    }

    #[test]
    fn standby_suspend_round_trip() {
        let psci = Psci::new();
        let cpu_index = platform::current_core_index();

        let result = psci.handle_smc(&[CPU_SUSPEND32, 0x1, 0, 0]);

        assert_eq!(result.values(), [0]);
        assert_eq!(
            psci.tree.locked_cpu_node(cpu_index).local_state(),
            LocalPowerState::On
        );
    }

    #[test]
    fn affinity_info_of_running_cpu() {
        let psci = Psci::new();
        let result = psci.handle_smc(&[AFFINITY_INFO32, current_mpidr(), 0, 0]);
        assert_eq!(result.values(), [u32::from(AffinityInfo::On) as u64]);
    }

    #[test]
    fn affinity_info_unknown_mpidr() {
        let psci = Psci::new();
        let result = psci.handle_smc(&[AFFINITY_INFO32, 0xdead, 0, 0]);
        assert_eq!(result.values(), [0xffff_ffff_ffff_fffeu64]);
    }

    #[test]
    fn cpu_on_writes_spintable_entry() {
        let psci = Psci::new();
        let target = other_mpidr();

        let result = psci.handle_smc(&[CPU_ON32, target, 0x2000, 0]);
        assert_eq!(result.values(), [0]);

        let cpu_index = platform::try_core_index_by_mpidr(target).unwrap();
        let mut cpu = psci.tree.locked_cpu_node(cpu_index);
        assert_eq!(cpu.affinity_info(), AffinityInfo::On);
        assert_eq!(
            cpu.pop_entry_point(),
            Some(EntryPoint::Entry64 {
                entry_point_address: 0x2000,
                context_id: 0,
            })
        );
    }

    #[test]
    fn cpu_on_already_on() {
        let psci = Psci::new();
        let current = current_mpidr();

        let result = psci.handle_smc(&[CPU_ON32, current, 0x2000, 0]);
        assert_eq!(result.values(), [0xffff_ffff_ffff_fffcu64]);
    }

    #[test]
    fn cpu_on_rejects_misaligned_entry() {
        let psci = Psci::new();
        let target = other_mpidr();

        let result = psci.handle_smc(&[CPU_ON32, target, 1, 0]);
        assert_eq!(result.values(), [0xffff_ffff_ffff_fff7u64]);
    }

    #[test]
    fn features_reports_supported_and_unsupported() {
        let psci = Psci::new();

        let supported = psci.handle_smc(&[FEATURES32, VERSION32, 0, 0]);
        assert_eq!(supported.values(), [0]);

        let unsupported = psci.handle_smc(&[FEATURES32, 0x8400_000f, 0, 0]);
        assert_eq!(unsupported.values(), [0xffff_ffff_ffff_ffffu64]);
    }

    #[test]
    fn cpu_off_powers_down() {
        let psci = Psci::new();
        let result = catch_unwind(|| psci.handle_smc(&[CPU_OFF32, 0, 0, 0]));
        assert!(result.is_err());
    }

    #[test]
    fn cpu_off_denied_for_last_cpu() {
        let psci = Psci::new();
        let cpu_index = platform::current_core_index();
        for index in 0..TestPlatform::cpu_identities().len() {
            if index != cpu_index {
                psci.tree
                    .locked_cpu_node(index)
                    .set_affinity_info(AffinityInfo::Off);
            }
        }

        let result = psci.handle_smc(&[CPU_OFF32, 0, 0, 0]);
        assert_eq!(result.values(), [0xffff_ffff_ffff_fffdu64]);
    }

    #[test]
    fn system_off_diverges() {
        let psci = Psci::new();
        let result = catch_unwind(|| psci.handle_smc(&[SYSTEM_OFF32, 0, 0, 0]));
        assert!(result.is_err());
    }
}
