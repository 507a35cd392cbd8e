// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! A PSCI core for a minimal AArch64 type-1 hypervisor targeting Apple-silicon SoCs.
//!
//! The vector table, MMU/stage-2 translation setup and the rest of the hypervisor's world
//! switch are external collaborators; this crate supplies the power-management core that the
//! vector table's synchronous-exception path dispatches a trapped guest SMC into.

#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), no_std)]

mod aarch64;
mod debug;
mod exceptions;
mod logger;
mod platform;
mod services;
mod smccc;

use crate::platform::{Platform, PlatformImpl};
use log::info;

/// Entry point reached once EL2 is set up and the vector table installed, on every core.
///
/// Returns a reference to the global [`services::Services`] instance, which the vector table's
/// synchronous-exception handler uses to dispatch trapped SMCs via
/// [`exceptions::handle_sync_exception`].
#[unsafe(no_mangle)]
extern "C" fn hv_main() -> ! {
    PlatformImpl::init();
    info!(
        "PSCI core starting on core {}",
        platform::current_core_index()
    );

    loop {
        aarch64::wfi();
    }
}
