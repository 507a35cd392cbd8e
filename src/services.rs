// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The single SMC dispatch point: this crate implements exactly one service, PSCI.

pub mod psci;

use crate::smccc::SmcReturn;
use psci::Psci;
use spin::Lazy;

static SERVICES: Lazy<Services> = Lazy::new(Services::new);

/// Owns the PSCI core and is the sole entry point for SMC calls trapped to EL2.
pub struct Services {
    pub psci: Psci,
}

impl Services {
    /// Returns a reference to the global `Services` instance, initializing it on first access.
    pub fn get() -> &'static Self {
        &SERVICES
    }

    fn new() -> Self {
        Self { psci: Psci::new() }
    }

    /// Decodes and dispatches an SMC call trapped from the guest, returning the value(s) to
    /// write back into its `x0`-`x3`.
    pub fn handle_smc(&self, regs: &[u64; 4]) -> SmcReturn {
        self.psci.handle_smc(regs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm_psci::{FunctionId, Version};

    /// Tests the PSCI_VERSION call as a simple example of SMC dispatch through `Services`.
    ///
    /// The point of this isn't to test every individual SMC call, just that the common
    /// dispatch path works; individual calls are tested within the `psci` module.
    #[test]
    fn handle_smc_version() {
        let services = Services::new();
        let regs = [u32::from(FunctionId::PsciVersion) as u64, 0, 0, 0];

        let result = services.handle_smc(&regs);

        assert_eq!(
            result.values(),
            [u32::from(Version { major: 1, minor: 1 }) as u64]
        );
    }
}
