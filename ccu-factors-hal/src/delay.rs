//! Busy-wait delay provider.
use embedded_hal::delay::DelayNs;

use crate::clocks::Hertz;

/// Spin loop delay calibrated to the CPU clock.
///
/// Every loop iteration takes at least one CPU cycle, so the delays are lower bounds. This is
/// good enough for polling the lock status of a generator, where only the upper bound of the
/// whole wait matters.
#[derive(Debug, Clone, Copy)]
pub struct BusyWait {
    cycles_per_us: u32,
}

impl BusyWait {
    pub const fn new(cpu_clk: Hertz) -> Self {
        Self {
            cycles_per_us: cpu_clk.raw().div_ceil(1_000_000),
        }
    }

    #[inline]
    pub const fn cycles_per_us(&self) -> u32 {
        self.cycles_per_us
    }
}

impl DelayNs for BusyWait {
    fn delay_ns(&mut self, ns: u32) {
        let cycles = (ns as u64 * self.cycles_per_us as u64).div_ceil(1000);
        for _ in 0..cycles {
            core::hint::spin_loop();
        }
    }
}
