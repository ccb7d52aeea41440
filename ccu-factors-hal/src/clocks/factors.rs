//! Factor-based clock generator instances.
//!
//! A [FactorsClock] is created once from a [FactorsInit] record. The layout, the resolution
//! strategy and the register handles are fixed from then on.
//!
//! Changing the rate is a read-modify-write sequence on the control register:
//!
//! 1. Resolve the factors with the configured [Strategy].
//! 2. Read the current control word, so bits outside the layout are preserved.
//! 3. Encode the factors into the word and write it back.
//! 4. Poll the lock status until the generator is stable.
//!
//! The whole sequence runs under the caller provided [RawMutex]. Resolution failures are
//! reported before the register is written. A [LockTimeoutError] means that the new factors were
//! written but the generator did not confirm them.
use arbitrary_int::u5;
use ccu_factors::{
    layout::{FactorValue, FactorsLayout, FracMode, LayoutError, bit_is_set, set_bit},
    regs::{InvalidRegisterError, RegisterAccess, RegisterHandle},
    table::{self, FactorFreq, SearchError},
};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal::delay::DelayNs;

use super::{ClockHw, Hertz};

/// Closed-form factor calculation for a target rate and a parent rate.
pub type GetFactorsFn =
    fn(rate: Hertz, parent_rate: Hertz) -> Result<FactorValue, NoFactorsError>;

/// Output rate for a given parent rate and factors.
pub type CalcRateFn = fn(parent_rate: Hertz, factors: &FactorValue) -> Hertz;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("no factors available for the requested rate")]
pub struct NoFactorsError;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    #[error("table search failed: {0}")]
    Table(#[from] SearchError),
    #[error("factor formula failed: {0}")]
    Formula(#[from] NoFactorsError),
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("generator not locked after {retries} polls")]
pub struct LockTimeoutError {
    pub retries: u32,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ApplyError {
    /// No factors were found. The hardware was not touched.
    #[error("resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    /// The control register was written, but the new rate is unconfirmed.
    #[error("lock timeout: {0}")]
    LockTimeout(#[from] LockTimeoutError),
}

impl ApplyError {
    /// Returns `true` if the control register might hold the new factors.
    pub const fn hardware_changed(&self) -> bool {
        matches!(self, ApplyError::LockTimeout(_))
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("clock name is empty")]
    EmptyName,
    #[error("clock {0} has no parents")]
    NoParents(&'static str),
    #[error("invalid layout: {0}")]
    Layout(#[from] LayoutError),
    #[error("invalid register: {0}")]
    Register(#[from] InvalidRegisterError),
    #[error("frequency table is empty")]
    EmptyTable,
    #[error("table start index {start} out of range for table with {len} entries")]
    TableStartOutOfRange { start: usize, len: usize },
    #[error("lock poll retry count is zero")]
    NoLockRetries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPolicy {
    /// Smallest table frequency which is not below the request, see
    /// [ccu_factors::table::lookup_factors].
    FirstNotBelow,
    /// Table frequency closest to the request, see [ccu_factors::table::search_factors].
    Closest,
}

#[derive(Debug, Clone, Copy)]
pub struct TableStrategy {
    pub table: &'static [FactorFreq],
    /// First table index taken into account.
    pub start: usize,
    /// Window size for [SearchPolicy::Closest]. Clamped to the table length.
    pub count: usize,
    pub policy: SearchPolicy,
    /// Used to calculate the current rate. If this is [None], the current factors are looked
    /// up in the table.
    pub calc_rate: Option<CalcRateFn>,
}

impl TableStrategy {
    pub const fn new(table: &'static [FactorFreq], policy: SearchPolicy) -> Self {
        Self {
            table,
            start: 0,
            count: usize::MAX,
            policy,
            calc_rate: None,
        }
    }

    pub const fn with_window(mut self, start: usize, count: usize) -> Self {
        self.start = start;
        self.count = count;
        self
    }

    pub const fn with_calc_rate(mut self, calc_rate: CalcRateFn) -> Self {
        self.calc_rate = Some(calc_rate);
        self
    }
}

/// How a clock resolves a target rate to factors.
#[derive(Debug, Clone, Copy)]
pub enum Strategy {
    Formula {
        get_factors: GetFactorsFn,
        calc_rate: CalcRateFn,
    },
    Table(TableStrategy),
}

/// Factors for a requested rate together with the rate they produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolved {
    pub factors: FactorValue,
    pub rate: Hertz,
}

impl Strategy {
    /// Resolve the factors for a rate. This is a pure calculation.
    pub fn resolve(
        &self,
        layout: &FactorsLayout,
        rate: Hertz,
        parent_rate: Hertz,
    ) -> Result<Resolved, ResolveError> {
        match self {
            Strategy::Formula {
                get_factors,
                calc_rate,
            } => {
                let factors = get_factors(rate, parent_rate)?;
                Ok(Resolved {
                    factors,
                    rate: calc_rate(parent_rate, &factors),
                })
            }
            Strategy::Table(strategy) => {
                let found = match strategy.policy {
                    SearchPolicy::FirstNotBelow => {
                        table::lookup_factors(layout, strategy.table, strategy.start, rate.raw())?
                    }
                    SearchPolicy::Closest => table::search_factors(
                        layout,
                        strategy.table,
                        strategy.start,
                        strategy.count,
                        rate.raw(),
                    )?,
                };
                Ok(Resolved {
                    factors: found.factors,
                    rate: Hertz::from_raw(found.freq),
                })
            }
        }
    }

    /// Rate produced by a raw control word. Returns 0 Hz if a table clock runs with factors
    /// which are not part of its table.
    pub fn rate_of(&self, layout: &FactorsLayout, raw: u32, parent_rate: Hertz) -> Hertz {
        match self {
            Strategy::Formula { calc_rate, .. } => calc_rate(parent_rate, &layout.decode(raw)),
            Strategy::Table(strategy) => match strategy.calc_rate {
                Some(calc_rate) => calc_rate(parent_rate, &layout.decode(raw)),
                None => table::lookup_freq(layout, strategy.table, raw)
                    .map(|entry| Hertz::from_raw(entry.freq))
                    .unwrap_or(Hertz::from_raw(0)),
            },
        }
    }
}

/// Bounded lock status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPoll {
    pub retries: u32,
    pub interval_us: u32,
}

impl LockPoll {
    pub const DEFAULT: Self = Self {
        retries: 2000,
        interval_us: 20,
    };
}

impl Default for LockPoll {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Separate lock status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub reg: RegisterHandle,
    pub bit: u5,
}

/// Initialization record of a [FactorsClock].
///
/// All offsets are relative to the base address of the clock control unit passed to
/// [FactorsClock::new] or [register].
pub struct FactorsInit<A> {
    pub name: &'static str,
    pub parent_names: &'static [&'static str],
    pub reg_offset: u32,
    /// Offset and bit of a separate lock status register.
    pub lock: Option<(u32, u5)>,
    pub layout: &'static FactorsLayout,
    pub strategy: Strategy,
    pub regs: A,
    pub lock_poll: LockPoll,
}

impl<A: RegisterAccess> FactorsInit<A> {
    pub fn new(
        name: &'static str,
        reg_offset: u32,
        layout: &'static FactorsLayout,
        strategy: Strategy,
        regs: A,
    ) -> Self {
        Self {
            name,
            parent_names: &[],
            reg_offset,
            lock: None,
            layout,
            strategy,
            regs,
            lock_poll: LockPoll::DEFAULT,
        }
    }

    pub fn with_parents(mut self, parent_names: &'static [&'static str]) -> Self {
        self.parent_names = parent_names;
        self
    }

    pub fn with_lock(mut self, offset: u32, bit: u5) -> Self {
        self.lock = Some((offset, bit));
        self
    }

    pub fn with_lock_poll(mut self, lock_poll: LockPoll) -> Self {
        self.lock_poll = lock_poll;
        self
    }
}

pub struct FactorsClock<A: RegisterAccess> {
    name: &'static str,
    parent_names: &'static [&'static str],
    reg: RegisterHandle,
    lock_status: Option<LockStatus>,
    sdm_pattern: Option<RegisterHandle>,
    layout: &'static FactorsLayout,
    strategy: Strategy,
    regs: A,
    lock_poll: LockPoll,
}

impl<A: RegisterAccess> FactorsClock<A> {
    /// Validate the initialization record and create the clock.
    pub fn new(init: FactorsInit<A>, base: RegisterHandle) -> Result<Self, ConfigError> {
        if init.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if init.parent_names.is_empty() {
            return Err(ConfigError::NoParents(init.name));
        }
        init.layout.validate()?;
        if let Strategy::Table(strategy) = &init.strategy {
            if strategy.table.is_empty() {
                return Err(ConfigError::EmptyTable);
            }
            if strategy.start >= strategy.table.len() {
                return Err(ConfigError::TableStartOutOfRange {
                    start: strategy.start,
                    len: strategy.table.len(),
                });
            }
        }
        if init.lock_poll.retries == 0 {
            return Err(ConfigError::NoLockRetries);
        }
        let reg = base.offset(init.reg_offset)?;
        let lock_status = match init.lock {
            Some((offset, bit)) => Some(LockStatus {
                reg: base.offset(offset)?,
                bit,
            }),
            None => None,
        };
        let sdm_pattern = match init.layout.sdm() {
            Some(sdm) => Some(base.offset(sdm.pattern_offset)?),
            None => None,
        };
        Ok(Self {
            name: init.name,
            parent_names: init.parent_names,
            reg,
            lock_status,
            sdm_pattern,
            layout: init.layout,
            strategy: init.strategy,
            regs: init.regs,
            lock_poll: init.lock_poll,
        })
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub const fn parent_names(&self) -> &'static [&'static str] {
        self.parent_names
    }

    #[inline]
    pub const fn reg(&self) -> RegisterHandle {
        self.reg
    }

    #[inline]
    pub const fn lock_status(&self) -> Option<LockStatus> {
        self.lock_status
    }

    #[inline]
    pub const fn layout(&self) -> &'static FactorsLayout {
        self.layout
    }

    #[inline]
    pub const fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    #[inline]
    pub const fn lock_poll(&self) -> LockPoll {
        self.lock_poll
    }

    #[inline]
    pub const fn regs(&self) -> &A {
        &self.regs
    }

    #[inline]
    pub fn read_raw(&self) -> u32 {
        self.regs.read(self.reg)
    }

    /// Decode the factors currently programmed into the control register.
    pub fn current_factors(&self) -> FactorValue {
        self.layout.decode(self.read_raw())
    }

    #[inline]
    pub fn resolve(&self, rate: Hertz, parent_rate: Hertz) -> Result<Resolved, ResolveError> {
        self.strategy.resolve(self.layout, rate, parent_rate)
    }

    /// Rate the clock would run at for the requested rate.
    pub fn round_rate(&self, rate: Hertz, parent_rate: Hertz) -> Result<Hertz, ResolveError> {
        self.resolve(rate, parent_rate).map(|resolved| resolved.rate)
    }

    /// Current output rate derived from the control register.
    ///
    /// Generators in fractional mode run at a fixed frequency which does not depend on the
    /// parent rate.
    pub fn recalc_rate(&self, parent_rate: Hertz) -> Hertz {
        let raw = self.read_raw();
        if self.layout.has_frac() {
            let factors = self.layout.decode(raw);
            if factors.frac_mode == FracMode::Fractional {
                return Hertz::from_raw(factors.frac_freq.freq_hz());
            }
        }
        self.strategy.rate_of(self.layout, raw, parent_rate)
    }

    /// Generators without an enable bit are always enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled_in(self.read_raw())
    }

    fn enabled_in(&self, ctrl: u32) -> bool {
        self.layout
            .enable_bit()
            .map_or(true, |bit| bit_is_set(ctrl, bit))
    }

    /// Returns [None] if the generator has no lock status.
    pub fn is_locked(&self) -> Option<bool> {
        self.lock_source()
            .map(|(reg, bit)| bit_is_set(self.regs.read(reg), bit))
    }

    fn lock_source(&self) -> Option<(RegisterHandle, u32)> {
        match (self.lock_status, self.layout.lock_bit()) {
            (Some(status), _) => Some((status.reg, status.bit.value() as u32)),
            (None, Some(bit)) => Some((self.reg, bit)),
            (None, None) => None,
        }
    }

    /// Resolve the factors for `rate`, program them and wait for the generator to lock.
    ///
    /// The `lock` is held for the whole read-modify-write sequence including the lock polling.
    /// On success, the resolved factors and the achieved rate are returned.
    pub fn compute_and_apply<M: RawMutex, D: DelayNs>(
        &self,
        lock: &M,
        delay: &mut D,
        rate: Hertz,
        parent_rate: Hertz,
    ) -> Result<Resolved, ApplyError> {
        lock.lock(|| self.apply_unlocked(delay, rate, parent_rate))
    }

    fn apply_unlocked<D: DelayNs>(
        &self,
        delay: &mut D,
        rate: Hertz,
        parent_rate: Hertz,
    ) -> Result<Resolved, ApplyError> {
        let resolved = self.resolve(rate, parent_rate)?;
        let current = self.regs.read(self.reg);
        let ctrl = self.layout.encode(&resolved.factors, current);
        log::trace!("{}: ctrl {:#010x} -> {:#010x}", self.name, current, ctrl);
        self.regs.write(self.reg, ctrl);
        log::debug!(
            "{}: requested {} Hz, applied {} Hz with {:?}",
            self.name,
            rate.raw(),
            resolved.rate.raw(),
            resolved.factors
        );
        self.wait_for_lock(ctrl, delay)?;
        Ok(resolved)
    }

    /// Enable the generator and wait for it to lock.
    ///
    /// If the layout has sigma-delta modulation, the default pattern is written to the pattern
    /// register first. Does nothing if the generator is already enabled or has no enable bit.
    pub fn enable<M: RawMutex, D: DelayNs>(
        &self,
        lock: &M,
        delay: &mut D,
    ) -> Result<(), LockTimeoutError> {
        let Some(enable_bit) = self.layout.enable_bit() else {
            return Ok(());
        };
        lock.lock(|| {
            let mut ctrl = self.regs.read(self.reg);
            if bit_is_set(ctrl, enable_bit) {
                return Ok(());
            }
            if let (Some(sdm), Some(pattern_reg)) = (self.layout.sdm(), self.sdm_pattern) {
                self.regs.write(pattern_reg, sdm.pattern_value);
                ctrl = sdm.enable.insert(ctrl, 1);
            }
            ctrl = set_bit(ctrl, enable_bit, 1);
            self.regs.write(self.reg, ctrl);
            log::debug!("{}: enabled", self.name);
            self.wait_for_lock(ctrl, delay)
        })
    }

    /// Disable the generator, including sigma-delta modulation.
    pub fn disable<M: RawMutex>(&self, lock: &M) {
        let Some(enable_bit) = self.layout.enable_bit() else {
            return;
        };
        lock.lock(|| {
            let mut ctrl = self.regs.read(self.reg);
            if let Some(sdm) = self.layout.sdm() {
                ctrl = sdm.enable.insert(ctrl, 0);
            }
            ctrl = set_bit(ctrl, enable_bit, 0);
            self.regs.write(self.reg, ctrl);
            log::debug!("{}: disabled", self.name);
        })
    }

    /// Poll the lock status after writing `ctrl`. A disabled generator never locks, so nothing
    /// is polled in that case.
    fn wait_for_lock<D: DelayNs>(&self, ctrl: u32, delay: &mut D) -> Result<(), LockTimeoutError> {
        let Some((reg, bit)) = self.lock_source() else {
            return Ok(());
        };
        if !self.enabled_in(ctrl) {
            return Ok(());
        }
        for _ in 0..self.lock_poll.retries {
            if bit_is_set(self.regs.read(reg), bit) {
                return Ok(());
            }
            delay.delay_us(self.lock_poll.interval_us);
        }
        log::warn!(
            "{}: not locked after {} polls",
            self.name,
            self.lock_poll.retries
        );
        Err(LockTimeoutError {
            retries: self.lock_poll.retries,
        })
    }
}

/// Registered clock, bound to the externally owned lock.
pub struct ClockHandle<'lock, A: RegisterAccess, M: RawMutex, D> {
    clock: FactorsClock<A>,
    lock: &'lock M,
    delay: D,
}

/// Register a factors clock.
///
/// The record is validated and the clock is bound to the lock which serializes its register
/// accesses. The delay provider is used for lock status polling. Each operation works on a copy
/// of it.
pub fn register<'lock, A: RegisterAccess, M: RawMutex, D: DelayNs + Clone>(
    init: FactorsInit<A>,
    base: RegisterHandle,
    lock: &'lock M,
    delay: D,
) -> Result<ClockHandle<'lock, A, M, D>, ConfigError> {
    let clock = FactorsClock::new(init, base)?;
    log::debug!("registered factors clock {}", clock.name());
    Ok(ClockHandle { clock, lock, delay })
}

impl<A: RegisterAccess, M: RawMutex, D> ClockHandle<'_, A, M, D> {
    #[inline]
    pub const fn clock(&self) -> &FactorsClock<A> {
        &self.clock
    }

    /// Release the clock. The lock is not touched.
    pub fn release(self) -> FactorsClock<A> {
        self.clock
    }

    delegate::delegate! {
        to self.clock {
            #[inline]
            pub fn layout(&self) -> &'static FactorsLayout;

            #[inline]
            pub fn resolve(&self, rate: Hertz, parent_rate: Hertz) -> Result<Resolved, ResolveError>;
        }
    }

    pub fn current_factors(&self) -> FactorValue {
        self.lock.lock(|| self.clock.current_factors())
    }
}

impl<A: RegisterAccess, M: RawMutex, D: DelayNs + Clone> ClockHw for ClockHandle<'_, A, M, D> {
    fn name(&self) -> &'static str {
        self.clock.name()
    }

    fn parent_names(&self) -> &'static [&'static str] {
        self.clock.parent_names()
    }

    fn recalc_rate(&self, parent_rate: Hertz) -> Hertz {
        self.lock.lock(|| self.clock.recalc_rate(parent_rate))
    }

    fn round_rate(&self, rate: Hertz, parent_rate: Hertz) -> Result<Hertz, ResolveError> {
        self.clock.round_rate(rate, parent_rate)
    }

    fn set_rate(&self, rate: Hertz, parent_rate: Hertz) -> Result<Hertz, ApplyError> {
        let mut delay = self.delay.clone();
        self.clock
            .compute_and_apply(self.lock, &mut delay, rate, parent_rate)
            .map(|resolved| resolved.rate)
    }

    fn enable(&self) -> Result<(), LockTimeoutError> {
        let mut delay = self.delay.clone();
        self.clock.enable(self.lock, &mut delay)
    }

    fn disable(&self) {
        self.clock.disable(self.lock)
    }

    fn is_enabled(&self) -> bool {
        self.lock.lock(|| self.clock.is_enabled())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate std;

    use super::*;
    use ccu_factors::{
        layout::FracFreq,
        pll::{
            CCU_BASE_ADDR, PLL_CPUX_CTRL_OFFSET, PLL_CPUX_LAYOUT, PLL_VIDEO_CTRL_OFFSET,
            PLL_VIDEO_LAYOUT, PLL_VIDEO_PAT_DEFAULT, PLL_VIDEO_PAT_OFFSET, PllCpuxControl,
        },
        regs::ShadowRegisters,
    };
    use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use fugit::RateExtU32;

    pub const LOCK_REG_OFFSET: u32 = 0x40;
    pub const LOCK_BIT: u32 = 3;

    pub fn base() -> RegisterHandle {
        RegisterHandle::new(CCU_BASE_ADDR).unwrap()
    }

    /// Register double which simulates a generator which locks a number of polls after each
    /// control register write.
    pub struct SimPll {
        pub shadow: ShadowRegisters<8>,
        ctrl: RegisterHandle,
        lock_reg: RegisterHandle,
        polls_until_lock: u32,
        remaining_polls: AtomicU32,
        ctrl_writes: AtomicU32,
        rmw_in_flight: AtomicBool,
        interleaved: AtomicBool,
    }

    impl SimPll {
        /// Lock status lives in the separate lock register unless the control register is
        /// passed as `lock_reg`.
        pub fn new(ctrl_offset: u32, lock_reg: Option<u32>, polls_until_lock: u32) -> Self {
            let ctrl = base().offset(ctrl_offset).unwrap();
            Self {
                shadow: ShadowRegisters::new(),
                ctrl,
                lock_reg: lock_reg.map_or(ctrl, |offset| base().offset(offset).unwrap()),
                polls_until_lock,
                remaining_polls: AtomicU32::new(0),
                ctrl_writes: AtomicU32::new(0),
                rmw_in_flight: AtomicBool::new(false),
                interleaved: AtomicBool::new(false),
            }
        }

        pub fn ctrl_writes(&self) -> u32 {
            self.ctrl_writes.load(Ordering::SeqCst)
        }

        pub fn ctrl(&self) -> u32 {
            self.shadow.read(self.ctrl)
        }

        pub fn interleaved(&self) -> bool {
            self.interleaved.load(Ordering::SeqCst)
        }

        fn lock_bit(&self) -> u32 {
            if self.lock_reg == self.ctrl {
                28
            } else {
                LOCK_BIT
            }
        }
    }

    impl RegisterAccess for SimPll {
        fn read(&self, reg: RegisterHandle) -> u32 {
            let mut value = self.shadow.read(reg);
            if reg == self.lock_reg {
                let remaining = self.remaining_polls.load(Ordering::SeqCst);
                if remaining == 0 {
                    value |= 1 << self.lock_bit();
                } else {
                    self.remaining_polls.store(remaining - 1, Ordering::SeqCst);
                    value &= !(1 << self.lock_bit());
                }
            }
            if reg == self.ctrl && self.lock_reg != self.ctrl {
                if self.rmw_in_flight.swap(true, Ordering::SeqCst) {
                    self.interleaved.store(true, Ordering::SeqCst);
                }
                std::thread::yield_now();
            }
            value
        }

        fn write(&self, reg: RegisterHandle, value: u32) {
            if reg == self.ctrl {
                self.remaining_polls
                    .store(self.polls_until_lock, Ordering::SeqCst);
                self.ctrl_writes.fetch_add(1, Ordering::SeqCst);
                self.rmw_in_flight.store(false, Ordering::SeqCst);
            }
            // The in-register lock bit is read-only.
            let value = if reg == self.ctrl {
                value & !(1 << 28)
            } else {
                value
            };
            self.shadow.write(reg, value);
        }
    }

    #[derive(Debug, Default, Clone)]
    pub struct CountingDelay {
        pub calls: u32,
        pub total_us: u32,
    }

    impl DelayNs for CountingDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.calls += 1;
            self.total_us += ns / 1000;
        }

        fn delay_us(&mut self, us: u32) {
            self.calls += 1;
            self.total_us += us;
        }
    }

    /// 24 MHz * (N + 1) * (K + 1) / ((M + 1) * 2^P), only N and K are used here.
    pub fn cpux_calc_rate(parent_rate: Hertz, factors: &FactorValue) -> Hertz {
        Hertz::from_raw(
            parent_rate.raw() * (factors.n as u32 + 1) * (factors.k as u32 + 1)
                / ((factors.m as u32 + 1) << factors.p),
        )
    }

    pub fn cpux_get_factors(rate: Hertz, parent_rate: Hertz) -> Result<FactorValue, NoFactorsError> {
        if parent_rate.raw() == 0 {
            return Err(NoFactorsError);
        }
        let mul = rate.raw() / parent_rate.raw();
        let k: u32 = if mul > 32 { 1 } else { 0 };
        let n = mul / (k + 1);
        if n == 0 || n > 32 {
            return Err(NoFactorsError);
        }
        Ok(FactorValue {
            n: (n - 1) as u16,
            k: k as u16,
            ..Default::default()
        })
    }

    pub const CPUX_FORMULA: Strategy = Strategy::Formula {
        get_factors: cpux_get_factors,
        calc_rate: cpux_calc_rate,
    };

    const fn video_entry(n: u16, m: u16, freq: u32) -> FactorFreq {
        FactorFreq::from_factors(
            &PLL_VIDEO_LAYOUT,
            &FactorValue {
                n,
                k: 0,
                m,
                p: 0,
                d1: 0,
                d2: 0,
                frac_mode: FracMode::Integer,
                frac_freq: FracFreq::Mhz270,
            },
            freq,
        )
    }

    pub static VIDEO_TABLE: [FactorFreq; 4] = [
        video_entry(12, 1, 156_000_000),
        video_entry(24, 1, 300_000_000),
        video_entry(49, 1, 600_000_000),
        video_entry(98, 3, 594_000_000),
    ];

    fn cpux_clock(sim: &SimPll) -> FactorsClock<&SimPll> {
        FactorsClock::new(
            FactorsInit::new(
                "pll_cpux",
                PLL_CPUX_CTRL_OFFSET,
                &PLL_CPUX_LAYOUT,
                CPUX_FORMULA,
                sim,
            )
            .with_parents(&["hosc"])
            .with_lock(LOCK_REG_OFFSET, u5::new(LOCK_BIT as u8))
            .with_lock_poll(LockPoll {
                retries: 10,
                interval_us: 20,
            }),
            base(),
        )
        .unwrap()
    }

    #[test]
    fn test_formula_apply() {
        let sim = SimPll::new(PLL_CPUX_CTRL_OFFSET, Some(LOCK_REG_OFFSET), 3);
        // Enabled, with a reserved bit set which must survive.
        sim.shadow
            .preload(base().offset(PLL_CPUX_CTRL_OFFSET).unwrap(), 0x8100_1000)
            .unwrap();
        let clock = cpux_clock(&sim);
        let lock = CriticalSectionRawMutex::new();
        let mut delay = CountingDelay::default();

        let resolved = clock
            .compute_and_apply(&lock, &mut delay, 1008.MHz(), 24.MHz())
            .unwrap();
        assert_eq!(resolved.rate.raw(), 1_008_000_000);
        assert_eq!(resolved.factors.n, 20);
        assert_eq!(resolved.factors.k, 1);
        let reg = PllCpuxControl::new_with_raw_value(sim.ctrl());
        assert!(reg.enable());
        assert_eq!(reg.n().value(), 20);
        assert_eq!(reg.k().value(), 1);
        assert_eq!(sim.ctrl() & (1 << 24), 1 << 24);
        assert_eq!(sim.ctrl_writes(), 1);
        assert_eq!(delay.calls, 3);
        assert_eq!(delay.total_us, 60);
        assert_eq!(clock.recalc_rate(24.MHz()).raw(), 1_008_000_000);
        assert_eq!(clock.is_locked(), Some(true));
    }

    #[test]
    fn test_resolution_failure_leaves_register() {
        let sim = SimPll::new(PLL_CPUX_CTRL_OFFSET, Some(LOCK_REG_OFFSET), 0);
        let ctrl = base().offset(PLL_CPUX_CTRL_OFFSET).unwrap();
        sim.shadow.preload(ctrl, 0x8000_1410).unwrap();
        let clock = cpux_clock(&sim);
        let lock = CriticalSectionRawMutex::new();
        let mut delay = CountingDelay::default();

        let result = clock.compute_and_apply(&lock, &mut delay, 10.MHz(), 24.MHz());
        assert_eq!(
            result,
            Err(ApplyError::Resolve(ResolveError::Formula(NoFactorsError)))
        );
        assert!(!result.unwrap_err().hardware_changed());
        assert_eq!(sim.ctrl(), 0x8000_1410);
        assert_eq!(sim.ctrl_writes(), 0);
        assert_eq!(delay.calls, 0);
    }

    #[test]
    fn test_lock_timeout() {
        let sim = SimPll::new(PLL_CPUX_CTRL_OFFSET, Some(LOCK_REG_OFFSET), u32::MAX);
        sim.shadow
            .preload(base().offset(PLL_CPUX_CTRL_OFFSET).unwrap(), 1 << 31)
            .unwrap();
        let clock = cpux_clock(&sim);
        let lock = CriticalSectionRawMutex::new();
        let mut delay = CountingDelay::default();

        let result = clock.compute_and_apply(&lock, &mut delay, 480.MHz(), 24.MHz());
        let err = result.unwrap_err();
        assert_eq!(err, ApplyError::LockTimeout(LockTimeoutError { retries: 10 }));
        assert!(err.hardware_changed());
        // The new factors were written even though the lock was never confirmed.
        assert_eq!(clock.current_factors().n, 19);
        assert_eq!(delay.calls, 10);
    }

    #[test]
    fn test_disabled_generator_is_not_polled() {
        let sim = SimPll::new(PLL_CPUX_CTRL_OFFSET, Some(LOCK_REG_OFFSET), u32::MAX);
        let clock = cpux_clock(&sim);
        let lock = CriticalSectionRawMutex::new();
        let mut delay = CountingDelay::default();
        assert!(!clock.is_enabled());
        let resolved = clock
            .compute_and_apply(&lock, &mut delay, 480.MHz(), 24.MHz())
            .unwrap();
        assert_eq!(resolved.factors.n, 19);
        assert_eq!(delay.calls, 0);
        assert_eq!(clock.current_factors().n, 19);
    }

    #[test]
    fn test_in_register_lock_bit() {
        let sim = SimPll::new(PLL_CPUX_CTRL_OFFSET, None, 2);
        sim.shadow
            .preload(base().offset(PLL_CPUX_CTRL_OFFSET).unwrap(), 1 << 31)
            .unwrap();
        let clock = FactorsClock::new(
            FactorsInit::new(
                "pll_cpux",
                PLL_CPUX_CTRL_OFFSET,
                &PLL_CPUX_LAYOUT,
                CPUX_FORMULA,
                &sim,
            )
            .with_parents(&["hosc"]),
            base(),
        )
        .unwrap();
        assert!(clock.lock_status().is_none());
        let lock = CriticalSectionRawMutex::new();
        let mut delay = CountingDelay::default();
        clock
            .compute_and_apply(&lock, &mut delay, 288.MHz(), 24.MHz())
            .unwrap();
        assert_eq!(delay.calls, 2);
        assert_eq!(clock.is_locked(), Some(true));
    }

    fn video_clock(sim: &SimPll, strategy: Strategy) -> FactorsClock<&SimPll> {
        FactorsClock::new(
            FactorsInit::new(
                "pll_video",
                PLL_VIDEO_CTRL_OFFSET,
                &PLL_VIDEO_LAYOUT,
                strategy,
                sim,
            )
            .with_parents(&["hosc"]),
            base(),
        )
        .unwrap()
    }

    #[test]
    fn test_table_apply_first_not_below() {
        let sim = SimPll::new(PLL_VIDEO_CTRL_OFFSET, None, 0);
        let clock = video_clock(
            &sim,
            Strategy::Table(TableStrategy::new(
                &VIDEO_TABLE[..3],
                SearchPolicy::FirstNotBelow,
            )),
        );
        let lock = CriticalSectionRawMutex::new();
        let mut delay = CountingDelay::default();

        let resolved = clock
            .compute_and_apply(&lock, &mut delay, 200.MHz(), 24.MHz())
            .unwrap();
        assert_eq!(resolved.rate.raw(), 300_000_000);
        assert_eq!(resolved.factors.n, 24);
        assert_eq!(clock.current_factors().n, 24);
        assert_eq!(clock.current_factors().frac_mode, FracMode::Integer);
        assert_eq!(clock.recalc_rate(24.MHz()).raw(), 300_000_000);

        // Saturates at the last entry.
        assert_eq!(
            clock.round_rate(2000.MHz(), 24.MHz()).unwrap().raw(),
            600_000_000
        );
    }

    /// Patterns which only pack the factor fields.
    static VIDEO_FACTORS_ONLY: [FactorFreq; 2] = [
        FactorFreq::new((24 << 8) | 1, 300_000_000),
        FactorFreq::new((49 << 8) | 1, 600_000_000),
    ];

    #[test]
    fn test_table_apply_keeps_integer_mode() {
        let sim = SimPll::new(PLL_VIDEO_CTRL_OFFSET, None, 0);
        let ctrl = base().offset(PLL_VIDEO_CTRL_OFFSET).unwrap();
        sim.shadow.preload(ctrl, 1 << 24).unwrap();
        for policy in [SearchPolicy::FirstNotBelow, SearchPolicy::Closest] {
            let clock = video_clock(
                &sim,
                Strategy::Table(TableStrategy::new(&VIDEO_FACTORS_ONLY, policy)),
            );
            let lock = CriticalSectionRawMutex::new();
            let mut delay = CountingDelay::default();

            let resolved = clock
                .compute_and_apply(&lock, &mut delay, 300.MHz(), 24.MHz())
                .unwrap();
            assert_eq!(resolved.factors.frac_mode, FracMode::Integer);
            assert_eq!(sim.ctrl(), (1 << 24) | (24 << 8) | 1);
            assert_eq!(clock.current_factors().frac_mode, FracMode::Integer);
            assert_eq!(clock.recalc_rate(24.MHz()).raw(), 300_000_000);
        }
    }

    #[test]
    fn test_table_apply_closest() {
        let sim = SimPll::new(PLL_VIDEO_CTRL_OFFSET, None, 0);
        let clock = video_clock(
            &sim,
            Strategy::Table(TableStrategy::new(&VIDEO_TABLE, SearchPolicy::Closest)),
        );
        let lock = CriticalSectionRawMutex::new();
        let mut delay = CountingDelay::default();

        let resolved = clock
            .compute_and_apply(&lock, &mut delay, 593.MHz(), 24.MHz())
            .unwrap();
        assert_eq!(resolved.rate.raw(), 594_000_000);
        assert_eq!(resolved.factors.n, 98);
        assert_eq!(resolved.factors.m, 3);
        assert_eq!(clock.recalc_rate(24.MHz()).raw(), 594_000_000);
    }

    #[test]
    fn test_empty_table_fails_resolution() {
        for policy in [SearchPolicy::FirstNotBelow, SearchPolicy::Closest] {
            let strategy = Strategy::Table(TableStrategy::new(&[], policy));
            assert_eq!(
                strategy.resolve(&PLL_VIDEO_LAYOUT, 300.MHz(), 24.MHz()),
                Err(ResolveError::Table(SearchError::EmptyTable))
            );
        }
    }

    #[test]
    fn test_table_recalc() {
        let sim = SimPll::new(PLL_VIDEO_CTRL_OFFSET, None, 0);
        let ctrl = base().offset(PLL_VIDEO_CTRL_OFFSET).unwrap();
        let clock = video_clock(
            &sim,
            Strategy::Table(TableStrategy::new(&VIDEO_TABLE, SearchPolicy::Closest)),
        );
        // Factors which are not part of the table.
        sim.shadow.preload(ctrl, (1 << 24) | (5 << 8)).unwrap();
        assert_eq!(clock.recalc_rate(24.MHz()).raw(), 0);

        let with_formula = video_clock(
            &sim,
            Strategy::Table(
                TableStrategy::new(&VIDEO_TABLE, SearchPolicy::Closest)
                    .with_calc_rate(cpux_calc_rate),
            ),
        );
        assert_eq!(with_formula.recalc_rate(24.MHz()).raw(), 144_000_000);

        // Fractional mode runs at a fixed rate.
        sim.shadow.preload(ctrl, 1 << 25).unwrap();
        assert_eq!(clock.recalc_rate(24.MHz()).raw(), 297_000_000);
        sim.shadow.preload(ctrl, 0).unwrap();
        assert_eq!(with_formula.recalc_rate(24.MHz()).raw(), 270_000_000);
    }

    #[test]
    fn test_enable_programs_sdm_pattern() {
        let sim = SimPll::new(PLL_VIDEO_CTRL_OFFSET, None, 1);
        let ctrl = base().offset(PLL_VIDEO_CTRL_OFFSET).unwrap();
        let pattern = base().offset(PLL_VIDEO_PAT_OFFSET).unwrap();
        sim.shadow.preload(ctrl, (1 << 24) | (24 << 8) | 1).unwrap();
        let clock = video_clock(
            &sim,
            Strategy::Table(TableStrategy::new(&VIDEO_TABLE, SearchPolicy::Closest)),
        );
        let lock = CriticalSectionRawMutex::new();
        let mut delay = CountingDelay::default();

        clock.enable(&lock, &mut delay).unwrap();
        assert_eq!(sim.shadow.get(pattern), Some(PLL_VIDEO_PAT_DEFAULT));
        assert_eq!(
            sim.ctrl(),
            (1 << 31) | (1 << 24) | (1 << 20) | (24 << 8) | 1
        );
        assert!(clock.is_enabled());
        assert_eq!(delay.calls, 1);

        // Already enabled, nothing is written.
        clock.enable(&lock, &mut delay).unwrap();
        assert_eq!(sim.ctrl_writes(), 1);

        clock.disable(&lock);
        assert_eq!(sim.ctrl(), (1 << 24) | (24 << 8) | 1);
        assert!(!clock.is_enabled());
    }

    #[test]
    fn test_enable_timeout() {
        let sim = SimPll::new(PLL_CPUX_CTRL_OFFSET, Some(LOCK_REG_OFFSET), u32::MAX);
        let clock = cpux_clock(&sim);
        let lock = CriticalSectionRawMutex::new();
        let mut delay = CountingDelay::default();
        assert_eq!(
            clock.enable(&lock, &mut delay),
            Err(LockTimeoutError { retries: 10 })
        );
        assert!(clock.is_enabled());
    }

    #[test]
    fn test_config_errors() {
        let sim = SimPll::new(PLL_CPUX_CTRL_OFFSET, None, 0);
        let init = || {
            FactorsInit::new(
                "pll_cpux",
                PLL_CPUX_CTRL_OFFSET,
                &PLL_CPUX_LAYOUT,
                CPUX_FORMULA,
                &sim,
            )
            .with_parents(&["hosc"])
        };
        assert!(FactorsClock::new(init(), base()).is_ok());

        let mut no_name = init();
        no_name.name = "";
        assert_eq!(
            FactorsClock::new(no_name, base()).err(),
            Some(ConfigError::EmptyName)
        );
        assert_eq!(
            FactorsClock::new(init().with_parents(&[]), base()).err(),
            Some(ConfigError::NoParents("pll_cpux"))
        );

        static BAD_LAYOUT: FactorsLayout = FactorsLayout::new().with_n(30, 4);
        let mut bad_layout = init();
        bad_layout.layout = &BAD_LAYOUT;
        assert!(matches!(
            FactorsClock::new(bad_layout, base()).err(),
            Some(ConfigError::Layout(_))
        ));

        let mut unaligned = init();
        unaligned.reg_offset = 0x2;
        assert!(matches!(
            FactorsClock::new(unaligned, base()).err(),
            Some(ConfigError::Register(InvalidRegisterError::Unaligned(_)))
        ));

        let mut empty_table = init();
        empty_table.strategy =
            Strategy::Table(TableStrategy::new(&[], SearchPolicy::FirstNotBelow));
        assert_eq!(
            FactorsClock::new(empty_table, base()).err(),
            Some(ConfigError::EmptyTable)
        );

        let mut bad_start = init();
        bad_start.strategy = Strategy::Table(
            TableStrategy::new(&VIDEO_TABLE, SearchPolicy::FirstNotBelow).with_window(4, 1),
        );
        assert_eq!(
            FactorsClock::new(bad_start, base()).err(),
            Some(ConfigError::TableStartOutOfRange { start: 4, len: 4 })
        );

        assert_eq!(
            FactorsClock::new(
                init().with_lock_poll(LockPoll {
                    retries: 0,
                    interval_us: 1
                }),
                base()
            )
            .err(),
            Some(ConfigError::NoLockRetries)
        );
    }

    struct StdRawMutex(std::sync::Mutex<()>);

    unsafe impl RawMutex for StdRawMutex {
        #[allow(clippy::declare_interior_mutable_const)]
        const INIT: Self = StdRawMutex(std::sync::Mutex::new(()));

        fn lock<R>(&self, f: impl FnOnce() -> R) -> R {
            let _guard = self.0.lock().unwrap();
            f()
        }
    }

    #[test]
    fn test_concurrent_apply_is_serialized() {
        let sim = SimPll::new(PLL_CPUX_CTRL_OFFSET, Some(LOCK_REG_OFFSET), 2);
        sim.shadow
            .preload(base().offset(PLL_CPUX_CTRL_OFFSET).unwrap(), 1 << 31)
            .unwrap();
        let clock = cpux_clock(&sim);
        let lock = StdRawMutex::INIT;

        std::thread::scope(|s| {
            let rates: [Hertz; 2] = [480.MHz(), 1008.MHz()];
            for rate in rates {
                let clock = &clock;
                let lock = &lock;
                s.spawn(move || {
                    let mut delay = CountingDelay::default();
                    for _ in 0..200 {
                        clock
                            .compute_and_apply(lock, &mut delay, rate, 24.MHz())
                            .unwrap();
                    }
                });
            }
        });
        assert!(!sim.interleaved());
        assert_eq!(sim.ctrl_writes(), 400);
        let n = clock.current_factors().n;
        assert!(n == 19 || n == 20);
    }
}
