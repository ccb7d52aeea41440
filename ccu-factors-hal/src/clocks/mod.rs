//! Clock module.
pub mod factors;
pub mod registry;

pub use factors::{
    ApplyError, ClockHandle, ConfigError, FactorsClock, FactorsInit, LockPoll, LockTimeoutError,
    NoFactorsError, ResolveError, Resolved, SearchPolicy, Strategy, TableStrategy, register,
};
pub use registry::{ClockRegistry, RegistryError};

/// Hertz
pub type Hertz = fugit::HertzU32;
pub type Hz = Hertz;

/// KiloHertz
pub type KiloHertz = fugit::KilohertzU32;

/// MegaHertz
pub type MegaHertz = fugit::MegahertzU32;
pub type MHz = MegaHertz;

/// Operations a clock-tree framework needs from a clock.
///
/// Parent handling, reference counting and the decision when to change a rate stay with the
/// framework.
pub trait ClockHw {
    fn name(&self) -> &'static str;

    fn parent_names(&self) -> &'static [&'static str];

    /// Current output rate, derived from the hardware state.
    fn recalc_rate(&self, parent_rate: Hertz) -> Hertz;

    /// Rate the clock would run at for the requested rate. Does not touch the hardware.
    fn round_rate(&self, rate: Hertz, parent_rate: Hertz) -> Result<Hertz, ResolveError>;

    /// Program the clock for the requested rate and return the achieved rate.
    fn set_rate(&self, rate: Hertz, parent_rate: Hertz) -> Result<Hertz, ApplyError>;

    fn enable(&self) -> Result<(), LockTimeoutError>;

    fn disable(&self);

    fn is_enabled(&self) -> bool;
}
