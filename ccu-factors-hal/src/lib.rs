//! # Factor-based clock generators
//!
//! This crate binds the register layer of the `ccu-factors` crate into addressable clock
//! instances. A [clocks::factors::FactorsClock] combines
//!
//! - a shared [ccu_factors::FactorsLayout] describing the control register,
//! - a [ccu_factors::RegisterAccess] implementation, either direct MMIO or an override,
//! - a resolution [clocks::factors::Strategy], which is either a closed-form formula or a
//!   frequency/factor table,
//!
//! and exposes the operations a clock-tree framework needs through [clocks::ClockHw].
//!
//! The mutual exclusion primitive which serializes register read-modify-write sequences is owned
//! by the caller. It is passed by reference into every operation touching the hardware, or into
//! [clocks::factors::register] which binds it to the returned handle.
#![no_std]

pub use ccu_factors;

pub mod clocks;
pub mod delay;
