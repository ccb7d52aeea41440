//! # Register layer for factor-based clock generators
//!
//! PLL-style frequency synthesizers of an SoC clock control unit derive their output rate from a
//! small set of integer factors (N, K, M, P, D1, D2 and optional fractional mode bits). These
//! factors are packed into fixed bit ranges of a control register, and the bit ranges differ
//! between generator families.
//!
//! This crate contains the generic, hardware independent part:
//!
//! - [layout]: the bit-field layout descriptor and the codec between raw register words and
//!   structured [layout::FactorValue]s.
//! - [regs]: validated register handles and the register access indirection.
//! - [table]: frequency/factor tables and the search algorithms resolving a target frequency.
//! - [pll]: register definitions of reference PLLs.
//!
//! The clock instance which binds all of these together lives in the `ccu-factors-hal` crate.
#![no_std]

pub mod layout;
pub mod pll;
pub mod regs;
pub mod table;

pub use layout::{FactorField, FactorValue, FactorsLayout, FracFreq, FracMode};
pub use regs::{DirectIo, RegisterAccess, RegisterHandle, ShadowRegisters};
pub use table::{FactorFreq, SearchError, TableMatch};
