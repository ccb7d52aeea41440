//! Reference PLL control registers of an Allwinner H3 style clock control unit.
//!
//! The bitfield definitions document the register map of two representative generators. The
//! layout constants describe the same registers for the generic codec.
use arbitrary_int::{u2, u4, u5, u7};

use crate::layout::FactorsLayout;

pub const CCU_BASE_ADDR: usize = 0x01C2_0000;

pub const PLL_CPUX_CTRL_OFFSET: u32 = 0x000;
pub const PLL_VIDEO_CTRL_OFFSET: u32 = 0x010;
pub const PLL_VIDEO_PAT_OFFSET: u32 = 0x288;

/// Default SDM pattern for the video PLL.
pub const PLL_VIDEO_PAT_DEFAULT: u32 = 0xD130_3333;

/// Output = 24 MHz * (N + 1) * (K + 1) / ((M + 1) * 2^P)
pub const PLL_CPUX_LAYOUT: FactorsLayout = FactorsLayout::new()
    .with_n(8, 5)
    .with_k(4, 2)
    .with_m(0, 2)
    .with_p(16, 2)
    .with_enable_bit(31)
    .with_lock_bit(28);

/// Integer mode output = 24 MHz * (N + 1) / (M + 1). Fractional mode output is 270 or 297 MHz.
pub const PLL_VIDEO_LAYOUT: FactorsLayout = FactorsLayout::new()
    .with_n(8, 7)
    .with_m(0, 4)
    .with_frac(24, 25)
    .with_enable_bit(31)
    .with_lock_bit(28)
    .with_sdm(20, 1, PLL_VIDEO_PAT_OFFSET, PLL_VIDEO_PAT_DEFAULT);

#[bitbybit::bitfield(u32)]
#[derive(Debug)]
pub struct PllCpuxControl {
    #[bit(31, rw)]
    enable: bool,
    /// Set by hardware once the PLL is stable.
    #[bit(28, r)]
    lock: bool,
    /// Output external divider, divides by 2^P. Only used for rates below 288 MHz.
    #[bits(16..=17, rw)]
    p: u2,
    #[bits(8..=12, rw)]
    n: u5,
    #[bits(4..=5, rw)]
    k: u2,
    #[bits(0..=1, rw)]
    m: u2,
}

#[bitbybit::bitenum(u1, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum PllMode {
    Fractional = 0,
    Integer = 1,
}

#[bitbybit::bitenum(u1, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum FracClockOut {
    Mhz270 = 0,
    Mhz297 = 1,
}

#[bitbybit::bitfield(u32)]
#[derive(Debug)]
pub struct PllVideoControl {
    #[bit(31, rw)]
    enable: bool,
    #[bit(28, r)]
    lock: bool,
    #[bit(25, rw)]
    frac_clk_out: FracClockOut,
    #[bit(24, rw)]
    mode: PllMode,
    #[bit(20, rw)]
    sdm_enable: bool,
    #[bits(8..=14, rw)]
    n: u7,
    /// Pre-divider M.
    #[bits(0..=3, rw)]
    m: u4,
}
