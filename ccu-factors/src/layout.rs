//! Bit-field layout descriptor and factor value codec.
//!
//! A [FactorsLayout] describes where each factor field of one generator family lives inside its
//! 32-bit control register. The layout is plain data and can be built in a `const` context, so a
//! single descriptor is usually declared once per hardware family and shared by every clock of
//! that family:
//!
//! ```
//! use ccu_factors::layout::{FactorValue, FactorsLayout};
//!
//! const PLL_VIDEO: FactorsLayout = FactorsLayout::new()
//!     .with_n(8, 7)
//!     .with_m(0, 4)
//!     .with_frac(24, 25)
//!     .with_enable_bit(31)
//!     .with_lock_bit(28);
//!
//! let value = FactorValue { n: 98, m: 7, ..Default::default() };
//! let raw = PLL_VIDEO.encode(&value, 0);
//! assert_eq!(PLL_VIDEO.decode(raw), value);
//! ```
//!
//! Encoding never fails. Values wider than the configured field are masked to the field width,
//! which matches what the hardware would latch.
use arbitrary_int::{u5, u6};

/// Output frequency of a fractional-mode generator with the out bit cleared.
pub const FRAC_FREQ_0_HZ: u32 = 270_000_000;
/// Output frequency of a fractional-mode generator with the out bit set.
pub const FRAC_FREQ_1_HZ: u32 = 297_000_000;

/// Integer or fractional synthesis.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, num_enum::FromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u8)]
pub enum FracMode {
    #[default]
    Integer = 0,
    Fractional = 1,
}

/// Fixed output frequency used in fractional mode.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, num_enum::FromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u8)]
pub enum FracFreq {
    #[default]
    Mhz270 = 0,
    Mhz297 = 1,
}

impl FracFreq {
    pub const fn freq_hz(&self) -> u32 {
        match self {
            FracFreq::Mhz270 => FRAC_FREQ_0_HZ,
            FracFreq::Mhz297 => FRAC_FREQ_1_HZ,
        }
    }
}

/// Names the integer factor fields of a [FactorValue].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FactorField {
    N,
    K,
    M,
    P,
    D1,
    D2,
}

impl FactorField {
    pub const ALL: [FactorField; 6] = [
        FactorField::N,
        FactorField::K,
        FactorField::M,
        FactorField::P,
        FactorField::D1,
        FactorField::D2,
    ];
}

/// Structured set of factors for one generator.
///
/// The fields are raw register values. Whether a field value of 0 means "divide by one" or
/// something else is up to the formula of the respective hardware family.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FactorValue {
    pub n: u16,
    pub k: u16,
    pub m: u16,
    pub p: u16,
    pub d1: u16,
    pub d2: u16,
    pub frac_mode: FracMode,
    pub frac_freq: FracFreq,
}

impl FactorValue {
    #[inline]
    pub const fn get(&self, field: FactorField) -> u16 {
        match field {
            FactorField::N => self.n,
            FactorField::K => self.k,
            FactorField::M => self.m,
            FactorField::P => self.p,
            FactorField::D1 => self.d1,
            FactorField::D2 => self.d2,
        }
    }

    #[inline]
    pub fn set(&mut self, field: FactorField, value: u16) {
        match field {
            FactorField::N => self.n = value,
            FactorField::K => self.k = value,
            FactorField::M => self.m = value,
            FactorField::P => self.p = value,
            FactorField::D1 => self.d1 = value,
            FactorField::D2 => self.d2 = value,
        }
    }
}

/// Position of one field inside a 32-bit register. A width of zero marks an absent field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BitField {
    shift: u5,
    width: u6,
}

impl BitField {
    pub const ABSENT: Self = Self {
        shift: u5::new(0),
        width: u6::new(0),
    };

    /// # Panics
    ///
    /// Panics if the shift is larger than 31 or the width is larger than 63. Inside a `const`
    /// item, this is a compile-time error.
    pub const fn new(shift: u8, width: u8) -> Self {
        Self {
            shift: u5::new(shift),
            width: u6::new(width),
        }
    }

    #[inline]
    pub const fn shift(&self) -> u32 {
        self.shift.value() as u32
    }

    #[inline]
    pub const fn width(&self) -> u32 {
        self.width.value() as u32
    }

    #[inline]
    pub const fn is_present(&self) -> bool {
        self.width() != 0
    }

    /// Field mask, not shifted.
    #[inline]
    pub const fn mask(&self) -> u32 {
        let width = self.width();
        if width == 0 {
            0
        } else if width >= 32 {
            u32::MAX
        } else {
            (1 << width) - 1
        }
    }

    /// Field mask at its register position.
    #[inline]
    pub const fn reg_mask(&self) -> u32 {
        self.mask() << self.shift()
    }

    /// Returns `true` if the field lies completely inside a 32-bit register.
    #[inline]
    pub const fn fits_u32(&self) -> bool {
        self.shift() + self.width() <= 32
    }

    #[inline]
    pub const fn extract(&self, word: u32) -> u32 {
        (word >> self.shift()) & self.mask()
    }

    /// Replace the field inside `word`. The value is truncated to the field width. Absent fields
    /// leave the word untouched.
    #[inline]
    pub const fn insert(&self, word: u32, value: u32) -> u32 {
        if !self.is_present() {
            return word;
        }
        (word & !self.reg_mask()) | ((value & self.mask()) << self.shift())
    }
}

/// Mode and output select bits of a generator with fractional capability.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FracSelect {
    /// Set: integer mode. Cleared: fractional mode.
    pub mode_bit: u5,
    /// Selects [FracFreq] in fractional mode.
    pub out_bit: u5,
}

/// Sigma-delta modulation settings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SdmConfig {
    /// SDM enable field inside the control register.
    pub enable: BitField,
    /// Offset of the pattern register from the clock unit base address.
    pub pattern_offset: u32,
    /// Default pattern written before the generator is enabled.
    pub pattern_value: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LayoutField {
    Factor(FactorField),
    SdmEnable,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    #[error("bit field {0:?} does not fit into a 32-bit register")]
    FieldOutOfRange(LayoutField),
    #[error("factor field {0:?} is wider than 16 bits")]
    FactorTooWide(FactorField),
}

/// Per-family map from factor name to its bit position inside the control register.
///
/// Field bit ranges of one layout must not overlap. This is not checked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FactorsLayout {
    n: BitField,
    k: BitField,
    m: BitField,
    p: BitField,
    d1: BitField,
    d2: BitField,
    frac: Option<FracSelect>,
    enable_bit: Option<u5>,
    lock_bit: Option<u5>,
    sdm: Option<SdmConfig>,
}

impl Default for FactorsLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl FactorsLayout {
    /// Layout without any fields.
    pub const fn new() -> Self {
        Self {
            n: BitField::ABSENT,
            k: BitField::ABSENT,
            m: BitField::ABSENT,
            p: BitField::ABSENT,
            d1: BitField::ABSENT,
            d2: BitField::ABSENT,
            frac: None,
            enable_bit: None,
            lock_bit: None,
            sdm: None,
        }
    }

    pub const fn with_n(mut self, shift: u8, width: u8) -> Self {
        self.n = BitField::new(shift, width);
        self
    }

    pub const fn with_k(mut self, shift: u8, width: u8) -> Self {
        self.k = BitField::new(shift, width);
        self
    }

    pub const fn with_m(mut self, shift: u8, width: u8) -> Self {
        self.m = BitField::new(shift, width);
        self
    }

    pub const fn with_p(mut self, shift: u8, width: u8) -> Self {
        self.p = BitField::new(shift, width);
        self
    }

    pub const fn with_d1(mut self, shift: u8, width: u8) -> Self {
        self.d1 = BitField::new(shift, width);
        self
    }

    pub const fn with_d2(mut self, shift: u8, width: u8) -> Self {
        self.d2 = BitField::new(shift, width);
        self
    }

    /// Enable fractional capability with the given mode select and output select bits.
    pub const fn with_frac(mut self, mode_bit: u8, out_bit: u8) -> Self {
        self.frac = Some(FracSelect {
            mode_bit: u5::new(mode_bit),
            out_bit: u5::new(out_bit),
        });
        self
    }

    pub const fn with_enable_bit(mut self, bit: u8) -> Self {
        self.enable_bit = Some(u5::new(bit));
        self
    }

    /// Lock status bit inside the control register itself.
    pub const fn with_lock_bit(mut self, bit: u8) -> Self {
        self.lock_bit = Some(u5::new(bit));
        self
    }

    pub const fn with_sdm(
        mut self,
        shift: u8,
        width: u8,
        pattern_offset: u32,
        pattern_value: u32,
    ) -> Self {
        self.sdm = Some(SdmConfig {
            enable: BitField::new(shift, width),
            pattern_offset,
            pattern_value,
        });
        self
    }

    #[inline]
    pub const fn field(&self, field: FactorField) -> BitField {
        match field {
            FactorField::N => self.n,
            FactorField::K => self.k,
            FactorField::M => self.m,
            FactorField::P => self.p,
            FactorField::D1 => self.d1,
            FactorField::D2 => self.d2,
        }
    }

    #[inline]
    pub const fn frac(&self) -> Option<FracSelect> {
        self.frac
    }

    #[inline]
    pub const fn has_frac(&self) -> bool {
        self.frac.is_some()
    }

    #[inline]
    pub const fn enable_bit(&self) -> Option<u32> {
        match self.enable_bit {
            Some(bit) => Some(bit.value() as u32),
            None => None,
        }
    }

    #[inline]
    pub const fn lock_bit(&self) -> Option<u32> {
        match self.lock_bit {
            Some(bit) => Some(bit.value() as u32),
            None => None,
        }
    }

    #[inline]
    pub const fn sdm(&self) -> Option<SdmConfig> {
        self.sdm
    }

    /// Union of the bit ranges of all factor fields.
    pub const fn factor_mask(&self) -> u32 {
        self.n.reg_mask()
            | self.k.reg_mask()
            | self.m.reg_mask()
            | self.p.reg_mask()
            | self.d1.reg_mask()
            | self.d2.reg_mask()
    }

    /// Check that every field fits the register and every factor fits a [FactorValue] field.
    pub fn validate(&self) -> Result<(), LayoutError> {
        for field in FactorField::ALL {
            let bits = self.field(field);
            if !bits.fits_u32() {
                return Err(LayoutError::FieldOutOfRange(LayoutField::Factor(field)));
            }
            if bits.width() > 16 {
                return Err(LayoutError::FactorTooWide(field));
            }
        }
        if let Some(sdm) = self.sdm {
            if !sdm.enable.fits_u32() {
                return Err(LayoutError::FieldOutOfRange(LayoutField::SdmEnable));
            }
        }
        Ok(())
    }

    /// Decode a raw control register word. Absent fields decode to 0.
    pub fn decode(&self, raw: u32) -> FactorValue {
        let mut value = self.decode_factors(raw);
        if let Some(frac) = self.frac {
            value.frac_mode = if (raw >> frac.mode_bit.value()) & 0b1 == 1 {
                FracMode::Integer
            } else {
                FracMode::Fractional
            };
            value.frac_freq = FracFreq::from(((raw >> frac.out_bit.value()) & 0b1) as u8);
        }
        value
    }

    /// Decode only the six integer factor fields.
    ///
    /// The fractional selection stays at integer mode. Pre-encoded table patterns only carry the
    /// factor fields, so their mode bit must not be interpreted.
    pub fn decode_factors(&self, raw: u32) -> FactorValue {
        let mut value = FactorValue::default();
        for field in FactorField::ALL {
            value.set(field, self.field(field).extract(raw) as u16);
        }
        value
    }

    /// Encode a factor value into `base`. Bits not covered by the layout are preserved.
    pub const fn encode(&self, value: &FactorValue, base: u32) -> u32 {
        let mut raw = base;
        raw = self.n.insert(raw, value.n as u32);
        raw = self.k.insert(raw, value.k as u32);
        raw = self.m.insert(raw, value.m as u32);
        raw = self.p.insert(raw, value.p as u32);
        raw = self.d1.insert(raw, value.d1 as u32);
        raw = self.d2.insert(raw, value.d2 as u32);
        if let Some(frac) = self.frac {
            let mode = match value.frac_mode {
                FracMode::Integer => 1,
                FracMode::Fractional => 0,
            };
            raw = set_bit(raw, frac.mode_bit.value() as u32, mode);
            raw = set_bit(raw, frac.out_bit.value() as u32, value.frac_freq as u32);
        }
        raw
    }
}

#[inline]
pub const fn set_bit(word: u32, bit: u32, value: u32) -> u32 {
    (word & !(1 << bit)) | ((value & 0b1) << bit)
}

#[inline]
pub const fn bit_is_set(word: u32, bit: u32) -> bool {
    (word >> bit) & 0b1 == 1
}
