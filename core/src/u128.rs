// ============================================================================
// BPF-Safe 128-bit Storage Type
// ============================================================================
//
// CRITICAL: Rust 1.77/1.78 changed u128 alignment from 8 to 16 bytes on
// x86_64, but BPF/SBF still uses 8-byte alignment. Structs holding raw u128
// fields therefore lay out differently on-chain and off-chain, which corrupts
// zero-copy slab reads.
//
// U128 wraps [u64; 2] (little-endian: [lo, hi]) so every stored 128-bit value
// has 8-byte alignment on all targets. Arithmetic unwraps to native u128,
// which is fine: only the *storage* layout must match across targets.
// See: https://blog.rust-lang.org/2024/03/30/i128-layout-update.html

/// BPF-safe unsigned 128-bit integer using [u64; 2] for consistent alignment.
/// Layout: [lo, hi] in little-endian order.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct U128 {
    parts: [u64; 2],
}

impl U128 {
    pub const ZERO: Self = Self { parts: [0, 0] };
    pub const MAX: Self = Self {
        parts: [u64::MAX, u64::MAX],
    };

    #[inline(always)]
    pub const fn new(val: u128) -> Self {
        Self {
            parts: [val as u64, (val >> 64) as u64],
        }
    }

    #[inline(always)]
    pub const fn get(self) -> u128 {
        (self.parts[0] as u128) | ((self.parts[1] as u128) << 64)
    }

    #[inline(always)]
    pub fn set(&mut self, val: u128) {
        self.parts = [val as u64, (val >> 64) as u64];
    }

    #[inline(always)]
    pub fn checked_add(self, rhs: u128) -> Option<Self> {
        self.get().checked_add(rhs).map(Self::new)
    }

    #[inline(always)]
    pub fn checked_sub(self, rhs: u128) -> Option<Self> {
        self.get().checked_sub(rhs).map(Self::new)
    }

    #[inline(always)]
    pub fn checked_mul(self, rhs: u128) -> Option<Self> {
        self.get().checked_mul(rhs).map(Self::new)
    }

    #[inline(always)]
    pub fn saturating_add(self, rhs: u128) -> Self {
        Self::new(self.get().saturating_add(rhs))
    }

    #[inline(always)]
    pub fn saturating_sub(self, rhs: u128) -> Self {
        Self::new(self.get().saturating_sub(rhs))
    }

    #[inline(always)]
    pub fn is_zero(self) -> bool {
        self.parts[0] == 0 && self.parts[1] == 0
    }
}

impl core::fmt::Debug for U128 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "U128({})", self.get())
    }
}

impl core::fmt::Display for U128 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.get())
    }
}

impl From<u128> for U128 {
    fn from(val: u128) -> Self {
        Self::new(val)
    }
}

impl From<u64> for U128 {
    fn from(val: u64) -> Self {
        Self::new(val as u128)
    }
}

impl From<U128> for u128 {
    fn from(val: U128) -> Self {
        val.get()
    }
}

impl PartialOrd for U128 {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U128 {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.get().cmp(&other.get())
    }
}
