//! Element descriptors: the bridge between Rust primitive types and the
//! substrate's datatype handles.
//!
//! The classic SHMEM ABI fans every operation out into dozens of per-type
//! entry points; here a single generic body per operation is instantiated
//! over these traits instead.

use num_complex::{Complex32, Complex64};
use num_traits::PrimInt;

use crate::substrate::{Datatype, Kind};

/// A primitive that can live in symmetric memory and travel through the
/// substrate.
pub trait Element: Copy + Send + 'static {
    const KIND: Kind;

    /// Substrate datatype for one element.
    fn datatype() -> Datatype {
        Datatype::new(Self::KIND)
    }
}

macro_rules! impl_element {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(impl Element for $ty {
            const KIND: Kind = $kind;
        })*
    };
}

impl_element! {
    i8  => Kind::Int8,
    i16 => Kind::Int16,
    i32 => Kind::Int32,
    i64 => Kind::Int64,
    u8  => Kind::Uint8,
    u16 => Kind::Uint16,
    u32 => Kind::Uint32,
    u64 => Kind::Uint64,
    f32 => Kind::Float,
    f64 => Kind::Double,
    Complex32 => Kind::Complex32,
    Complex64 => Kind::Complex64,
}

/// Elements accepted by the value-moving atomics (`swap`, `fetch`, `set`).
///
/// `FAST_ATOMIC` marks the types the intra-node fast path may touch with a
/// processor atomic; floating-point swap stays on the substrate because
/// processor atomics for floats are not portably defined.
pub trait AtomicValue: Element + PartialEq {
    const FAST_ATOMIC: bool;

    fn to_bits64(self) -> u64;
    fn from_bits64(bits: u64) -> Self;
}

macro_rules! impl_atomic_value {
    ($($ty:ty => $fast:expr),* $(,)?) => {
        $(impl AtomicValue for $ty {
            const FAST_ATOMIC: bool = $fast;

            fn to_bits64(self) -> u64 {
                let mut bits = [0u8; 8];
                let raw = self.to_ne_bytes();
                bits[..raw.len()].copy_from_slice(&raw);
                u64::from_ne_bytes(bits)
            }

            fn from_bits64(bits: u64) -> Self {
                let raw = bits.to_ne_bytes();
                Self::from_ne_bytes(raw[..core::mem::size_of::<Self>()].try_into().unwrap())
            }
        })*
    };
}

impl_atomic_value! {
    i32 => true,
    i64 => true,
    u32 => true,
    u64 => true,
    f32 => false,
    f64 => false,
}

/// Integer elements with the full atomic set (`cswap`, `add`, `fadd`,
/// `inc`, `finc`).
pub trait AtomicInt: AtomicValue + PrimInt {}

impl AtomicInt for i32 {}
impl AtomicInt for i64 {}
impl AtomicInt for u32 {}
impl AtomicInt for u64 {}

/// Elements a PE can spin on with `wait`/`wait_until`.
pub trait WaitElement: Element + PartialOrd {}

impl WaitElement for i16 {}
impl WaitElement for i32 {}
impl WaitElement for i64 {}
impl WaitElement for u16 {}
impl WaitElement for u32 {}
impl WaitElement for u64 {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_sizes() {
        assert_eq!(<i16 as Element>::KIND.size(), 2);
        assert_eq!(<f64 as Element>::KIND.size(), 8);
        assert_eq!(<Complex64 as Element>::KIND.size(), 16);
    }

    #[test]
    fn bits_roundtrip() {
        assert_eq!(i64::from_bits64((-5i64).to_bits64()), -5);
        assert_eq!(u32::from_bits64(7u32.to_bits64()), 7);
        assert_eq!(f64::from_bits64(2.5f64.to_bits64()), 2.5);
        assert_eq!(f32::from_bits64((-1.25f32).to_bits64()), -1.25);
    }

    #[test]
    fn float_swap_avoids_the_fast_path() {
        assert!(<i64 as AtomicValue>::FAST_ATOMIC);
        assert!(!<f32 as AtomicValue>::FAST_ATOMIC);
        assert!(!<f64 as AtomicValue>::FAST_ATOMIC);
    }
}
