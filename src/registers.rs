//! Register Bank
//!
//! A fixed block of holding registers mapped at logical addresses
//! `40001..=40000 + N`.
//!
//! The bank is shared between the protocol engine and whatever refreshes
//! sensor values, so every register is an atomic. Only `load` and `store`
//! are used, which keeps the bank usable on targets without CAS atomics.
//! A single register can never tear, but a multi register write from the
//! bus can interleave with a refresh.

use core::sync::atomic::{AtomicU16, Ordering};

use crate::{RegisterStore, DEVICE_REGISTERS, REGISTER_BASE};

/// Storage for exactly N holding registers
pub struct RegisterBank<const N: usize = DEVICE_REGISTERS> {
    regs: [AtomicU16; N],
}

impl<const N: usize> RegisterBank<N> {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU16 = AtomicU16::new(0);

    /// Create a new bank with every register at zero
    ///
    /// Intended for static usage.
    pub const fn new() -> Self {
        Self {
            regs: [Self::ZERO; N],
        }
    }

    /// Create a new bank seeded with `values`
    pub fn with_values(values: [u16; N]) -> Self {
        let bank = Self::new();
        bank.regs
            .iter()
            .zip(values.iter())
            .for_each(|(r, v)| r.store(*v, Ordering::Relaxed));
        bank
    }

    /// Map a logical address to a register index
    pub fn index_of(logical_address: u32) -> Option<usize> {
        let idx = logical_address.checked_sub(REGISTER_BASE)? as usize;
        (idx < N).then_some(idx)
    }

    /// Read a register by index
    #[inline]
    pub fn get(&self, index: usize) -> Option<u16> {
        self.regs.get(index).map(|r| r.load(Ordering::Acquire))
    }

    /// Update a register by index, returning false if out of range
    ///
    /// This is the entry point for sensor refresh.
    #[inline]
    pub fn set(&self, index: usize, value: u16) -> bool {
        match self.regs.get(index) {
            Some(r) => {
                r.store(value, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Copy out every register
    pub fn snapshot(&self) -> [u16; N] {
        let mut out = [0u16; N];
        out.iter_mut()
            .zip(self.regs.iter())
            .for_each(|(o, r)| *o = r.load(Ordering::Acquire));
        out
    }

    /// The number of registers in the bank
    #[inline]
    pub const fn len(&self) -> usize {
        N
    }

    /// Is the bank empty?
    #[inline]
    pub const fn is_empty(&self) -> bool {
        N == 0
    }
}

impl<const N: usize> Default for RegisterBank<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RegisterStore for RegisterBank<N> {
    /// Out of range addresses read as zero
    fn read(&self, logical_address: u32) -> u16 {
        Self::index_of(logical_address)
            .and_then(|idx| self.get(idx))
            .unwrap_or(0)
    }

    /// Out of range addresses store nothing and report zero
    fn write(&self, logical_address: u32, value: u16) -> u16 {
        match Self::index_of(logical_address) {
            Some(idx) if self.set(idx, value) => value,
            _ => {
                mb_debug!("write to unmapped register {=u32}", logical_address);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn countdown() -> RegisterBank {
        let mut init = [0u16; DEVICE_REGISTERS];
        init.iter_mut()
            .enumerate()
            .for_each(|(i, v)| *v = (DEVICE_REGISTERS - i) as u16);
        RegisterBank::with_values(init)
    }

    #[test]
    fn logical_addresses_map_from_the_base() {
        let bank = countdown();
        assert_eq!(bank.read(40001), 20);
        assert_eq!(bank.read(40005), 16);
        assert_eq!(bank.read(40020), 1);
    }

    #[test]
    fn out_of_range_reads_are_zero() {
        let bank = countdown();
        assert_eq!(bank.read(40000), 0);
        assert_eq!(bank.read(40021), 0);
        assert_eq!(bank.read(0), 0);
    }

    #[test]
    fn writes_echo_the_stored_value() {
        let bank = countdown();
        assert_eq!(bank.write(40006, 1234), 1234);
        assert_eq!(bank.get(5), Some(1234));
        assert_eq!(bank.write(40021, 99), 0);
        assert_eq!(bank.snapshot()[19], 1);
    }

    #[test]
    fn refresh_by_index() {
        static BANK: RegisterBank<4> = RegisterBank::new();
        assert!(BANK.set(3, 7));
        assert!(!BANK.set(4, 7));
        assert_eq!(BANK.read(40004), 7);
        assert_eq!(BANK.len(), 4);
    }
}
