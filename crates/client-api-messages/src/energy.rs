//! Energy accounting units reported to clients.

use derive_more::{Add, AddAssign, Sub, SubAssign};
use std::fmt;

/// [EnergyQuanta] represents an amount of energy in a canonical unit.
/// It represents the smallest unit of energy that can be used to pay for
/// a reducer invocation. We will likely refer to this unit as an "eV".
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Add, Sub, AddAssign, SubAssign)]
pub struct EnergyQuanta {
    pub quanta: u128,
}

impl EnergyQuanta {
    pub const ZERO: Self = EnergyQuanta { quanta: 0 };

    #[inline]
    pub fn new(quanta: u128) -> Self {
        Self { quanta }
    }

    #[inline]
    pub fn get(&self) -> u128 {
        self.quanta
    }
}

impl fmt::Display for EnergyQuanta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.quanta.fmt(f)?;
        f.write_str("eV")
    }
}

impl fmt::Debug for EnergyQuanta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnergyQuanta({self})")
    }
}
