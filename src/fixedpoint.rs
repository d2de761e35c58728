//! 17.14 fixed-point arithmetic.
//!
//! The MLFQS scheduler keeps `recent_cpu` and `load_avg` in a signed 17.14
//! representation: 17 integer bits, 14 fraction bits, one sign bit.

use core::ops::{Add, Sub};

const F: i32 = 1 << 14;

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);

    pub const fn from_int(n: i32) -> Fixed {
        Fixed(n * F)
    }

    /// Truncates toward zero.
    pub const fn trunc(self) -> i32 {
        self.0 / F
    }

    /// Rounds to the nearest integer.
    pub const fn round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }

    pub const fn add_int(self, n: i32) -> Fixed {
        Fixed(self.0 + n * F)
    }

    pub const fn sub_int(self, n: i32) -> Fixed {
        Fixed(self.0 - n * F)
    }

    pub const fn mul_int(self, n: i32) -> Fixed {
        Fixed(self.0 * n)
    }

    pub const fn div_int(self, n: i32) -> Fixed {
        Fixed(self.0 / n)
    }

    /// Full-precision multiply through an i64 intermediate.
    pub const fn mul(self, other: Fixed) -> Fixed {
        Fixed((self.0 as i64 * other.0 as i64 / F as i64) as i32)
    }

    /// Full-precision divide through an i64 intermediate.
    pub const fn div(self, other: Fixed) -> Fixed {
        Fixed((self.0 as i64 * F as i64 / other.0 as i64) as i32)
    }
}

impl Add for Fixed {
    type Output = Fixed;

    fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 + rhs.0)
    }
}

impl Sub for Fixed {
    type Output = Fixed;

    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 - rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(Fixed::from_int(5).trunc(), 5);
        assert_eq!(Fixed::from_int(-5).trunc(), -5);
        assert_eq!(Fixed::from_int(3).div_int(2).round(), 2);
        assert_eq!(Fixed::from_int(3).div_int(2).trunc(), 1);
        assert_eq!(Fixed::from_int(-3).div_int(2).round(), -2);
    }

    #[test]
    fn arithmetic() {
        let x = Fixed::from_int(6);
        let y = Fixed::from_int(4);
        assert_eq!((x + y).trunc(), 10);
        assert_eq!((x - y).trunc(), 2);
        assert_eq!(x.mul(y).trunc(), 24);
        assert_eq!(x.div(y).round(), 2);
        assert_eq!(x.add_int(1).trunc(), 7);
        assert_eq!(x.mul_int(3).trunc(), 18);
    }

    #[test]
    fn load_avg_formula_converges() {
        // load_avg = (59/60) * load_avg + (1/60) * ready, ready fixed at 1.
        let c59_60 = Fixed::from_int(59).div(Fixed::from_int(60));
        let c1_60 = Fixed::from_int(1).div(Fixed::from_int(60));
        let mut load = Fixed::ZERO;
        for _ in 0..2000 {
            load = c59_60.mul(load) + c1_60.mul_int(1);
        }
        // Converges to 1.00 within rounding error.
        assert_eq!(load.mul_int(100).round(), 100);
    }
}
