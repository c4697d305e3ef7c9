//! Forward-mode dual numbers carrying a full gradient
//!
//! A `Dual` holds a value and its partial derivatives with respect to every
//! model parameter, so one evaluation of the log density yields the exact
//! gradient. Code written against [`Real`] runs unchanged on `f64`.

use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

/// Largest parameter count of any model (the full model)
pub const MAX_PARAMS: usize = 6;

/// Scalar arithmetic shared by `f64` and [`Dual`]
pub trait Real:
    Copy
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
    + AddAssign
{
    fn constant(value: f64) -> Self;
    fn value(self) -> f64;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn ln_1p(self) -> Self;
    fn sqrt(self) -> Self;
    fn tanh(self) -> Self;
    fn abs(self) -> Self;
}

impl Real for f64 {
    #[inline]
    fn constant(value: f64) -> Self {
        value
    }
    #[inline]
    fn value(self) -> f64 {
        self
    }
    #[inline]
    fn exp(self) -> Self {
        f64::exp(self)
    }
    #[inline]
    fn ln(self) -> Self {
        f64::ln(self)
    }
    #[inline]
    fn ln_1p(self) -> Self {
        f64::ln_1p(self)
    }
    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    #[inline]
    fn tanh(self) -> Self {
        f64::tanh(self)
    }
    #[inline]
    fn abs(self) -> Self {
        f64::abs(self)
    }
}

/// Value with its gradient over up to [`MAX_PARAMS`] parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual {
    pub value: f64,
    pub grad: [f64; MAX_PARAMS],
}

impl Dual {
    /// Seed parameter `index`: ∂x/∂x_index = 1
    pub fn variable(value: f64, index: usize) -> Self {
        let mut grad = [0.0; MAX_PARAMS];
        grad[index] = 1.0;
        Self { value, grad }
    }

    /// f(self), given f and f' at `self.value`
    #[inline]
    fn chain(self, value: f64, derivative: f64) -> Self {
        let mut grad = self.grad;
        for g in &mut grad {
            *g *= derivative;
        }
        Self { value, grad }
    }

    #[inline]
    fn combine(self, other: Dual, value: f64, da: f64, db: f64) -> Self {
        let mut grad = [0.0; MAX_PARAMS];
        for (i, g) in grad.iter_mut().enumerate() {
            *g = da * self.grad[i] + db * other.grad[i];
        }
        Self { value, grad }
    }
}

impl Real for Dual {
    #[inline]
    fn constant(value: f64) -> Self {
        Self {
            value,
            grad: [0.0; MAX_PARAMS],
        }
    }
    #[inline]
    fn value(self) -> f64 {
        self.value
    }
    #[inline]
    fn exp(self) -> Self {
        let e = self.value.exp();
        self.chain(e, e)
    }
    #[inline]
    fn ln(self) -> Self {
        self.chain(self.value.ln(), 1.0 / self.value)
    }
    #[inline]
    fn ln_1p(self) -> Self {
        self.chain(self.value.ln_1p(), 1.0 / (1.0 + self.value))
    }
    #[inline]
    fn sqrt(self) -> Self {
        let s = self.value.sqrt();
        self.chain(s, 0.5 / s)
    }
    #[inline]
    fn tanh(self) -> Self {
        let t = self.value.tanh();
        self.chain(t, 1.0 - t * t)
    }
    #[inline]
    fn abs(self) -> Self {
        self.chain(self.value.abs(), self.value.signum())
    }
}

impl Add for Dual {
    type Output = Dual;
    #[inline]
    fn add(self, rhs: Dual) -> Dual {
        self.combine(rhs, self.value + rhs.value, 1.0, 1.0)
    }
}

impl Sub for Dual {
    type Output = Dual;
    #[inline]
    fn sub(self, rhs: Dual) -> Dual {
        self.combine(rhs, self.value - rhs.value, 1.0, -1.0)
    }
}

impl Mul for Dual {
    type Output = Dual;
    #[inline]
    fn mul(self, rhs: Dual) -> Dual {
        self.combine(rhs, self.value * rhs.value, rhs.value, self.value)
    }
}

impl Div for Dual {
    type Output = Dual;
    #[inline]
    fn div(self, rhs: Dual) -> Dual {
        let q = self.value / rhs.value;
        self.combine(rhs, q, 1.0 / rhs.value, -q / rhs.value)
    }
}

impl Neg for Dual {
    type Output = Dual;
    #[inline]
    fn neg(self) -> Dual {
        self.chain(-self.value, -1.0)
    }
}

impl AddAssign for Dual {
    #[inline]
    fn add_assign(&mut self, rhs: Dual) {
        *self = *self + rhs;
    }
}

impl Add<f64> for Dual {
    type Output = Dual;
    #[inline]
    fn add(self, rhs: f64) -> Dual {
        Dual {
            value: self.value + rhs,
            grad: self.grad,
        }
    }
}

impl Sub<f64> for Dual {
    type Output = Dual;
    #[inline]
    fn sub(self, rhs: f64) -> Dual {
        Dual {
            value: self.value - rhs,
            grad: self.grad,
        }
    }
}

impl Mul<f64> for Dual {
    type Output = Dual;
    #[inline]
    fn mul(self, rhs: f64) -> Dual {
        self.chain(self.value * rhs, rhs)
    }
}

impl Div<f64> for Dual {
    type Output = Dual;
    #[inline]
    fn div(self, rhs: f64) -> Dual {
        self.chain(self.value / rhs, 1.0 / rhs)
    }
}
