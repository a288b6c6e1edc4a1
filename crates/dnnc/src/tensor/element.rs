//! Scalar element traits implemented by every tensor element type.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use bytemuck::Pod;

use super::dtype::DType;
use super::host::Tensor;
use super::value::TensorValue;

/// Numeric behaviour every tensor element provides.
///
/// Integer accumulation wraps instead of panicking so reference kernels and generated code agree
/// on overflow.
pub trait Element:
    Copy + Default + PartialEq + PartialOrd + Send + Sync + fmt::Debug + Pod + 'static
{
    /// Element type tag carried by tensors of this element.
    const DTYPE: DType;

    /// Returns the additive identity.
    fn zero() -> Self;
    /// Returns the smallest finite value, the identity of a max reduction.
    fn lowest() -> Self;
    /// Converts from a double, truncating toward zero for integers.
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    /// Adds two elements, wrapping on integer overflow.
    fn accumulate(self, other: Self) -> Self;
    /// Multiplies by a float factor in the element's own arithmetic.
    fn scale(self, factor: f32) -> Self;

    fn wrap(tensor: Tensor<Self>) -> TensorValue;
    fn view(value: &TensorValue) -> Option<&Tensor<Self>>;
    fn view_mut(value: &mut TensorValue) -> Option<&mut Tensor<Self>>;
}

/// Floating-point elements used by normalization and linear kernels.
pub trait FloatElement:
    Element
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    fn one() -> Self;
    fn from_f32(v: f32) -> Self;
    fn exp(self) -> Self;
    fn sqrt(self) -> Self;
    fn powf(self, exponent: Self) -> Self;
}

macro_rules! impl_float_element {
    ($ty:ty, $dtype:ident, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$dtype;

            fn zero() -> Self {
                0.0
            }

            fn lowest() -> Self {
                <$ty>::MIN
            }

            fn from_f64(v: f64) -> Self {
                v as $ty
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn accumulate(self, other: Self) -> Self {
                self + other
            }

            fn scale(self, factor: f32) -> Self {
                self * factor as $ty
            }

            fn wrap(tensor: Tensor<Self>) -> TensorValue {
                TensorValue::$variant(tensor)
            }

            fn view(value: &TensorValue) -> Option<&Tensor<Self>> {
                match value {
                    TensorValue::$variant(tensor) => Some(tensor),
                    _ => None,
                }
            }

            fn view_mut(value: &mut TensorValue) -> Option<&mut Tensor<Self>> {
                match value {
                    TensorValue::$variant(tensor) => Some(tensor),
                    _ => None,
                }
            }
        }

        impl FloatElement for $ty {
            fn one() -> Self {
                1.0
            }

            fn from_f32(v: f32) -> Self {
                v as $ty
            }

            fn exp(self) -> Self {
                <$ty>::exp(self)
            }

            fn sqrt(self) -> Self {
                <$ty>::sqrt(self)
            }

            fn powf(self, exponent: Self) -> Self {
                <$ty>::powf(self, exponent)
            }
        }
    };
}

macro_rules! impl_int_element {
    ($ty:ty, $dtype:ident, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$dtype;

            fn zero() -> Self {
                0
            }

            fn lowest() -> Self {
                <$ty>::MIN
            }

            fn from_f64(v: f64) -> Self {
                v as $ty
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn accumulate(self, other: Self) -> Self {
                self.wrapping_add(other)
            }

            fn scale(self, factor: f32) -> Self {
                (self as f32 * factor) as $ty
            }

            fn wrap(tensor: Tensor<Self>) -> TensorValue {
                TensorValue::$variant(tensor)
            }

            fn view(value: &TensorValue) -> Option<&Tensor<Self>> {
                match value {
                    TensorValue::$variant(tensor) => Some(tensor),
                    _ => None,
                }
            }

            fn view_mut(value: &mut TensorValue) -> Option<&mut Tensor<Self>> {
                match value {
                    TensorValue::$variant(tensor) => Some(tensor),
                    _ => None,
                }
            }
        }
    };
}

impl_float_element!(f32, F32, F32);
impl_float_element!(f64, F64, F64);
impl_int_element!(i8, I8, I8);
impl_int_element!(i16, I16, I16);
impl_int_element!(i32, I32, I32);
impl_int_element!(i64, I64, I64);
impl_int_element!(u8, U8, U8);
impl_int_element!(u16, U16, U16);
impl_int_element!(u32, U32, U32);
impl_int_element!(u64, U64, U64);
