//! Type-erased tensor wrapper so tensors of different element types share one collection.

use super::dtype::DType;
use super::element::Element;
use super::host::Tensor;
use super::TensorError;

/// Closed union over every supported element type.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    F32(Tensor<f32>),
    F64(Tensor<f64>),
    I8(Tensor<i8>),
    I16(Tensor<i16>),
    I32(Tensor<i32>),
    I64(Tensor<i64>),
    U8(Tensor<u8>),
    U16(Tensor<u16>),
    U32(Tensor<u32>),
    U64(Tensor<u64>),
}

/// Runs `$body` with `$tensor` bound to the concrete tensor inside `$value`.
#[macro_export]
macro_rules! dispatch_tensor {
    ($value:expr, $tensor:ident => $body:expr) => {
        match $value {
            $crate::tensor::TensorValue::F32($tensor) => $body,
            $crate::tensor::TensorValue::F64($tensor) => $body,
            $crate::tensor::TensorValue::I8($tensor) => $body,
            $crate::tensor::TensorValue::I16($tensor) => $body,
            $crate::tensor::TensorValue::I32($tensor) => $body,
            $crate::tensor::TensorValue::I64($tensor) => $body,
            $crate::tensor::TensorValue::U8($tensor) => $body,
            $crate::tensor::TensorValue::U16($tensor) => $body,
            $crate::tensor::TensorValue::U32($tensor) => $body,
            $crate::tensor::TensorValue::U64($tensor) => $body,
        }
    };
}

impl TensorValue {
    /// Zero-filled tensor of the given element type.
    pub fn zeros(dtype: DType, dims: &[usize]) -> Self {
        match dtype {
            DType::F32 => TensorValue::F32(Tensor::new(dims)),
            DType::F64 => TensorValue::F64(Tensor::new(dims)),
            DType::I8 => TensorValue::I8(Tensor::new(dims)),
            DType::I16 => TensorValue::I16(Tensor::new(dims)),
            DType::I32 => TensorValue::I32(Tensor::new(dims)),
            DType::I64 => TensorValue::I64(Tensor::new(dims)),
            DType::U8 => TensorValue::U8(Tensor::new(dims)),
            DType::U16 => TensorValue::U16(Tensor::new(dims)),
            DType::U32 => TensorValue::U32(Tensor::new(dims)),
            DType::U64 => TensorValue::U64(Tensor::new(dims)),
        }
    }

    /// Empty container of the given element type, used for unpopulated gradient slots.
    pub fn empty(dtype: DType) -> Self {
        Self::zeros(dtype, &[])
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::F32(_) => DType::F32,
            TensorValue::F64(_) => DType::F64,
            TensorValue::I8(_) => DType::I8,
            TensorValue::I16(_) => DType::I16,
            TensorValue::I32(_) => DType::I32,
            TensorValue::I64(_) => DType::I64,
            TensorValue::U8(_) => DType::U8,
            TensorValue::U16(_) => DType::U16,
            TensorValue::U32(_) => DType::U32,
            TensorValue::U64(_) => DType::U64,
        }
    }

    pub fn dims(&self) -> &[usize] {
        dispatch_tensor!(self, tensor => tensor.dims())
    }

    pub fn len(&self) -> usize {
        dispatch_tensor!(self, tensor => tensor.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed view of the payload.
    ///
    /// Panics if the stored element type is not `T`.
    pub fn as_tensor<T: Element>(&self) -> &Tensor<T> {
        match T::view(self) {
            Some(tensor) => tensor,
            None => panic!(
                "tensor holds {} elements but was accessed as {}",
                self.dtype(),
                T::DTYPE
            ),
        }
    }

    /// Mutable typed view of the payload.
    ///
    /// Panics if the stored element type is not `T`.
    pub fn as_tensor_mut<T: Element>(&mut self) -> &mut Tensor<T> {
        let dtype = self.dtype();
        match T::view_mut(self) {
            Some(tensor) => tensor,
            None => panic!(
                "tensor holds {dtype} elements but was accessed as {}",
                T::DTYPE
            ),
        }
    }

    pub fn try_as_tensor<T: Element>(&self) -> Option<&Tensor<T>> {
        T::view(self)
    }

    pub fn try_as_tensor_mut<T: Element>(&mut self) -> Option<&mut Tensor<T>> {
        T::view_mut(self)
    }

    pub fn into_tensor<T: Element>(self) -> Result<Tensor<T>, TensorError> {
        let found = self.dtype();
        let mut value = self;
        match T::view_mut(&mut value) {
            Some(tensor) => Ok(std::mem::replace(tensor, Tensor::empty())),
            None => Err(TensorError::DTypeMismatch {
                expected: T::DTYPE,
                found,
            }),
        }
    }

    /// Raw bytes of the payload in native byte order.
    pub fn as_bytes(&self) -> &[u8] {
        dispatch_tensor!(self, tensor => bytemuck::cast_slice(tensor.data()))
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        dispatch_tensor!(self, tensor => bytemuck::cast_slice_mut(tensor.data_mut()))
    }

    /// Overwrites this tensor with `other`, which must match in dtype and extents.
    pub fn copy_from(&mut self, other: &TensorValue) -> Result<(), TensorError> {
        self.ensure_same_layout(other)?;
        self.as_bytes_mut().copy_from_slice(other.as_bytes());
        Ok(())
    }

    pub fn ensure_same_layout(&self, other: &TensorValue) -> Result<(), TensorError> {
        if self.dtype() != other.dtype() {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype(),
                found: other.dtype(),
            });
        }
        if self.dims() != other.dims() {
            return Err(TensorError::ExtentMismatch {
                lhs: self.dims().to_vec(),
                rhs: other.dims().to_vec(),
            });
        }
        Ok(())
    }

    /// Values widened to `f64`, for tolerance comparisons and diagnostics.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        dispatch_tensor!(self, tensor => tensor.data().iter().map(|v| v.to_f64()).collect())
    }
}

impl<T: Element> From<Tensor<T>> for TensorValue {
    fn from(tensor: Tensor<T>) -> Self {
        T::wrap(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access_matches_stored_dtype() {
        let value = TensorValue::from(Tensor::full(&[2, 2], 3i16));
        assert_eq!(value.dtype(), DType::I16);
        assert_eq!(value.as_tensor::<i16>()[[1, 1]], 3);
        assert!(value.try_as_tensor::<f32>().is_none());
    }

    #[test]
    #[should_panic(expected = "accessed as f64")]
    fn typed_access_with_wrong_dtype_is_fatal() {
        let value = TensorValue::zeros(DType::F32, &[4]);
        let _ = value.as_tensor::<f64>();
    }

    #[test]
    fn copy_from_checks_dtype_and_extents() {
        let mut dst = TensorValue::zeros(DType::F32, &[2, 2]);
        let src = TensorValue::from(Tensor::full(&[2, 2], 1.5f32));
        dst.copy_from(&src).unwrap();
        assert_eq!(dst, src);

        let wrong_dtype = TensorValue::zeros(DType::F64, &[2, 2]);
        assert!(matches!(
            dst.copy_from(&wrong_dtype),
            Err(TensorError::DTypeMismatch { .. })
        ));
        let wrong_dims = TensorValue::zeros(DType::F32, &[4]);
        assert!(matches!(
            dst.copy_from(&wrong_dims),
            Err(TensorError::ExtentMismatch { .. })
        ));
    }

    #[test]
    fn byte_view_covers_every_element() {
        let value = TensorValue::zeros(DType::U64, &[3, 2]);
        assert_eq!(value.as_bytes().len(), 48);
    }
}
