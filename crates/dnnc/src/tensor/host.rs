//! Owned, contiguous, row-major host tensor.

use std::ops::{Index, IndexMut};

use rand::Rng;
use smallvec::SmallVec;

use super::element::{Element, FloatElement};
use super::{Dims, TensorError, MAX_RANK};

/// Dense host tensor with up to four dimensions.
///
/// An empty extent list produces an empty container with no elements, which is how unused
/// gradient slots are represented.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T: Element> {
    dims: Dims,
    strides: Dims,
    data: Vec<T>,
}

impl<T: Element> Tensor<T> {
    /// Allocates a zero-filled tensor.
    ///
    /// Panics if `dims` has more than four entries.
    pub fn new(dims: &[usize]) -> Self {
        assert!(
            dims.len() <= MAX_RANK,
            "tensor rank {} exceeds the supported maximum of {MAX_RANK}",
            dims.len()
        );
        let len = element_count(dims);
        Tensor {
            dims: Dims::from_slice(dims),
            strides: row_major_strides(dims),
            data: vec![T::zero(); len],
        }
    }

    /// Empty container: rank zero, no storage.
    pub fn empty() -> Self {
        Tensor {
            dims: SmallVec::new(),
            strides: SmallVec::new(),
            data: Vec::new(),
        }
    }

    /// Wraps an existing buffer, validating its length against the extents.
    pub fn from_vec(dims: &[usize], data: Vec<T>) -> Result<Self, TensorError> {
        if dims.len() > MAX_RANK {
            return Err(TensorError::RankTooLarge { rank: dims.len() });
        }
        let expected = element_count(dims);
        if data.len() != expected {
            return Err(TensorError::LengthMismatch {
                dims: dims.to_vec(),
                expected,
                actual: data.len(),
            });
        }
        Ok(Tensor {
            dims: Dims::from_slice(dims),
            strides: row_major_strides(dims),
            data,
        })
    }

    pub fn full(dims: &[usize], value: T) -> Self {
        let mut tensor = Self::new(dims);
        tensor.fill(value);
        tensor
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Flat offset of a coordinate tuple.
    ///
    /// Panics when the coordinate count differs from the rank or a coordinate is out of range.
    pub fn offset(&self, coords: &[usize]) -> usize {
        assert_eq!(
            coords.len(),
            self.dims.len(),
            "tensor of rank {} addressed with {} coordinates",
            self.dims.len(),
            coords.len()
        );
        coords
            .iter()
            .zip(self.dims.iter().zip(self.strides.iter()))
            .map(|(&coord, (&extent, &stride))| {
                assert!(coord < extent, "coordinate {coord} out of range for extent {extent}");
                coord * stride
            })
            .sum()
    }

    pub fn fill(&mut self, value: T) {
        self.data.iter_mut().for_each(|slot| *slot = value);
    }

    /// Fills every element by calling `generator` once per element in row-major order.
    pub fn fill_with<F: FnMut() -> T>(&mut self, mut generator: F) {
        for slot in self.data.iter_mut() {
            *slot = generator();
        }
    }

    /// Copies the contents of `other`, which must have identical extents.
    pub fn copy_from(&mut self, other: &Tensor<T>) -> Result<(), TensorError> {
        self.ensure_same_extents(other)?;
        self.data.copy_from_slice(&other.data);
        Ok(())
    }

    /// Elementwise in-place addition of a tensor with identical extents.
    pub fn add_assign(&mut self, other: &Tensor<T>) -> Result<(), TensorError> {
        self.ensure_same_extents(other)?;
        for (lhs, rhs) in self.data.iter_mut().zip(other.data.iter()) {
            *lhs = lhs.accumulate(*rhs);
        }
        Ok(())
    }

    fn ensure_same_extents(&self, other: &Tensor<T>) -> Result<(), TensorError> {
        if self.dims != other.dims {
            return Err(TensorError::ExtentMismatch {
                lhs: self.dims.to_vec(),
                rhs: other.dims.to_vec(),
            });
        }
        Ok(())
    }
}

impl<T: FloatElement> Tensor<T> {
    /// Samples a tensor from a normal distribution using the Box-Muller transform.
    pub fn randn<R: Rng + ?Sized>(dims: &[usize], mean: f32, std: f32, rng: &mut R) -> Self {
        let mut tensor = Self::new(dims);
        tensor.fill_with(|| {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let radius = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            T::from_f32(mean + std * radius * theta.cos())
        });
        tensor
    }
}

macro_rules! impl_coordinate_index {
    ($($n:literal),*) => {
        $(
            impl<T: Element> Index<[usize; $n]> for Tensor<T> {
                type Output = T;

                fn index(&self, coords: [usize; $n]) -> &T {
                    let offset = self.offset(&coords);
                    &self.data[offset]
                }
            }

            impl<T: Element> IndexMut<[usize; $n]> for Tensor<T> {
                fn index_mut(&mut self, coords: [usize; $n]) -> &mut T {
                    let offset = self.offset(&coords);
                    &mut self.data[offset]
                }
            }
        )*
    };
}

impl_coordinate_index!(1, 2, 3, 4);

/// Product of all extents; zero for an empty extent list.
pub fn element_count(dims: &[usize]) -> usize {
    if dims.is_empty() {
        0
    } else {
        dims.iter().product()
    }
}

pub fn row_major_strides(dims: &[usize]) -> Dims {
    let mut strides: Dims = SmallVec::from_elem(1, dims.len());
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn strides_are_row_major() {
        assert_eq!(row_major_strides(&[2, 3, 4, 5]).as_slice(), &[60, 20, 5, 1]);
        assert_eq!(row_major_strides(&[7]).as_slice(), &[1]);
    }

    #[test]
    fn coordinate_access_uses_row_major_offsets() {
        let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let mut tensor = Tensor::from_vec(&[2, 3, 4], data).unwrap();
        assert_eq!(tensor[[1, 2, 3]], 23.0);
        assert_eq!(tensor[[0, 1, 0]], 4.0);
        tensor[[1, 0, 0]] = -1.0;
        assert_eq!(tensor.data()[12], -1.0);
    }

    #[test]
    #[should_panic(expected = "addressed with 2 coordinates")]
    fn coordinate_arity_mismatch_is_fatal() {
        let tensor = Tensor::<f32>::new(&[2, 2, 2]);
        let _ = tensor[[0, 0]];
    }

    #[test]
    fn empty_extents_produce_empty_container() {
        let tensor = Tensor::<i32>::new(&[]);
        assert!(tensor.is_empty());
        assert_eq!(tensor.rank(), 0);
        assert_eq!(Tensor::<f32>::empty(), Tensor::<f32>::new(&[]));
    }

    #[test]
    fn fill_and_generator_initialize_every_element() {
        let mut tensor = Tensor::<i64>::new(&[3, 3]);
        tensor.fill(7);
        assert!(tensor.data().iter().all(|&v| v == 7));

        let mut counter = 0;
        tensor.fill_with(|| {
            counter += 1;
            counter
        });
        assert_eq!(tensor.data(), &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn copy_and_add_require_identical_extents() {
        let mut a = Tensor::full(&[2, 3], 1.0f32);
        let b = Tensor::full(&[2, 3], 2.0f32);
        a.add_assign(&b).unwrap();
        assert!(a.data().iter().all(|&v| v == 3.0));
        a.copy_from(&b).unwrap();
        assert_eq!(a, b);

        let c = Tensor::full(&[3, 2], 1.0f32);
        assert!(matches!(
            a.add_assign(&c),
            Err(TensorError::ExtentMismatch { .. })
        ));
        assert!(a.copy_from(&c).is_err());
    }

    #[test]
    fn integer_add_wraps() {
        let mut a = Tensor::full(&[2], u8::MAX);
        a.add_assign(&Tensor::full(&[2], 2u8)).unwrap();
        assert_eq!(a.data(), &[1, 1]);
    }

    #[test]
    fn from_vec_rejects_bad_length() {
        let err = Tensor::from_vec(&[2, 2], vec![1.0f32; 3]).unwrap_err();
        assert!(matches!(err, TensorError::LengthMismatch { expected: 4, .. }));
    }

    #[test]
    fn randn_is_deterministic_for_a_seed() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = Tensor::<f32>::randn(&[4, 4], 0.0, 1.0, &mut rng);
        let mut rng = StdRng::seed_from_u64(3);
        let b = Tensor::<f32>::randn(&[4, 4], 0.0, 1.0, &mut rng);
        assert_eq!(a, b);
        assert!(a.data().iter().all(|v| v.is_finite()));
    }
}
