//! Conversion between [`Array`] and `ndarray`.
//!
//! `ndarray` shapes are row-major with the slowest axis first, so they are
//! the reverse of the FITS axis order used by [`Array`].

use ndarray::{ArrayD, IxDyn};

use crate::codec::{Array, ArrayData};
use crate::error::{Error, Result};

/// Element types that map onto one [`ArrayData`] variant.
pub trait Element: Clone {
    fn wrap(values: Vec<Self>) -> ArrayData;

    fn unwrap(data: ArrayData) -> Option<Vec<Self>>;
}

macro_rules! element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            fn wrap(values: Vec<Self>) -> ArrayData {
                ArrayData::$variant(values)
            }

            fn unwrap(data: ArrayData) -> Option<Vec<Self>> {
                match data {
                    ArrayData::$variant(values) => Some(values),
                    _ => None,
                }
            }
        }
    };
}

element!(u8, Byte);
element!(i8, I8);
element!(i16, I16);
element!(i32, I32);
element!(i64, I64);
element!(f32, F32);
element!(f64, F64);
element!(bool, Logical);
element!([f32; 2], ComplexF32);
element!([f64; 2], ComplexF64);

/// Move the values of `array` into an `ndarray` array.
pub fn to_ndarray<T: Element>(array: Array) -> Result<ArrayD<T>> {
    let shape: Vec<usize> = array.shape().iter().rev().copied().collect();
    let ty = array.element_type();
    let values = T::unwrap(array.into_data())
        .ok_or_else(|| Error::UnsupportedElementType(format!("{ty:?} into {}", std::any::type_name::<T>())))?;
    ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| Error::InvalidValue(e.to_string()))
}

/// Copy an `ndarray` array, in logical order whatever its memory layout.
pub fn from_ndarray<T: Element>(array: &ArrayD<T>) -> Result<Array> {
    let shape: Vec<usize> = array.shape().iter().rev().copied().collect();
    Array::new(&shape, T::wrap(array.iter().cloned().collect()))
}
