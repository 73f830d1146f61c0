//! Module handling lazy loading via iterating on slices on the original buffer.
//!
//! ```
//! use bintensors::tensor::{Dtype, TensorView};
//! use bintensors::slice::TensorIndexer;
//!
//! let data: Vec<u8> = (0..16).collect();
//! let view = TensorView::new(Dtype::U8, vec![4, 4], &data).unwrap();
//! let spans: Vec<&[u8]> = view
//!     .sliced_data(&[TensorIndexer::from(1..3)])
//!     .unwrap()
//!     .collect();
//! assert_eq!(spans, vec![&data[4..12]]);
//! ```
use crate::lib::Vec;
use crate::tensor::TensorView;
use core::fmt::Display;
use core::ops::{
    Bound, Range, RangeBounds, RangeFrom, RangeFull, RangeInclusive, RangeTo, RangeToInclusive,
};

/// Error representing invalid slicing attempt
#[derive(Debug)]
#[cfg_attr(test, derive(Eq, PartialEq))]
pub enum InvalidSlice {
    /// When the client asked for more slices than the tensors has dimensions
    TooManySlices,
    /// When the client asked for a slice that exceeds the allowed bounds
    SliceOutOfRange {
        /// The rank of the dimension that has the out of bounds
        dim_index: usize,
        /// The problematic value
        asked: usize,
        /// The dimension size we shouldn't go over.
        dim_size: usize,
    },
}

impl Display for InvalidSlice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            InvalidSlice::TooManySlices => {
                write!(f, "more slicing indexes than dimensions in tensor")
            }
            InvalidSlice::SliceOutOfRange {
                dim_index,
                asked,
                dim_size,
            } => {
                write!(f, "index {asked} out of bounds for tensor dimension #{dim_index} of size {dim_size}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for InvalidSlice {}

/// Single index operation on one dimension of a tensor, either picking a
/// single element (dropping the dimension from the result) or narrowing the
/// dimension to a sub-range.
#[derive(Debug, Clone)]
pub enum TensorIndexer {
    /// Select a single element along the dimension
    Select(usize),
    /// Keep only the given bounds of the dimension
    Narrow(Bound<usize>, Bound<usize>),
}

impl From<usize> for TensorIndexer {
    fn from(index: usize) -> Self {
        TensorIndexer::Select(index)
    }
}

impl From<RangeFull> for TensorIndexer {
    fn from(_: RangeFull) -> Self {
        TensorIndexer::Narrow(Bound::Unbounded, Bound::Unbounded)
    }
}

macro_rules! impl_from_range {
    ($range_type:ty) => {
        impl From<$range_type> for TensorIndexer {
            fn from(range: $range_type) -> Self {
                use core::ops::Bound::*;

                let start = match range.start_bound() {
                    Included(idx) => Included(*idx),
                    Excluded(idx) => Excluded(*idx),
                    Unbounded => Unbounded,
                };

                let end = match range.end_bound() {
                    Included(idx) => Included(*idx),
                    Excluded(idx) => Excluded(*idx),
                    Unbounded => Unbounded,
                };

                TensorIndexer::Narrow(start, end)
            }
        }
    };
}

impl_from_range!(Range<usize>);
impl_from_range!(RangeInclusive<usize>);
impl_from_range!(RangeFrom<usize>);
impl_from_range!(RangeTo<usize>);
impl_from_range!(RangeToInclusive<usize>);

/// Iterator over the contiguous byte spans of a sliced tensor, in row-major
/// order. Spans borrow from the tensor's buffer; nothing is copied.
#[derive(Debug)]
pub struct SliceIterator<'data> {
    data: &'data [u8],
    /// Resolved `[start, stop)` range per original dimension.
    ranges: Vec<(usize, usize)>,
    /// Byte stride per original dimension.
    strides: Vec<usize>,
    /// Dimensions before `split` are walked one index at a time; everything
    /// from `split` on is covered by a single contiguous span.
    split: usize,
    span_offset: usize,
    span_len: usize,
    odometer: Vec<usize>,
    remaining: usize,
    newshape: Vec<usize>,
}

impl<'data> SliceIterator<'data> {
    /// Creates a new SliceIterator
    /// This should be used internally by tensor only
    pub(crate) fn new(
        view: &'data TensorView<'data>,
        slices: &[TensorIndexer],
    ) -> Result<Self, InvalidSlice> {
        let shape = view.shape();
        if slices.len() > shape.len() {
            return Err(InvalidSlice::TooManySlices);
        }

        // Resolve every dimension to a concrete [start, stop) range; `Select`
        // drops the dimension from the result shape.
        let mut ranges = Vec::with_capacity(shape.len());
        let mut newshape = Vec::with_capacity(shape.len());
        for (dim_index, &dim_size) in shape.iter().enumerate() {
            let (start, stop, keep) = match slices.get(dim_index) {
                Some(TensorIndexer::Select(index)) => (*index, index + 1, false),
                Some(TensorIndexer::Narrow(start_bound, end_bound)) => {
                    let start = match start_bound {
                        Bound::Included(idx) => *idx,
                        Bound::Excluded(idx) => *idx + 1,
                        Bound::Unbounded => 0,
                    };
                    let stop = match end_bound {
                        Bound::Included(idx) => *idx + 1,
                        Bound::Excluded(idx) => *idx,
                        Bound::Unbounded => dim_size,
                    };
                    (start, stop, true)
                }
                None => (0, dim_size, true),
            };
            if start > stop || stop > dim_size {
                return Err(InvalidSlice::SliceOutOfRange {
                    dim_index,
                    asked: if stop > dim_size { stop - 1 } else { start },
                    dim_size,
                });
            }
            ranges.push((start, stop));
            if keep {
                newshape.push(stop - start);
            }
        }

        // Byte strides of the original tensor, innermost dimension first.
        let mut strides = vec![0usize; shape.len()];
        let mut stride = view.dtype().size();
        for i in (0..shape.len()).rev() {
            strides[i] = stride;
            stride *= shape[i];
        }

        // The innermost dimension that is not taken whole bounds the longest
        // contiguous run; full trailing dimensions merge into it.
        let (split, span_offset, span_len) = match (0..shape.len())
            .rev()
            .find(|&i| ranges[i] != (0, shape[i]))
        {
            Some(i) => {
                let (start, stop) = ranges[i];
                (i, start * strides[i], (stop - start) * strides[i])
            }
            // Nothing is narrowed, the whole tensor is one span.
            None => (0, 0, stride),
        };

        let remaining = if span_len == 0 {
            0
        } else {
            ranges[..split].iter().map(|&(start, stop)| stop - start).product()
        };
        let odometer = ranges[..split].iter().map(|&(start, _)| start).collect();

        Ok(Self {
            data: view.data(),
            ranges,
            strides,
            split,
            span_offset,
            span_len,
            odometer,
            remaining,
            newshape,
        })
    }

    /// The shape of the sliced tensor.
    pub fn newshape(&self) -> Vec<usize> {
        self.newshape.clone()
    }

    /// Total number of bytes still to be yielded, useful to preallocate a
    /// destination buffer.
    pub fn remaining_byte_len(&self) -> usize {
        self.remaining * self.span_len
    }
}

impl<'data> Iterator for SliceIterator<'data> {
    type Item = &'data [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let base: usize = self
            .odometer
            .iter()
            .zip(&self.strides)
            .map(|(&index, &stride)| index * stride)
            .sum();

        // Advance the odometer, rightmost dimension fastest.
        for i in (0..self.split).rev() {
            self.odometer[i] += 1;
            if self.odometer[i] < self.ranges[i].1 {
                break;
            }
            self.odometer[i] = self.ranges[i].0;
        }

        let start = base + self.span_offset;
        Some(&self.data[start..start + self.span_len])
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Dtype;

    #[test]
    fn test_selecting_first_dim_is_one_span() {
        let data: Vec<u8> = (0..24).collect();
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();

        let mut iter = SliceIterator::new(&tensor, &[TensorIndexer::from(1usize)]).unwrap();
        assert_eq!(iter.newshape(), vec![3, 4]);
        assert_eq!(iter.remaining_byte_len(), 12);
        assert_eq!(iter.next(), Some(&data[12..24]));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_narrowing_middle_dim() {
        let data: Vec<u8> = (0..24).collect();
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();

        let slices = [TensorIndexer::from(..), TensorIndexer::from(1..3)];
        let iter = SliceIterator::new(&tensor, &slices).unwrap();
        assert_eq!(iter.newshape(), vec![2, 2, 4]);
        let spans: Vec<&[u8]> = iter.collect();
        assert_eq!(spans, vec![&data[4..12], &data[16..24]]);
    }

    #[test]
    fn test_wide_dtype_strides() {
        let data: Vec<u8> = (0..16).collect();
        let tensor = TensorView::new(Dtype::F32, vec![2, 2], &data).unwrap();

        let slices = [TensorIndexer::from(..), TensorIndexer::from(0..1)];
        let spans: Vec<&[u8]> = SliceIterator::new(&tensor, &slices).unwrap().collect();
        assert_eq!(spans, vec![&data[0..4], &data[8..12]]);
    }

    #[test]
    fn test_selecting_every_dim_yields_one_element() {
        let data: Vec<u8> = (0..24).collect();
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();

        let slices = [
            TensorIndexer::from(1usize),
            TensorIndexer::from(2usize),
            TensorIndexer::from(3usize),
        ];
        let mut iter = SliceIterator::new(&tensor, &slices).unwrap();
        assert!(iter.newshape().is_empty());
        assert_eq!(iter.next(), Some(&data[23..24]));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_no_slices_yields_whole_buffer() {
        let data: Vec<u8> = (0..24).collect();
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();

        let mut iter = SliceIterator::new(&tensor, &[]).unwrap();
        assert_eq!(iter.remaining_byte_len(), 24);
        assert_eq!(iter.next(), Some(&data[..]));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_empty_narrow_yields_nothing() {
        let data: Vec<u8> = (0..24).collect();
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();

        let mut iter = SliceIterator::new(&tensor, &[TensorIndexer::from(1..1)]).unwrap();
        assert_eq!(iter.remaining_byte_len(), 0);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_out_of_bounds() {
        let data: Vec<u8> = (0..24).collect();
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();

        let result = SliceIterator::new(&tensor, &[TensorIndexer::from(5usize)]);
        assert_eq!(
            result.unwrap_err(),
            InvalidSlice::SliceOutOfRange {
                dim_index: 0,
                asked: 5,
                dim_size: 2,
            }
        );
    }

    #[test]
    fn test_too_many_slices() {
        let data: Vec<u8> = (0..24).collect();
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();

        let slices = [
            TensorIndexer::from(0usize),
            TensorIndexer::from(0usize),
            TensorIndexer::from(0usize),
            TensorIndexer::from(0usize),
        ];
        let result = SliceIterator::new(&tensor, &slices);
        assert_eq!(result.unwrap_err(), InvalidSlice::TooManySlices);
    }

    #[test]
    fn test_sliced_data_through_view() {
        let data: Vec<u8> = (0..12).collect();
        let tensor = TensorView::new(Dtype::U8, vec![3, 4], &data).unwrap();

        let spans: Vec<&[u8]> = tensor
            .sliced_data(&[TensorIndexer::from(0..2)])
            .unwrap()
            .collect();
        assert_eq!(spans, vec![&data[0..8]]);
    }
}
