//! Tensor layout conversion
//!
//! TFLite keeps activations in NHWC and convolution filters in OHWI
//! (depthwise: 1HWC). ONNX convolutions and pools want NCHW and OIHW.

/// Transpose permutation from NHWC to NCHW
pub const NHWC_TO_NCHW: [usize; 4] = [0, 3, 1, 2];

/// Transpose permutation from NCHW back to NHWC
pub const NCHW_TO_NHWC: [usize; 4] = [0, 2, 3, 1];

/// Conv filter OHWI to OIHW
pub const OHWI_TO_OIHW: [usize; 4] = [0, 3, 1, 2];

/// Depthwise filter [1, H, W, C*M] to [C*M, 1, H, W]
pub const DEPTHWISE_TO_OIHW: [usize; 4] = [3, 0, 1, 2];

/// Shape after applying `perm`
pub fn permute_dims<T: Copy>(dims: &[T], perm: &[usize]) -> Vec<T> {
    perm.iter().map(|&axis| dims[axis]).collect()
}

/// Transpose a dense row-major tensor of `elem_size`-byte elements
///
/// Returns None if `perm` is not a permutation of `0..dims.len()` or the
/// payload length does not match `dims`.
pub fn permute(data: &[u8], dims: &[usize], perm: &[usize], elem_size: usize) -> Option<Vec<u8>> {
    let rank = dims.len();
    if perm.len() != rank {
        return None;
    }
    let mut seen = vec![false; rank];
    for &axis in perm {
        if axis >= rank || std::mem::replace(&mut seen[axis], true) {
            return None;
        }
    }

    let count: usize = dims.iter().product();
    if count.checked_mul(elem_size)? != data.len() {
        return None;
    }

    // Row-major strides of the source, in elements
    let mut strides = vec![1usize; rank];
    for axis in (0..rank.saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }

    let out_dims = permute_dims(dims, perm);
    let out_strides = permute_dims(&strides, perm);

    let mut out = Vec::with_capacity(data.len());
    let mut index = vec![0usize; rank];
    for _ in 0..count {
        let src: usize = index
            .iter()
            .zip(&out_strides)
            .map(|(i, stride)| i * stride)
            .sum();
        out.extend_from_slice(&data[src * elem_size..(src + 1) * elem_size]);

        // Advance the output index, last axis fastest
        for axis in (0..rank).rev() {
            index[axis] += 1;
            if index[axis] < out_dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }

    Some(out)
}
