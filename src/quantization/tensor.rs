//! Quantized tensor representation.

use std::sync::Arc;

use candle_core::{Device, Tensor};

use super::{dequantizer_for, Weight};
use crate::gguf::{GgmlType, TensorRecord};
use crate::model::{WeightMerge, WeightPatch};

/// Shared, read-only view of an encoded tensor payload.
///
/// Clones share the backing buffer (usually the memory-mapped GGUF file).
#[derive(Clone)]
pub struct RawData {
    backing: Arc<dyn AsRef<[u8]> + Send + Sync>,
    start: usize,
    len: usize,
}

impl RawData {
    /// View `len` bytes of `backing` starting at `start`. The range must be in bounds.
    pub(crate) fn slice(backing: Arc<dyn AsRef<[u8]> + Send + Sync>, start: usize, len: usize) -> Self {
        debug_assert!(start + len <= (*backing).as_ref().len());
        Self { backing, start, len }
    }

    /// Wrap an owned buffer
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            backing: Arc::new(bytes),
            start: 0,
            len,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &(*self.backing).as_ref()[self.start..self.start + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether both views point at the same bytes in memory
    pub fn same_bytes(&self, other: &RawData) -> bool {
        self.len == other.len && std::ptr::eq(self.as_bytes().as_ptr(), other.as_bytes().as_ptr())
    }
}

impl std::fmt::Debug for RawData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawData")
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

/// A weight merge deferred until the tensor is materialized.
#[derive(Clone)]
pub struct PendingPatch {
    /// Unintercepted merge logic the patch is replayed through
    merge: Arc<dyn WeightMerge>,
    patches: Vec<WeightPatch>,
    key: String,
}

impl PendingPatch {
    pub fn new(merge: Arc<dyn WeightMerge>, patches: Vec<WeightPatch>, key: impl Into<String>) -> Self {
        Self {
            merge,
            patches,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn patches(&self) -> &[WeightPatch] {
        &self.patches
    }

    /// Run the deferred merge on a full-precision value
    pub fn apply(&self, tensor: Tensor, device: &Device) -> crate::Result<Tensor> {
        self.merge
            .calculate_weight(&self.patches, Weight::Full(tensor), &self.key)?
            .into_tensor(device)
    }
}

impl std::fmt::Debug for PendingPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPatch")
            .field("key", &self.key)
            .field("num_patches", &self.patches.len())
            .finish()
    }
}

/// A tensor kept in its GGUF encoding until it is needed at full precision.
///
/// Cloning shares the encoded bytes but gives the clone its own pending-patch
/// queue, so patches queued on one copy never show up on another.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    /// Tensor name, used in diagnostics
    name: String,
    /// Encoded payload
    data: RawData,
    /// Encoding of `data`
    ggml_type: GgmlType,
    /// Logical shape, outermost dimension first
    shape: Vec<usize>,
    /// Merges to replay after dequantization, in arrival order
    patches: Vec<PendingPatch>,
}

impl QuantizedTensor {
    /// Create a quantized tensor from its encoded bytes and logical shape
    pub fn new(
        name: impl Into<String>,
        data: RawData,
        ggml_type: GgmlType,
        shape: Vec<usize>,
    ) -> crate::Result<Self> {
        let name = name.into();
        let elements: usize = shape.iter().product();
        match ggml_type.byte_size(elements) {
            Some(expected) if expected == data.len() => {}
            Some(expected) => {
                return Err(crate::GgufError::InvalidTensor {
                    tensor: name,
                    reason: format!(
                        "{} payload is {} bytes, {:?} needs {}",
                        ggml_type,
                        data.len(),
                        shape,
                        expected
                    ),
                })
            }
            None => {
                return Err(crate::GgufError::InvalidTensor {
                    tensor: name,
                    reason: format!("{} elements do not fill whole {} blocks", elements, ggml_type),
                })
            }
        }

        Ok(Self {
            name,
            data,
            ggml_type,
            shape,
            patches: Vec::new(),
        })
    }

    /// Build from a container record, flipping its innermost-first dimensions
    pub fn from_record(record: TensorRecord) -> crate::Result<Self> {
        let mut shape = record.shape;
        shape.reverse();
        Self::new(record.name, record.data, record.ggml_type, shape)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw_data(&self) -> &RawData {
        &self.data
    }

    pub fn ggml_type(&self) -> GgmlType {
        self.ggml_type
    }

    /// Logical dimensions, as a native tensor of the same value would report them
    pub fn dims(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Get the number of elements in the logical tensor
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the encoding is already full precision
    pub fn is_dense(&self) -> bool {
        self.ggml_type.is_dense()
    }

    /// Get compressed size in bytes
    pub fn encoded_size(&self) -> usize {
        self.data.len()
    }

    /// Encoded size relative to the same tensor stored as f32
    pub fn compression_ratio(&self) -> f32 {
        self.encoded_size() as f32 / (self.elem_count() * 4).max(1) as f32
    }

    pub fn pending_patches(&self) -> &[PendingPatch] {
        &self.patches
    }

    /// Queue a merge to run after dequantization. The encoded bytes are never touched.
    pub fn enqueue_patch(&mut self, patch: PendingPatch) {
        tracing::trace!("Deferring {} patches for {}", patch.patches().len(), self.name);
        self.patches.push(patch);
    }

    /// Decode the payload, ignoring pending patches
    pub fn dequantize(&self, device: &Device) -> crate::Result<Tensor> {
        let dequantizer = dequantizer_for(self.ggml_type).ok_or_else(|| {
            crate::GgufError::UnsupportedQuantization {
                tensor: self.name.clone(),
                qtype: self.ggml_type.to_string(),
            }
        })?;
        dequantizer.dequantize(self.data.as_bytes(), &self.shape, device)
    }

    /// Decode the payload and replay pending patches in the order they were queued.
    ///
    /// The queue is left in place, so repeated calls return equal results.
    pub fn materialize(&self, device: &Device) -> crate::Result<Tensor> {
        let mut tensor = self.dequantize(device)?;
        for patch in &self.patches {
            tensor = patch.apply(tensor, device)?;
        }
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::test_util::{f16_bytes, f32_bytes, q8_0_bytes};
    use crate::model::NativeMerge;
    use candle_core::DType;

    fn q8_weight(name: &str) -> QuantizedTensor {
        let quants: Vec<i8> = (0..64).map(|i| (i % 7) as i8 - 3).collect();
        QuantizedTensor::new(name, RawData::from_vec(q8_0_bytes(0.25, &quants)), GgmlType::Q8_0, vec![2, 32])
            .unwrap()
    }

    fn diff_patch(value: f32, shape: &[usize]) -> WeightPatch {
        WeightPatch::Diff {
            delta: Tensor::full(value, shape, &Device::Cpu).unwrap(),
            strength: 1.0,
        }
    }

    #[test]
    fn test_from_record_reverses_shape() {
        let record = TensorRecord {
            name: "w".to_string(),
            data: RawData::from_vec(f32_bytes(&[0.0; 6])),
            ggml_type: GgmlType::F32,
            shape: vec![3, 2],
        };
        let qt = QuantizedTensor::from_record(record).unwrap();
        assert_eq!(qt.dims(), &[2, 3]);
        assert_eq!(qt.rank(), 2);
        assert_eq!(qt.elem_count(), 6);
    }

    #[test]
    fn test_rejects_inconsistent_payload() {
        let err = QuantizedTensor::new("w", RawData::from_vec(vec![0u8; 10]), GgmlType::F32, vec![4]).unwrap_err();
        assert!(matches!(err, crate::GgufError::InvalidTensor { .. }));
    }

    #[test]
    fn test_dense_materialize_is_bit_identical() {
        let raw = f16_bytes(&[0.1, -3.5, 7.25, 1e-3]);
        let qt = QuantizedTensor::new("w", RawData::from_vec(raw.clone()), GgmlType::F16, vec![2, 2]).unwrap();

        let tensor = qt.materialize(&Device::Cpu).unwrap();
        assert_eq!(tensor.dtype(), DType::F16);
        let bits: Vec<u8> = tensor
            .flatten_all()
            .unwrap()
            .to_vec1::<half::f16>()
            .unwrap()
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(bits, raw);
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let qt = q8_weight("w");
        let a: Vec<f32> = qt.materialize(&Device::Cpu).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = qt.materialize(&Device::Cpu).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_patches_replay_in_order() {
        let merge: Arc<dyn WeightMerge> = Arc::new(NativeMerge::default());
        let mut qt = q8_weight("w");
        qt.enqueue_patch(PendingPatch::new(merge.clone(), vec![diff_patch(1.0, &[2, 32])], "w"));
        qt.enqueue_patch(PendingPatch::new(
            merge,
            vec![WeightPatch::Diff {
                delta: Tensor::full(2.0f32, (2, 32), &Device::Cpu).unwrap(),
                strength: -0.5,
            }],
            "w",
        ));

        let base: Vec<f32> = qt.dequantize(&Device::Cpu).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let patched: Vec<f32> = qt.materialize(&Device::Cpu).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (b, p) in base.iter().zip(patched) {
            assert_eq!(p, b + 1.0 - 1.0);
        }
        assert_eq!(qt.pending_patches().len(), 2);
    }

    #[test]
    fn test_clone_shares_bytes_but_not_patches() {
        let original = q8_weight("w");
        let mut copy = original.clone();
        copy.enqueue_patch(PendingPatch::new(Arc::new(NativeMerge::default()), vec![diff_patch(1.0, &[2, 32])], "w"));

        assert!(copy.raw_data().same_bytes(original.raw_data()));
        assert_eq!(copy.pending_patches().len(), 1);
        assert!(original.pending_patches().is_empty());
    }

    #[test]
    fn test_q8_1_has_no_decoder() {
        let qt = QuantizedTensor::new("blocks.1.w", RawData::from_vec(vec![0u8; 36]), GgmlType::Q8_1, vec![32])
            .unwrap();

        let err = qt.materialize(&Device::Cpu).unwrap_err();
        assert!(matches!(
            err,
            crate::GgufError::UnsupportedQuantization { ref qtype, .. } if qtype == "Q8_1"
        ));
    }

    #[test]
    fn test_unsupported_quantization() {
        let qt = QuantizedTensor::new("blocks.0.w", RawData::from_vec(vec![0u8; 136]), GgmlType::Iq4Xs, vec![256])
            .unwrap();

        let err = qt.materialize(&Device::Cpu).unwrap_err();
        match err {
            crate::GgufError::UnsupportedQuantization { tensor, qtype } => {
                assert_eq!(tensor, "blocks.0.w");
                assert_eq!(qtype, "IQ4_XS");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
