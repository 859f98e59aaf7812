//! Encoded model input for a single sample.
//!
//! Epistemic foundation:
//! - K_i: Batch size is exactly 1; construction rejects anything else
//! - K_i: Token ids, attention mask and (vision) cross-attention mask always
//!   agree on sequence length, before and after every append
//! - K_i: Appended tensors are created on the device of the existing input

use crate::models::{Result, SieveError};
use candle_core::{DType, Device, Tensor};

/// Cross-attention unit appended per generated token in vision mode.
///
/// The generated token attends to the first two image tiles.
pub const CROSS_ATTENTION_STEP: [u32; 4] = [1, 1, 0, 0];

/// Per-sample sequence state handed from the processor to the classifier.
#[derive(Debug, Clone)]
pub struct EncodedInput {
    /// Token ids, shape `(1, seq)`
    input_ids: Tensor,
    /// Attention mask, shape `(1, seq)`
    attention_mask: Tensor,
    /// Cross-attention mask, shape `(1, seq, 1, 4)` (vision only)
    cross_attention_mask: Option<Tensor>,
}

impl EncodedInput {
    /// Assemble an input from provider tensors, checking shape invariants.
    pub fn new(
        input_ids: Tensor,
        attention_mask: Tensor,
        cross_attention_mask: Option<Tensor>,
    ) -> Result<Self> {
        let (batch, seq) = input_ids.dims2()?;
        if batch != 1 {
            return Err(SieveError::Shape(format!(
                "expected a single sample per input, got batch size {batch}"
            )));
        }

        let mask_dims = attention_mask.dims2()?;
        if mask_dims != (1, seq) {
            return Err(SieveError::Shape(format!(
                "attention mask {mask_dims:?} does not match token ids (1, {seq})"
            )));
        }

        if let Some(cross) = &cross_attention_mask {
            let expected = [1, seq, 1, CROSS_ATTENTION_STEP.len()];
            if cross.dims() != expected {
                return Err(SieveError::Shape(format!(
                    "cross-attention mask {:?} does not match expected {expected:?}",
                    cross.dims()
                )));
            }
        }

        Ok(Self {
            input_ids,
            attention_mask,
            cross_attention_mask,
        })
    }

    /// Build a text-only input from token ids with a full attention mask.
    pub fn from_ids(ids: &[u32], device: &Device) -> Result<Self> {
        let input_ids = Tensor::new(ids, device)?.unsqueeze(0)?;
        let attention_mask = Tensor::ones((1, ids.len()), DType::U32, device)?;
        Self::new(input_ids, attention_mask, None)
    }

    /// Attach a cross-attention mask (vision mode).
    pub fn with_cross_attention_mask(self, mask: Tensor) -> Result<Self> {
        Self::new(self.input_ids, self.attention_mask, Some(mask))
    }

    /// Current sequence length.
    pub fn seq_len(&self) -> usize {
        self.input_ids.dim(1).unwrap_or(0)
    }

    /// Device the input lives on.
    pub fn device(&self) -> &Device {
        self.input_ids.device()
    }

    /// Token ids tensor, shape `(1, seq)`.
    pub fn input_ids(&self) -> &Tensor {
        &self.input_ids
    }

    /// Attention mask tensor, shape `(1, seq)`.
    pub fn attention_mask(&self) -> &Tensor {
        &self.attention_mask
    }

    /// Cross-attention mask tensor, if this is a vision input.
    pub fn cross_attention_mask(&self) -> Option<&Tensor> {
        self.cross_attention_mask.as_ref()
    }

    /// Token ids as a host vector.
    pub fn token_ids(&self) -> Result<Vec<u32>> {
        Ok(self
            .input_ids
            .squeeze(0)?
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?)
    }

    /// Append one token, growing every mask by one position.
    pub fn append_token(&mut self, token: u32) -> Result<()> {
        let device = self.input_ids.device().clone();

        let next = Tensor::new(&[[token]], &device)?.to_dtype(self.input_ids.dtype())?;
        self.input_ids = Tensor::cat(&[&self.input_ids, &next], 1)?;

        let ones = Tensor::ones((1, 1), self.attention_mask.dtype(), &device)?;
        self.attention_mask = Tensor::cat(&[&self.attention_mask, &ones], 1)?;

        if let Some(cross) = &self.cross_attention_mask {
            let step = Tensor::from_slice(
                &CROSS_ATTENTION_STEP[..],
                (1, 1, 1, CROSS_ATTENTION_STEP.len()),
                &device,
            )?
            .to_dtype(cross.dtype())?;
            self.cross_attention_mask = Some(Tensor::cat(&[cross, &step], 1)?);
        }

        Ok(())
    }
}
