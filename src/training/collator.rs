// Padding collator: right-pads a batch to its longest sequence

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};

use super::dataset::TokenizedRecord;

/// One collated batch on the training device
#[derive(Debug)]
pub struct Batch {
    /// `(batch, seq)` u32
    pub input_ids: Tensor,
    /// Real token count per row; the model derives its padding mask from these
    pub lengths: Vec<usize>,
    /// `(batch,)` u32 class indices
    pub labels: Tensor,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.lengths.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaddingCollator {
    pad_token_id: u32,
}

impl PaddingCollator {
    pub fn new(pad_token_id: u32) -> Self {
        Self { pad_token_id }
    }

    pub fn collate(&self, records: &[&TokenizedRecord], device: &Device) -> Result<Batch> {
        if records.is_empty() {
            bail!("cannot collate an empty batch");
        }
        if let Some(i) = records.iter().position(|r| r.is_empty()) {
            bail!("record {} in batch has no tokens", i);
        }

        let seq_len = records.iter().map(|r| r.len()).max().unwrap_or(0);
        let mut ids = Vec::with_capacity(records.len() * seq_len);
        for record in records {
            let pad = seq_len - record.len();
            ids.extend_from_slice(&record.input_ids);
            ids.extend(std::iter::repeat(self.pad_token_id).take(pad));
        }

        let shape = (records.len(), seq_len);
        let labels: Vec<u32> = records.iter().map(|r| r.label).collect();
        Ok(Batch {
            input_ids: Tensor::from_vec(ids, shape, device)?,
            lengths: records.iter().map(|r| r.len()).collect(),
            labels: Tensor::new(labels.as_slice(), device)?,
        })
    }
}
