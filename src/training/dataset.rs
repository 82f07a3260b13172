// Tokenized datasets and the seeded train/validation split

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::ValSetSize;
use crate::errors::ClassifyError;
use crate::models::TextTokenizer;
use crate::task::Example;

/// Seed of the train/validation permutation
pub const SPLIT_SEED: u64 = 42;

/// Token ids plus class index; the text columns are gone by now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedRecord {
    pub input_ids: Vec<u32>,
    pub label: u32,
}

impl TokenizedRecord {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Position of `output` in the label vocabulary
pub fn label_index(labels: &[String], output: &str) -> Result<u32, ClassifyError> {
    labels
        .iter()
        .position(|l| l == output)
        .map(|i| i as u32)
        .ok_or_else(|| ClassifyError::LabelNotFound {
            label: output.to_string(),
            labels: labels.to_vec(),
        })
}

/// Tokenize the example's `input` (truncated, unpadded) and resolve its label
pub fn tokenize_example(
    tokenizer: &TextTokenizer,
    labels: &[String],
    example: &Example,
) -> Result<TokenizedRecord, ClassifyError> {
    let input_ids = tokenizer.encode(&example.input)?;
    let label = label_index(labels, &example.output)?;
    Ok(TokenizedRecord { input_ids, label })
}

/// Train and optional validation partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitData {
    pub train: Vec<TokenizedRecord>,
    pub val: Option<Vec<TokenizedRecord>>,
}

/// Seeded permutation split: the first `test_size` permuted rows become the
/// test partition, the rest (in permuted order) the train partition.
pub fn train_test_split<T>(
    rows: Vec<T>,
    test_size: usize,
    seed: u64,
) -> Result<(Vec<T>, Vec<T>), ClassifyError> {
    if test_size >= rows.len() {
        return Err(ClassifyError::SplitTooLarge {
            requested: test_size,
            available: rows.len(),
        });
    }

    let mut permutation: Vec<usize> = (0..rows.len()).collect();
    permutation.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut slots: Vec<Option<T>> = rows.into_iter().map(Some).collect();
    let mut take = |indices: &[usize]| -> Vec<T> {
        indices.iter().filter_map(|&i| slots[i].take()).collect()
    };
    let test = take(&permutation[..test_size]);
    let train = take(&permutation[test_size..]);
    Ok((train, test))
}

fn shuffle_and_tokenize<F>(
    mut rows: Vec<Example>,
    seed: u64,
    tokenize: &F,
) -> Result<Vec<TokenizedRecord>, ClassifyError>
where
    F: Fn(&Example) -> Result<TokenizedRecord, ClassifyError>,
{
    rows.shuffle(&mut StdRng::seed_from_u64(seed));
    rows.iter().map(tokenize).collect()
}

/// Split, shuffle and tokenize loaded examples.
///
/// With a positive validation size the data is partitioned with `seed`,
/// then each partition is shuffled with its own seed derived from `seed`.
/// Otherwise everything is shuffled into the train partition.
pub fn split_train_data<F>(
    data: Vec<Example>,
    val_set_size: ValSetSize,
    seed: u64,
    tokenize: F,
) -> Result<SplitData, ClassifyError>
where
    F: Fn(&Example) -> Result<TokenizedRecord, ClassifyError>,
{
    let val_rows = val_set_size.rows_for(data.len());
    let train_seed = seed.wrapping_add(1);
    let val_seed = seed.wrapping_add(2);

    if val_set_size.is_enabled() && val_rows > 0 {
        let (train, val) = train_test_split(data, val_rows, seed)?;
        let train = shuffle_and_tokenize(train, train_seed, &tokenize)?;
        let val = shuffle_and_tokenize(val, val_seed, &tokenize)?;
        tracing::info!(train = train.len(), val = val.len(), "Split training data");
        Ok(SplitData {
            train,
            val: Some(val),
        })
    } else {
        let train = shuffle_and_tokenize(data, train_seed, &tokenize)?;
        tracing::info!(train = train.len(), "Using all rows for training, no validation set");
        Ok(SplitData { train, val: None })
    }
}
