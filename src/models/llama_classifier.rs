// Llama backbone with a sequence-classification head
//
// Base weights come from safetensors and are never registered as variables,
// so they stay frozen. Everything trainable (LoRA branches and the score
// head) lives in one VarMap, named the way PEFT names its adapter tensors.

use anyhow::{bail, Context, Result};
use candle_core::quantized::{GgmlDType, QMatMul, QTensor};
use candle_core::{DType, Device, IndexOp, Module, Tensor, Var, D};
use candle_nn::{Embedding, Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::lora::{LoRAConfig, LoraLinear};
use crate::errors::ClassifyError;

/// Name of the classification head inside the trainable VarMap
pub const SCORE_WEIGHT: &str = "base_model.model.score.weight";

/// Prefix of decoder layers inside the trainable VarMap
const ADAPTER_LAYER_PREFIX: &str = "base_model.model.model.layers";

/// Additive mask value for blocked attention positions
const MASK_VALUE: f64 = -1e9;

/// Subset of the HF `config.json` the classifier needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open config at {:?}", path))?;
        serde_json::from_reader(file).context("Failed to parse Llama config.json")
    }

    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// How base weights are materialised
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Activation dtype (embeddings and dense projections)
    pub dtype: DType,
    /// Keep projection weights 8-bit quantized (Q8_0)
    pub low_bit: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            dtype: DType::F32,
            low_bit: false,
        }
    }
}

enum BaseWeight {
    Dense {
        weight: Tensor,
        /// Contiguous `weight^T`, filled by `compile`
        transposed: Option<Tensor>,
    },
    Quantized {
        matmul: QMatMul,
        tensor: Arc<QTensor>,
    },
}

/// Frozen projection with an optional LoRA branch
struct Projection {
    name: &'static str,
    in_dim: usize,
    out_dim: usize,
    base: BaseWeight,
    lora: Option<LoraLinear>,
}

impl Projection {
    fn load(
        vb: &VarBuilder,
        name: &'static str,
        in_dim: usize,
        out_dim: usize,
        options: LoadOptions,
    ) -> Result<Self> {
        let weight = vb
            .pp(name)
            .get((out_dim, in_dim), "weight")
            .with_context(|| format!("Failed to load {} weight", name))?;

        let base = if options.low_bit && in_dim % GgmlDType::Q8_0.block_size() == 0 {
            let tensor = Arc::new(QTensor::quantize(&weight.to_dtype(DType::F32)?, GgmlDType::Q8_0)?);
            BaseWeight::Quantized {
                matmul: QMatMul::from_arc(tensor.clone())?,
                tensor,
            }
        } else {
            if options.low_bit {
                tracing::warn!(projection = name, in_dim, "Width not divisible by the Q8_0 block, keeping dense");
            }
            BaseWeight::Dense {
                weight: weight.to_dtype(options.dtype)?,
                transposed: None,
            }
        };

        Ok(Self {
            name,
            in_dim,
            out_dim,
            base,
            lora: None,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let base = match &self.base {
            BaseWeight::Dense {
                transposed: Some(wt),
                ..
            } => xs.broadcast_matmul(wt)?,
            BaseWeight::Dense { weight, .. } => xs.broadcast_matmul(&weight.t()?)?,
            BaseWeight::Quantized { matmul, .. } => {
                matmul.forward(&xs.to_dtype(DType::F32)?)?.to_dtype(xs.dtype())?
            }
        };
        match &self.lora {
            Some(lora) => base + lora.forward(xs, train)?,
            None => Ok(base),
        }
    }

    fn attach_lora(&mut self, config: &LoRAConfig, vb: VarBuilder) -> candle_core::Result<bool> {
        if !config.targets(self.name) {
            return Ok(false);
        }
        self.lora = Some(LoraLinear::new(self.in_dim, self.out_dim, config, vb.pp(self.name))?);
        Ok(true)
    }

    fn compile(&mut self) -> candle_core::Result<()> {
        if let BaseWeight::Dense { weight, transposed } = &mut self.base {
            *transposed = Some(weight.t()?.contiguous()?);
        }
        Ok(())
    }

    fn to_dtype(&mut self, dtype: DType) -> candle_core::Result<()> {
        if let BaseWeight::Dense { weight, transposed } = &mut self.base {
            *weight = weight.to_dtype(dtype)?;
            if let Some(wt) = transposed {
                *wt = wt.to_dtype(dtype)?;
            }
        }
        Ok(())
    }

    fn dequantize(&mut self, dtype: DType, device: &Device) -> candle_core::Result<()> {
        if let BaseWeight::Quantized { tensor, .. } = &self.base {
            let weight = tensor.dequantize(device)?.to_dtype(dtype)?;
            self.base = BaseWeight::Dense {
                weight,
                transposed: None,
            };
        }
        Ok(())
    }
}

/// RMS normalisation, always computed in f32
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(vb: VarBuilder, size: usize, eps: f64) -> Result<Self> {
        let weight = vb.get(size, "weight")?.to_dtype(DType::F32)?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let dtype = xs.dtype();
        let x = xs.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        x.broadcast_mul(&self.weight)?.to_dtype(dtype)
    }
}

/// Precomputed rotary position tables, `(max_positions, head_dim / 2)` in f32
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &LlamaConfig, device: &Device) -> candle_core::Result<Self> {
        let head_dim = config.head_dim();
        let half = head_dim / 2;
        let positions = config.max_position_embeddings;

        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / config.rope_theta.powf(2.0 * i as f64 / head_dim as f64) as f32)
            .collect();
        let mut freqs = Vec::with_capacity(positions * half);
        for pos in 0..positions {
            freqs.extend(inv_freq.iter().map(|f| pos as f32 * f));
        }
        let freqs = Tensor::from_vec(freqs, (positions, half), device)?;

        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Rotate `(batch, heads, seq, head_dim)` queries or keys
    fn apply(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (_b, _h, seq_len, head_dim) = xs.dims4()?;
        let half = head_dim / 2;
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        let cos = Tensor::cat(&[&cos, &cos], D::Minus1)?.to_dtype(xs.dtype())?;
        let sin = Tensor::cat(&[&sin, &sin], D::Minus1)?.to_dtype(xs.dtype())?;

        let x1 = xs.narrow(D::Minus1, 0, half)?;
        let x2 = xs.narrow(D::Minus1, half, half)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

        xs.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
    }
}

struct Attention {
    q_proj: Projection,
    k_proj: Projection,
    v_proj: Projection,
    o_proj: Projection,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig, options: LoadOptions) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads();

        Ok(Self {
            q_proj: Projection::load(&vb, "q_proj", hidden, num_heads * head_dim, options)?,
            k_proj: Projection::load(&vb, "k_proj", hidden, num_kv_heads * head_dim, options)?,
            v_proj: Projection::load(&vb, "v_proj", hidden, num_kv_heads * head_dim, options)?,
            o_proj: Projection::load(&vb, "o_proj", num_heads * head_dim, hidden, options)?,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    fn projections_mut(&mut self) -> [&mut Projection; 4] {
        [&mut self.q_proj, &mut self.k_proj, &mut self.v_proj, &mut self.o_proj]
    }

    fn forward(
        &self,
        xs: &Tensor,
        rope: &RotaryEmbedding,
        mask: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let (b, t, _) = xs.dims3()?;

        let q = self
            .q_proj
            .forward(xs, train)?
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(xs, train)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(xs, train)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rope.apply(&q)?;
        let k = rope.apply(&k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?.to_dtype(DType::F32)?;
        let blocked = mask.broadcast_as(scores.shape())?;
        let fill = Tensor::new(MASK_VALUE as f32, scores.device())?.broadcast_as(scores.shape())?;
        let scores = blocked.where_cond(&fill, &scores)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(v.dtype())?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out, train)
    }
}

struct Mlp {
    gate_proj: Projection,
    up_proj: Projection,
    down_proj: Projection,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &LlamaConfig, options: LoadOptions) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        Ok(Self {
            gate_proj: Projection::load(&vb, "gate_proj", hidden, inter, options)?,
            up_proj: Projection::load(&vb, "up_proj", hidden, inter, options)?,
            down_proj: Projection::load(&vb, "down_proj", inter, hidden, options)?,
        })
    }

    fn projections_mut(&mut self) -> [&mut Projection; 3] {
        [&mut self.gate_proj, &mut self.up_proj, &mut self.down_proj]
    }

    fn forward(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let gate = self.gate_proj.forward(xs, train)?;
        // silu(x) = x / (1 + e^-x)
        let gate = (&gate / (gate.neg()?.exp()? + 1.0)?)?;
        let up = self.up_proj.forward(xs, train)?;
        self.down_proj.forward(&(gate * up)?, train)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig, options: LoadOptions) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config, options)?,
            mlp: Mlp::load(vb.pp("mlp"), config, options)?,
            input_layernorm: RmsNorm::load(vb.pp("input_layernorm"), config.hidden_size, config.rms_norm_eps)?,
            post_attention_layernorm: RmsNorm::load(
                vb.pp("post_attention_layernorm"),
                config.hidden_size,
                config.rms_norm_eps,
            )?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        rope: &RotaryEmbedding,
        mask: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let residual = xs;
        let hidden = self.input_layernorm.forward(xs)?;
        let hidden = (self.self_attn.forward(&hidden, rope, mask, train)? + residual)?;
        let residual = &hidden;
        let out = self.post_attention_layernorm.forward(&hidden)?;
        let out = self.mlp.forward(&out, train)?;
        out + residual
    }

    fn for_each_projection<F>(&mut self, mut f: F) -> candle_core::Result<()>
    where
        F: FnMut(&'static str, &mut Projection) -> candle_core::Result<()>,
    {
        for proj in self.self_attn.projections_mut() {
            f("self_attn", proj)?;
        }
        for proj in self.mlp.projections_mut() {
            f("mlp", proj)?;
        }
        Ok(())
    }
}

/// Llama decoder repurposed as a sequence classifier.
///
/// Logits come from the `score` head applied to the hidden state of the
/// last non-padding token of each sequence (inputs are right padded).
pub struct LlamaForSequenceClassification {
    config: LlamaConfig,
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    score: Tensor,
    rope: RotaryEmbedding,
    num_labels: usize,
    dtype: DType,
    device: Device,
    trainable: VarMap,
    lora: Option<LoRAConfig>,
    use_cache: bool,
    mask_cache: Mutex<HashMap<usize, Tensor>>,
}

impl LlamaForSequenceClassification {
    /// Build from base weights in `vb`. A `score.weight` tensor in the base
    /// checkpoint seeds the head; otherwise it starts from N(0, 0.02).
    pub fn load(
        vb: VarBuilder,
        config: LlamaConfig,
        num_labels: usize,
        options: LoadOptions,
    ) -> Result<Self> {
        if num_labels == 0 {
            bail!(ClassifyError::InvalidConfig("classifier needs at least one label".to_string()));
        }
        if config.hidden_size % config.num_attention_heads != 0
            || config.num_attention_heads % config.num_key_value_heads() != 0
        {
            bail!(ClassifyError::InvalidConfig(format!(
                "inconsistent attention shape: hidden={} heads={} kv_heads={}",
                config.hidden_size,
                config.num_attention_heads,
                config.num_key_value_heads()
            )));
        }

        let device = vb.device().clone();
        let hidden = config.hidden_size;

        let embed_weight = vb
            .get((config.vocab_size, hidden), "model.embed_tokens.weight")
            .context("Failed to load token embeddings")?
            .to_dtype(options.dtype)?;
        let embed_tokens = Embedding::new(embed_weight, hidden);

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        let layers_vb = vb.pp("model.layers");
        for i in 0..config.num_hidden_layers {
            layers.push(
                DecoderLayer::load(layers_vb.pp(i), &config, options)
                    .with_context(|| format!("Failed to load decoder layer {}", i))?,
            );
        }
        let norm = RmsNorm::load(vb.pp("model.norm"), hidden, config.rms_norm_eps)?;

        let mut trainable = VarMap::new();
        let score = {
            let tvb = VarBuilder::from_varmap(&trainable, DType::F32, &device);
            tvb.get_with_hints(
                (num_labels, hidden),
                SCORE_WEIGHT,
                Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
            )?
        };
        if vb.contains_tensor("score.weight") {
            let pretrained = vb.get((num_labels, hidden), "score.weight")?.to_dtype(DType::F32)?;
            trainable.set_one(SCORE_WEIGHT, pretrained)?;
            tracing::debug!("Seeded score head from base checkpoint");
        }

        let rope = RotaryEmbedding::new(&config, &device)?;

        tracing::info!(
            layers = config.num_hidden_layers,
            hidden,
            num_labels,
            dtype = ?options.dtype,
            low_bit = options.low_bit,
            "Built Llama sequence classifier"
        );

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            score,
            rope,
            num_labels,
            dtype: options.dtype,
            device,
            trainable,
            lora: None,
            use_cache: true,
            mask_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Inject LoRA branches into every projection named by `config`
    pub fn apply_adapter(&mut self, config: &LoRAConfig) -> Result<()> {
        if self.lora.is_some() {
            bail!("LoRA adapter already applied");
        }
        let tvb = VarBuilder::from_varmap(&self.trainable, DType::F32, &self.device);
        let mut attached = 0usize;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let layer_vb = tvb.pp(format!("{}.{}", ADAPTER_LAYER_PREFIX, i));
            layer.for_each_projection(|block, proj| {
                if proj.attach_lora(config, layer_vb.pp(block))? {
                    attached += 1;
                }
                Ok(())
            })?;
        }
        if attached == 0 {
            bail!(ClassifyError::InvalidConfig(format!(
                "no projection matches LoRA target modules {:?}",
                config.target_modules
            )));
        }

        tracing::info!(
            adapted_projections = attached,
            rank = config.rank,
            alpha = config.alpha,
            trainable_parameters = self.num_trainable_parameters(),
            "Applied LoRA adapter"
        );
        self.lora = Some(config.clone());
        Ok(())
    }

    /// Layer a trained adapter directory (config + weights) onto the model
    pub fn load_adapter(&mut self, dir: &Path, weights_file: &str) -> Result<()> {
        let config = LoRAConfig::load(dir)?;
        self.apply_adapter(&config)?;
        self.load_trainable(&dir.join(weights_file))
    }

    /// Overwrite all trainable tensors from a safetensors file
    pub fn load_trainable(&mut self, path: &Path) -> Result<()> {
        self.trainable
            .load(path)
            .with_context(|| format!("Failed to load adapter weights from {:?}", path))
    }

    /// Save trainable tensors to `path`
    pub fn save_trainable(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        self.trainable
            .save(path)
            .with_context(|| format!("Failed to save adapter weights to {:?}", path))
    }

    /// Save weights and `adapter_config.json` into `dir`
    pub fn save_adapter(&self, dir: &Path, weights_file: &str) -> Result<()> {
        let config = self
            .lora
            .as_ref()
            .context("No LoRA adapter applied; nothing to save")?;
        config.save(dir)?;
        self.save_trainable(&dir.join(weights_file))?;
        tracing::info!(dir = %dir.display(), "Saved adapter");
        Ok(())
    }

    /// Class logits `(batch, num_labels)` in f32.
    ///
    /// `input_ids` is `(batch, seq)` u32, right padded; `lengths[i]` is the
    /// number of real tokens in row `i`.
    pub fn forward(&self, input_ids: &Tensor, lengths: &[usize], train: bool) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        if lengths.len() != batch {
            bail!("got {} lengths for a batch of {}", lengths.len(), batch);
        }
        if let Some(bad) = lengths.iter().find(|&&l| l == 0 || l > seq_len) {
            bail!("sequence length {} outside 1..={}", bad, seq_len);
        }
        if seq_len > self.config.max_position_embeddings {
            bail!(
                "sequence length {} exceeds max_position_embeddings {}",
                seq_len,
                self.config.max_position_embeddings
            );
        }

        let mask = self.attention_mask(lengths, seq_len)?;
        let mut xs = self.embed_tokens.forward(input_ids)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &self.rope, &mask, train)?;
        }
        let xs = self.norm.forward(&xs)?;

        let pooled = lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| xs.i((i, len - 1)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let pooled = Tensor::stack(&pooled, 0)?.to_dtype(DType::F32)?;

        Ok(pooled.matmul(&self.score.t()?)?)
    }

    /// Index of the highest-scoring class for one unpadded sequence
    pub fn predict(&self, input_ids: &[u32]) -> Result<usize> {
        let ids = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let logits = self.forward(&ids, &[input_ids.len()], false)?.detach();
        let index = logits.argmax(D::Minus1)?.squeeze(0)?.to_scalar::<u32>()?;
        Ok(index as usize)
    }

    /// `(batch, 1, seq, seq)` u8 mask, 1 where a key must be ignored
    fn attention_mask(&self, lengths: &[usize], seq_len: usize) -> Result<Tensor> {
        let unpadded = lengths.iter().all(|&l| l == seq_len);
        if self.use_cache && unpadded && lengths.len() == 1 {
            let mut cache = self
                .mask_cache
                .lock()
                .map_err(|_| anyhow::anyhow!("attention mask cache poisoned"))?;
            if let Some(mask) = cache.get(&seq_len) {
                return Ok(mask.clone());
            }
            let mask = build_mask(lengths, seq_len, &self.device)?;
            cache.insert(seq_len, mask.clone());
            return Ok(mask);
        }
        Ok(build_mask(lengths, seq_len, &self.device)?)
    }

    /// Enable or disable memoised attention masks
    pub fn set_use_cache(&mut self, use_cache: bool) {
        self.use_cache = use_cache;
        if !use_cache {
            if let Ok(mut cache) = self.mask_cache.lock() {
                cache.clear();
            }
        }
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache
    }

    /// Ahead-of-time preparation: pre-transpose dense projection weights
    pub fn compile(&mut self) -> Result<()> {
        for layer in &mut self.layers {
            layer.for_each_projection(|_, proj| proj.compile())?;
        }
        tracing::info!("Prepared contiguous transposed projection weights");
        Ok(())
    }

    /// Cast embeddings and dense projections (quantized weights stay as they are)
    pub fn to_dtype(&mut self, dtype: DType) -> Result<()> {
        if dtype == self.dtype {
            return Ok(());
        }
        let weight = self.embed_tokens.embeddings().to_dtype(dtype)?;
        self.embed_tokens = Embedding::new(weight, self.config.hidden_size);
        for layer in &mut self.layers {
            layer.for_each_projection(|_, proj| proj.to_dtype(dtype))?;
        }
        self.dtype = dtype;
        Ok(())
    }

    /// Replace quantized projections with frozen dense weights in the
    /// activation dtype so gradients flow through every layer. Norms, the
    /// score head and adapters are already f32.
    pub fn prepare_for_low_bit_training(&mut self) -> Result<()> {
        let dtype = self.dtype;
        let device = self.device.clone();
        let mut converted = 0usize;
        for layer in &mut self.layers {
            layer.for_each_projection(|_, proj| {
                if matches!(proj.base, BaseWeight::Quantized { .. }) {
                    converted += 1;
                }
                proj.dequantize(dtype, &device)
            })?;
        }
        tracing::info!(converted, dtype = ?dtype, "Prepared quantized model for training");
        Ok(())
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.trainable.all_vars()
    }

    pub fn num_trainable_parameters(&self) -> usize {
        self.trainable
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn lora_config(&self) -> Option<&LoRAConfig> {
        self.lora.as_ref()
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

fn build_mask(lengths: &[usize], seq_len: usize, device: &Device) -> candle_core::Result<Tensor> {
    let mut data = Vec::with_capacity(lengths.len() * seq_len * seq_len);
    for &len in lengths {
        for query in 0..seq_len {
            for key in 0..seq_len {
                data.push(u8::from(key > query || key >= len));
            }
        }
    }
    Tensor::from_vec(data, (lengths.len(), 1, seq_len, seq_len), device)
}
