// Shared fixtures: a tiny random Llama checkpoint and labelled data on disk

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use llama_classify::config::TaskConfig;
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const HIDDEN: usize = 32;
pub const INTERMEDIATE: usize = 64;
pub const LAYERS: usize = 2;
pub const HEADS: usize = 4;
pub const KV_HEADS: usize = 2;
pub const VOCAB: usize = 16;

pub fn labels() -> Vec<String> {
    vec!["positive".to_string(), "negative".to_string()]
}

/// Write config.json, tokenizer.json and model.safetensors into `dir`
pub fn write_tiny_model(dir: &Path) {
    fs::create_dir_all(dir).unwrap();

    let config = json!({
        "hidden_size": HIDDEN,
        "intermediate_size": INTERMEDIATE,
        "vocab_size": VOCAB,
        "num_hidden_layers": LAYERS,
        "num_attention_heads": HEADS,
        "num_key_value_heads": KV_HEADS,
        "rms_norm_eps": 1e-6,
        "rope_theta": 10000.0,
        "max_position_embeddings": 64
    });
    fs::write(dir.join("config.json"), config.to_string()).unwrap();

    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {
                "<unk>": 0, "<s>": 1, "</s>": 2, "good": 3, "great": 4, "fine": 5,
                "bad": 6, "awful": 7, "poor": 8, "movie": 9, "film": 10
            },
            "unk_token": "<unk>"
        }
    });
    fs::write(dir.join("tokenizer.json"), tokenizer.to_string()).unwrap();

    let dev = Device::Cpu;
    let head_dim = HIDDEN / HEADS;
    let kv = KV_HEADS * head_dim;
    let randn = |shape: (usize, usize)| Tensor::randn(0f32, 0.1, shape, &dev).unwrap();
    let ones = || Tensor::ones(HIDDEN, DType::F32, &dev).unwrap();

    let mut weights: HashMap<String, Tensor> = HashMap::new();
    weights.insert("model.embed_tokens.weight".to_string(), randn((VOCAB, HIDDEN)));
    weights.insert("model.norm.weight".to_string(), ones());
    for i in 0..LAYERS {
        let p = format!("model.layers.{}", i);
        weights.insert(format!("{p}.self_attn.q_proj.weight"), randn((HIDDEN, HIDDEN)));
        weights.insert(format!("{p}.self_attn.k_proj.weight"), randn((kv, HIDDEN)));
        weights.insert(format!("{p}.self_attn.v_proj.weight"), randn((kv, HIDDEN)));
        weights.insert(format!("{p}.self_attn.o_proj.weight"), randn((HIDDEN, HIDDEN)));
        weights.insert(format!("{p}.mlp.gate_proj.weight"), randn((INTERMEDIATE, HIDDEN)));
        weights.insert(format!("{p}.mlp.up_proj.weight"), randn((INTERMEDIATE, HIDDEN)));
        weights.insert(format!("{p}.mlp.down_proj.weight"), randn((HIDDEN, INTERMEDIATE)));
        weights.insert(format!("{p}.input_layernorm.weight"), ones());
        weights.insert(format!("{p}.post_attention_layernorm.weight"), ones());
    }
    candle_core::safetensors::save(&weights, dir.join("model.safetensors")).unwrap();
}

/// `n` labelled rows alternating between the two classes
pub fn examples(n: usize) -> Vec<serde_json::Value> {
    let positive = ["good movie", "great film", "fine movie", "good film"];
    let negative = ["bad movie", "awful film", "poor movie", "bad film"];
    (0..n)
        .map(|i| {
            let (text, label) = if i % 2 == 0 {
                (positive[(i / 2) % positive.len()], "positive")
            } else {
                (negative[(i / 2) % negative.len()], "negative")
            };
            json!({ "instruction": "Classify the review", "input": text, "output": label })
        })
        .collect()
}

pub fn write_jsonl(path: &Path, rows: &[serde_json::Value]) {
    let body: String = rows.iter().map(|r| format!("{}\n", r)).collect();
    fs::write(path, body).unwrap();
}

/// Small, fast CPU configuration
pub fn tiny_config(model_dir: &Path, output_dir: &Path) -> TaskConfig {
    let mut config = TaskConfig::new(model_dir.to_str().unwrap(), labels());
    config.model.max_length = 16;
    config.device.preference = llama_classify::models::DevicePreference::Cpu;
    config.training.per_gpu_train_batch_size = 2;
    config.training.gradient_accumulation_steps = 2;
    config.training.epochs = 2;
    config.training.learning_rate = 1e-3;
    config.training.logging_steps = 1;
    config.training.output_dir = output_dir.to_path_buf();
    config
}
