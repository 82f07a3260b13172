// Model components: device selection, weights resolution, tokenizer,
// LoRA adapters and the Llama sequence classifier

pub mod common;
pub mod download;
pub mod llama_classifier;
pub mod loaders;
pub mod lora;
pub mod tokenizer;

pub use common::{activation_dtype, device_info, get_device_with_preference, DevicePreference};
pub use download::{ModelDownloader, ModelFiles};
pub use llama_classifier::{LlamaConfig, LlamaForSequenceClassification, LoadOptions};
pub use loaders::load_model_tokenizer;
pub use lora::{default_target_modules, LoRAConfig, LoraLinear};
pub use tokenizer::TextTokenizer;
