use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use burn::tensor::Tensor;
use burn_tensor::Shape;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::state::{CacheState, LayerCache};

pub type DefaultBackend = burn::backend::NdArray;
pub type DefaultDevice = burn_ndarray::NdArrayDevice;

fn default_short_filter_length() -> usize {
    4
}

fn default_max_seqlen() -> usize {
    8192
}

fn default_rotary_base() -> f32 {
    10000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TokenizerType {
    #[serde(rename = "CharLevelTokenizer")]
    CharLevel,
    #[serde(rename = "VocabFile")]
    VocabFile,
}

/// Validated run configuration, parsed from a YAML file at startup and
/// read-only afterwards. Unknown keys are rejected rather than silently
/// carried along.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub tokenizer_type: TokenizerType,
    pub vocab_size: usize,
    /// JSON vocabulary file, required for `TokenizerType::VocabFile`.
    #[serde(default)]
    pub vocab_file: Option<PathBuf>,
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    /// Layers at these indices are attention layers; every other layer is a
    /// gated short-convolution layer.
    pub attn_layer_idxs: Vec<usize>,
    #[serde(default = "default_short_filter_length")]
    pub short_filter_length: usize,
    #[serde(default = "default_max_seqlen")]
    pub max_seqlen: usize,
    #[serde(default = "default_rotary_base")]
    pub rotary_base: f32,
    #[serde(default)]
    pub eos_token_id: Option<usize>,
}

impl Config {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| Error::Config {
            reason: format!("cannot open {}: {e}", path.as_ref().display()),
        })?;
        let config: Config =
            serde_yaml::from_reader(BufReader::new(file)).map_err(|e| Error::Config {
                reason: format!("malformed config {}: {e}", path.as_ref().display()),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text).map_err(|e| Error::Config {
            reason: format!("malformed config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(config_error("vocab_size must be positive"));
        }
        if self.n_layers == 0 {
            return Err(config_error("n_layers must be positive"));
        }
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            return Err(config_error("dim must be divisible by n_heads"));
        }
        if self.head_size() % 2 != 0 {
            return Err(config_error("head size must be even for rotary embedding"));
        }
        if self.short_filter_length < 2 {
            return Err(config_error("short_filter_length must be at least 2"));
        }
        if self.max_seqlen == 0 {
            return Err(config_error("max_seqlen must be positive"));
        }
        for pair in self.attn_layer_idxs.windows(2) {
            if pair[1] <= pair[0] {
                return Err(config_error("attn_layer_idxs must be strictly increasing"));
            }
        }
        if let Some(&last) = self.attn_layer_idxs.last() {
            if last >= self.n_layers {
                return Err(config_error("attn_layer_idxs entry out of range"));
            }
        }
        if self.tokenizer_type == TokenizerType::VocabFile && self.vocab_file.is_none() {
            return Err(config_error("vocab_file is required for VocabFile tokenizer"));
        }
        Ok(())
    }

    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn n_attn_layers(&self) -> usize {
        self.attn_layer_idxs.len()
    }

    pub fn n_hyena_layers(&self) -> usize {
        self.n_layers - self.attn_layer_idxs.len()
    }

    pub fn is_attn_layer(&self, layer_id: usize) -> bool {
        self.attn_layer_idxs.contains(&layer_id)
    }

    /// Pre-allocates the per-layer cache arena for one generation session.
    pub fn init_cache(&self, device: &DefaultDevice) -> CacheState {
        let layers = (0..self.n_layers)
            .map(|layer_id| {
                if self.is_attn_layer(layer_id) {
                    LayerCache::Attention {
                        key: Tensor::<DefaultBackend, 2>::zeros(
                            Shape::new([self.max_seqlen, self.dim]),
                            device,
                        ),
                        value: Tensor::<DefaultBackend, 2>::zeros(
                            Shape::new([self.max_seqlen, self.dim]),
                            device,
                        ),
                    }
                } else {
                    LayerCache::Hyena {
                        window: Tensor::<DefaultBackend, 2>::zeros(
                            Shape::new([self.short_filter_length - 1, self.dim]),
                            device,
                        ),
                    }
                }
            })
            .collect();
        CacheState::new(layers, *device)
    }
}

fn config_error(reason: &str) -> Error {
    Error::Config {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_yaml() -> &'static str {
        "tokenizer_type: CharLevelTokenizer\n\
         vocab_size: 256\n\
         dim: 16\n\
         hidden_dim: 32\n\
         n_layers: 4\n\
         n_heads: 2\n\
         attn_layer_idxs: [1, 3]\n"
    }

    #[test]
    fn parses_with_defaults() {
        let config = Config::from_yaml_str(base_yaml()).unwrap();
        assert_eq!(config.tokenizer_type, TokenizerType::CharLevel);
        assert_eq!(config.short_filter_length, 4);
        assert_eq!(config.max_seqlen, 8192);
        assert_eq!(config.n_attn_layers(), 2);
        assert_eq!(config.n_hyena_layers(), 2);
        assert!(config.is_attn_layer(3));
        assert!(!config.is_attn_layer(0));
    }

    #[test]
    fn rejects_unknown_keys() {
        let yaml = format!("{}mystery_knob: 7\n", base_yaml());
        assert!(matches!(
            Config::from_yaml_str(&yaml),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn rejects_unrecognized_tokenizer_type() {
        let yaml = base_yaml().replace("CharLevelTokenizer", "WordPiece");
        assert!(matches!(
            Config::from_yaml_str(&yaml),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_attn_layer() {
        let yaml = base_yaml().replace("[1, 3]", "[1, 9]");
        assert!(matches!(
            Config::from_yaml_str(&yaml),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn vocab_file_tokenizer_requires_path() {
        let yaml = base_yaml().replace("CharLevelTokenizer", "VocabFile");
        assert!(matches!(
            Config::from_yaml_str(&yaml),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn cache_arena_matches_layer_layout() {
        let config = Config::from_yaml_str(base_yaml()).unwrap();
        let device = DefaultDevice::Cpu;
        let cache = config.init_cache(&device);
        assert_eq!(cache.layers.len(), 4);
        assert!(matches!(cache.layers[1], LayerCache::Attention { .. }));
        assert!(matches!(cache.layers[0], LayerCache::Hyena { .. }));
        assert_eq!(cache.seq_len, 0);
    }
}
