use burn::{
    module::Module,
    nn::{RmsNorm, RmsNormConfig},
    tensor::Tensor,
};
use burn_ndarray::NdArrayTensor;
use burn_tensor::{activation, Data, Shape};
use half::bf16;
use ndarray::{Array2, ArrayD, IxDyn};

use crate::config::{Config, DefaultBackend as B, DefaultDevice};
use crate::error::{Error, Result};
use crate::state::{CacheState, LayerCache};

/// Contract between the decoding loop and a model implementation.
///
/// `forward` returns next-token logits for every input position, shape
/// `(tokens.len(), vocab_size)`. With a cache the positions continue from
/// `cache.seq_len` and the cache is mutated in place; without one the call
/// reprocesses from position zero and leaves no state behind.
pub trait CausalModel {
    fn forward(&self, tokens: &[usize], cache: Option<&mut CacheState>) -> Result<Array2<f32>>;

    /// Fresh pre-allocated cache arena for one generation session.
    fn empty_cache(&self) -> CacheState;

    fn vocab_size(&self) -> usize;

    fn max_seqlen(&self) -> usize;
}

/// Stacked per-layer weights. Attention and hyena layers are grouped
/// separately and indexed by their position within their own group.
#[derive(Debug, Clone, Module)]
pub struct ModelWeights {
    /// (vocab_size, dim); also the tied output head
    pub token_embedding: Tensor<B, 2>,
    /// (n_attn, dim)
    pub attn_rms: Tensor<B, 2>,
    /// (n_attn, dim, dim)
    pub wq: Tensor<B, 3>,
    pub wk: Tensor<B, 3>,
    pub wv: Tensor<B, 3>,
    pub wo: Tensor<B, 3>,
    /// rotary frequencies, (head_size / 2,); kept at full precision
    pub inv_freq: Tensor<B, 1>,
    /// (n_hyena, dim)
    pub hyena_rms: Tensor<B, 2>,
    /// (n_hyena, 2 * dim, dim); rows split into gate and signal halves
    pub in_proj: Tensor<B, 3>,
    /// depthwise causal filters, (n_hyena, short_filter_length, dim);
    /// kept at full precision
    pub short_filter: Tensor<B, 3>,
    /// (n_hyena, dim, dim)
    pub out_proj: Tensor<B, 3>,
    /// (n_layers, dim)
    pub ffn_rms: Tensor<B, 2>,
    /// (n_layers, hidden_dim, dim)
    pub w1: Tensor<B, 3>,
    /// (n_layers, dim, hidden_dim)
    pub w2: Tensor<B, 3>,
    /// (n_layers, hidden_dim, dim)
    pub w3: Tensor<B, 3>,
    /// (dim,)
    pub final_rms: Tensor<B, 1>,
}

pub const PARAMETER_NAMES: &[&str] = &[
    "token_embedding",
    "attn.rms",
    "attn.wq",
    "attn.wk",
    "attn.wv",
    "attn.wo",
    "attn.inv_freq",
    "hyena.rms",
    "hyena.in_proj",
    "hyena.short_filter",
    "hyena.out_proj",
    "ffn.rms",
    "ffn.w1",
    "ffn.w2",
    "ffn.w3",
    "final_rms",
];

#[derive(Debug, Clone, Shrinkwrap)]
pub struct Model {
    #[shrinkwrap(main_field)]
    pub weights: ModelWeights,
    pub config: Config,
    pub rms_norm: RmsNorm<B>,
    pub device: DefaultDevice,
}

impl Model {
    /// Builds the model with initializer weights; a checkpoint is applied on
    /// top via `checkpoint::apply_checkpoint`.
    pub fn init(config: &Config, device: &DefaultDevice) -> Result<Model> {
        config.validate()?;
        let dim = config.dim;
        let hidden_dim = config.hidden_dim;
        let n_layers = config.n_layers;
        let n_attn = config.n_attn_layers();
        let n_hyena = config.n_hyena_layers();
        let head_size = config.head_size();
        let filter_len = config.short_filter_length;

        let inv_freq_values: Vec<f32> = (0..head_size / 2)
            .map(|i| 1.0 / config.rotary_base.powf(2.0 * i as f32 / head_size as f32))
            .collect();
        let inv_freq = Tensor::from_data(
            Data::new(inv_freq_values, Shape::new([head_size / 2])),
            device,
        );

        let weights = ModelWeights {
            token_embedding: Tensor::ones(Shape::new([config.vocab_size, dim]), device),
            attn_rms: Tensor::ones(Shape::new([n_attn, dim]), device),
            wq: Tensor::ones(Shape::new([n_attn, dim, dim]), device),
            wk: Tensor::ones(Shape::new([n_attn, dim, dim]), device),
            wv: Tensor::ones(Shape::new([n_attn, dim, dim]), device),
            wo: Tensor::ones(Shape::new([n_attn, dim, dim]), device),
            inv_freq,
            hyena_rms: Tensor::ones(Shape::new([n_hyena, dim]), device),
            in_proj: Tensor::ones(Shape::new([n_hyena, 2 * dim, dim]), device),
            short_filter: Tensor::ones(Shape::new([n_hyena, filter_len, dim]), device),
            out_proj: Tensor::ones(Shape::new([n_hyena, dim, dim]), device),
            ffn_rms: Tensor::ones(Shape::new([n_layers, dim]), device),
            w1: Tensor::ones(Shape::new([n_layers, hidden_dim, dim]), device),
            w2: Tensor::ones(Shape::new([n_layers, dim, hidden_dim]), device),
            w3: Tensor::ones(Shape::new([n_layers, hidden_dim, dim]), device),
            final_rms: Tensor::ones(Shape::new([dim]), device),
        };

        let rms_norm = RmsNormConfig::new(dim).with_epsilon(1e-5).init::<B>(device);

        Ok(Model {
            weights,
            config: config.clone(),
            rms_norm,
            device: *device,
        })
    }

    pub fn parameter_names(&self) -> Vec<String> {
        PARAMETER_NAMES.iter().map(|name| name.to_string()).collect()
    }

    pub fn parameter_shape(&self, name: &str) -> Option<Vec<usize>> {
        let w = &self.weights;
        let dims: Vec<usize> = match name {
            "token_embedding" => w.token_embedding.dims().to_vec(),
            "attn.rms" => w.attn_rms.dims().to_vec(),
            "attn.wq" => w.wq.dims().to_vec(),
            "attn.wk" => w.wk.dims().to_vec(),
            "attn.wv" => w.wv.dims().to_vec(),
            "attn.wo" => w.wo.dims().to_vec(),
            "attn.inv_freq" => w.inv_freq.dims().to_vec(),
            "hyena.rms" => w.hyena_rms.dims().to_vec(),
            "hyena.in_proj" => w.in_proj.dims().to_vec(),
            "hyena.short_filter" => w.short_filter.dims().to_vec(),
            "hyena.out_proj" => w.out_proj.dims().to_vec(),
            "ffn.rms" => w.ffn_rms.dims().to_vec(),
            "ffn.w1" => w.w1.dims().to_vec(),
            "ffn.w2" => w.w2.dims().to_vec(),
            "ffn.w3" => w.w3.dims().to_vec(),
            "final_rms" => w.final_rms.dims().to_vec(),
            _ => return None,
        };
        Some(dims)
    }

    pub fn parameter_data(&self, name: &str) -> Option<ArrayD<f32>> {
        let w = &self.weights;
        let array = match name {
            "token_embedding" => to_array(w.token_embedding.clone()),
            "attn.rms" => to_array(w.attn_rms.clone()),
            "attn.wq" => to_array(w.wq.clone()),
            "attn.wk" => to_array(w.wk.clone()),
            "attn.wv" => to_array(w.wv.clone()),
            "attn.wo" => to_array(w.wo.clone()),
            "attn.inv_freq" => to_array(w.inv_freq.clone()),
            "hyena.rms" => to_array(w.hyena_rms.clone()),
            "hyena.in_proj" => to_array(w.in_proj.clone()),
            "hyena.short_filter" => to_array(w.short_filter.clone()),
            "hyena.out_proj" => to_array(w.out_proj.clone()),
            "ffn.rms" => to_array(w.ffn_rms.clone()),
            "ffn.w1" => to_array(w.w1.clone()),
            "ffn.w2" => to_array(w.w2.clone()),
            "ffn.w3" => to_array(w.w3.clone()),
            "final_rms" => to_array(w.final_rms.clone()),
            _ => return None,
        };
        Some(array)
    }

    /// Shape-checked write of one named parameter.
    pub fn set_parameter(&mut self, name: &str, value: ArrayD<f32>) -> Result<()> {
        let expected = self.parameter_shape(name).ok_or_else(|| Error::Checkpoint {
            reason: format!("unknown parameter {name}"),
        })?;
        if value.shape() != expected.as_slice() {
            return Err(Error::Checkpoint {
                reason: format!(
                    "parameter {name} expects shape {expected:?}, got {:?}",
                    value.shape()
                ),
            });
        }
        let w = &mut self.weights;
        match name {
            "token_embedding" => w.token_embedding = to_tensor::<2>(value),
            "attn.rms" => w.attn_rms = to_tensor::<2>(value),
            "attn.wq" => w.wq = to_tensor::<3>(value),
            "attn.wk" => w.wk = to_tensor::<3>(value),
            "attn.wv" => w.wv = to_tensor::<3>(value),
            "attn.wo" => w.wo = to_tensor::<3>(value),
            "attn.inv_freq" => w.inv_freq = to_tensor::<1>(value),
            "hyena.rms" => w.hyena_rms = to_tensor::<2>(value),
            "hyena.in_proj" => w.in_proj = to_tensor::<3>(value),
            "hyena.short_filter" => w.short_filter = to_tensor::<3>(value),
            "hyena.out_proj" => w.out_proj = to_tensor::<3>(value),
            "ffn.rms" => w.ffn_rms = to_tensor::<2>(value),
            "ffn.w1" => w.w1 = to_tensor::<3>(value),
            "ffn.w2" => w.w2 = to_tensor::<3>(value),
            "ffn.w3" => w.w3 = to_tensor::<3>(value),
            "final_rms" => w.final_rms = to_tensor::<1>(value),
            _ => {
                return Err(Error::Checkpoint {
                    reason: format!("unknown parameter {name}"),
                })
            }
        }
        Ok(())
    }

    /// Rounds every parameter through bf16 storage precision, keeping the
    /// rotary frequencies and the convolution filters at full precision.
    /// Invoked once after checkpoint load, before inference.
    pub fn narrow_to_bf16_except_positional(&mut self) {
        let device = self.device;
        let w = &mut self.weights;
        w.token_embedding = bf16_round(w.token_embedding.clone(), &device);
        w.attn_rms = bf16_round(w.attn_rms.clone(), &device);
        w.wq = bf16_round(w.wq.clone(), &device);
        w.wk = bf16_round(w.wk.clone(), &device);
        w.wv = bf16_round(w.wv.clone(), &device);
        w.wo = bf16_round(w.wo.clone(), &device);
        w.hyena_rms = bf16_round(w.hyena_rms.clone(), &device);
        w.in_proj = bf16_round(w.in_proj.clone(), &device);
        w.out_proj = bf16_round(w.out_proj.clone(), &device);
        w.ffn_rms = bf16_round(w.ffn_rms.clone(), &device);
        w.w1 = bf16_round(w.w1.clone(), &device);
        w.w2 = bf16_round(w.w2.clone(), &device);
        w.w3 = bf16_round(w.w3.clone(), &device);
        w.final_rms = bf16_round(w.final_rms.clone(), &device);
    }

    fn forward_position(
        &self,
        token: usize,
        position: usize,
        cache: &mut CacheState,
        inv_freq: &[f32],
    ) -> Result<Tensor<B, 1>> {
        let device = &self.device;
        let token_index = Tensor::from_ints([token as i32], device);
        let mut x: Tensor<B, 1> = self
            .token_embedding
            .clone()
            .select(0, token_index)
            .squeeze(0);

        let mut attn_idx = 0;
        let mut hyena_idx = 0;
        for layer_id in 0..self.config.n_layers {
            if self.config.is_attn_layer(layer_id) {
                let (key_cache, value_cache) = match &mut cache.layers[layer_id] {
                    LayerCache::Attention { key, value } => (key, value),
                    LayerCache::Hyena { .. } => return Err(cache_layout_error(layer_id)),
                };
                x = self.attention_block(x, attn_idx, position, key_cache, value_cache, inv_freq);
                attn_idx += 1;
            } else {
                let window = match &mut cache.layers[layer_id] {
                    LayerCache::Hyena { window } => window,
                    LayerCache::Attention { .. } => return Err(cache_layout_error(layer_id)),
                };
                x = self.hyena_block(x, hyena_idx, window);
                hyena_idx += 1;
            }
            x = self.feedforward(x, layer_id);
        }

        let x = self.rms_norm.forward(x) * self.final_rms.clone();
        Ok(self
            .token_embedding
            .clone()
            .matmul(x.unsqueeze_dim(1))
            .squeeze(1))
    }

    fn attention_block(
        &self,
        x: Tensor<B, 1>,
        layer_k: usize,
        position: usize,
        key_cache: &mut Tensor<B, 2>,
        value_cache: &mut Tensor<B, 2>,
        inv_freq: &[f32],
    ) -> Tensor<B, 1> {
        let device = &self.device;
        let dim = self.config.dim;
        let n_heads = self.config.n_heads;
        let head_size = self.config.head_size();
        let layer_index = Tensor::from_ints([layer_k as i32], device);

        let rms_weight: Tensor<B, 1> = self
            .attn_rms
            .clone()
            .select(0, layer_index.clone())
            .squeeze(0);
        let xb = self.rms_norm.forward(x.clone()) * rms_weight;

        let wq: Tensor<B, 2> = self.wq.clone().select(0, layer_index.clone()).squeeze(0);
        let wk: Tensor<B, 2> = self.wk.clone().select(0, layer_index.clone()).squeeze(0);
        let wv: Tensor<B, 2> = self.wv.clone().select(0, layer_index.clone()).squeeze(0);

        let mut q: Tensor<B, 1> = xb
            .clone()
            .unsqueeze_dim::<2>(0)
            .matmul(wq.transpose())
            .squeeze(0);
        let mut k: Tensor<B, 1> = xb
            .clone()
            .unsqueeze_dim::<2>(0)
            .matmul(wk.transpose())
            .squeeze(0);
        let v: Tensor<B, 1> = xb
            .unsqueeze_dim::<2>(0)
            .matmul(wv.transpose())
            .squeeze(0);

        rope(&mut q, n_heads, head_size, position, inv_freq, device);
        rope(&mut k, n_heads, head_size, position, inv_freq, device);

        // record this position's key/value at its absolute slot
        *key_cache = key_cache.clone().slice_assign(
            [position..position + 1, 0..dim],
            k.unsqueeze_dim(0),
        );
        *value_cache = value_cache.clone().slice_assign(
            [position..position + 1, 0..dim],
            v.unsqueeze_dim(0),
        );

        // per-head softmax(Q K^T / sqrt(d)) over the cached prefix
        let mut attended: Tensor<B, 1> = Tensor::zeros(Shape::new([dim]), device);
        for head in 0..n_heads {
            let head_range = head * head_size..(head + 1) * head_size;

            let q_head: Tensor<B, 1> = q.clone().slice([head_range.clone()]);
            let keys: Tensor<B, 2> = key_cache
                .clone()
                .slice([0..position + 1, head_range.clone()]);
            let attn_logits = q_head.unsqueeze().matmul(keys.transpose())
                / (head_size as f32).sqrt();
            let scores = activation::softmax(attn_logits, 1);

            let values: Tensor<B, 2> = value_cache
                .clone()
                .slice([0..position + 1, head_range.clone()]);
            let weighted: Tensor<B, 1> = scores.matmul(values).squeeze(0);
            attended = attended.slice_assign([head_range], weighted);
        }

        let wo: Tensor<B, 2> = self.wo.clone().select(0, layer_index).squeeze(0);
        let out: Tensor<B, 1> = wo.matmul(attended.unsqueeze_dim(1)).squeeze(1);

        // residual connection
        x + out
    }

    fn hyena_block(
        &self,
        x: Tensor<B, 1>,
        layer_k: usize,
        window: &mut Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let device = &self.device;
        let dim = self.config.dim;
        let filter_len = self.config.short_filter_length;
        let layer_index = Tensor::from_ints([layer_k as i32], device);

        let rms_weight: Tensor<B, 1> = self
            .hyena_rms
            .clone()
            .select(0, layer_index.clone())
            .squeeze(0);
        let xb = self.rms_norm.forward(x.clone()) * rms_weight;

        let in_proj: Tensor<B, 2> = self
            .in_proj
            .clone()
            .select(0, layer_index.clone())
            .squeeze(0);
        let uv: Tensor<B, 1> = in_proj.matmul(xb.unsqueeze_dim(1)).squeeze(1);
        let u: Tensor<B, 1> = uv.clone().slice([0..dim]);
        let v: Tensor<B, 1> = uv.slice([dim..2 * dim]);

        // receptive field: the cached window followed by the current input
        let buf = Tensor::cat(vec![window.clone(), v.unsqueeze_dim(0)], 0);
        let filter: Tensor<B, 2> = self
            .short_filter
            .clone()
            .select(0, layer_index.clone())
            .squeeze(0);
        let h: Tensor<B, 1> = (buf.clone() * filter).sum_dim(0).squeeze(0);

        // slide the window forward one position
        *window = buf.slice([1..filter_len, 0..dim]);

        let gated = activation::silu(u) * h;
        let out_proj: Tensor<B, 2> = self.out_proj.clone().select(0, layer_index).squeeze(0);
        let out: Tensor<B, 1> = out_proj.matmul(gated.unsqueeze_dim(1)).squeeze(1);

        x + out
    }

    /// self.w2(F.silu(self.w1(x)) * self.w3(x))
    fn feedforward(&self, x: Tensor<B, 1>, layer_id: usize) -> Tensor<B, 1> {
        let device = &self.device;
        let layer_index = Tensor::from_ints([layer_id as i32], device);

        let rms_weight: Tensor<B, 1> = self
            .ffn_rms
            .clone()
            .select(0, layer_index.clone())
            .squeeze(0);
        let xb = self.rms_norm.forward(x.clone()) * rms_weight;

        let w1: Tensor<B, 2> = self.w1.clone().select(0, layer_index.clone()).squeeze(0);
        let w2: Tensor<B, 2> = self.w2.clone().select(0, layer_index.clone()).squeeze(0);
        let w3: Tensor<B, 2> = self.w3.clone().select(0, layer_index).squeeze(0);

        let hb: Tensor<B, 1> =
            activation::silu(w1.matmul(xb.clone().unsqueeze_dim(1)).squeeze(1));
        let hb2: Tensor<B, 1> = w3.matmul(xb.unsqueeze_dim(1)).squeeze(1);
        let out: Tensor<B, 1> = w2.matmul((hb * hb2).unsqueeze_dim(1)).squeeze(1);

        x + out
    }
}

impl CausalModel for Model {
    fn forward(&self, tokens: &[usize], cache: Option<&mut CacheState>) -> Result<Array2<f32>> {
        let vocab_size = self.config.vocab_size;
        if tokens.is_empty() {
            return Ok(Array2::zeros((0, vocab_size)));
        }

        let mut scratch;
        let cache = match cache {
            Some(cache) => {
                if cache.device != self.device {
                    return Err(Error::DeviceMismatch {
                        expected: format!("{:?}", self.device),
                        found: format!("{:?}", cache.device),
                    });
                }
                cache
            }
            None => {
                // full-prefix reprocessing still needs in-call history
                scratch = self.empty_cache();
                &mut scratch
            }
        };

        let inv_freq: Vec<f32> = self.weights.inv_freq.clone().into_data().value;

        let mut rows: Vec<Tensor<B, 2>> = Vec::with_capacity(tokens.len());
        for &token in tokens {
            let position = cache.seq_len;
            if position >= self.config.max_seqlen {
                return Err(Error::SequenceTooLong {
                    len: position + 1,
                    max: self.config.max_seqlen,
                });
            }
            let logits = self.forward_position(token, position, cache, &inv_freq)?;
            rows.push(logits.unsqueeze_dim(0));
            cache.advance();
        }

        let all: Tensor<B, 2> = Tensor::cat(rows, 0);
        let data = all.into_data();
        Ok(Array2::from_shape_vec((tokens.len(), vocab_size), data.value)
            .expect("logits buffer should match (len, vocab_size)"))
    }

    fn empty_cache(&self) -> CacheState {
        self.config.init_cache(&self.device)
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn max_seqlen(&self) -> usize {
        self.config.max_seqlen
    }
}

/// Applies the rotary rotation in place for each head at the given position.
fn rope(
    x: &mut Tensor<B, 1>,
    n_heads: usize,
    head_size: usize,
    position: usize,
    inv_freq: &[f32],
    device: &DefaultDevice,
) {
    for head in 0..n_heads {
        for i in (0..head_size).step_by(2) {
            let val = position as f32 * inv_freq[i / 2];
            let fcr = val.cos();
            let fci = val.sin();

            let base = head * head_size + i;
            let index = Tensor::from_ints([base as i32], device);
            let prev_val: Tensor<B, 1> = x.clone().select(0, index.clone());
            let next_val: Tensor<B, 1> = x.clone().select(0, index + 1);

            let rotated_prev = prev_val.clone() * fcr - next_val.clone() * fci;
            let rotated_next = prev_val * fci + next_val * fcr;

            *x = x.clone().slice_assign([base..base + 1], rotated_prev);
            *x = x.clone().slice_assign([base + 1..base + 2], rotated_next);
        }
    }
}

fn cache_layout_error(layer_id: usize) -> Error {
    Error::Config {
        reason: format!("cache record at layer {layer_id} does not match the model's layer kinds"),
    }
}

fn to_tensor<const D: usize>(array: ArrayD<f32>) -> Tensor<B, D> {
    Tensor::from_primitive(NdArrayTensor::<f32, D>::new(array.into()))
}

fn to_array<const D: usize>(tensor: Tensor<B, D>) -> ArrayD<f32> {
    let data = tensor.into_data();
    ArrayD::from_shape_vec(IxDyn(&data.shape.dims), data.value)
        .expect("tensor data should match its shape")
}

fn bf16_round<const D: usize>(tensor: Tensor<B, D>, device: &DefaultDevice) -> Tensor<B, D> {
    let data = tensor.into_data();
    let value: Vec<f32> = data
        .value
        .iter()
        .map(|v| bf16::from_f32(*v).to_f32())
        .collect();
    Tensor::from_data(Data::new(value, data.shape), device)
}
