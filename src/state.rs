use burn::tensor::Tensor;

use crate::config::{DefaultBackend as B, DefaultDevice};

/// Cache record for a single layer, indexed by layer number.
#[derive(Debug, Clone)]
pub enum LayerCache {
    /// Attention key/value history, each (max_seqlen, dim); row `p` holds the
    /// projected key/value of the token at absolute position `p`.
    Attention {
        key: Tensor<B, 2>,
        value: Tensor<B, 2>,
    },
    /// Sliding window over the last `short_filter_length - 1` convolution
    /// inputs, (short_filter_length - 1, dim), oldest row first.
    Hyena { window: Tensor<B, 2> },
}

/// Per-session decoding state threaded through successive forward calls.
///
/// One record per layer, pre-allocated up front so decoding steps do not
/// allocate. `seq_len` always equals the number of positions pushed through
/// this cache. Owned exclusively by one generation session; sharing a cache
/// between sessions is not supported.
#[derive(Debug, Clone)]
pub struct CacheState {
    pub layers: Vec<LayerCache>,
    pub seq_len: usize,
    pub device: DefaultDevice,
}

impl CacheState {
    pub fn new(layers: Vec<LayerCache>, device: DefaultDevice) -> Self {
        Self {
            layers,
            seq_len: 0,
            device,
        }
    }

    pub fn advance(&mut self) {
        self.seq_len += 1;
    }
}
