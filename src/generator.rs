use std::io::{self, Write};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::error::{Error, Result};
use crate::hyena::CausalModel;
use crate::sampling::{sample, SamplingParams};
use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub num_tokens: usize,
    /// Reuse per-layer state across steps instead of reprocessing the full
    /// prefix each step. A performance choice only: with greedy sampling both
    /// modes produce identical sequences.
    pub cached_generation: bool,
    /// Bounds total prompt + generated length. A prompt alone over the limit
    /// is an error; a generation that would run past it stops early.
    pub max_seqlen: usize,
    /// Stream each decoded token to stdout as it is produced. Never affects
    /// the returned sequence.
    pub print_generation: bool,
}

#[derive(Debug, Clone)]
pub struct Generation {
    /// Prompt tokens followed by the generated suffix.
    pub tokens: Vec<usize>,
    pub text: String,
    pub prompt_len: usize,
}

impl Generation {
    pub fn num_generated(&self) -> usize {
        self.tokens.len() - self.prompt_len
    }
}

/// Owns one autoregressive decoding session: the sampling parameters, the
/// stop token, and a seeded session-local RNG. Concurrent sessions get
/// independent generators (and independent caches).
pub struct Generator<'a, M: CausalModel> {
    model: &'a M,
    tokenizer: &'a Tokenizer,
    sampling: SamplingParams,
    stop_token: Option<usize>,
    rng: StdRng,
}

impl<'a, M: CausalModel> Generator<'a, M> {
    pub fn new(
        model: &'a M,
        tokenizer: &'a Tokenizer,
        sampling: SamplingParams,
        stop_token: Option<usize>,
        seed: u64,
    ) -> Self {
        Self {
            model,
            tokenizer,
            sampling,
            stop_token,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn generate(&mut self, prompt_text: &str, opts: &GenerateOptions) -> Result<Generation> {
        self.sampling.validate()?;
        let limit = opts.max_seqlen.min(self.model.max_seqlen());
        let prompt = self.tokenizer.encode(prompt_text)?;
        if prompt.len() > limit {
            return Err(Error::SequenceTooLong {
                len: prompt.len(),
                max: limit,
            });
        }

        let mut tokens = prompt.clone();
        let started = Instant::now();

        if opts.num_tokens > 0 {
            if prompt.is_empty() {
                return Err(Error::InvalidParameter {
                    reason: "prompt must encode to at least one token".to_string(),
                });
            }
            let mut cache = if opts.cached_generation {
                Some(self.model.empty_cache())
            } else {
                None
            };

            // one pass over the full prompt; in cached mode this populates
            // the per-layer state
            let mut logits = self.model.forward(&tokens, cache.as_mut())?;

            for _ in 0..opts.num_tokens {
                if tokens.len() >= limit {
                    break;
                }
                let last_row: Vec<f32> = logits.row(logits.nrows() - 1).to_vec();
                let next = sample(&last_row, &self.sampling, &mut self.rng)?;
                tokens.push(next);
                if opts.print_generation {
                    print!("{}", self.tokenizer.decode_token(next)?);
                    io::stdout().flush()?;
                }
                if self.stop_token == Some(next) {
                    break;
                }
                logits = match cache.as_mut() {
                    // cached: only the most recent token rides on the cache
                    Some(cache) => {
                        self.model.forward(&tokens[tokens.len() - 1..], Some(cache))?
                    }
                    // uncached: reprocess the entire sequence so far
                    None => self.model.forward(&tokens, None)?,
                };
            }
        }

        let generated = tokens.len() - prompt.len();
        let elapsed = started.elapsed().as_secs_f32();
        if generated > 0 && elapsed > 0.0 {
            info!(
                generated,
                tokens_per_sec = generated as f32 / elapsed,
                "generation finished"
            );
        }

        let text = self.tokenizer.decode(&tokens)?;
        Ok(Generation {
            prompt_len: prompt.len(),
            tokens,
            text,
        })
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use ndarray::Array2;

    use super::*;
    use crate::config::DefaultDevice;
    use crate::state::CacheState;
    use crate::tokenizer::{CharLevelTokenizer, Tokenizer};

    /// Model stand-in that always favors one token and records the effective
    /// sequence length of every forward call.
    struct ScriptedModel {
        vocab_size: usize,
        max_seqlen: usize,
        favored: usize,
        calls: RefCell<Vec<usize>>,
    }

    impl ScriptedModel {
        fn new(vocab_size: usize, max_seqlen: usize, favored: usize) -> Self {
            Self {
                vocab_size,
                max_seqlen,
                favored,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl CausalModel for ScriptedModel {
        fn forward(
            &self,
            tokens: &[usize],
            cache: Option<&mut CacheState>,
        ) -> crate::error::Result<Array2<f32>> {
            let base = cache.as_ref().map(|c| c.seq_len).unwrap_or(0);
            self.calls.borrow_mut().push(base + tokens.len());
            if let Some(cache) = cache {
                for _ in tokens {
                    cache.advance();
                }
            }
            let mut logits = Array2::zeros((tokens.len(), self.vocab_size));
            for mut row in logits.rows_mut() {
                row[self.favored] = 1.0;
            }
            Ok(logits)
        }

        fn empty_cache(&self) -> CacheState {
            CacheState::new(Vec::new(), DefaultDevice::Cpu)
        }

        fn vocab_size(&self) -> usize {
            self.vocab_size
        }

        fn max_seqlen(&self) -> usize {
            self.max_seqlen
        }
    }

    fn char_tokenizer() -> Tokenizer {
        Tokenizer::CharLevel(CharLevelTokenizer::new(256))
    }

    fn opts(num_tokens: usize, cached: bool, max_seqlen: usize) -> GenerateOptions {
        GenerateOptions {
            num_tokens,
            cached_generation: cached,
            max_seqlen,
            print_generation: false,
        }
    }

    #[test]
    fn zero_tokens_returns_prompt_unchanged() {
        let model = ScriptedModel::new(256, 64, 100);
        let tokenizer = char_tokenizer();
        let mut generator =
            Generator::new(&model, &tokenizer, SamplingParams::default(), None, 1);
        let generation = generator.generate("AB", &opts(0, false, 64)).unwrap();
        assert_eq!(generation.tokens, vec![65, 66]);
        assert_eq!(generation.num_generated(), 0);
        assert!(model.calls.borrow().is_empty());
    }

    #[test]
    fn uncached_reprocesses_growing_prefixes() {
        let model = ScriptedModel::new(256, 64, 100);
        let tokenizer = char_tokenizer();
        let mut generator =
            Generator::new(&model, &tokenizer, SamplingParams::default(), None, 1);
        let generation = generator.generate("abc", &opts(5, false, 64)).unwrap();
        assert_eq!(generation.tokens.len(), 8);
        // the prompt pass, then one full reprocess per generated token
        assert_eq!(*model.calls.borrow(), vec![3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn cached_steps_feed_single_tokens() {
        let model = ScriptedModel::new(256, 64, 100);
        let tokenizer = char_tokenizer();
        let mut generator =
            Generator::new(&model, &tokenizer, SamplingParams::default(), None, 1);
        let generation = generator.generate("abc", &opts(5, true, 64)).unwrap();
        assert_eq!(generation.tokens.len(), 8);
        // effective lengths match the uncached mode; each step carries one token
        assert_eq!(*model.calls.borrow(), vec![3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn stop_token_halts_immediately() {
        let model = ScriptedModel::new(256, 64, 7);
        let tokenizer = char_tokenizer();
        let mut generator =
            Generator::new(&model, &tokenizer, SamplingParams::default(), Some(7), 1);
        let generation = generator.generate("abc", &opts(5, false, 64)).unwrap();
        assert_eq!(generation.num_generated(), 1);
        assert_eq!(*generation.tokens.last().unwrap(), 7);
    }

    #[test]
    fn generation_stops_at_max_seqlen() {
        let model = ScriptedModel::new(256, 64, 100);
        let tokenizer = char_tokenizer();
        let mut generator =
            Generator::new(&model, &tokenizer, SamplingParams::default(), None, 1);
        let generation = generator.generate("abc", &opts(10, false, 5)).unwrap();
        assert_eq!(generation.tokens.len(), 5);
    }

    #[test]
    fn oversized_prompt_is_rejected() {
        let model = ScriptedModel::new(256, 64, 100);
        let tokenizer = char_tokenizer();
        let mut generator =
            Generator::new(&model, &tokenizer, SamplingParams::default(), None, 1);
        assert!(matches!(
            generator.generate("abcdef", &opts(1, false, 4)),
            Err(Error::SequenceTooLong { len: 6, max: 4 })
        ));
    }

    #[test]
    fn greedy_cached_and_uncached_agree_on_real_model() {
        use crate::hyena::Model;
        use ndarray::{ArrayD, IxDyn};

        let mut config = crate::hyena::test::tiny_config();
        config.vocab_size = 256;
        let device = DefaultDevice::Cpu;
        let mut model = Model::init(&config, &device).unwrap();
        let shape = model.parameter_shape("token_embedding").unwrap();
        let numel: usize = shape.iter().product();
        let embedding = ArrayD::from_shape_vec(
            IxDyn(&shape),
            (0..numel).map(|i| ((i * 53 % 31) as f32 - 15.0) * 0.04).collect(),
        )
        .unwrap();
        model.set_parameter("token_embedding", embedding).unwrap();

        let tokenizer = char_tokenizer();
        let run = |cached: bool| {
            let mut generator =
                Generator::new(&model, &tokenizer, SamplingParams::default(), None, 1);
            generator
                .generate("ab", &opts(6, cached, config.max_seqlen))
                .unwrap()
                .tokens
        };
        assert_eq!(run(true), run(false));
    }
}
