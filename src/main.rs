use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use hyena_rs::checkpoint::{apply_checkpoint, TensorMap};
use hyena_rs::config::{Config, DefaultDevice};
use hyena_rs::generator::{GenerateOptions, Generator};
use hyena_rs::hyena::Model;
use hyena_rs::sampling::SamplingParams;
use hyena_rs::tokenizer::Tokenizer;

/// Autoregressive text generation with the striped hybrid sequence model.
#[derive(Parser, Debug)]
#[command(name = "hyena_rs", about = "Run the striped hybrid sequence model")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long = "config_path")]
    config_path: PathBuf,

    /// Path to a checkpoint file; loaded with partial-match semantics
    #[arg(long = "checkpoint_path")]
    checkpoint_path: Option<PathBuf>,

    /// Number of tokens to generate
    #[arg(long = "num_tokens", default_value_t = 84)]
    num_tokens: usize,

    /// Path to the prompt file
    #[arg(long = "prompt_file", default_value = "./prompt.txt")]
    prompt_file: PathBuf,

    /// Use key/value and convolution state caching to speed up generation
    #[arg(long = "cached_generation", default_value_t = false)]
    cached_generation: bool,

    #[arg(long, default_value_t = 1.0)]
    temperature: f32,

    #[arg(long = "top_k", default_value_t = 1)]
    top_k: usize,

    #[arg(long = "top_p", default_value_t = 1.0)]
    top_p: f32,

    /// Seed for the session sampling RNG
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();

    let config = Config::from_yaml_file(&args.config_path)
        .with_context(|| format!("loading config {}", args.config_path.display()))?;
    info!(config = ?config, "loaded config");

    let tokenizer = Tokenizer::from_config(&config)?;

    let device = DefaultDevice::Cpu;
    let mut model = Model::init(&config, &device)?;

    if let Some(path) = &args.checkpoint_path {
        let tensors = TensorMap::load(path)
            .with_context(|| format!("loading checkpoint {}", path.display()))?;
        let report = apply_checkpoint(&mut model, &tensors);
        info!(
            matched = report.matched.len(),
            model_only = report.model_only.len(),
            checkpoint_only = report.checkpoint_only.len(),
            "checkpoint loaded"
        );
    }
    model.narrow_to_bf16_except_positional();

    let prompt = std::fs::read_to_string(&args.prompt_file)
        .with_context(|| format!("reading prompt {}", args.prompt_file.display()))?;
    println!("Prompt: {prompt}");

    let sampling = SamplingParams {
        temperature: args.temperature,
        top_k: args.top_k,
        top_p: args.top_p,
    };
    let mut generator =
        Generator::new(&model, &tokenizer, sampling, config.eos_token_id, args.seed);
    let opts = GenerateOptions {
        num_tokens: args.num_tokens,
        cached_generation: args.cached_generation,
        max_seqlen: config.max_seqlen,
        print_generation: true,
    };
    let generation = generator.generate(&prompt, &opts)?;

    println!("\nresult: {}", generation.text);
    Ok(())
}
