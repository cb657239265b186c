use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use hyena_rs::checkpoint::{apply_checkpoint, load_reference_logits, TensorMap};
use hyena_rs::config::{Config, DefaultDevice};
use hyena_rs::hyena::{CausalModel, Model};
use hyena_rs::parity::{compare_logits, ComparisonOutcome};
use hyena_rs::tokenizer::Tokenizer;

/// Diffs one forward pass against reference logits produced by an
/// independent implementation. Caching is disabled on this path; the prompt
/// is processed in a single full pass.
#[derive(Parser, Debug)]
#[command(name = "parity", about = "Check forward-pass logits against reference tensors")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long = "config_path")]
    config_path: PathBuf,

    /// Path to a checkpoint file; loaded with partial-match semantics
    #[arg(long = "checkpoint_path")]
    checkpoint_path: Option<PathBuf>,

    /// Path to the prompt file
    #[arg(long = "prompt_file", default_value = "./prompt.txt")]
    prompt_file: PathBuf,

    /// Reference logits file; repeat the flag to compare several references
    #[arg(long = "logits_path")]
    logits_path: Vec<PathBuf>,

    /// Maximum tolerated absolute difference per element
    #[arg(long, default_value_t = 1e-3)]
    tolerance: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();

    let config = Config::from_yaml_file(&args.config_path)
        .with_context(|| format!("loading config {}", args.config_path.display()))?;
    let tokenizer = Tokenizer::from_config(&config)?;

    let device = DefaultDevice::Cpu;
    let mut model = Model::init(&config, &device)?;
    if let Some(path) = &args.checkpoint_path {
        let tensors = TensorMap::load(path)
            .with_context(|| format!("loading checkpoint {}", path.display()))?;
        apply_checkpoint(&mut model, &tensors);
    }
    model.narrow_to_bf16_except_positional();

    let prompt = std::fs::read_to_string(&args.prompt_file)
        .with_context(|| format!("reading prompt {}", args.prompt_file.display()))?;
    let tokens = tokenizer.encode(&prompt)?;
    info!(
        prompt_tokens = tokens.len(),
        vocab_size = model.vocab_size(),
        "running single forward pass"
    );

    let logits = model.forward(&tokens, None)?;

    let mut any_failed = false;
    for path in &args.logits_path {
        let outcome = match load_reference_logits(path) {
            Ok(reference) => compare_logits(logits.view(), &reference, args.tolerance),
            Err(e) => ComparisonOutcome::Skipped {
                reason: e.to_string(),
            },
        };
        match &outcome {
            ComparisonOutcome::Skipped { reason } => {
                warn!(reference = %path.display(), %reason, "comparison skipped");
                println!("{}: skipped ({reason})", path.display());
            }
            ComparisonOutcome::ShapeMismatch { expected, found } => {
                println!(
                    "{}: FAIL shape mismatch, expected at most {expected:?}, found {found:?}",
                    path.display()
                );
            }
            ComparisonOutcome::Compared {
                max_abs_diff,
                worst,
                over_tolerance,
                passed,
            } => {
                let verdict = if *passed { "PASS" } else { "FAIL" };
                println!(
                    "{}: {verdict} max_abs_diff={max_abs_diff:.3e} at position {} vocab {} \
                     ({over_tolerance} elements over tolerance {:.1e})",
                    path.display(),
                    worst.0,
                    worst.1,
                    args.tolerance
                );
            }
        }
        any_failed |= outcome.failed();
    }

    if any_failed {
        std::process::exit(1);
    }
    Ok(())
}
