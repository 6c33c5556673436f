//! Streaming text generation from the command line
//!
//! Usage:
//!   # Scripted runtime (no model file needed):
//!   cargo run --example generate -- "Hello"
//!   # A scripted model file with a system prompt:
//!   cargo run --example generate -- -m model.json -s "You narrate." "Look around"
//!   # Custom sampling:
//!   cargo run --example generate -- -t 0.8 -p 0.95 -k 20 --seed 7 "Hello"
//!   # Settings from a config file, CLI flags win:
//!   cargo run --example generate -- -c runtime.json -n 64 "Hello"

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;

use cinder::testing::{ScriptedBackend, ScriptedModel};
use cinder::{Backend, Result};
use cinder_runtime::{logging, Runtime, RuntimeConfig};

/// Reply used by the built-in scripted model.
const DEMO_REPLY: &str = "The torch gutters. Somewhere below, water drips on stone. ✓";

/// Streaming generation over the scripted runtime
///
/// Without `--model`, a byte-level scripted model is written to the temp
/// directory and used instead.
#[derive(Parser)]
#[command(name = "generate")]
struct Cli {
    /// Path to a scripted model JSON file
    #[arg(short, long, env = "CINDER_MODEL_PATH")]
    model: Option<PathBuf>,

    /// Runtime config JSON file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Text prompt
    #[arg(default_value = "Hello")]
    prompt: String,

    /// System prompt, wrapped as a ChatML system turn
    #[arg(short, long)]
    system: Option<String>,

    /// Maximum tokens to generate
    #[arg(short = 'n', long)]
    max_tokens: Option<usize>,

    /// Sampling temperature
    #[arg(short, long)]
    temperature: Option<f32>,

    /// Keep only the k most likely tokens (0 = disabled)
    #[arg(short = 'k', long)]
    top_k: Option<i32>,

    /// Nucleus sampling threshold
    #[arg(short = 'p', long)]
    top_p: Option<f32>,

    /// Repetition penalty factor (1.0 = disabled, >1.0 penalises repeated tokens)
    #[arg(short = 'r', long)]
    repeat_penalty: Option<f32>,

    /// RNG seed for sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Context length in tokens
    #[arg(long)]
    n_ctx: Option<usize>,

    /// Runtime worker threads (default: cores - 2, between 1 and 8)
    #[arg(long)]
    threads: Option<usize>,

    /// Parse ChatML markup in the prompt into control tokens
    #[arg(long)]
    format_chat: bool,
}

impl Cli {
    fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_file(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(n) = self.max_tokens {
            config.target_length = n;
        }
        if let Some(t) = self.temperature {
            config.sampling.temperature = t;
        }
        if let Some(k) = self.top_k {
            config.sampling.top_k = k;
        }
        if let Some(p) = self.top_p {
            config.sampling.top_p = p;
        }
        if let Some(r) = self.repeat_penalty {
            config.sampling.repeat_penalty = r;
        }
        if self.seed.is_some() {
            config.sampling.seed = self.seed;
        }
        if let Some(n_ctx) = self.n_ctx {
            config.context.n_ctx = n_ctx;
        }
        if self.threads.is_some() {
            config.context.n_threads = self.threads;
        }
        config.format_chat |= self.format_chat;
        Ok(config)
    }

    fn model_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.model {
            return Ok(path.clone());
        }
        let path = std::env::temp_dir().join("cinder-demo-model.json");
        ScriptedModel::byte_level(DEMO_REPLY).save(&path)?;
        Ok(path)
    }
}

#[allow(clippy::cast_precision_loss)]
fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let config = cli.runtime_config()?;
    let model_path = cli.model_path()?;

    let backend = ScriptedBackend::default();
    backend.init()?;
    println!("Backend: {}", backend.system_info());
    println!("Loading model from: {}", model_path.display());

    let mut runtime = Runtime::load(&backend, &model_path, &config)?;
    println!(
        "Sampling: temperature={}, top_k={}, top_p={}, repeat_penalty={}, seed={:?}",
        config.sampling.temperature,
        config.sampling.top_k,
        config.sampling.top_p,
        config.sampling.repeat_penalty,
        config.sampling.seed,
    );
    runtime.reset_session(cli.system.as_deref());

    println!("{}", cli.prompt);
    let start = Instant::now();
    let mut stdout = io::stdout();
    let completion = runtime.stream(&cli.prompt, |fragment| {
        let _ = write!(stdout, "{fragment}");
        let _ = stdout.flush();
    })?;
    let elapsed = start.elapsed();

    println!();
    if let Some(warning) = completion.capacity_warning {
        println!(
            "Warning: prompt plus budget needs {} tokens, context holds {}",
            warning.required, warning.available
        );
    }
    println!(
        "Generated {} tokens in {:.2}s ({:.1} tokens/sec), finished: {:?}",
        completion.generated_tokens,
        elapsed.as_secs_f64(),
        completion.generated_tokens as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        completion.reason,
    );
    println!("Usage: {}", runtime.usage());

    Ok(())
}
