//! Continue a prompt with an RWKV-5 checkpoint, printing text as it is
//! generated.
//!
//! ```text
//! rwkv-generate --model rwkv-5-world.safetensors --tokenizer tokenizer.json "The capital of France is"
//! ```

use std::error::Error;
use std::io::{self, Write};
use std::path::PathBuf;
use clap::Parser;
use futures::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;
use teppan::config::{DecayFormat, ModelConfig, SchedulerConfig};
use teppan::driver::{AsyncScheduler, GenerationRequest, Generator};
use teppan::error::SessionError;
use teppan::model::Rwkv;
use teppan::sampler::TypicalSampler;
use teppan::scheduler::{BatchScheduler, Tokenizer};
use teppan::weights::SafeTensorsArchive;
use teppan::Device;

/// Generate text with a batched RWKV-5 runtime
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// `.safetensors` checkpoint
    #[arg(long)]
    model: PathBuf,

    /// `tokenizer.json` in the Hugging Face format
    #[arg(long)]
    tokenizer: PathBuf,

    #[arg(value_name = "PROMPT")]
    prompt: String,

    /// Maximum tokens to generate
    #[arg(short = 'n', long, default_value = "64")]
    max_tokens: usize,

    #[arg(long, default_value = "0.9")]
    temperature: f32,

    #[arg(long, default_value = "0.7")]
    tau: f32,

    /// Stop before any token completing this text; repeatable
    #[arg(long)]
    stop: Vec<String>,

    /// Tokens per prefill pass
    #[arg(long, default_value = "64")]
    chunk: usize,

    /// Block-quantize projections to u8
    #[arg(long)]
    quantize: bool,

    /// The checkpoint stores raw `time_decay` rather than `exp(-exp(x))`
    #[arg(long)]
    raw_decay: bool,

    /// Run on the accelerator (needs the `candle` feature)
    #[arg(long)]
    accelerator: bool,

    #[arg(long)]
    seed: Option<u64>,
}

struct HfTokenizer(tokenizers::Tokenizer);

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, SessionError> {
        self.0
            .encode(text, false)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|e| SessionError::Tokenizer(e.to_string()))
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, SessionError> {
        self.0
            .decode(tokens, false)
            .map_err(|e| SessionError::Tokenizer(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let cli = Cli::parse();

    let tokenizer = tokenizers::Tokenizer::from_file(&cli.tokenizer)?;
    let printer = HfTokenizer(tokenizer.clone());

    let mut config = ModelConfig::default().with_quantize(cli.quantize);
    if cli.raw_decay {
        config = config.with_decay(DecayFormat::Raw);
    }
    if cli.accelerator {
        config = config.with_device(Device::Accelerator);
    }
    let scheduler_config = SchedulerConfig::default()
        .with_max_sessions(1)
        .with_prefill_chunk(cli.chunk)
        .with_default_temperature(cli.temperature)
        .with_default_tau(cli.tau);

    let archive = SafeTensorsArchive::open(&cli.model)?;
    let model = Rwkv::load(&archive, config, 1, scheduler_config.prefill_chunk())?;
    info!(layers = model.layer_count(), vocab = model.vocab_size(), "ready");
    let sampler = match cli.seed {
        Some(seed) => TypicalSampler::from_seed(seed),
        None => TypicalSampler::new(),
    };
    let scheduler = AsyncScheduler::new(BatchScheduler::new(model, HfTokenizer(tokenizer), sampler, scheduler_config));

    let request = GenerationRequest {
        prompt: cli.prompt.clone(),
        max_tokens: cli.max_tokens,
        temperature: None,
        tau: None,
        stop: cli.stop,
    };
    let mut stream = scheduler.run(request).await?;

    print!("{}", cli.prompt);
    let mut tokens = Vec::new();
    let mut printed = 0;
    while let Some(token) = stream.next().await {
        tokens.push(token);
        // decode the whole tail so multi-token characters print once complete
        let text = printer.decode(&tokens)?;
        if text.ends_with('\u{fffd}') {
            continue;
        }
        if let Some(fresh) = text.get(printed..) {
            print!("{fresh}");
            io::stdout().flush()?;
            printed = text.len();
        }
    }
    println!();
    Ok(())
}
