use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nano_genai::{
    ByteTokenizer, CancellationToken, ChatSession, EngineConfig, GenerationConfig, LLMEngine,
    PerfMetrics, PreemptionMode, Result, StreamEvent, SyntheticBackend,
};

#[derive(Parser, Debug)]
#[command(name = "nano-genai")]
#[command(about = "Continuous-batching generation runtime demo on a synthetic model")]
struct Cli {
    /// Engine configuration (JSON); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tokens per KV cache block
    #[arg(long)]
    block_size: Option<usize>,

    /// Device blocks in the KV cache
    #[arg(long)]
    cache_size: Option<usize>,

    /// Preempt by recomputation instead of swapping
    #[arg(long)]
    recompute: bool,

    /// Seed of the synthetic model
    #[arg(long, default_value = "0")]
    seed: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit requests from several threads and report metrics
    Bench {
        /// Number of requests per producer thread
        #[arg(short, long, default_value = "4")]
        num_requests: usize,

        /// Producer threads
        #[arg(short, long, default_value = "2")]
        producers: usize,

        /// Maximum tokens to generate per request
        #[arg(long, default_value = "32")]
        max_tokens: usize,

        /// Draft tokens per step via prompt lookup (0 disables)
        #[arg(long, default_value = "0")]
        lookup: usize,
    },
    /// Run a multi-turn chat, one turn per message
    Chat {
        /// User messages, in order
        messages: Vec<String>,

        /// System message
        #[arg(short, long)]
        system: Option<String>,

        /// Maximum tokens to generate per turn
        #[arg(long, default_value = "16")]
        max_tokens: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nano_genai=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(block_size) = cli.block_size {
        config.scheduler.block_size = block_size;
    }
    if let Some(cache_size) = cli.cache_size {
        config.scheduler.cache_size = cache_size;
    }
    if cli.recompute {
        config.scheduler.preemption_mode = PreemptionMode::Recompute;
    }

    println!("nano-genai v{}", env!("CARGO_PKG_VERSION"));

    let backend = SyntheticBackend::new(ByteTokenizer::VOCAB_SIZE, cli.seed);
    let engine = LLMEngine::new(Box::new(backend), Arc::new(ByteTokenizer), config)?;

    match cli.command {
        Commands::Bench {
            num_requests,
            producers,
            max_tokens,
            lookup,
        } => bench(engine, num_requests, producers, max_tokens, lookup),
        Commands::Chat {
            messages,
            system,
            max_tokens,
        } => chat(engine, &messages, system.as_deref(), max_tokens),
    }
}

fn bench(
    mut engine: LLMEngine,
    num_requests: usize,
    producers: usize,
    max_tokens: usize,
    lookup: usize,
) -> Result<()> {
    let submitter = engine.submitter();
    let shutdown = CancellationToken::new();
    let engine_shutdown = shutdown.clone();
    let engine_thread = thread::spawn(move || engine.run(engine_shutdown));

    let workers: Vec<_> = (0..producers)
        .map(|producer| {
            let submitter = submitter.clone();
            thread::spawn(move || -> Result<Vec<PerfMetrics>> {
                let config = if lookup > 0 {
                    GenerationConfig::prompt_lookup(max_tokens, lookup, 3)
                } else {
                    GenerationConfig::greedy(max_tokens)
                };
                let handles = (0..num_requests)
                    .map(|i| {
                        let prompt = format!("producer {producer} request {i}: abcabcabc");
                        submitter.submit(prompt, config.clone())
                    })
                    .collect::<Result<Vec<_>>>()?;

                let mut metrics = Vec::with_capacity(handles.len());
                for handle in handles {
                    while let Some(event) = handle.recv() {
                        match event {
                            StreamEvent::Fragment(_) => {}
                            StreamEvent::Finished(output) => {
                                metrics.push(output.metrics);
                                break;
                            }
                            StreamEvent::Error(e) => return Err(e),
                        }
                    }
                }
                Ok(metrics)
            })
        })
        .collect();

    let mut all = Vec::new();
    for worker in workers {
        match worker.join() {
            Ok(metrics) => all.extend(metrics?),
            Err(_) => eprintln!("producer thread panicked"),
        }
    }
    shutdown.cancel();
    match engine_thread.join() {
        Ok(result) => result?,
        Err(_) => eprintln!("engine thread panicked"),
    }

    let generated: usize = all.iter().map(|m| m.num_generated_tokens).sum();
    let mean_ttft = mean(all.iter().filter_map(PerfMetrics::ttft_ms));
    let mean_tpot = mean(all.iter().filter_map(PerfMetrics::mean_tpot_ms));
    info!(requests = all.len(), generated, "bench done");
    println!("requests:       {}", all.len());
    println!("tokens:         {generated}");
    println!("mean ttft (ms): {mean_ttft:.3}");
    println!("mean tpot (ms): {mean_tpot:.3}");
    if lookup > 0 {
        let proposed: usize = all.iter().map(|m| m.num_draft_tokens).sum();
        let accepted: usize = all.iter().map(|m| m.num_accepted_draft_tokens).sum();
        println!("drafts:         {accepted}/{proposed} accepted");
    }
    Ok(())
}

fn chat(
    engine: LLMEngine,
    messages: &[String],
    system: Option<&str>,
    max_tokens: usize,
) -> Result<()> {
    let mut session = ChatSession::new(engine).with_config(GenerationConfig::greedy(max_tokens));
    session.start_chat(system);
    for message in messages {
        println!("> {message}");
        let output = session.generate(message.as_str(), None)?;
        println!("{}", output.output_text.escape_debug());
        println!(
            "  [{} tokens, {} cached, {}]",
            output.output_tokens.len(),
            output.metrics.num_cached_tokens,
            output.finish_reason.as_str()
        );
    }
    session.finish_chat();
    Ok(())
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}
