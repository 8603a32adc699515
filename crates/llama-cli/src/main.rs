use std::path::PathBuf;

use clap::Parser;
use llama_cli::{generate, GenerateOptions, Overrides, TinyModel, TINY_PIECES};
use llama_gen::LlamaModel;
use tracing_subscriber::EnvFilter;

/// llama-gen demo: token generation against a tiny deterministic model
#[derive(Parser)]
#[command(name = "llama-cli", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Generate text from a prompt using the tiny demo model.
    Generate {
        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// JSON session config. Flags below override its values.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum number of tokens to generate.
        #[arg(short = 'n', long)]
        n_predict: Option<usize>,

        /// Random seed for reproducible sampling.
        #[arg(short, long)]
        seed: Option<u64>,

        /// Sampling temperature (<= 0 selects greedy decoding).
        #[arg(short, long)]
        temperature: Option<f32>,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        top_p: Option<f32>,

        #[arg(long)]
        min_p: Option<f32>,

        /// KV cache size in tokens.
        #[arg(long, default_value_t = 512)]
        ctx_size: usize,

        /// Tokens per decode call while processing the prompt.
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Treat control text such as `</s>` in the prompt as plain text.
        #[arg(long)]
        no_special: bool,
    },
    /// Print the demo vocabulary.
    Vocab,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Generate {
            prompt,
            config,
            n_predict,
            seed,
            temperature,
            top_k,
            top_p,
            min_p,
            ctx_size,
            batch_size,
            no_special,
        } => {
            let options = GenerateOptions {
                prompt,
                config_path: config,
                overrides: Overrides {
                    n_predict,
                    n_batch: batch_size,
                    seed,
                    temperature,
                    top_k,
                    top_p,
                    min_p,
                },
                ctx_size,
                parse_special: !no_special,
            };

            let mut stdout = std::io::stdout().lock();
            match generate(&options, &mut stdout) {
                Ok(result) => {
                    println!();
                    let stats = &result.generation.stats;
                    eprintln!(
                        "[{}] prompt {} tokens in {:.1} ms, generated {} tokens in {:.1} ms ({:.1} tok/s){}",
                        result.generation.reason,
                        stats.prompt_tokens,
                        stats.prompt_time_ms,
                        stats.generated_tokens,
                        stats.decode_time_ms,
                        stats.tokens_per_second,
                        if result.generation.cancelled { ", cancelled" } else { "" },
                    );
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Vocab => {
            let model = TinyModel::new();
            println!("n_vocab: {}", model.n_vocab());
            if let Some(bos) = model.bos_token() {
                println!("bos: {bos}");
            }
            let eos: Vec<_> = (0..model.n_vocab() as i32)
                .filter(|&t| model.is_end_of_generation(t))
                .collect();
            println!("end-of-generation: {eos:?}");
            for piece in TINY_PIECES {
                if let Some(id) = model.vocab().token_for(piece.as_bytes()) {
                    println!("{id:>5} {piece:?}");
                }
            }
        }
    }
}
