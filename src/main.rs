use anyhow::{Context as _, Result};
use clap::Parser;
use ner_engine::app::NerRunner;
use ner_engine::envconfig::EngineConfig;
use ner_engine::Context;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ner")]
#[command(about = "Extract named entities from text with a BERT-style token classifier")]
struct Args {
    /// Model file; defaults to NER_MODEL_PATH
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Worker threads per evaluation; defaults to NER_THREADS
    #[arg(short, long)]
    threads: Option<usize>,

    /// Report an error for input longer than the model accepts
    #[arg(long)]
    no_truncate: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Texts to analyze; read one per line from stdin when empty
    text: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let config = EngineConfig::from_env();
    let model_path = args
        .model
        .or(config.model_path)
        .context("no model given; pass --model or set NER_MODEL_PATH")?;
    let ctx = Context::load(&model_path)
        .with_context(|| format!("failed to load {}", model_path.display()))?;

    let runner = NerRunner::new(&ctx)
        .threads(args.threads.unwrap_or(config.threads))
        .truncate(config.truncate && !args.no_truncate);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if args.text.is_empty() {
        for line in io::stdin().lock().lines() {
            emit(&mut out, &runner, &line?)?;
        }
    } else {
        for text in &args.text {
            emit(&mut out, &runner, text)?;
        }
    }
    Ok(())
}

fn emit(out: &mut impl Write, runner: &NerRunner<'_>, text: &str) -> Result<()> {
    let line = match runner.run(text) {
        Ok(entities) => serde_json::to_string(&entities)?,
        Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
    };
    writeln!(out, "{}", line)?;
    Ok(())
}
