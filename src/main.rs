//! CLI entry point for tactic-trainer-rs.

use std::path::Path;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tactic_trainer_rs::checkpoint::Checkpointer;
use tactic_trainer_rs::encoder::Encoder;
use tactic_trainer_rs::dataset::Dataset;
use tactic_trainer_rs::evaluator::{top_k, Evaluator};
use tactic_trainer_rs::export::{probe_batch, Exporter};
use tactic_trainer_rs::sampler::collate;
use tactic_trainer_rs::scorer::ScorerFactory;
use tactic_trainer_rs::trainer::select_device;
use tactic_trainer_rs::{Result, TacticConfig, Trainer, Vocabulary};

#[derive(Parser)]
#[command(name = "tactic-trainer")]
#[command(about = "Substitution-tactic classifier training pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from checkpoint
        #[arg(long)]
        resume: Option<String>,
    },
    /// Evaluate a checkpoint on the held-out split
    Eval {
        /// Path to configuration file
        config: String,
        /// Checkpoint directory to evaluate
        #[arg(long)]
        checkpoint: String,
        /// Print top-k predictions for this many validation examples
        #[arg(long, default_value_t = 3)]
        show: usize,
    },
    /// Export a checkpoint as an inference artifact
    Export {
        /// Path to configuration file
        config: String,
        /// Checkpoint directory to export
        #[arg(long)]
        checkpoint: String,
        /// Output directory for the artifact
        #[arg(long)]
        output: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = TacticConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Tokenizer: {}", config.encoder.tokenizer_path);
            println!("  Dataset: {}", config.dataset.path);
            println!(
                "  Effective batch: {} x {}",
                config.training.batch_size, config.training.accumulation_steps
            );
        }
        Commands::Train { config, resume } => {
            tracing::info!("Starting training with config: {}", config);
            let config = TacticConfig::from_file(&config)?;
            let mut trainer = Trainer::new(config)?;
            if let Some(checkpoint) = resume {
                trainer.resume_from(checkpoint);
            }
            trainer.train()?;
        }
        Commands::Eval {
            config,
            checkpoint,
            show,
        } => {
            let config = TacticConfig::from_file(&config)?;
            config.validate()?;
            evaluate_checkpoint(&config, Path::new(&checkpoint), show)?;
        }
        Commands::Export {
            config,
            checkpoint,
            output,
        } => {
            let config = TacticConfig::from_file(&config)?;
            config.validate()?;
            export_checkpoint(&config, Path::new(&checkpoint), Path::new(&output))?;
            println!("✓ Artifact exported to: {output}");
        }
        Commands::Init { output } => {
            let mut config = TacticConfig::default();
            config.encoder.tokenizer_path = "tokenizer.json".to_string();
            config.dataset.path = "data/problems.json".to_string();
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}

fn load_vocab(config: &TacticConfig) -> Result<Vocabulary> {
    match &config.vocab_path {
        Some(path) => Vocabulary::from_file(path),
        None => Ok(Vocabulary::default()),
    }
}

fn evaluate_checkpoint(config: &TacticConfig, checkpoint: &Path, show: usize) -> Result<()> {
    let device = select_device();
    let vocab = load_vocab(config)?;
    let encoder = Encoder::from_config(&config.encoder)?;

    let mut scorer = ScorerFactory::build(&config.model, vocab.len(), &device)?;
    let meta = Checkpointer::restore(checkpoint, scorer.as_mut(), &vocab, &config.encoder)?;
    println!(
        "Evaluating {} (epoch {}, step {})",
        checkpoint.display(),
        meta.epoch,
        meta.step
    );

    let dataset = Dataset::load(&config.dataset, config.seed)?;
    let evaluator = Evaluator::new(config.eval.threshold, config.training.batch_size);
    let metrics = evaluator.evaluate(scorer.as_ref(), &dataset.val, &encoder, &vocab, &device)?;

    println!("Examples:        {}", metrics.examples);
    println!("Loss:            {:.4}", metrics.loss);
    println!("Exact match:     {:.4}", metrics.exact_match);
    println!("Micro precision: {:.4}", metrics.micro_precision);
    println!("Micro recall:    {:.4}", metrics.micro_recall);
    println!("Micro F1:        {:.4}", metrics.micro_f1);
    println!("Macro F1:        {:.4}", metrics.macro_f1);

    for example in dataset.val.iter().take(show) {
        let (encoded, _) = encoder.encode_example(example, &vocab)?;
        let batch = collate(&[encoded], 0, &device)?;
        let logits = scorer.forward(&batch)?.detach();
        let probs = candle_nn::ops::sigmoid(&logits)?.to_vec2::<f32>()?;

        let preview: String = example.statement.chars().take(60).collect();
        println!("\n  {preview}...");
        for (label, prob) in top_k(&probs[0], &vocab, 3) {
            println!("    -> {label}: {:.0}%", prob * 100.0);
        }
    }
    Ok(())
}

fn export_checkpoint(config: &TacticConfig, checkpoint: &Path, output: &Path) -> Result<()> {
    let device = select_device();
    let vocab = load_vocab(config)?;
    let encoder = Encoder::from_config(&config.encoder)?;

    let mut scorer = ScorerFactory::build(&config.model, vocab.len(), &device)?;
    Checkpointer::restore(checkpoint, scorer.as_mut(), &vocab, &config.encoder)?;

    let probe = probe_batch(&encoder, &vocab, &device)?;
    Exporter::export(
        scorer.as_ref(),
        &vocab,
        &config.model,
        &config.encoder,
        &probe,
        output,
    )?;
    Ok(())
}
