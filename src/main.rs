//! CLI entry point for continual-rs.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use continual_rs::config::BenchmarkSource;
use continual_rs::experiment::run_experiment;
use continual_rs::{ExperimentConfig, Result};

#[derive(Parser)]
#[command(name = "continual")]
#[command(about = "Continual-learning strategies with a plugin-driven training loop")]
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
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Experiment preset (naive-mlp, mt-naive-mlp, cwr-star-mlp)
        #[arg(long, default_value = "naive-mlp")]
        preset: String,
    },
    /// Train on every experience and evaluate the stream after each
    Run {
        /// Path to configuration file
        config: String,
        /// Override the output directory
        #[arg(long)]
        output: Option<String>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = ExperimentConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Strategy: {}", config.strategy.name());
            println!(
                "  Model: {} -> {} x {} -> {}",
                config.model.input_size,
                config.model.hidden_layers,
                config.model.hidden_size,
                config.model.num_classes
            );
            match &config.benchmark.source {
                BenchmarkSource::Synthetic { num_classes, .. } => {
                    println!("  Benchmark: synthetic, {num_classes} classes");
                }
                BenchmarkSource::Jsonl { train_path, .. } => {
                    println!("  Benchmark: {train_path}");
                }
            }
            println!("  Experiences: {}", config.benchmark.n_experiences);
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = ExperimentConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Run { config, output } => {
            tracing::info!("Starting experiment with config: {}", config);
            let mut config = ExperimentConfig::from_file(&config)?;
            if output.is_some() {
                config.output_dir = output;
            }

            let report = run_experiment(&config)?;
            println!("✓ Trained on {} experiences", report.training.len());
            if let Some(last) = report.evaluations.last() {
                for result in last {
                    println!(
                        "  Experience {} (task {}): accuracy {:.4}, loss {:.4}",
                        result.experience, result.task_label, result.accuracy, result.loss
                    );
                }
            }
            println!(
                "  Final average accuracy: {:.4}",
                report.final_average_accuracy
            );
            if let Some(dir) = &config.output_dir {
                println!("  Outputs: {dir}");
            }
        }
    }

    Ok(())
}
