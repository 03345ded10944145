//! End-to-end experiments driven by an [`ExperimentConfig`].

use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::config::{BenchmarkSource, ExperimentConfig, StrategySettings};
use crate::criterion::CrossEntropyLoss;
use crate::dataset::TensorDataset;
use crate::error::{ContinualError, Result};
use crate::evaluation::{EvalProtocol, EvalResults};
use crate::model::{ContinualModel, SimpleMlp};
use crate::scenario::{Scenario, SplitOptions, SyntheticBlobs};
use crate::strategy::{
    BaseStrategy, CwrStar, CwrStarOptions, ExperienceResult, MtNaive, MultiHeadOptions, Naive,
    TrainSummary,
};

/// Everything an experiment produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    /// Strategy name.
    pub strategy: String,
    /// Plugins of the strategy, in execution order.
    pub plugins: Vec<String>,
    /// Order in which classes were introduced.
    pub class_order: Vec<u32>,
    /// One summary per training experience.
    pub training: Vec<TrainSummary>,
    /// Test results on the whole stream after each training experience.
    pub evaluations: Vec<Vec<ExperienceResult>>,
    /// Mean accuracy over the stream after the last experience.
    pub final_average_accuracy: f64,
    /// Records of the evaluation protocol.
    pub metrics: EvalResults,
}

/// Build the model, optimizer and strategy described by `config`.
///
/// Every strategy is evaluated with accuracy, average loss and forgetting.
pub fn build_strategy(config: &ExperimentConfig) -> Result<BaseStrategy> {
    config.validate()?;

    let device = match &config.training.device {
        Some(setting) => setting.resolve()?,
        None => Device::Cpu,
    };
    let model = SimpleMlp::new(&config.model, &device)?;
    tracing::info!(
        "Built model: {} layers, {} parameters",
        model.layer_names().len(),
        model.parameter_count()
    );
    let optimizer = config.optimizer.build(model.var_map().all_vars())?;
    let evaluation = Some(EvalProtocol::with_default_metrics());
    let training = config.training.clone();

    let strategy = match &config.strategy {
        StrategySettings::Naive => {
            Naive::new(model, optimizer, CrossEntropyLoss, evaluation, training, None)?
                .into_inner()
        }
        StrategySettings::MtNaive {
            classifier_field,
            keep_initial_layer,
        } => MtNaive::new(
            model,
            optimizer,
            CrossEntropyLoss,
            evaluation,
            training,
            None,
            MultiHeadOptions {
                classifier_field: classifier_field.clone(),
                keep_initial_layer: *keep_initial_layer,
            },
        )?
        .into_inner(),
        StrategySettings::CwrStar {
            second_last_layer_name,
            num_classes,
        } => CwrStar::new(
            model,
            optimizer,
            CrossEntropyLoss,
            evaluation,
            training,
            None,
            CwrStarOptions::new(second_last_layer_name.clone()).with_num_classes(*num_classes),
        )?
        .into_inner(),
    };

    tracing::info!(
        "Strategy: {} (plugins: {:?})",
        config.strategy.name(),
        strategy.plugin_names()
    );
    Ok(strategy)
}

/// Load or generate the benchmark and split it into experiences.
pub fn build_scenario(config: &ExperimentConfig) -> Result<Scenario> {
    let benchmark = &config.benchmark;
    let (train, test) = match &benchmark.source {
        BenchmarkSource::Synthetic {
            num_classes,
            input_size,
            train_per_class,
            test_per_class,
            separation,
        } => {
            let blobs = SyntheticBlobs::new(*num_classes, *input_size, *separation, benchmark.seed)?;
            (
                blobs.sample(*train_per_class, benchmark.seed.wrapping_add(1))?,
                blobs.sample(*test_per_class, benchmark.seed.wrapping_add(2))?,
            )
        }
        BenchmarkSource::Jsonl {
            train_path,
            test_path,
        } => {
            let train = TensorDataset::from_jsonl(train_path)?;
            let test = TensorDataset::from_jsonl(test_path)?;
            if train.feature_dim() != config.model.input_size {
                return Err(ContinualError::Config(format!(
                    "{} has {} features, model.input_size is {}",
                    train_path,
                    train.feature_dim(),
                    config.model.input_size
                )));
            }
            (train, test)
        }
    };
    tracing::info!(
        "Loaded benchmark: {} train / {} test samples, {} classes",
        train.len(),
        test.len(),
        train.classes().len()
    );

    Scenario::class_incremental(
        train,
        test,
        benchmark.n_experiences,
        SplitOptions {
            task_labels: benchmark.task_labels,
            class_order: benchmark.class_order.clone(),
            seed: Some(benchmark.seed),
        },
    )
}

/// Train on every experience in order, testing on the whole stream after each.
///
/// When `config.output_dir` is set, `report.json` and `model.safetensors` are
/// written there.
pub fn run_experiment(config: &ExperimentConfig) -> Result<ExperimentReport> {
    let scenario = build_scenario(config)?;
    let mut strategy = build_strategy(config)?;

    let mut training = Vec::with_capacity(scenario.len());
    let mut evaluations = Vec::with_capacity(scenario.len());
    for experience in scenario.experiences() {
        training.push(strategy.train(experience)?);
        evaluations.push(strategy.test(scenario.experiences())?);
    }

    let final_average_accuracy = evaluations
        .last()
        .filter(|round| !round.is_empty())
        .map_or(0.0, |round| {
            round.iter().map(|r| r.accuracy).sum::<f64>() / round.len() as f64
        });
    tracing::info!("Final average accuracy: {:.4}", final_average_accuracy);

    let report = ExperimentReport {
        strategy: config.strategy.name().to_string(),
        plugins: strategy
            .plugin_names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        class_order: scenario.class_order().to_vec(),
        training,
        evaluations,
        final_average_accuracy,
        metrics: strategy
            .evaluation_protocol()
            .map(|e| e.results().clone())
            .unwrap_or_default(),
    };

    if let Some(output_dir) = &config.output_dir {
        let output_dir = Path::new(output_dir);
        std::fs::create_dir_all(output_dir)?;
        std::fs::write(
            output_dir.join("report.json"),
            serde_json::to_string_pretty(&report)?,
        )?;
        strategy.save_weights(output_dir.join("model.safetensors"))?;
        tracing::info!("Saved report and weights to: {}", output_dir.display());
    }

    Ok(report)
}
