//! Integration tests for the strategies and the plugin loop.

use std::sync::{Arc, Mutex};

use candle_core::Device;
use continual_rs::criterion::CrossEntropyLoss;
use continual_rs::evaluation::EvalProtocol;
use continual_rs::model::{layer_params, ContinualModel, SimpleMlp, SimpleMlpConfig};
use continual_rs::optimizer::{OptimizerConfig, StrategyOptimizer};
use continual_rs::plugins::StrategyPlugin;
use continual_rs::scenario::{Experience, Scenario, SplitOptions, SyntheticBlobs};
use continual_rs::strategy::{
    CwrStar, CwrStarOptions, MtNaive, MultiHeadOptions, Naive, StrategyState,
};
use continual_rs::{ContinualError, Result, StrategyConfig};

type Log = Arc<Mutex<Vec<String>>>;

/// Records every hook it sees as `"{name}:{hook}"`.
struct RecordingPlugin {
    name: &'static str,
    log: Log,
}

impl RecordingPlugin {
    fn boxed(name: &'static str, log: &Log) -> Box<dyn StrategyPlugin> {
        Box::new(Self {
            name,
            log: Arc::clone(log),
        })
    }
}

macro_rules! record_hooks {
    ($($hook:ident),* $(,)?) => {
        $(
            fn $hook(&mut self, _state: &mut StrategyState) -> Result<()> {
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("{}:{}", self.name, stringify!($hook)));
                Ok(())
            }
        )*
    };
}

impl StrategyPlugin for RecordingPlugin {
    fn name(&self) -> &str {
        self.name
    }

    record_hooks!(
        before_training,
        adapt_train_dataset,
        before_training_exp,
        before_training_epoch,
        before_training_iteration,
        before_forward,
        after_forward,
        before_backward,
        after_backward,
        before_update,
        after_update,
        after_training_iteration,
        after_training_epoch,
        after_training_exp,
        after_training,
        before_test,
        adapt_test_dataset,
        before_test_exp,
        before_test_iteration,
        before_test_forward,
        after_test_forward,
        after_test_iteration,
        after_test_exp,
        after_test,
    );
}

fn mlp(input_size: usize, num_classes: usize) -> SimpleMlp {
    let config = SimpleMlpConfig {
        input_size,
        hidden_size: 16,
        hidden_layers: 1,
        num_classes,
        dropout: 0.0,
    };
    SimpleMlp::new(&config, &Device::Cpu).unwrap()
}

fn sgd(model: &SimpleMlp) -> StrategyOptimizer {
    OptimizerConfig::sgd(0.1)
        .build(model.var_map().all_vars())
        .unwrap()
}

fn scenario(num_classes: usize, n_experiences: usize, task_labels: bool) -> Scenario {
    let blobs = SyntheticBlobs::new(num_classes, 4, 4.0, 7).unwrap();
    Scenario::class_incremental(
        blobs.sample(6, 1).unwrap(),
        blobs.sample(5, 2).unwrap(),
        n_experiences,
        SplitOptions {
            task_labels,
            ..Default::default()
        },
    )
    .unwrap()
}

fn config(train_mb_size: usize) -> StrategyConfig {
    StrategyConfig {
        train_mb_size,
        train_epochs: 1,
        test_mb_size: Some(100),
        shuffle: false,
        ..Default::default()
    }
}

fn hooks_of(log: &Log, name: &str) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|entry| entry.strip_prefix(&format!("{name}:")).map(str::to_string))
        .collect()
}

#[test]
fn test_naive_forwards_everything() {
    let log = Log::default();
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let plugins = vec![
        RecordingPlugin::boxed("first", &log),
        RecordingPlugin::boxed("second", &log),
    ];

    let strategy = Naive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        Some(EvalProtocol::with_default_metrics()),
        config(3),
        Some(plugins),
    )
    .unwrap();

    assert_eq!(strategy.config(), &config(3));
    assert_eq!(strategy.plugin_names(), vec!["first", "second"]);
    assert_eq!(strategy.model().layer_names(), vec!["features.0", "classifier"]);
    assert_eq!(strategy.optimizer().num_params(), 4);
    assert_eq!(
        strategy.evaluation_protocol().unwrap().metric_names(),
        vec!["accuracy", "loss", "forgetting"]
    );
}

#[test]
fn test_naive_without_plugins() {
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let strategy = Naive::new(model, optimizer, CrossEntropyLoss, None, config(3), None).unwrap();
    assert!(strategy.plugin_names().is_empty());
    assert!(strategy.evaluation_protocol().is_none());
}

#[test]
fn test_mt_naive_default_plugins() {
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let strategy = MtNaive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(3),
        None,
        MultiHeadOptions::default(),
    )
    .unwrap();

    assert_eq!(strategy.plugin_names(), vec!["multi_head"]);
    assert_eq!(strategy.head_options().classifier_field, "classifier");
    assert!(!strategy.head_options().keep_initial_layer);
}

#[test]
fn test_mt_naive_appends_head_plugin_last() {
    let log = Log::default();
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let plugins = vec![RecordingPlugin::boxed("p1", &log), RecordingPlugin::boxed("p2", &log)];

    let strategy = MtNaive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(3),
        Some(plugins),
        MultiHeadOptions {
            classifier_field: "classifier".into(),
            keep_initial_layer: true,
        },
    )
    .unwrap();

    assert_eq!(strategy.plugin_names(), vec!["p1", "p2", "multi_head"]);
    assert!(strategy.head_options().keep_initial_layer);
}

#[test]
fn test_mt_naive_missing_classifier_propagates() {
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let result = MtNaive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(3),
        None,
        MultiHeadOptions {
            classifier_field: "head".into(),
            keep_initial_layer: false,
        },
    );
    assert!(matches!(result, Err(ContinualError::Plugin { .. })));
}

#[test]
fn test_cwr_star_default_plugins() {
    let model = mlp(4, 50);
    let optimizer = sgd(&model);
    let strategy = CwrStar::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(3),
        None,
        CwrStarOptions::new("features.0"),
    )
    .unwrap();

    assert_eq!(strategy.plugin_names(), vec!["cwr_star"]);
    assert_eq!(strategy.cwr_options().second_last_layer_name, "features.0");
    assert_eq!(strategy.cwr_options().num_classes, 50);
}

#[test]
fn test_cwr_star_appends_plugin_last() {
    let log = Log::default();
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let plugins = vec![RecordingPlugin::boxed("p1", &log)];

    let strategy = CwrStar::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(3),
        Some(plugins),
        CwrStarOptions::new("features.0").with_num_classes(4),
    )
    .unwrap();

    assert_eq!(strategy.plugin_names(), vec!["p1", "cwr_star"]);
}

#[test]
fn test_cwr_star_construction_errors_propagate() {
    // The default 50 classes exceed the 4 classifier outputs.
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let result = CwrStar::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(3),
        None,
        CwrStarOptions::new("features.0"),
    );
    assert!(matches!(result, Err(ContinualError::Plugin { .. })));

    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let result = CwrStar::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(3),
        None,
        CwrStarOptions::new("conv5").with_num_classes(4),
    );
    assert!(matches!(result, Err(ContinualError::Plugin { .. })));
}

#[test]
fn test_base_constructor_errors_propagate() {
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let result = MtNaive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(0),
        None,
        MultiHeadOptions::default(),
    );
    assert!(matches!(result, Err(ContinualError::Config(_))));
}

#[test]
fn test_training_hook_order() {
    let log = Log::default();
    let model = mlp(4, 2);
    let optimizer = sgd(&model);
    let mut strategy = Naive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(4),
        Some(vec![RecordingPlugin::boxed("rec", &log)]),
    )
    .unwrap();

    // 12 samples in minibatches of 4
    let scenario = scenario(2, 1, false);
    strategy.train(&scenario.experiences()[0]).unwrap();

    let hooks = hooks_of(&log, "rec");
    let iteration = [
        "before_training_iteration",
        "before_forward",
        "after_forward",
        "before_backward",
        "after_backward",
        "before_update",
        "after_update",
        "after_training_iteration",
    ];
    let mut expected = vec![
        "before_training",
        "adapt_train_dataset",
        "before_training_exp",
        "before_training_epoch",
    ];
    for _ in 0..3 {
        expected.extend(iteration);
    }
    expected.extend(["after_training_epoch", "after_training_exp", "after_training"]);
    assert_eq!(hooks, expected);
}

#[test]
fn test_evaluation_hook_order() {
    let log = Log::default();
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let mut strategy = Naive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(4),
        Some(vec![RecordingPlugin::boxed("rec", &log)]),
    )
    .unwrap();

    let scenario = scenario(4, 2, false);
    let results = strategy.test(scenario.experiences()).unwrap();
    assert_eq!(results.len(), 2);

    let per_experience = [
        "adapt_test_dataset",
        "before_test_exp",
        "before_test_iteration",
        "before_test_forward",
        "after_test_forward",
        "after_test_iteration",
        "after_test_exp",
    ];
    let mut expected = vec!["before_test"];
    expected.extend(per_experience);
    expected.extend(per_experience);
    expected.push("after_test");
    assert_eq!(hooks_of(&log, "rec"), expected);
}

#[test]
fn test_plugins_run_in_sequence_order() {
    let log = Log::default();
    let model = mlp(4, 2);
    let optimizer = sgd(&model);
    let mut strategy = Naive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(100),
        Some(vec![
            RecordingPlugin::boxed("a", &log),
            RecordingPlugin::boxed("b", &log),
        ]),
    )
    .unwrap();

    strategy.train(&scenario(2, 1, false).experiences()[0]).unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log[0], "a:before_training");
    assert_eq!(log[1], "b:before_training");
    assert_eq!(log[log.len() - 2], "a:after_training");
    assert_eq!(log[log.len() - 1], "b:after_training");
}

struct FailingPlugin;

impl StrategyPlugin for FailingPlugin {
    fn name(&self) -> &str {
        "failing"
    }

    fn before_training_exp(&mut self, _state: &mut StrategyState) -> Result<()> {
        Err(ContinualError::plugin("failing", "refused"))
    }
}

#[test]
fn test_plugin_error_aborts_training() {
    let log = Log::default();
    let model = mlp(4, 2);
    let optimizer = sgd(&model);
    let mut strategy = Naive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(4),
        Some(vec![
            Box::new(FailingPlugin) as Box<dyn StrategyPlugin>,
            RecordingPlugin::boxed("after", &log),
        ]),
    )
    .unwrap();

    let err = strategy
        .train(&scenario(2, 1, false).experiences()[0])
        .unwrap_err();
    assert_eq!(err.to_string(), "plugin `failing` failed: refused");

    // The later plugin never saw the failing hook.
    let hooks = hooks_of(&log, "after");
    assert_eq!(hooks, vec!["before_training", "adapt_train_dataset"]);
}

/// Keeps only the first `keep` training samples.
struct TruncateDataset {
    keep: usize,
}

impl StrategyPlugin for TruncateDataset {
    fn name(&self) -> &str {
        "truncate"
    }

    fn adapt_train_dataset(&mut self, state: &mut StrategyState) -> Result<()> {
        if let Some(dataset) = &state.dataset {
            let indices: Vec<usize> = (0..self.keep.min(dataset.len())).collect();
            state.dataset = Some(dataset.subset(&indices)?);
        }
        Ok(())
    }
}

#[test]
fn test_adapted_dataset_is_trained_on() {
    let model = mlp(4, 2);
    let optimizer = sgd(&model);
    let mut strategy = Naive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(2),
        Some(vec![Box::new(TruncateDataset { keep: 4 }) as Box<dyn StrategyPlugin>]),
    )
    .unwrap();

    let summary = strategy.train(&scenario(2, 1, false).experiences()[0]).unwrap();
    assert_eq!(summary.iterations, 2);
}

/// Records `train_exp_counter` as seen at the end of an experience.
struct CounterWatcher {
    seen: Arc<Mutex<Vec<(usize, usize)>>>,
    at_exp_end: usize,
}

impl StrategyPlugin for CounterWatcher {
    fn name(&self) -> &str {
        "counter_watcher"
    }

    fn after_training_exp(&mut self, state: &mut StrategyState) -> Result<()> {
        self.at_exp_end = state.train_exp_counter;
        Ok(())
    }

    fn after_training(&mut self, state: &mut StrategyState) -> Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((self.at_exp_end, state.train_exp_counter));
        Ok(())
    }
}

#[test]
fn test_experience_counter_advances_after_the_experience() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let mut strategy = Naive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(4),
        Some(vec![Box::new(CounterWatcher {
            seen: Arc::clone(&seen),
            at_exp_end: usize::MAX,
        }) as Box<dyn StrategyPlugin>]),
    )
    .unwrap();

    let scenario = scenario(4, 2, false);
    strategy.train_stream(scenario.experiences()).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(0, 1), (1, 2)]);
}

#[test]
fn test_naive_learns_separable_classes() {
    let model = mlp(4, 2);
    let optimizer = OptimizerConfig::sgd(0.05)
        .build(model.var_map().all_vars())
        .unwrap();
    let mut strategy = Naive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        StrategyConfig {
            train_mb_size: 4,
            train_epochs: 20,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    let scenario = scenario(2, 1, false);
    strategy.train(&scenario.experiences()[0]).unwrap();
    let results = strategy.test(scenario.experiences()).unwrap();
    assert!(results[0].accuracy > 0.8, "accuracy {}", results[0].accuracy);
}

fn weights(model: &dyn ContinualModel, layer: &str) -> Vec<Vec<f32>> {
    layer_params(model, layer)
        .unwrap()
        .weight
        .as_tensor()
        .to_vec2()
        .unwrap()
}

#[test]
fn test_cwr_star_freezes_features_after_first_experience() {
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let mut strategy = CwrStar::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(4),
        None,
        CwrStarOptions::new("features.0").with_num_classes(4),
    )
    .unwrap();

    let scenario = scenario(4, 2, false);
    let experiences: &[Experience] = scenario.experiences();

    let initial = weights(strategy.model(), "features.0");
    strategy.train(&experiences[0]).unwrap();
    let after_first = weights(strategy.model(), "features.0");
    assert_ne!(initial, after_first);
    assert!(strategy.state().frozen().is_empty());

    strategy.train(&experiences[1]).unwrap();
    assert_eq!(weights(strategy.model(), "features.0"), after_first);
    assert!(strategy.state().is_frozen("features.0.weight"));
    assert_eq!(strategy.optimizer().num_params(), 2);
}

#[test]
fn test_cwr_star_keeps_rows_of_earlier_classes() {
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let mut strategy = CwrStar::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(4),
        None,
        CwrStarOptions::new("features.0").with_num_classes(4),
    )
    .unwrap();

    let scenario = scenario(4, 2, false);
    strategy.train(&scenario.experiences()[0]).unwrap();
    let first_rows: Vec<Vec<f32>> = weights(strategy.model(), "classifier")[..2].to_vec();

    // Classes 2 and 3 do not touch the consolidated rows of classes 0 and 1.
    strategy.train(&scenario.experiences()[1]).unwrap();
    let rows = weights(strategy.model(), "classifier");
    assert_eq!(rows[..2].to_vec(), first_rows);
}

fn without_training_data(experience: &Experience) -> Experience {
    let mut empty = experience.clone();
    empty.train = experience.train.subset(&[]).unwrap();
    empty
}

#[test]
fn test_empty_experience_is_a_training_error() {
    let log = Log::default();
    let model = mlp(4, 2);
    let optimizer = sgd(&model);
    let mut strategy = Naive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(4),
        Some(vec![RecordingPlugin::boxed("watcher", &log)]),
    )
    .unwrap();

    let scenario = scenario(2, 1, false);
    let result = strategy.train(&without_training_data(&scenario.experiences()[0]));
    assert!(matches!(result, Err(ContinualError::Training(_))));
    assert!(!strategy.state().is_training);
    assert!(strategy.state().dataset.is_none());
    assert_eq!(
        hooks_of(&log, "watcher"),
        vec!["before_training", "adapt_train_dataset"]
    );

    // The strategy is still usable afterwards.
    strategy.train(&scenario.experiences()[0]).unwrap();
    assert_eq!(strategy.state().train_exp_counter, 1);
}

#[test]
fn test_cwr_star_empty_experience_keeps_consolidated_rows() {
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let mut strategy = CwrStar::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(4),
        None,
        CwrStarOptions::new("features.0").with_num_classes(4),
    )
    .unwrap();

    let scenario = scenario(4, 2, false);
    let experiences = scenario.experiences();
    strategy.train(&experiences[0]).unwrap();
    let classifier = weights(strategy.model(), "classifier");
    let features = weights(strategy.model(), "features.0");
    let accuracy = strategy.test(&experiences[..1]).unwrap()[0].accuracy;

    let result = strategy.train(&without_training_data(&experiences[1]));
    assert!(matches!(result, Err(ContinualError::Training(_))));
    assert_eq!(weights(strategy.model(), "classifier"), classifier);
    assert_eq!(weights(strategy.model(), "features.0"), features);
    assert!(!strategy.state().is_training);
    assert!(strategy.state().frozen().is_empty());
    assert_eq!(strategy.state().train_exp_counter, 1);
    assert_eq!(
        strategy.test(&experiences[..1]).unwrap()[0].accuracy,
        accuracy
    );
}

#[test]
fn test_mt_naive_restores_heads_per_task() {
    let model = mlp(4, 4);
    let optimizer = sgd(&model);
    let mut strategy = MtNaive::new(
        model,
        optimizer,
        CrossEntropyLoss,
        None,
        config(4),
        None,
        MultiHeadOptions::default(),
    )
    .unwrap();

    let scenario = scenario(4, 2, true);
    let experiences = scenario.experiences();
    strategy.train(&experiences[0]).unwrap();
    let head0 = weights(strategy.model(), "classifier");

    strategy.train(&experiences[1]).unwrap();
    let head1 = weights(strategy.model(), "classifier");
    assert_ne!(head0, head1);

    // Testing task 0 swaps its head back in, task 1 is active again afterwards.
    strategy.test(&experiences[..1]).unwrap();
    assert_eq!(weights(strategy.model(), "classifier"), head0);
    strategy.test(&experiences[1..]).unwrap();
    assert_eq!(weights(strategy.model(), "classifier"), head1);
}
