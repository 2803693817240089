//! End-to-end pipeline tests: train, checkpoint, evaluate, export.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use candle_core::Device;
use tempfile::TempDir;

use tactic_trainer_rs::checkpoint::Checkpointer;
use tactic_trainer_rs::config::{ModelConfig, TacticConfig};
use tactic_trainer_rs::encoder::Encoder;
use tactic_trainer_rs::evaluator::Evaluator;
use tactic_trainer_rs::export::{probe_batch, Exporter, ROUND_TRIP_TOLERANCE};
use tactic_trainer_rs::sampler::{collate, BatchSampler, PrefetchLoader};
use tactic_trainer_rs::scorer::{bce_with_logits, Scorer, ScorerFactory, TacticClassifier};
use tactic_trainer_rs::{Trainer, Vocabulary};

fn test_config(temp: &TempDir, n_examples: usize) -> TacticConfig {
    let tokenizer_path = temp.path().join("tokenizer.json");
    common::write_tokenizer(&tokenizer_path);
    let store_path = temp.path().join("problems.json");
    common::write_store(&store_path, n_examples);

    let mut config = TacticConfig::default();
    config.encoder.tokenizer_path = tokenizer_path.to_str().unwrap().to_string();
    config.encoder.max_length = 12;
    config.dataset.path = store_path.to_str().unwrap().to_string();
    config.dataset.val_split = 0.2;
    config.model.token_vocab_size = 64;
    config.model.hidden_size = 8;
    config.model.intermediate_size = 12;
    config.training.epochs = 2;
    config.training.batch_size = 4;
    config.training.accumulation_steps = 2;
    config.training.learning_rate = 1e-3;
    config.training.logging_steps = 1000;
    config.selection.checkpoint_interval = 1;
    config.output_dir = temp.path().join("outputs").to_str().unwrap().to_string();
    config.seed = Some(42);
    config
}

#[test]
fn train_checkpoint_evaluate_export_round_trip() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp, 30);
    let output_dir = PathBuf::from(&config.output_dir);

    let mut trainer = Trainer::new(config.clone()).unwrap();
    trainer.train().unwrap();
    assert!(!trainer.metric_history().is_empty());

    // Restore the final checkpoint into a fresh scorer.
    let device = Device::Cpu;
    let vocab = Vocabulary::default();
    let mut scorer = ScorerFactory::build(&config.model, vocab.len(), &device).unwrap();
    let meta = Checkpointer::restore(
        &output_dir.join("checkpoint-final"),
        scorer.as_mut(),
        &vocab,
        &config.encoder,
    )
    .unwrap();
    assert_eq!(meta.vocabulary.len(), 20);
    assert!(meta.step > 0);

    // Evaluate the restored scorer: metrics must be well-formed.
    let encoder = Encoder::from_config(&config.encoder).unwrap();
    let dataset =
        tactic_trainer_rs::dataset::Dataset::load(&config.dataset, config.seed).unwrap();
    let evaluator = Evaluator::new(0.5, 4);
    let metrics = evaluator
        .evaluate(scorer.as_ref(), &dataset.val, &encoder, &vocab, &device)
        .unwrap();
    assert_eq!(metrics.examples, dataset.val.len());
    assert!(metrics.loss.is_finite());
    assert!((0.0..=1.0).contains(&metrics.micro_f1));

    // Export and verify the cross-runtime contract.
    let artifact_dir = temp.path().join("artifact");
    let probe = probe_batch(&encoder, &vocab, &device).unwrap();
    let manifest = Exporter::export(
        scorer.as_ref(),
        &vocab,
        &config.model,
        &config.encoder,
        &probe,
        &artifact_dir,
    )
    .unwrap();
    assert_eq!(manifest.num_labels, 20);

    // A downstream runtime rebuilding from the artifact sees logits within
    // tolerance of the in-memory scorer.
    let (reloaded, artifact_vocab, _) = Exporter::load_artifact(&artifact_dir, &device).unwrap();
    let expected = scorer.forward(&probe).unwrap().to_vec2::<f32>().unwrap();
    let actual = reloaded.forward(&probe).unwrap().to_vec2::<f32>().unwrap();
    for (a, b) in expected[0].iter().zip(actual[0].iter()) {
        assert!((f64::from(*a) - f64::from(*b)).abs() < ROUND_TRIP_TOLERANCE);
    }
    // Position i in the artifact's output means vocabulary[i].
    assert_eq!(artifact_vocab.labels(), vocab.labels());
}

#[test]
fn gradient_accumulation_is_invariant_to_window_size() {
    // batch_size=8, K=1 and batch_size=4, K=2 over the same ordering must
    // produce equivalent gradients: mean-BCE over 8 examples equals the sum
    // of two 1/2-scaled mean-BCEs over the two halves.
    let temp = TempDir::new().unwrap();
    let tokenizer_path = temp.path().join("tokenizer.json");
    common::write_tokenizer(&tokenizer_path);

    let device = Device::Cpu;
    let vocab = Vocabulary::new(["x = 0", "y = 0", "Apply AM-GM"]).unwrap();
    let encoder = Encoder::from_config(&tactic_trainer_rs::config::EncoderConfig {
        tokenizer_path: tokenizer_path.to_str().unwrap().to_string(),
        max_length: 10,
    })
    .unwrap();

    let model_config = ModelConfig {
        token_vocab_size: 32,
        hidden_size: 8,
        intermediate_size: 10,
        pretrained: None,
    };

    // Two classifiers with identical weights via a state round-trip.
    let weights = temp.path().join("init.safetensors");
    let model_a = TacticClassifier::new(&model_config, vocab.len(), &device).unwrap();
    model_a.save_state(&weights).unwrap();
    let mut model_b = TacticClassifier::new(&model_config, vocab.len(), &device).unwrap();
    model_b.load_state(&weights).unwrap();

    let examples: Vec<tactic_trainer_rs::dataset::Example> = (0..8)
        .map(|i| tactic_trainer_rs::dataset::Example {
            statement: format!("problem {i} find all functions"),
            tactics: vec!["x = 0".to_string()],
        })
        .collect();
    let encoded: Vec<_> = examples
        .iter()
        .map(|e| encoder.encode_example(e, &vocab).unwrap().0)
        .collect();

    // K=1: one backward over the full batch of 8.
    let full = collate(&encoded, 0, &device).unwrap();
    let loss_a = bce_with_logits(&model_a.forward(&full).unwrap(), &full.labels).unwrap();
    let grads_a = loss_a.backward().unwrap();

    // K=2: two micro-batches of 4, each loss scaled by 1/2, summed before
    // a single backward.
    let first = collate(&encoded[..4], 0, &device).unwrap();
    let second = collate(&encoded[4..], 0, &device).unwrap();
    let loss_1 = bce_with_logits(&model_b.forward(&first).unwrap(), &first.labels).unwrap();
    let loss_2 = bce_with_logits(&model_b.forward(&second).unwrap(), &second.labels).unwrap();
    let accumulated = (loss_1.affine(0.5, 0.0).unwrap() + loss_2.affine(0.5, 0.0).unwrap()).unwrap();
    let grads_b = accumulated.backward().unwrap();

    // Gradients agree per parameter within floating-point tolerance.
    let data_a = model_a.parameters().data().lock().unwrap();
    let data_b = model_b.parameters().data().lock().unwrap();
    let mut names: Vec<&String> = data_a.keys().collect();
    names.sort();
    assert!(!names.is_empty());
    for name in names {
        let var_a = &data_a[name];
        let var_b = &data_b[name];
        let grad_a = grads_a
            .get(var_a)
            .unwrap_or_else(|| panic!("missing grad for {name}"))
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let grad_b = grads_b
            .get(var_b)
            .unwrap_or_else(|| panic!("missing grad for {name}"))
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(grad_a.len(), grad_b.len());
        for (a, b) in grad_a.iter().zip(grad_b.iter()) {
            assert!(
                (a - b).abs() < 1e-5,
                "gradient mismatch for {name}: {a} vs {b}"
            );
        }
    }
}

#[test]
fn prefetch_loader_matches_direct_encoding() {
    // Batches coming through the prefetch worker are identical to encoding
    // the same permutation inline.
    let temp = TempDir::new().unwrap();
    let tokenizer_path = temp.path().join("tokenizer.json");
    common::write_tokenizer(&tokenizer_path);

    let device = Device::Cpu;
    let vocab = Arc::new(Vocabulary::new(["x = 0", "y = 0"]).unwrap());
    let encoder = Arc::new(
        Encoder::from_config(&tactic_trainer_rs::config::EncoderConfig {
            tokenizer_path: tokenizer_path.to_str().unwrap().to_string(),
            max_length: 8,
        })
        .unwrap(),
    );

    let examples: Arc<Vec<tactic_trainer_rs::dataset::Example>> = Arc::new(
        (0..9)
            .map(|i| tactic_trainer_rs::dataset::Example {
                statement: format!("problem {i} show that"),
                tactics: vec![if i % 2 == 0 { "x = 0" } else { "y = 0" }.to_string()],
            })
            .collect(),
    );

    let sampler = BatchSampler::new(4, Some(11));
    let order = sampler.epoch_order(examples.len(), 0);

    let loader = PrefetchLoader::spawn(
        Arc::clone(&examples),
        order.clone(),
        Arc::clone(&encoder),
        Arc::clone(&vocab),
        4,
        device.clone(),
        2,
    );

    let mut loader_batches = Vec::new();
    while let Some(batch) = loader.next_batch() {
        loader_batches.push(batch.unwrap());
    }

    let direct_batches: Vec<_> = order
        .chunks(4)
        .map(|chunk| {
            let encoded: Vec<_> = chunk
                .iter()
                .map(|&i| encoder.encode_example(&examples[i], &vocab).unwrap().0)
                .collect();
            collate(&encoded, 0, &device).unwrap()
        })
        .collect();

    assert_eq!(loader_batches.len(), direct_batches.len());
    for (a, b) in loader_batches.iter().zip(direct_batches.iter()) {
        assert_eq!(
            a.token_ids.to_vec2::<u32>().unwrap(),
            b.token_ids.to_vec2::<u32>().unwrap()
        );
        assert_eq!(
            a.labels.to_vec2::<f32>().unwrap(),
            b.labels.to_vec2::<f32>().unwrap()
        );
    }
}

#[test]
fn checkpoint_from_smaller_vocabulary_is_rejected_whole() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp, 20);
    config.training.epochs = 1;
    let output_dir = PathBuf::from(&config.output_dir);

    let mut trainer = Trainer::new(config.clone()).unwrap();
    trainer.train().unwrap();

    // A 21-label run must reject the 20-label checkpoint and leave the
    // fresh scorer untouched.
    let device = Device::Cpu;
    let vocab21 = Vocabulary::new((0..21).map(|i| format!("tactic {i}"))).unwrap();
    let mut scorer = ScorerFactory::build(&config.model, 21, &device).unwrap();

    let encoder = Encoder::from_config(&config.encoder).unwrap();
    let probe = probe_batch(&encoder, &vocab21, &device).unwrap();
    let before = scorer.forward(&probe).unwrap().to_vec2::<f32>().unwrap();

    let result = Checkpointer::restore(
        &output_dir.join("checkpoint-final"),
        scorer.as_mut(),
        &vocab21,
        &config.encoder,
    );
    assert!(result.is_err());

    let after = scorer.forward(&probe).unwrap().to_vec2::<f32>().unwrap();
    assert_eq!(before, after);
}
