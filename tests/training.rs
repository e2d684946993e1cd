use candle_core::{Device, Tensor};
use image::{Rgb, RgbImage};
use std::fs;
use std::path::Path;

use concept_tuner::error::ConfigError;
use concept_tuner::models::tiny::{TinyConfig, TinySource};
use concept_tuner::models::Component;
use concept_tuner::trainers::collate::Example;
use concept_tuner::trainers::config::FinetuneType;
use concept_tuner::trainers::data_loader::{FinetuneDataset, InMemorySource};
use concept_tuner::trainers::noise::NoiseSource;
use concept_tuner::trainers::{train_from_config, ConceptTrainer, TrainConfig, TrainerState};

fn config(out: &Path, finetune_type: FinetuneType) -> TrainConfig {
    TrainConfig {
        finetune_type,
        token: Some("cat".into()),
        term: Some("cat".into()),
        data: Some("unused".into()),
        out_dir: out.to_path_buf(),
        lr: 1e-2,
        scale_lr: false,
        save_step: 100,
        sample_steps: 2,
        seed: Some(42),
        cpu: true,
        ..Default::default()
    }
}

fn setup(config: TrainConfig) -> ConceptTrainer {
    let bindings = config.concept_bindings().unwrap();
    ConceptTrainer::setup(config, bindings, &TinySource::new(TinyConfig::default())).unwrap()
}

/// Random instance images captioned for the first concept, with class images
/// when `prior` is set.
fn examples(trainer: &ConceptTrainer, n: usize, prior: bool) -> InMemorySource {
    captioned(trainer, &[("<cat> cat", "cat")], n, prior)
}

/// `n` random images cycling through `(instance caption, class caption)` pairs.
fn captioned(trainer: &ConceptTrainer, captions: &[(&str, &str)], n: usize, prior: bool) -> InMemorySource {
    let tokenizer = trainer.tokenizer();
    let side = trainer.resolution();
    let mut noise = NoiseSource::new(Some(9));
    let examples = (0..n)
        .map(|i| {
            let (caption, class) = captions[i % captions.len()];
            Example {
                image: noise.randn((3, side, side), &Device::Cpu).unwrap().tanh().unwrap(),
                input_ids: tokenizer.encode_padded(caption).unwrap(),
                class_image: prior.then(|| noise.randn((3, side, side), &Device::Cpu).unwrap().tanh().unwrap()),
                class_input_ids: prior.then(|| tokenizer.encode_padded(class).unwrap()),
            }
        })
        .collect();
    InMemorySource::new(examples)
}

fn embedding_rows(trainer: &ConceptTrainer) -> Vec<Vec<f32>> {
    let key = &trainer.plan().embedding_key;
    trainer.models().text_encoder.params().get(key).unwrap().to_vec2().unwrap()
}

fn backbone_weight(trainer: &ConceptTrainer, key: &str) -> Vec<f32> {
    trainer
        .models()
        .backbone
        .params()
        .get(key)
        .unwrap()
        .to_dtype(candle_core::DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap()
}

fn encode(trainer: &ConceptTrainer, text: &str) -> Vec<f32> {
    let ids = trainer.tokenizer().encode_padded(text).unwrap();
    let ids = Tensor::from_vec(ids.clone(), (1, ids.len()), &Device::Cpu).unwrap();
    trainer
        .models()
        .text_encoder
        .forward(&ids)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap()
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() <= tol, "{} vs {}", x, y);
    }
}

#[test]
fn test_only_new_embedding_rows_move() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = config(dir.path(), FinetuneType::Custom);
    c.train_steps = 12;
    let mut trainer = setup(c);
    let new_id = trainer.tokens()[0].1 as usize;

    let before = embedding_rows(&trainer);
    let k_before = backbone_weight(&trainer, "attn2.to_k.weight");
    let q_before = backbone_weight(&trainer, "attn2.to_q.weight");

    let source = examples(&trainer, 4, false);
    let summary = trainer.train(Box::new(source)).unwrap();
    assert_eq!(summary.steps, 12);
    assert_eq!(summary.skipped_steps, 0);

    let after = embedding_rows(&trainer);
    for (i, (b, a)) in before.iter().zip(&after).enumerate() {
        if i == new_id {
            assert_ne!(b, a, "new token row should train");
        } else {
            assert_eq!(b, a, "row {} changed", i);
        }
    }
    assert_ne!(k_before, backbone_weight(&trainer, "attn2.to_k.weight"));
    assert_eq!(q_before, backbone_weight(&trainer, "attn2.to_q.weight"));
}

#[test]
fn test_two_concepts_train_only_their_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = config(dir.path(), FinetuneType::Custom);
    c.token = Some("cat+dog".into());
    c.term = Some("cat+dog".into());
    c.data = Some("unused_cats+unused_dogs".into());
    c.train_steps = 12;
    let mut trainer = setup(c);
    let new_ids: Vec<usize> = trainer.tokens().iter().map(|(_, id)| *id as usize).collect();
    assert_eq!(new_ids.len(), 2);
    assert_ne!(new_ids[0], new_ids[1]);

    let before = embedding_rows(&trainer);
    let source = captioned(&trainer, &[("<cat> cat", "cat"), ("<dog> dog", "dog")], 4, false);
    let summary = trainer.train(Box::new(source)).unwrap();
    assert_eq!(summary.steps, 12);
    assert_eq!(summary.skipped_steps, 0);

    let after = embedding_rows(&trainer);
    assert_eq!(before.len(), after.len());
    for (i, (b, a)) in before.iter().zip(&after).enumerate() {
        if new_ids.contains(&i) {
            assert_ne!(b, a, "row {} of a new token should train", i);
        } else {
            assert_eq!(b, a, "row {} changed", i);
        }
    }
}

#[test]
fn test_epochs_cover_train_steps() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = config(dir.path(), FinetuneType::Text);
    c.train_steps = 7;
    let mut trainer = setup(c);
    let source = examples(&trainer, 3, false);

    let summary = trainer.train(Box::new(source)).unwrap();
    assert_eq!(summary.steps, 7);
    assert_eq!(summary.epochs, 3);
    assert!(summary.last_loss.unwrap().is_finite());
    assert_eq!(trainer.state(), TrainerState::Completed);
}

#[test]
fn test_prior_preservation_trains() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = config(dir.path(), FinetuneType::Custom);
    c.term_data = Some("unused_prior".into());
    c.batch_size = 2;
    c.train_steps = 3;
    let mut trainer = setup(c);
    assert!(trainer.with_prior());

    let source = examples(&trainer, 4, true);
    let summary = trainer.train(Box::new(source)).unwrap();
    assert_eq!(summary.steps, 3);
    assert!(summary.last_loss.unwrap().is_finite());
}

#[test]
fn test_nonfinite_loss_skips_updates() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = config(dir.path(), FinetuneType::Text);
    c.train_steps = 4;
    let mut trainer = setup(c);
    let before = embedding_rows(&trainer);

    let ids = trainer.tokenizer().encode_padded("<cat> cat").unwrap();
    let side = trainer.resolution();
    let nan = (Tensor::ones((3, side, side), candle_core::DType::F32, &Device::Cpu).unwrap() * f64::NAN).unwrap();
    let source = InMemorySource::new(vec![Example {
        image: nan,
        input_ids: ids,
        class_image: None,
        class_input_ids: None,
    }]);

    let summary = trainer.train(Box::new(source)).unwrap();
    assert_eq!(summary.steps, 4);
    assert_eq!(summary.skipped_steps, 4);
    assert!(summary.last_loss.is_none());
    assert_eq!(before, embedding_rows(&trainer));
}

#[test]
fn test_resume_reproduces_embeddings() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = config(dir.path(), FinetuneType::Text);
    c.train_steps = 3;
    let mut trainer = setup(c.clone());
    let source = examples(&trainer, 2, false);
    let summary = trainer.train(Box::new(source)).unwrap();
    let final_ckpt = summary.checkpoints.last().unwrap().clone();
    assert!(final_ckpt.ends_with("cat.safetensors"));

    let mut resumed_config = c;
    resumed_config.delta_ckpt = Some(final_ckpt);
    let resumed = setup(resumed_config);

    assert_eq!(resumed.tokens(), trainer.tokens());
    assert_close(&encode(&trainer, "photo of <cat> cat"), &encode(&resumed, "photo of <cat> cat"), 1e-5);
}

#[test]
fn test_resume_reapplies_attention_deltas() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = config(dir.path(), FinetuneType::Custom);
    c.train_steps = 3;
    let mut trainer = setup(c.clone());
    let source = examples(&trainer, 2, false);
    let summary = trainer.train(Box::new(source)).unwrap();

    let mut resumed_config = c;
    resumed_config.delta_ckpt = summary.checkpoints.last().cloned();
    let resumed = setup(resumed_config);

    for key in ["attn2.to_k.weight", "attn2.to_v.weight"] {
        // deltas are measured against a half-precision copy of the base
        assert_close(&backbone_weight(&trainer, key), &backbone_weight(&resumed, key), 1e-2);
    }
    assert_close(&encode(&trainer, "<cat> cat"), &encode(&resumed, "<cat> cat"), 1e-5);
}

#[test]
fn test_artifact_names() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = config(dir.path(), FinetuneType::Custom);
    c.train_steps = 4;
    c.save_step = 2;
    let mut trainer = setup(c);
    let source = examples(&trainer, 2, false);
    let summary = trainer.train(Box::new(source)).unwrap();

    for name in ["cat-0002.safetensors", "cat-0004.safetensors", "cat.safetensors", "cat-0002.jpg", "cat-0004.jpg"] {
        assert!(dir.path().join(name).exists(), "missing {}", name);
    }
    assert_eq!(summary.checkpoints.len(), 3);
    assert_eq!(summary.samples.len(), 2);
}

#[test]
fn test_disabled_samples() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = config(dir.path(), FinetuneType::Text);
    c.train_steps = 2;
    c.save_step = 1;
    c.sample_steps = 0;
    let mut trainer = setup(c);
    let source = examples(&trainer, 1, false);
    let summary = trainer.train(Box::new(source)).unwrap();
    assert_eq!(summary.checkpoints.len(), 3);
    assert!(summary.samples.is_empty());
    assert!(!dir.path().join("cat-0001.jpg").exists());
}

#[test]
fn test_image_folders_feed_training() {
    let dir = tempfile::tempdir().unwrap();
    let mut folders = Vec::new();
    for (name, value) in [("cats", 40u8), ("dogs", 200), ("cat_prior", 90), ("dog_prior", 150)] {
        let folder = dir.path().join(name);
        fs::create_dir_all(&folder).unwrap();
        for i in 0..2 {
            RgbImage::from_pixel(12, 10, Rgb([value, i * 60, 255 - value]))
                .save(folder.join(format!("{}.png", i)))
                .unwrap();
        }
        folders.push(folder.display().to_string());
    }

    let out = dir.path().join("out");
    let mut c = config(&out, FinetuneType::Custom);
    c.token = Some("cat+dog".into());
    c.term = Some("cat+dog".into());
    c.data = Some(format!("{}+{}", folders[0], folders[1]));
    c.term_data = Some(format!("{}+{}", folders[2], folders[3]));
    c.train_steps = 2;
    let bindings = c.concept_bindings().unwrap();
    let mut trainer = ConceptTrainer::setup(c, bindings.clone(), &TinySource::new(TinyConfig::default())).unwrap();
    assert_eq!(trainer.tokens().len(), 2);

    let dataset = FinetuneDataset::new(&bindings, trainer.tokenizer(), trainer.resolution(), false).unwrap();
    let summary = trainer.train(Box::new(dataset)).unwrap();
    assert_eq!(summary.steps, 2);
    assert!(out.join("cat+dog.safetensors").exists());
}

#[test]
fn test_mismatched_lists_fail_before_loading() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let c = TrainConfig {
        token: Some("a+b".into()),
        term: Some("cat".into()),
        data: Some("d".into()),
        maindir: dir.path().join("no-models"),
        out_dir: out.clone(),
        cpu: true,
        ..Default::default()
    };
    let err = train_from_config(c).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::CountMismatch {
            tokens: 2,
            terms: 1,
            data: 1
        })
    );
    assert!(!out.exists());
}
