pub mod augmentation;
pub mod backbone;
pub mod evaluation;
pub mod export;
pub mod inference;
pub mod ml_model;
pub mod pretrained;
pub mod training;

pub use augmentation::{Augmentation, GeometricParams};
pub use backbone::{BackboneHandle, FeatureExtractor};
pub use evaluation::{evaluate, predict_samples, ClassificationReport, ConfusionMatrix, Evaluation};
pub use export::{ExportArtifacts, Exporter, ExternalConverter};
pub use inference::InferenceEngine;
pub use ml_model::{
    Classifier, FrozenPrefix, InferenceClassifier, ModelConfig, ModelSummary, SignClassifier,
};
pub use pretrained::load_backbone_weights;
pub use training::{
    class_weights, EpochRecord, TrainOutcome, TrainableConfig, TrainingPhase, TwoPhaseTrainer,
};
