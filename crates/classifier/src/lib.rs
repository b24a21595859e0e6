pub mod classifier;
pub mod rules;

pub use classifier::{Classification, ClassificationResult, Classifier};
pub use rules::RuleSet;
