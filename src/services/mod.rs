pub mod classifier;
pub mod confidence_gate;
pub mod ingestion;
pub mod jobs;
pub mod learner;
pub mod mapping_dictionary;
pub mod mapping_suggester;
pub mod normalize;
pub mod promotion;
pub mod row_normalizer;
pub mod smart_router;
