mod canonical;
mod mapping;

pub use canonical::{
    doc_type_label, is_supported_country, is_supported_currency, CanonicalDocument, DocType,
    SUPPORTED_COUNTRIES, SUPPORTED_CURRENCIES,
};
pub use mapping::{
    FeedbackType, FieldFeedback, FieldStats, MappingFeedback, MappingProvider, MappingSuggestion,
    StatsKey, Transform,
};
