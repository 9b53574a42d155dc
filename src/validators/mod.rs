mod canonical;
mod country;

pub use canonical::validate_canonical;
pub use country::{
    validate_country_rules, validator_for_country, CountryValidator, EcuadorValidator,
    MexicoValidator, SpainValidator,
};

use crate::models::CanonicalDocument;
use crate::types::ItemError;
use serde::Serialize;

/// Both validation passes, reported separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub structural_errors: Vec<String>,
    pub country_errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.structural_errors.is_empty() && self.country_errors.is_empty()
    }

    pub fn all_errors(&self) -> Vec<String> {
        self.structural_errors
            .iter()
            .chain(self.country_errors.iter())
            .cloned()
            .collect()
    }

    /// Errors as item error entries (`validation` / `country_rule`).
    pub fn to_item_errors(&self) -> Vec<ItemError> {
        self.structural_errors
            .iter()
            .map(|e| ItemError::new("validation", e.clone()))
            .chain(
                self.country_errors
                    .iter()
                    .map(|e| ItemError::new("country_rule", e.clone())),
            )
            .collect()
    }
}

/// Run the structural and country passes; neither depends on the other.
pub fn validate_document(doc: &CanonicalDocument) -> ValidationReport {
    let (_, structural_errors) = validate_canonical(doc);
    let (_, country_errors) = validate_country_rules(doc);
    ValidationReport {
        structural_errors,
        country_errors,
    }
}
