//! Guard against cardholder data reaching the engine. Payloads carry only
//! opaque processor tokens; any field that smells like a PAN, CVV, or bank
//! account number is rejected before anything is stored.

use crate::BillingError;
use crate::BillingResult;

const FORBIDDEN_FIELDS: [&str; 5] = [
    "card_number",
    "cvv",
    "cvc",
    "account_number",
    "routing_number",
];

/// Walks the payload recursively, case-insensitively, including nested
/// objects and arrays.
pub fn ensure_no_pci_fields(value: &serde_json::Value) -> BillingResult<()> {
    match value {
        serde_json::Value::Object(map) => {
            for (field, nested) in map {
                let lowered = field.to_ascii_lowercase();
                if FORBIDDEN_FIELDS.contains(&lowered.as_str()) {
                    return Err(BillingError::PciViolation(field.clone()));
                }
                ensure_no_pci_fields(nested)?;
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for item in items {
                ensure_no_pci_fields(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_payloads_pass() {
        let value = json!({
            "token": "pm_test_1",
            "metadata": {"plan": "pro", "last4": "4242"}
        });
        assert!(ensure_no_pci_fields(&value).is_ok());
    }

    #[test]
    fn top_level_forbidden_fields_are_rejected() {
        for field in FORBIDDEN_FIELDS {
            let value = json!({field: "4111111111111111"});
            assert!(matches!(
                ensure_no_pci_fields(&value),
                Err(BillingError::PciViolation(found)) if found == field
            ));
        }
    }

    #[test]
    fn nested_and_case_variant_fields_are_rejected() {
        let nested = json!({"payment": {"details": {"Card_Number": "4111"}}});
        assert!(matches!(
            ensure_no_pci_fields(&nested),
            Err(BillingError::PciViolation(_))
        ));

        let in_array = json!({"items": [{"CVV": "123"}]});
        assert!(matches!(
            ensure_no_pci_fields(&in_array),
            Err(BillingError::PciViolation(_))
        ));
    }
}
