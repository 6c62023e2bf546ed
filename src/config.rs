use std::{
    collections::{BTreeSet, HashMap},
    fs::File,
    path::Path,
    str::FromStr,
};

use anyhow::Result;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::{
    credits::{CreditAllocator, EXCLUDED_SU_TYPES, INITIAL_CREDIT_AMOUNT, NEW_PI_CREDIT_CODE},
    subsidy::{SubsidyAllocator, SUBSIDY_AMOUNT, SUBSIDY_INSTITUTION},
};

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub credit_code: String,
    #[serde(deserialize_with = "decimal")]
    pub initial_credit: BigDecimal,
    pub excluded_su_types: Vec<String>,
    pub subsidy: SubsidyDefinition,
    /// Email domain to institution name.
    pub institutions: HashMap<String, String>,
    /// Canonical PI to the other names they are billed under.
    pub aliases: HashMap<String, Vec<String>>,
    pub nonbillable_pis: Vec<String>,
    pub nonbillable_projects: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SubsidyDefinition {
    pub institution: String,
    #[serde(deserialize_with = "decimal")]
    pub amount: BigDecimal,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            credit_code: NEW_PI_CREDIT_CODE.to_owned(),
            initial_credit: INITIAL_CREDIT_AMOUNT.into(),
            excluded_su_types: EXCLUDED_SU_TYPES.iter().map(|s| s.to_string()).collect(),
            subsidy: SubsidyDefinition::default(),
            institutions: HashMap::default(),
            aliases: HashMap::default(),
            nonbillable_pis: Vec::default(),
            nonbillable_projects: Vec::default(),
        }
    }
}

impl Default for SubsidyDefinition {
    fn default() -> Self {
        Self {
            institution: SUBSIDY_INSTITUTION.to_owned(),
            amount: SUBSIDY_AMOUNT.into(),
        }
    }
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Configuration> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn credits(&self) -> CreditAllocator {
        CreditAllocator {
            credit_code: self.credit_code.clone(),
            initial_credit: self.initial_credit.clone(),
            excluded_su_types: self.excluded_su_types.iter().cloned().collect(),
        }
    }

    pub fn subsidy(&self) -> SubsidyAllocator {
        SubsidyAllocator {
            institution: self.subsidy.institution.clone(),
            amount: self.subsidy.amount.clone(),
        }
    }

    pub fn nonbillable_pis(&self) -> BTreeSet<String> {
        self.nonbillable_pis.iter().cloned().collect()
    }

    pub fn nonbillable_projects(&self) -> BTreeSet<String> {
        self.nonbillable_projects.iter().cloned().collect()
    }
}

// Amounts may be written as JSON numbers or strings, strings keep exact decimals.
fn decimal<'de, D>(deserializer: D) -> std::result::Result<BigDecimal, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => BigDecimal::from_str(text.trim()).map_err(serde::de::Error::custom),
        Value::Number(number) => {
            BigDecimal::from_str(&number.to_string()).map_err(serde::de::Error::custom)
        }
        other => Err(serde::de::Error::custom(format!(
            "expected a decimal amount, found {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Configuration = serde_json::from_str("{}").unwrap();
        let credits = config.credits();
        assert_eq!(credits.credit_code, "0002");
        assert_eq!(credits.initial_credit, BigDecimal::from(1000));
        assert!(credits.excluded_su_types.contains("OpenStack GPUA100SXM4"));

        let subsidy = config.subsidy();
        assert_eq!(subsidy.institution, "Boston University");
        assert_eq!(subsidy.amount, BigDecimal::from(100));
    }

    #[test]
    fn test_overrides() {
        let config: Configuration = serde_json::from_str(
            r#"{
                "credit_code": "0003",
                "initial_credit": "750.50",
                "excluded_su_types": ["OpenShift GPUH100"],
                "subsidy": { "institution": "Harvard University", "amount": 250 },
                "institutions": { "bu.edu": "Boston University" },
                "aliases": { "PI1": ["PI1_1"] },
                "nonbillable_pis": ["PI9"]
            }"#,
        )
        .unwrap();

        let credits = config.credits();
        assert_eq!(credits.credit_code, "0003");
        assert_eq!(credits.initial_credit, BigDecimal::from_str("750.50").unwrap());
        assert_eq!(
            credits.excluded_su_types.into_iter().collect::<Vec<_>>(),
            vec!["OpenShift GPUH100"]
        );
        assert_eq!(config.subsidy().amount, BigDecimal::from(250));
        assert_eq!(config.subsidy().institution, "Harvard University");
        assert_eq!(config.institutions.get("bu.edu").unwrap(), "Boston University");
        assert!(config.nonbillable_pis().contains("PI9"));
        assert!(config.nonbillable_projects().is_empty());
    }

    #[test]
    fn test_rejects_bad_amount() {
        let result = serde_json::from_str::<Configuration>(r#"{ "initial_credit": "lots" }"#);
        assert!(result.is_err());

        let result = serde_json::from_str::<Configuration>(r#"{ "initial_credit": true }"#);
        assert!(result.is_err());
    }
}
