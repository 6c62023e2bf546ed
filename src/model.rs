use std::str::FromStr;

use tracing::warn;

pub use bigdecimal::{BigDecimal, Signed, Zero};
pub use itertools::Itertools;

use crate::{
    error::Error,
    month::InvoiceMonth,
    parsing::{Table, parse_table},
};

pub const INVOICE_DATE_FIELD: &str = "Invoice Month";
pub const PI_FIELD: &str = "Manager (PI)";
pub const PROJECT_FIELD: &str = "Project - Allocation";
pub const SU_TYPE_FIELD: &str = "SU Type";
pub const COST_FIELD: &str = "Cost";
pub const INSTITUTION_FIELD: &str = "Institution";
pub const CREDIT_FIELD: &str = "Credit";
pub const CREDIT_CODE_FIELD: &str = "Credit Code";
pub const BALANCE_FIELD: &str = "Balance";
pub const SUBSIDY_FIELD: &str = "Subsidy";
pub const PROJECT_NAME_FIELD: &str = "Project";

const KNOWN_FIELDS: [&str; 9] = [
    INVOICE_DATE_FIELD,
    PROJECT_FIELD,
    PI_FIELD,
    INSTITUTION_FIELD,
    SU_TYPE_FIELD,
    COST_FIELD,
    CREDIT_FIELD,
    CREDIT_CODE_FIELD,
    BALANCE_FIELD,
];

/// One row of cloud usage, plus the credit and balance the allocators add.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub invoice_month: InvoiceMonth,
    /// Empty when the source row names no PI.
    pub pi: String,
    pub project: String,
    pub su_type: String,
    pub cost: BigDecimal,
    pub institution: String,
    pub credit: Option<BigDecimal>,
    pub credit_code: Option<String>,
    pub balance: BigDecimal,
    /// Columns carried through to the exported invoice untouched.
    pub extra: Vec<(String, String)>,
}

impl UsageRecord {
    pub fn new(
        invoice_month: InvoiceMonth,
        pi: &str,
        project: &str,
        su_type: &str,
        cost: BigDecimal,
    ) -> Self {
        Self {
            invoice_month,
            pi: pi.to_owned(),
            project: project.to_owned(),
            su_type: su_type.to_owned(),
            balance: cost.clone(),
            cost,
            institution: String::default(),
            credit: None,
            credit_code: None,
            extra: Vec::default(),
        }
    }

    #[cfg(test)]
    pub fn with_institution(mut self, institution: &str) -> Self {
        self.institution = institution.to_owned();
        self
    }

    #[cfg(test)]
    pub fn with_credit(mut self, credit: BigDecimal, code: &str) -> Self {
        self.apply_credit(credit, code);
        self
    }

    /// Drops any previously applied credit so the balance is the full cost.
    pub fn reset_credit(&mut self) {
        self.credit = None;
        self.credit_code = None;
        self.balance = self.cost.clone();
    }

    pub fn apply_credit(&mut self, credit: BigDecimal, code: &str) {
        self.balance = &self.cost - &credit;
        self.credit = Some(credit);
        self.credit_code = Some(code.to_owned());
    }
}

fn required(table: &Table, name: &str) -> Result<usize, Error> {
    table
        .column(name)
        .ok_or_else(|| Error::Format(format!("usage table has no '{}' column", name)))
}

/// Reads usage rows from CSV text. Columns are matched by header name.
pub fn parse_usage(text: &str) -> Result<Vec<UsageRecord>, Error> {
    let table = parse_table(text)?;

    let month = required(&table, INVOICE_DATE_FIELD)?;
    let pi = required(&table, PI_FIELD)?;
    let project = required(&table, PROJECT_FIELD)?;
    let su_type = required(&table, SU_TYPE_FIELD)?;
    let cost = required(&table, COST_FIELD)?;
    let institution = table.column(INSTITUTION_FIELD);

    let extra = table
        .header
        .iter()
        .enumerate()
        .filter(|(_, name)| !KNOWN_FIELDS.contains(&name.as_str()))
        .map(|(i, name)| (i, name.clone()))
        .collect_vec();

    table
        .rows
        .iter()
        .map(|row| -> Result<UsageRecord, Error> {
            let mut record = UsageRecord::new(
                InvoiceMonth::parse(&row[month])?,
                row[pi].trim(),
                &row[project],
                &row[su_type],
                BigDecimal::from_str(row[cost].trim()).map_err(|e| {
                    Error::Format(format!("cost '{}' for {}: {}", row[cost], row[project], e))
                })?,
            );
            if let Some(institution) = institution {
                record.institution = row[institution].clone();
            }
            record.extra = extra
                .iter()
                .map(|(i, name)| (name.clone(), row[*i].clone()))
                .collect();
            Ok(record)
        })
        .collect()
}

/// The billing period of a run, taken from the first record.
pub fn invoice_month(records: &[UsageRecord]) -> Result<InvoiceMonth, Error> {
    let first = records
        .first()
        .map(|r| r.invoice_month)
        .ok_or_else(|| Error::Format("no usage records".to_owned()))?;

    let others = records
        .iter()
        .filter(|r| r.invoice_month != first)
        .map(|r| r.invoice_month)
        .unique()
        .collect_vec();
    if !others.is_empty() {
        warn!("invoice month is {} but records also carry {:?}", first, others);
    }

    Ok(first)
}

/// Money as written to every table: always two fractional digits, zero included.
pub fn money(value: &BigDecimal) -> String {
    format!("{:.2}", value)
}

/// Billable invoice table: the known columns, then extra columns in first-seen order.
pub fn usage_table(records: &[UsageRecord]) -> Table {
    let extra_names = records
        .iter()
        .flat_map(|r| r.extra.iter().map(|(name, _)| name.clone()))
        .unique()
        .collect_vec();

    let mut table = Table::new(
        KNOWN_FIELDS
            .iter()
            .map(|f| f.to_string())
            .chain(extra_names.iter().cloned())
            .collect(),
    );

    for record in records {
        let known = [
            record.invoice_month.to_string(),
            record.project.clone(),
            record.pi.clone(),
            record.institution.clone(),
            record.su_type.clone(),
            money(&record.cost),
            record.credit.as_ref().map(money).unwrap_or_default(),
            record.credit_code.clone().unwrap_or_default(),
            money(&record.balance),
        ];
        let extra = extra_names.iter().map(|name| {
            record
                .extra
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        });
        table.push(known.into_iter().chain(extra).collect());
    }

    table
}
