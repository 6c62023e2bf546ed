use std::collections::BTreeMap;

use tracing::{debug, info, span, Level};

use crate::{model::*, month::InvoiceMonth, parsing::Table};

pub const SUBSIDY_INSTITUTION: &str = "Boston University";
pub const SUBSIDY_AMOUNT: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct SubsidyRecord {
    pub invoice_month: InvoiceMonth,
    pub pi: String,
    pub project: String,
    pub institution: String,
    pub cost: BigDecimal,
    pub credit: Option<BigDecimal>,
    pub subsidy: BigDecimal,
    pub balance: BigDecimal,
}

impl SubsidyRecord {
    pub fn from_usage(record: &UsageRecord) -> Self {
        Self {
            invoice_month: record.invoice_month,
            pi: record.pi.clone(),
            project: record.project.clone(),
            institution: record.institution.clone(),
            cost: record.cost.clone(),
            credit: record.credit.clone(),
            subsidy: BigDecimal::zero(),
            balance: record.balance.clone(),
        }
    }

    fn merge(&mut self, other: &UsageRecord) {
        self.cost += &other.cost;
        self.balance += &other.balance;
        self.credit = match (self.credit.take(), other.credit.as_ref()) {
            (Some(a), Some(b)) => Some(a + b),
            (Some(a), None) => Some(a),
            (None, b) => b.cloned(),
        };
    }
}

/// Project name without its allocation suffix, `ProjectA-e6413` is `ProjectA`.
pub fn project_name(allocation: &str) -> &str {
    allocation
        .rsplit_once('-')
        .map(|(name, _)| name)
        .unwrap_or(allocation)
}

/// A fixed per-PI budget spent against the balances of one institution's projects.
#[derive(Debug, Clone)]
pub struct SubsidyAllocator {
    pub institution: String,
    pub amount: BigDecimal,
}

impl Default for SubsidyAllocator {
    fn default() -> Self {
        Self {
            institution: SUBSIDY_INSTITUTION.to_owned(),
            amount: SUBSIDY_AMOUNT.into(),
        }
    }
}

impl SubsidyAllocator {
    /// The institution's rows, collapsed to one per project and PI and ordered by project, then PI.
    pub fn select(&self, records: &[UsageRecord]) -> Vec<SubsidyRecord> {
        let mut projects: BTreeMap<(String, String), SubsidyRecord> = BTreeMap::new();

        for record in records.iter().filter(|r| r.institution == self.institution) {
            let name = project_name(&record.project);
            let key = (name.to_owned(), record.pi.clone());
            match projects.get_mut(&key) {
                Some(existing) => existing.merge(record),
                None => {
                    let mut collapsed = SubsidyRecord::from_usage(record);
                    collapsed.project = name.to_owned();
                    projects.insert(key, collapsed);
                }
            }
        }

        projects.into_values().collect()
    }

    /// Spends each PI's budget over their rows in order. Returns the total applied.
    pub fn allocate(&self, records: &mut [SubsidyRecord]) -> BigDecimal {
        let _span = span!(Level::INFO, "subsidy", institution = %self.institution).entered();

        let mut by_pi: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, record) in records.iter().enumerate() {
            by_pi.entry(record.pi.clone()).or_default().push(i);
        }

        let mut total = BigDecimal::zero();
        for (pi, rows) in by_pi {
            let mut remaining = self.amount.clone();
            for i in rows {
                if remaining.is_zero() {
                    break;
                }

                let record = &mut records[i];
                if !record.balance.is_positive() {
                    continue;
                }

                let applied = std::cmp::min(record.balance.clone(), remaining.clone());
                record.balance -= &applied;
                remaining -= &applied;
                record.subsidy = applied;
            }

            let spent = &self.amount - &remaining;
            debug!(%pi, %spent, "subsidy");
            total += spent;
        }

        info!("applied {} of subsidy", total);

        total
    }
}

pub fn subsidy_table(records: &[SubsidyRecord]) -> Table {
    let mut table = Table::new(
        [
            INVOICE_DATE_FIELD,
            PROJECT_NAME_FIELD,
            PI_FIELD,
            INSTITUTION_FIELD,
            COST_FIELD,
            CREDIT_FIELD,
            SUBSIDY_FIELD,
            BALANCE_FIELD,
        ]
        .iter()
        .map(|f| f.to_string())
        .collect(),
    );

    for record in records {
        table.push(vec![
            record.invoice_month.to_string(),
            record.project.clone(),
            record.pi.clone(),
            record.institution.clone(),
            money(&record.cost),
            record.credit.as_ref().map(money).unwrap_or_default(),
            money(&record.subsidy),
            money(&record.balance),
        ]);
    }

    table
}
