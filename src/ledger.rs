use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
    time::Instant,
};

use bigdecimal::{BigDecimal, Zero};
use tracing::{debug, info, span, Level};

use crate::{
    error::Error,
    model::money,
    month::InvoiceMonth,
    parsing::{parse_table, Table},
};

pub const PI_FIELD: &str = "PI";
pub const FIRST_MONTH_FIELD: &str = "First Invoice Month";
pub const INITIAL_CREDITS_FIELD: &str = "Initial Credits";
pub const FIRST_USED_FIELD: &str = "1st Month Used";
pub const SECOND_USED_FIELD: &str = "2nd Month Used";

pub const HEADER: [&str; 5] = [
    PI_FIELD,
    FIRST_MONTH_FIELD,
    INITIAL_CREDITS_FIELD,
    FIRST_USED_FIELD,
    SECOND_USED_FIELD,
];

/// Which of the two consumption counters a run writes back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsedField {
    First,
    Second,
}

impl std::fmt::Display for UsedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsedField::First => f.pad(FIRST_USED_FIELD),
            UsedField::Second => f.pad(SECOND_USED_FIELD),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub pi: String,
    pub first_month: InvoiceMonth,
    /// Empty when an operator seeds a month's credit before any PI is billed in it.
    pub initial_credits: Option<BigDecimal>,
    pub first_used: BigDecimal,
    pub second_used: BigDecimal,
}

impl LedgerEntry {
    pub fn new(pi: &str, first_month: InvoiceMonth, initial_credits: Option<BigDecimal>) -> Self {
        Self {
            pi: pi.to_owned(),
            first_month,
            initial_credits,
            first_used: BigDecimal::zero(),
            second_used: BigDecimal::zero(),
        }
    }

    pub fn with_used(mut self, field: UsedField, value: BigDecimal) -> Self {
        *self.used_mut(field) = value;
        self
    }

    pub fn used(&self, field: UsedField) -> &BigDecimal {
        match field {
            UsedField::First => &self.first_used,
            UsedField::Second => &self.second_used,
        }
    }

    fn used_mut(&mut self, field: UsedField) -> &mut BigDecimal {
        match field {
            UsedField::First => &mut self.first_used,
            UsedField::Second => &mut self.second_used,
        }
    }

    pub fn remaining(&self) -> Option<BigDecimal> {
        self.initial_credits
            .as_ref()
            .map(|initial| initial - &self.first_used - &self.second_used)
    }

    fn from_row(row: &[String]) -> Result<Self, Error> {
        let amount = |text: &str| -> Result<Option<BigDecimal>, Error> {
            match text.trim() {
                "" => Ok(None),
                value => Ok(Some(BigDecimal::from_str(value)?)),
            }
        };

        let entry = Self {
            pi: row[0].trim().to_owned(),
            first_month: InvoiceMonth::parse(&row[1])?,
            initial_credits: amount(&row[2])?,
            first_used: amount(&row[3])?.unwrap_or_default(),
            second_used: amount(&row[4])?.unwrap_or_default(),
        };

        if entry.pi.is_empty() {
            return Err(Error::Format("ledger entry without PI".to_owned()));
        }

        Ok(entry)
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.pi.clone(),
            self.first_month.to_string(),
            self.initial_credits
                .as_ref()
                .map(money)
                .unwrap_or_default(),
            money(&self.first_used),
            money(&self.second_used),
        ]
    }
}

/// Every PI's credit grant and consumption, keyed by PI and kept in storage order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    /// PI to position in `entries`.
    index: HashMap<String, usize>,
}

impl Ledger {
    pub fn new(entries: Vec<LedgerEntry>) -> Result<Self, Error> {
        let mut ledger = Self::default();
        for entry in entries {
            if ledger.index.contains_key(&entry.pi) {
                return Err(Error::LedgerInconsistency(format!(
                    "duplicate ledger entry for PI {}",
                    entry.pi
                )));
            }
            ledger.push(entry);
        }

        Ok(ledger)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let table = parse_table(text)?;
        if table.header.iter().map(|h| h.trim()).ne(HEADER.into_iter()) {
            return Err(Error::Format(format!(
                "expected ledger columns {:?}, found {:?}",
                HEADER, table.header
            )));
        }

        Self::new(
            table
                .rows
                .iter()
                .map(|row| LedgerEntry::from_row(row))
                .collect::<Result<Vec<_>, _>>()?,
        )
    }

    pub fn to_table(&self) -> Table {
        let mut table = Table::new(HEADER.iter().map(|h| h.to_string()).collect());
        for entry in self.entries.iter() {
            table.push(entry.to_row());
        }
        table
    }

    fn push(&mut self, entry: LedgerEntry) {
        self.index.insert(entry.pi.clone(), self.entries.len());
        self.entries.push(entry);
    }

    pub fn get(&self, pi: &str) -> Option<&LedgerEntry> {
        self.index.get(pi).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Credit an operator pre-seeded for PIs first billed in `month`: the
    /// initial credit of the first entry for that month, when it has one.
    pub fn seeded_credit(&self, month: &InvoiceMonth) -> Option<&BigDecimal> {
        self.entries
            .iter()
            .find(|e| &e.first_month == month)
            .and_then(|e| e.initial_credits.as_ref())
    }

    /// Appends `entry` for an unknown PI, otherwise copies `field` from it
    /// onto the existing entry.
    pub fn upsert(&mut self, entry: LedgerEntry, field: UsedField) {
        match self.index.get(&entry.pi).copied() {
            Some(i) => {
                let existing = &mut self.entries[i];
                *existing.used_mut(field) = entry.used(field).clone();
                if existing.initial_credits.is_none() {
                    existing.initial_credits = entry.initial_credits;
                }
            }
            None => {
                debug!(pi = %entry.pi, "new ledger entry");
                self.push(entry);
            }
        }
    }
}

/// Durable home of the ledger between invoice runs.
pub trait LedgerStore {
    fn load(&self) -> Result<Ledger, Error>;

    fn save(&self, ledger: &Ledger) -> Result<(), Error>;
}

#[derive(Debug, Clone)]
pub struct LedgerFile {
    path: PathBuf,
}

impl LedgerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for LedgerFile {
    fn load(&self) -> Result<Ledger, Error> {
        let _span = span!(Level::INFO, "ledger").entered();
        let started = Instant::now();

        let unavailable = |e: &dyn std::fmt::Display| {
            Error::LedgerUnavailable(self.path.clone(), e.to_string())
        };

        let text = std::fs::read_to_string(&self.path).map_err(|e| unavailable(&e))?;
        let ledger = Ledger::parse(&text).map_err(|e| unavailable(&e))?;

        info!(
            "loaded {} ledger entries from {} in {:?}",
            ledger.len(),
            self.path.display(),
            Instant::now() - started
        );

        Ok(ledger)
    }

    fn save(&self, ledger: &Ledger) -> Result<(), Error> {
        std::fs::write(&self.path, ledger.to_table().to_text())?;

        info!(
            "saved {} ledger entries to {}",
            ledger.len(),
            self.path.display()
        );

        Ok(())
    }
}
