use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, span, warn, Level};

use crate::{
    error::Error,
    ledger::{Ledger, LedgerEntry, UsedField},
    model::*,
    month::{pi_age, InvoiceMonth},
};

pub const NEW_PI_CREDIT_CODE: &str = "0002";
pub const INITIAL_CREDIT_AMOUNT: u32 = 1000;
pub const EXCLUDED_SU_TYPES: [&str; 2] = ["OpenShift GPUA100SXM4", "OpenStack GPUA100SXM4"];

/// The new-PI credit: a pool spread over a PI's first two billed months.
#[derive(Debug, Clone)]
pub struct CreditAllocator {
    pub credit_code: String,
    /// Used when the ledger seeds no amount for the invoice month.
    pub initial_credit: BigDecimal,
    pub excluded_su_types: BTreeSet<String>,
}

impl Default for CreditAllocator {
    fn default() -> Self {
        Self {
            credit_code: NEW_PI_CREDIT_CODE.to_owned(),
            initial_credit: INITIAL_CREDIT_AMOUNT.into(),
            excluded_su_types: EXCLUDED_SU_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A consumption counter that already held a different figure.
#[derive(Debug, Clone, PartialEq)]
pub struct Overwritten {
    pub pi: String,
    pub field: UsedField,
    pub previous: BigDecimal,
    pub current: BigDecimal,
}

impl std::fmt::Display for Overwritten {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PI {} previously used ${} of new PI credits ({}), now uses ${}",
            self.pi,
            money(&self.previous),
            self.field,
            money(&self.current)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreditReport {
    pub default_credit: BigDecimal,
    pub applied: BigDecimal,
    pub new_pis: Vec<String>,
    pub overwritten: Vec<Overwritten>,
}

/// A PI who is still inside the credit window this month.
struct Eligible {
    starting: BigDecimal,
    initial: BigDecimal,
    field: UsedField,
}

impl CreditAllocator {
    pub fn default_credit(&self, ledger: &Ledger, month: &InvoiceMonth) -> BigDecimal {
        ledger
            .seeded_credit(month)
            .cloned()
            .unwrap_or_else(|| self.initial_credit.clone())
    }

    fn is_excluded(&self, record: &UsageRecord) -> bool {
        self.excluded_su_types.contains(&record.su_type)
    }

    fn eligibility(
        &self,
        ledger: &Ledger,
        pi: &str,
        month: &InvoiceMonth,
        default_credit: &BigDecimal,
    ) -> Result<Option<Eligible>, Error> {
        let entry = ledger.get(pi);

        let eligible = match pi_age(ledger, pi, month)? {
            0 => {
                let initial = entry
                    .and_then(|e| e.initial_credits.clone())
                    .unwrap_or_else(|| default_credit.clone());
                Eligible {
                    starting: initial.clone(),
                    initial,
                    field: UsedField::First,
                }
            }
            1 => {
                let entry = entry.ok_or_else(|| {
                    Error::LedgerInconsistency(format!("PI {} has an age but no entry", pi))
                })?;
                let initial = entry.initial_credits.clone().ok_or_else(|| {
                    Error::LedgerInconsistency(format!(
                        "PI {} in second month has no initial credits",
                        pi
                    ))
                })?;
                Eligible {
                    starting: &initial - &entry.first_used,
                    initial,
                    field: UsedField::Second,
                }
            }
            _ => return Ok(None),
        };

        if eligible.starting.is_negative() {
            return Err(Error::LedgerInconsistency(format!(
                "PI {} has used more than the {} credit granted",
                pi, eligible.initial
            )));
        }

        Ok(Some(eligible))
    }

    /// Applies the new-PI credit to `records` and records consumption in `ledger`.
    ///
    /// Every PI's eligibility is settled before either the records or the
    /// ledger are touched, so an error leaves both as they were.
    pub fn allocate(
        &self,
        month: &InvoiceMonth,
        records: &mut [UsageRecord],
        ledger: &mut Ledger,
    ) -> Result<CreditReport, Error> {
        let _span = span!(Level::INFO, "credits", %month).entered();

        let default_credit = self.default_credit(ledger, month);
        info!("new PI credit set at {} for {}", default_credit, month);

        let mut by_pi: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, record) in records.iter().enumerate() {
            by_pi.entry(record.pi.clone()).or_default().push(i);
        }

        let settled = by_pi
            .into_iter()
            .map(|(pi, rows)| {
                let eligible = self.eligibility(ledger, &pi, month, &default_credit)?;
                Ok((pi, rows, eligible))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        for record in records.iter_mut() {
            record.reset_credit();
        }

        let mut report = CreditReport {
            default_credit: default_credit.clone(),
            ..Default::default()
        };

        for (pi, rows, eligible) in settled {
            let Some(eligible) = eligible else {
                debug!(%pi, "past the credit window");
                continue;
            };

            let mut remaining = eligible.starting.clone();
            for i in rows {
                let record = &mut records[i];
                if remaining.is_zero() || self.is_excluded(record) {
                    continue;
                }

                let applied = std::cmp::min(record.cost.clone(), remaining.clone());
                remaining -= &applied;
                record.apply_credit(applied, &self.credit_code);
            }

            let used = &eligible.starting - &remaining;
            report.applied += &used;

            match ledger.get(&pi) {
                Some(existing) => {
                    let previous = existing.used(eligible.field);
                    if !previous.is_zero() && previous != &used {
                        let overwritten = Overwritten {
                            pi: pi.clone(),
                            field: eligible.field,
                            previous: previous.clone(),
                            current: used.clone(),
                        };
                        warn!("ledger overwritten: {}", overwritten);
                        report.overwritten.push(overwritten);
                    }
                }
                None => report.new_pis.push(pi.clone()),
            }

            ledger.upsert(
                LedgerEntry::new(&pi, *month, Some(eligible.initial))
                    .with_used(eligible.field, used),
                eligible.field,
            );
        }

        info!(
            "applied {} of new PI credit, {} new PIs",
            report.applied,
            report.new_pis.len()
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn month(token: &str) -> InvoiceMonth {
        InvoiceMonth::parse(token).expect("inline month error")
    }

    fn decimal(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).expect("inline decimal error")
    }

    fn record(pi: &str, project: &str, su_type: &str, cost: &str) -> UsageRecord {
        UsageRecord::new(month("2024-03"), pi, project, su_type, decimal(cost))
    }

    fn credits(records: &[UsageRecord]) -> Vec<Option<BigDecimal>> {
        records.iter().map(|r| r.credit.clone()).collect()
    }

    fn balances(records: &[UsageRecord]) -> Vec<BigDecimal> {
        records.iter().map(|r| r.balance.clone()).collect()
    }

    const LEDGER: &str = r"PI,First Invoice Month,Initial Credits,1st Month Used,2nd Month Used
PI1,2023-09,500,200,0
PI2,2024-01,2000,0,0
PI3,2024-01,2000,1000,500
PI4,2024-02,1000,900,0
PI5,2024-02,1000,300,500
PI6,2024-02,1000,700,0
PI7,2024-03,500,300,0
PI8,2024-04,1000,500,0
";

    fn mixed_invoice() -> Vec<UsageRecord> {
        vec![
            record("PI1", "ProjectA", "CPU", "10"),
            record("PI2", "ProjectB", "CPU", "100"),
            record("PI3", "ProjectC", "CPU", "10000"),
            record("PI4", "ProjectD", "CPU", "500"),
            record("PI4", "ProjectE", "CPU", "100"),
            record("PI5", "ProjectF", "CPU", "400"),
            record("PI7", "ProjectG", "CPU", "200"),
            record("NewPI1", "ProjectH", "CPU", "250"),
            record("NewPI1", "ProjectI", "CPU", "250"),
            record("NewPI2", "ProjectJ", "CPU", "700"),
            record("NewPI2", "ProjectK", "CPU", "700"),
        ]
    }

    #[test]
    fn test_mixed_ages_with_seeded_month() -> Result<(), Error> {
        let mut ledger = Ledger::parse(LEDGER)?;
        let mut records = mixed_invoice();

        let report =
            CreditAllocator::default().allocate(&month("2024-03"), &mut records, &mut ledger)?;

        assert_eq!(report.default_credit, decimal("500"));

        let d = |v: &str| Some(decimal(v));
        assert_eq!(
            credits(&records),
            vec![
                None,
                None,
                None,
                d("100"),
                None,
                d("400"),
                d("200"),
                d("250"),
                d("250"),
                d("500"),
                None
            ]
        );
        assert_eq!(
            balances(&records),
            ["10", "100", "10000", "400", "100", "0", "0", "0", "0", "200", "700"]
                .map(decimal)
                .to_vec()
        );
        for r in records.iter() {
            assert_eq!(
                r.credit_code.as_deref(),
                r.credit.as_ref().map(|_| NEW_PI_CREDIT_CODE)
            );
        }

        let expected = [
            ("PI1", "2023-09", "500", "200", "0"),
            ("PI2", "2024-01", "2000", "0", "0"),
            ("PI3", "2024-01", "2000", "1000", "500"),
            ("PI4", "2024-02", "1000", "900", "100"),
            ("PI5", "2024-02", "1000", "300", "400"),
            ("PI6", "2024-02", "1000", "700", "0"),
            ("PI7", "2024-03", "500", "200", "0"),
            ("PI8", "2024-04", "1000", "500", "0"),
            ("NewPI1", "2024-03", "500", "500", "0"),
            ("NewPI2", "2024-03", "500", "500", "0"),
        ];
        assert_eq!(ledger.len(), expected.len());
        for (pi, first, initial, first_used, second_used) in expected {
            let entry = ledger.get(pi).unwrap();
            assert_eq!(entry.first_month, month(first), "{}", pi);
            assert_eq!(entry.initial_credits, Some(decimal(initial)), "{}", pi);
            assert_eq!(entry.first_used, decimal(first_used), "{}", pi);
            assert_eq!(entry.second_used, decimal(second_used), "{}", pi);
        }

        assert_eq!(report.new_pis, vec!["NewPI1", "NewPI2"]);
        assert_eq!(
            report
                .overwritten
                .iter()
                .map(|o| o.pi.as_str())
                .collect::<Vec<_>>(),
            vec!["PI5", "PI7"]
        );

        Ok(())
    }

    #[test]
    fn test_excluded_su_types() -> Result<(), Error> {
        let mut ledger =
            Ledger::parse("PI,First Invoice Month,Initial Credits,1st Month Used,2nd Month Used\nOldPI,2024-03,500,200,0\n")?;
        let mut records = vec![
            record("PI1", "A", "GPU", "500"),
            record("PI1", "B", "OpenShift GPUA100SXM4", "100"),
            record("PI1", "C", "OpenStack GPUA100SXM4", "100"),
            record("PI2", "D", "OpenShift GPUA100SXM4", "500"),
            record("PI2", "E", "OpenStack GPUA100SXM4", "500"),
        ];

        CreditAllocator::default().allocate(&month("2024-03"), &mut records, &mut ledger)?;

        assert_eq!(
            credits(&records),
            vec![Some(decimal("500")), None, None, None, None]
        );
        assert_eq!(
            balances(&records),
            ["0", "100", "100", "500", "500"].map(decimal).to_vec()
        );
        assert_eq!(ledger.get("PI2").unwrap().first_used, decimal("0"));

        Ok(())
    }

    #[test]
    fn test_new_pi_gets_fallback_credit() -> Result<(), Error> {
        let mut ledger = Ledger::default();
        let mut records = vec![record("PI9", "A", "CPU", "10000")];

        let report =
            CreditAllocator::default().allocate(&month("2024-03"), &mut records, &mut ledger)?;

        assert_eq!(report.default_credit, decimal("1000"));
        assert_eq!(records[0].credit, Some(decimal("1000")));
        assert_eq!(records[0].balance, decimal("9000"));

        let entry = ledger.get("PI9").unwrap();
        assert_eq!(entry.first_month, month("2024-03"));
        assert_eq!(entry.initial_credits, Some(decimal("1000")));
        assert_eq!(entry.first_used, decimal("1000"));
        assert!(entry.second_used.is_zero());

        Ok(())
    }

    #[test]
    fn test_second_month_excluded_row_keeps_remaining() -> Result<(), Error> {
        let mut ledger = Ledger::parse(
            "PI,First Invoice Month,Initial Credits,1st Month Used,2nd Month Used\nPI1,2024-02,1000,600,0\n",
        )?;
        let mut records = vec![record("PI1", "A", "OpenStack GPUA100SXM4", "500")];

        let report =
            CreditAllocator::default().allocate(&month("2024-03"), &mut records, &mut ledger)?;

        assert_eq!(records[0].credit, None);
        assert_eq!(records[0].credit_code, None);
        assert_eq!(records[0].balance, decimal("500"));
        assert!(ledger.get("PI1").unwrap().second_used.is_zero());
        assert!(report.applied.is_zero());
        assert!(report.overwritten.is_empty());

        Ok(())
    }

    #[test]
    fn test_old_pi_ledger_untouched() -> Result<(), Error> {
        let mut ledger = Ledger::parse(LEDGER)?;
        let before = ledger.clone();
        let mut records = vec![
            record("PI1", "A", "CPU", "10"),
            record("PI3", "B", "CPU", "20"),
        ];

        CreditAllocator::default().allocate(&month("2024-03"), &mut records, &mut ledger)?;

        assert_eq!(ledger, before);
        assert!(records.iter().all(|r| r.credit.is_none() && r.balance == r.cost));

        Ok(())
    }

    #[test]
    fn test_credit_spread_across_rows_in_order() -> Result<(), Error> {
        let mut ledger = Ledger::default();
        let mut records = vec![
            record("PI1", "A", "CPU", "300.25"),
            record("PI1", "B", "OpenShift GPUA100SXM4", "900"),
            record("PI1", "C", "CPU", "650.50"),
            record("PI1", "D", "CPU", "75"),
        ];

        let report =
            CreditAllocator::default().allocate(&month("2024-03"), &mut records, &mut ledger)?;

        assert_eq!(
            credits(&records),
            vec![Some(decimal("300.25")), None, Some(decimal("650.50")), Some(decimal("49.25"))]
        );
        assert_eq!(records[3].balance, decimal("25.75"));
        assert_eq!(report.applied, decimal("1000"));
        for r in records.iter() {
            assert_eq!(r.balance, &r.cost - r.credit.clone().unwrap_or_default());
        }

        Ok(())
    }

    #[test]
    fn test_zero_and_negative_costs_take_credit() -> Result<(), Error> {
        let mut ledger = Ledger::default();
        let mut records = vec![
            record("PI1", "A", "CPU", "0"),
            record("PI1", "B", "CPU", "-100"),
            record("PI1", "C", "CPU", "1100"),
        ];

        let report =
            CreditAllocator::default().allocate(&month("2024-03"), &mut records, &mut ledger)?;

        assert_eq!(
            credits(&records),
            vec![Some(decimal("0")), Some(decimal("-100")), Some(decimal("1100"))]
        );
        assert!(records
            .iter()
            .all(|r| r.credit_code.as_deref() == Some(NEW_PI_CREDIT_CODE)));
        assert_eq!(balances(&records), ["0", "0", "0"].map(decimal).to_vec());
        assert_eq!(report.applied, decimal("1000"));
        assert_eq!(ledger.get("PI1").unwrap().first_used, decimal("1000"));

        Ok(())
    }

    #[test]
    fn test_negative_age_is_fatal_and_changes_nothing() -> Result<(), Error> {
        let mut ledger = Ledger::parse(LEDGER)?;
        let before = ledger.clone();
        let mut records = vec![
            record("NewPI", "A", "CPU", "10"),
            record("PI8", "B", "CPU", "10"),
        ];
        let original = records.clone();

        let result =
            CreditAllocator::default().allocate(&month("2024-03"), &mut records, &mut ledger);

        assert!(matches!(result, Err(Error::LedgerInconsistency(_))));
        assert_eq!(ledger, before);
        assert_eq!(records, original);

        Ok(())
    }

    #[test]
    fn test_repeat_run_is_stable() -> Result<(), Error> {
        let mut ledger = Ledger::parse(LEDGER)?;
        let mut records = mixed_invoice();
        let allocator = CreditAllocator::default();

        allocator.allocate(&month("2024-03"), &mut records, &mut ledger)?;
        let first_ledger = ledger.clone();
        let first_records = records.clone();

        let report = allocator.allocate(&month("2024-03"), &mut records, &mut ledger)?;

        assert_eq!(ledger, first_ledger);
        assert_eq!(records, first_records);
        assert!(report.overwritten.is_empty());
        assert!(report.new_pis.is_empty());

        Ok(())
    }

    #[test]
    fn test_custom_policy() -> Result<(), Error> {
        let allocator = CreditAllocator {
            credit_code: "NEWPI".to_owned(),
            initial_credit: decimal("50"),
            excluded_su_types: ["CPU".to_owned()].into_iter().collect(),
        };
        let mut ledger = Ledger::default();
        let mut records = vec![
            record("PI1", "A", "CPU", "100"),
            record("PI1", "B", "GPU", "100"),
        ];

        allocator.allocate(&month("2024-03"), &mut records, &mut ledger)?;

        assert_eq!(records[0].credit, None);
        assert_eq!(records[1].credit, Some(decimal("50")));
        assert_eq!(records[1].credit_code.as_deref(), Some("NEWPI"));

        Ok(())
    }

    #[test]
    fn test_second_month_without_initial_credit_is_fatal() -> Result<(), Error> {
        let mut ledger = Ledger::parse(
            "PI,First Invoice Month,Initial Credits,1st Month Used,2nd Month Used\nPI1,2024-02,,0,0\n",
        )?;
        let mut records = vec![record("PI1", "A", "CPU", "10")];

        assert!(matches!(
            CreditAllocator::default().allocate(&month("2024-03"), &mut records, &mut ledger),
            Err(Error::LedgerInconsistency(_))
        ));

        Ok(())
    }
}
