use std::str::FromStr;

use chrono::NaiveDate;
use nom::{
    bytes::complete::{tag, take_while_m_n},
    combinator::{all_consuming, map_res},
    sequence::separated_pair,
    IResult,
};

use crate::{error::Error, ledger::Ledger};

/// A billing period, written `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvoiceMonth {
    year: i32,
    month: u32,
}

impl InvoiceMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, Error> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(|_| Self { year, month })
            .ok_or_else(|| Error::Format(format!("invalid invoice month {}-{}", year, month)))
    }

    pub fn parse(token: &str) -> Result<Self, Error> {
        let (_, (year, month)) = all_consuming(year_month)(token.trim())
            .map_err(|_| Error::Format(format!("invalid invoice month '{}'", token)))?;

        Self::new(year, month)
    }
}

impl FromStr for InvoiceMonth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for InvoiceMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&format!("{:04}-{:02}", self.year, self.month))
    }
}

fn year_month(i: &str) -> IResult<&str, (i32, u32)> {
    separated_pair(
        map_res(take_while_m_n(4, 4, |c: char| c.is_ascii_digit()), |s: &str| {
            s.parse::<i32>()
        }),
        tag("-"),
        map_res(take_while_m_n(1, 2, |c: char| c.is_ascii_digit()), |s: &str| {
            s.parse::<u32>()
        }),
    )(i)
}

/// Whole months from `b` to `a`, positive when `a` is later.
pub fn month_diff(a: &InvoiceMonth, b: &InvoiceMonth) -> i32 {
    (a.year - b.year) * 12 + (a.month as i32 - b.month as i32)
}

/// Months since the PI was first billed, zero for a PI the ledger has never seen.
pub fn pi_age(ledger: &Ledger, pi: &str, invoice_month: &InvoiceMonth) -> Result<u32, Error> {
    match ledger.get(pi) {
        None => Ok(0),
        Some(entry) => {
            let age = month_diff(invoice_month, &entry.first_month);
            if age < 0 {
                Err(Error::LedgerInconsistency(format!(
                    "PI {} from {} found in {} invoice",
                    pi, entry.first_month, invoice_month
                )))
            } else {
                Ok(age as u32)
            }
        }
    }
}
