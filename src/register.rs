use std::path::PathBuf;

use clap::Args;
use colored::Colorize;
use ellipse::Ellipse;
use regex::Regex;
use terminal_size::{terminal_size, Width};

use crate::{
    config::Configuration,
    ledger::{LedgerEntry, LedgerFile, LedgerStore},
    model::*,
    month::{month_diff, InvoiceMonth},
};

#[derive(Debug, Args)]
pub struct Command {
    /// Only PIs matching this pattern.
    pub pattern: Option<String>,
    #[arg(long, value_name = "FILE")]
    pub ledger: PathBuf,
    /// Show each PI's age as of this invoice month.
    #[arg(short, long, value_name = "YYYY-MM")]
    pub month: Option<InvoiceMonth>,
    #[arg(long)]
    pub width: Option<u16>,
}

const MONTH_WIDTH: usize = 7;
const AGE_WIDTH: usize = 4;

struct Format {
    pi_width: usize,
    value_width: usize,
    age_width: Option<usize>,
}

impl Format {
    pub fn new(cmd: &Command) -> Self {
        let maximum_width = match (cmd.width, terminal_size()) {
            (Some(w), _) | (None, Some((Width(w), _))) => w as usize,
            _ => 160,
        };

        let value_width = 12;
        let age_width = cmd.month.map(|_| AGE_WIDTH);
        let columns = 5 + age_width.map_or(0, |_| 1);
        let fixed = MONTH_WIDTH + 4 * value_width + age_width.unwrap_or_default() + columns;
        let pi_width = maximum_width.saturating_sub(fixed).max(12);

        Self {
            pi_width,
            value_width,
            age_width,
        }
    }

    fn header(&self) -> String {
        let line = format!(
            "{:pi_width$} {:month_width$} {:>value_width$} {:>value_width$} {:>value_width$} {:>value_width$}",
            "PI",
            "First",
            "Initial",
            "1st Used",
            "2nd Used",
            "Remaining",
            pi_width = self.pi_width,
            month_width = MONTH_WIDTH,
            value_width = self.value_width,
        );

        match self.age_width {
            Some(age_width) => format!("{} {:>age_width$}", line, "Age", age_width = age_width),
            None => line,
        }
    }
}

struct Row<'r> {
    entry: &'r LedgerEntry,
    age: Option<i32>,
}

impl<'r> Row<'r> {
    fn format(&self, format: &Format) -> String {
        let optional = |value: Option<BigDecimal>| value.as_ref().map(money).unwrap_or_default();

        let line = format!(
            "{:pi_width$} {:month_width$} {:>value_width$} {:>value_width$} {:>value_width$} {:>value_width$}",
            self.entry.pi.as_str().truncate_ellipse(format.pi_width - 3),
            self.entry.first_month.to_string(),
            optional(self.entry.initial_credits.clone()),
            money(&self.entry.first_used),
            money(&self.entry.second_used),
            optional(self.entry.remaining()),
            pi_width = format.pi_width,
            month_width = MONTH_WIDTH,
            value_width = format.value_width,
        );

        match (format.age_width, self.age) {
            (Some(age_width), Some(age)) => {
                format!("{} {:>age_width$}", line, age, age_width = age_width)
            }
            _ => line,
        }
    }

    fn colored(&self, format: &Format) -> colored::ColoredString {
        let line = self.format(format);
        match self.age {
            Some(age) if age < 0 => line.as_str().red(),
            Some(0) => line.as_str().green(),
            Some(1) => line.as_str().yellow(),
            Some(_) => line.as_str().dimmed(),
            None => line.as_str().normal(),
        }
    }
}

pub fn execute_command(_config: &Configuration, cmd: &Command) -> anyhow::Result<()> {
    let ledger = LedgerFile::new(&cmd.ledger).load()?;
    if ledger.is_empty() {
        println!("no ledger entries");
        return Ok(());
    }

    let compiled = cmd.pattern.as_deref().map(Regex::new).transpose()?;

    let format = Format::new(cmd);
    println!("{}", format.header().as_str().bold());

    for entry in ledger
        .iter()
        .filter(|e| compiled.as_ref().map_or(true, |c| c.is_match(&e.pi)))
    {
        let row = Row {
            entry,
            age: cmd.month.as_ref().map(|m| month_diff(m, &entry.first_month)),
        };

        println!("{}", row.colored(&format));
    }

    Ok(())
}
