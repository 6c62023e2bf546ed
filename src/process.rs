use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{anyhow, Context, Result};
use clap::Args;
use colored::Colorize;
use tracing::*;

use crate::{
    config::Configuration,
    credits::CreditReport,
    error::Error,
    ledger::{LedgerFile, LedgerStore},
    model::*,
    month::InvoiceMonth,
    parsing::Table,
    prepare,
    subsidy::subsidy_table,
};

#[derive(Debug, Args)]
pub struct Command {
    /// Usage CSV files or glob patterns.
    #[arg(required = true, value_name = "CSV_GLOB")]
    pub usage: Vec<String>,
    #[arg(long, value_name = "FILE")]
    pub ledger: PathBuf,
    #[arg(long, value_name = "FILE", default_value = "billable.csv")]
    pub output: PathBuf,
    #[arg(long, value_name = "FILE")]
    pub nonbillable_output: Option<PathBuf>,
    #[arg(long, value_name = "FILE", default_value = "subsidy.csv")]
    pub subsidy_output: PathBuf,
    /// Newline separated PIs that are never billed.
    #[arg(long, value_name = "FILE")]
    pub pi_file: Option<PathBuf>,
    /// Newline separated projects that are never billed.
    #[arg(long, value_name = "FILE")]
    pub projects_file: Option<PathBuf>,
    /// Projects paused between a start and end month.
    #[arg(long, value_name = "FILE")]
    pub timed_projects_file: Option<PathBuf>,
    /// Folder receiving one invoice per PI.
    #[arg(long, value_name = "DIR")]
    pub output_folder: Option<PathBuf>,
    #[arg(long)]
    pub dry_run: bool,
}

fn expand_usage(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let matched = glob::glob(pattern)?.collect::<Result<Vec<_>, _>>()?;
        if matched.is_empty() {
            return Err(anyhow!("no usage files match {}", pattern));
        }
        paths.extend(matched);
    }

    Ok(paths)
}

fn load_usage(paths: &[PathBuf]) -> Result<Vec<UsageRecord>> {
    let _span = span!(Level::INFO, "loading").entered();
    let started = Instant::now();

    let mut records = Vec::new();
    for path in paths {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed = parse_usage(&text).with_context(|| format!("parsing {}", path.display()))?;
        debug!("{} rows from {}", parsed.len(), path.display());
        records.extend(parsed);
    }

    let elapsed = Instant::now() - started;
    info!("loaded {} usage rows in {:?}", records.len(), elapsed);

    Ok(records)
}

fn read_list(path: &Path) -> Result<BTreeSet<String>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    Ok(text
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.to_owned())
        .collect())
}

fn write_table(path: &Path, table: &Table) -> Result<(), Error> {
    std::fs::write(path, table.to_text())?;
    info!("wrote {} rows to {}", table.rows.len(), path.display());

    Ok(())
}

/// Writes each PI's billable rows to `{institution}_{pi}_{month}.csv` in `folder`.
fn export_pi_billables(
    records: &[UsageRecord],
    folder: &Path,
    month: &InvoiceMonth,
) -> Result<Vec<PathBuf>, Error> {
    std::fs::create_dir_all(folder)?;

    let mut paths = Vec::new();
    for pi in records.iter().map(|r| r.pi.as_str()).unique() {
        let rows = records.iter().filter(|r| r.pi == pi).cloned().collect_vec();
        let institution = rows.first().map(|r| r.institution.as_str()).unwrap_or_default();
        let path = folder.join(format!("{}_{}_{}.csv", institution, pi, month));
        write_table(&path, &usage_table(&rows))?;
        paths.push(path);
    }

    Ok(paths)
}

fn print_summary(month: &InvoiceMonth, report: &CreditReport, subsidy: &BigDecimal) {
    println!("{}", format!("invoice {}", month).as_str().bold());
    println!("{:>16} {:>12}", "new PI credit", money(&report.default_credit));
    println!("{:>16} {:>12}", "credit applied", money(&report.applied));
    println!("{:>16} {:>12}", "subsidy applied", money(subsidy));

    for pi in report.new_pis.iter() {
        println!("{}", format!("{:>16} {}", "new PI", pi).as_str().green());
    }

    for overwritten in report.overwritten.iter() {
        println!("{}", overwritten.to_string().as_str().yellow());
    }
}

pub fn execute_command(config: &Configuration, cmd: &Command) -> anyhow::Result<()> {
    let paths = expand_usage(&cmd.usage)?;
    let mut records = load_usage(&paths)?;
    let month = invoice_month(&records)?;

    let mut pis = config.nonbillable_pis();
    if let Some(path) = &cmd.pi_file {
        pis.extend(read_list(path)?);
    }
    let mut projects = config.nonbillable_projects();
    if let Some(path) = &cmd.projects_file {
        projects.extend(read_list(path)?);
    }
    if let Some(path) = &cmd.timed_projects_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let timed = prepare::timed_projects(&text, &month)?;
        info!("timed projects not billed for {}: {:?}", month, timed);
        projects.extend(timed);
    }

    prepare::canonicalize_aliases(&mut records, &config.aliases);
    let (billable, nonbillable) = prepare::remove_nonbillables(records, &pis, &projects);
    let mut billable = prepare::validate_pi_names(billable);
    prepare::tag_institutions(&mut billable, &config.institutions);

    let store = LedgerFile::new(&cmd.ledger);
    let mut ledger = store.load()?;

    let report = config.credits().allocate(&month, &mut billable, &mut ledger)?;

    let subsidy = config.subsidy();
    let mut subsidized = subsidy.select(&billable);
    let subsidy_applied = subsidy.allocate(&mut subsidized);

    write_table(&cmd.output, &usage_table(&billable))?;
    if let Some(path) = &cmd.nonbillable_output {
        write_table(path, &usage_table(&nonbillable))?;
    }
    write_table(&cmd.subsidy_output, &subsidy_table(&subsidized))?;
    if let Some(folder) = &cmd.output_folder {
        let written = export_pi_billables(&billable, folder, &month)?;
        info!("wrote {} PI invoices to {}", written.len(), folder.display());
    }

    if cmd.dry_run {
        info!("dry run, leaving {} untouched", store.path().display());
    } else {
        store.save(&ledger)?;
    }

    print_summary(&month, &report, &subsidy_applied);

    Ok(())
}
