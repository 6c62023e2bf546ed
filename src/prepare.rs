use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::{error::Error, model::*, month::InvoiceMonth, parsing::parse_table};

pub const TIMED_PROJECT_FIELD: &str = "Project";
pub const TIMED_START_FIELD: &str = "Start Date";
pub const TIMED_END_FIELD: &str = "End Date";

/// Splits records into the billable ones and those naming a non-billable PI or project.
pub fn remove_nonbillables(
    records: Vec<UsageRecord>,
    pis: &BTreeSet<String>,
    projects: &BTreeSet<String>,
) -> (Vec<UsageRecord>, Vec<UsageRecord>) {
    let (billable, nonbillable): (Vec<_>, Vec<_>) = records
        .into_iter()
        .partition(|r| !pis.contains(&r.pi) && !projects.contains(&r.project));

    debug!(
        "{} billable and {} non-billable records",
        billable.len(),
        nonbillable.len()
    );

    (billable, nonbillable)
}

/// Projects paused for `month`, read from a table of `YYYY-MM` start and end
/// months. Both ends are inclusive.
pub fn timed_projects(text: &str, month: &InvoiceMonth) -> Result<Vec<String>, Error> {
    let table = parse_table(text)?;
    let column = |name: &str| {
        table
            .column(name)
            .ok_or_else(|| Error::Format(format!("timed projects table has no '{}' column", name)))
    };
    let project = column(TIMED_PROJECT_FIELD)?;
    let start = column(TIMED_START_FIELD)?;
    let end = column(TIMED_END_FIELD)?;

    let mut projects = Vec::new();
    for row in table.rows.iter() {
        let starts = InvoiceMonth::parse(&row[start])?;
        let ends = InvoiceMonth::parse(&row[end])?;
        if &starts <= month && month <= &ends {
            projects.push(row[project].trim().to_owned());
        }
    }

    Ok(projects)
}

/// Drops records that name no PI.
pub fn validate_pi_names(records: Vec<UsageRecord>) -> Vec<UsageRecord> {
    records
        .into_iter()
        .filter(|r| {
            if r.pi.trim().is_empty() {
                warn!("billable project {} has empty PI field", r.project);
                false
            } else {
                true
            }
        })
        .collect()
}

/// Renames every alias to its canonical PI.
pub fn canonicalize_aliases(records: &mut [UsageRecord], aliases: &HashMap<String, Vec<String>>) {
    let canonical: HashMap<&str, &str> = aliases
        .iter()
        .flat_map(|(pi, names)| names.iter().map(move |n| (n.as_str(), pi.as_str())))
        .collect();

    for record in records.iter_mut() {
        if let Some(pi) = canonical.get(record.pi.as_str()) {
            record.pi = pi.to_string();
        }
    }
}

/// Institution for a PI, keyed by the domain of their username.
pub fn institution_for_pi<'m>(institutions: &'m HashMap<String, String>, pi: &str) -> Option<&'m str> {
    let domain = pi.rsplit('@').next().unwrap_or(pi);
    institutions.get(domain).map(|name| name.as_str())
}

/// Tags records with their PI's institution, keeping any the source already carried.
pub fn tag_institutions(records: &mut [UsageRecord], institutions: &HashMap<String, String>) {
    let mut unknown = BTreeSet::new();

    for record in records.iter_mut() {
        match institution_for_pi(institutions, &record.pi) {
            Some(name) => record.institution = name.to_owned(),
            None if record.institution.is_empty() => {
                unknown.insert(record.pi.clone());
            }
            None => {}
        }
    }

    for pi in unknown {
        warn!("PI name {} does not match any institution", pi);
    }
}
