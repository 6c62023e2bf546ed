use std::borrow::Cow;

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while},
    character::complete::char,
    combinator::{map, opt, value},
    multi::{fold_many0, many0, separated_list1},
    sequence::{delimited, pair, terminated},
    IResult,
};

use crate::error::Error;


/// A comma separated table: one header row followed by records of the same width.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(header: Vec<String>) -> Self {
        Self {
            header,
            rows: Vec::default(),
        }
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    /// Rows are built from the header's own columns, so widths always agree.
    pub fn push(&mut self, row: Vec<String>) {
        debug_assert_eq!(row.len(), self.header.len());
        self.rows.push(row);
    }

    pub fn to_text(&self) -> String {
        std::iter::once(&self.header)
            .chain(self.rows.iter())
            .map(|row| {
                row.iter()
                    .map(|f| write_field(f))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .map(|line| line + "\n")
            .collect()
    }
}

fn line_ending(i: &str) -> IResult<&str, &str> {
    alt((tag("\r\n"), tag("\n")))(i)
}

fn quoted_field(i: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        fold_many0(
            alt((value("\"", tag("\"\"")), is_not("\""))),
            String::new,
            |mut acc, piece| {
                acc.push_str(piece);
                acc
            },
        ),
        char('"'),
    )(i)
}

fn bare_field(i: &str) -> IResult<&str, String> {
    map(take_while(|c: char| c != ',' && c != '\n' && c != '\r'), |s: &str| {
        s.to_owned()
    })(i)
}

fn field(i: &str) -> IResult<&str, String> {
    alt((quoted_field, bare_field))(i)
}

fn record(i: &str) -> IResult<&str, Vec<String>> {
    separated_list1(char(','), field)(i)
}

fn records(i: &str) -> IResult<&str, Vec<Vec<String>>> {
    map(
        pair(many0(terminated(record, line_ending)), opt(record)),
        |(mut rows, last)| {
            rows.extend(last);
            rows.into_iter().filter(|r| !is_blank(r)).collect()
        },
    )(i)
}

fn is_blank(row: &[String]) -> bool {
    row.len() == 1 && row[0].trim().is_empty()
}

pub fn parse_table(i: &str) -> Result<Table, Error> {
    let i = i.strip_prefix('\u{feff}').unwrap_or(i);

    let (remaining, mut rows) = records(i).map_err(|e| Error::Format(format!("{:?}", e)))?;
    if !remaining.is_empty() {
        return Err(Error::Format(format!(
            "unparsed table text near '{}'",
            remaining.chars().take(20).collect::<String>()
        )));
    }

    if rows.is_empty() {
        return Err(Error::Format("table has no header".to_owned()));
    }

    let header = rows.remove(0);
    for (number, row) in rows.iter().enumerate() {
        if row.len() != header.len() {
            return Err(Error::Format(format!(
                "row {} has {} fields, header has {}",
                number + 1,
                row.len(),
                header.len()
            )));
        }
    }

    Ok(Table { header, rows })
}

pub fn write_field(field: &str) -> Cow<'_, str> {
    if field.contains(|c: char| c == ',' || c == '"' || c == '\n' || c == '\r') {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}
