//! Upstream archive retrieval and header-driven report parsing.

use std::io::{Cursor, Read};

use async_trait::async_trait;
use chrono::NaiveDate;
use cot_core::{ContractId, WeeklyObservation};
use cot_storage::{ArchiveSnapshots, FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

pub const CRATE_NAME: &str = "cot-adapters";

pub const DEFAULT_ARCHIVE_URL_TEMPLATE: &str =
    "https://www.cftc.gov/files/dea/history/fut_disagg_txt_{year}.zip";

/// Header names of the upstream delimited report.
pub mod columns {
    pub const CONTRACT_NAME: &str = "Market_and_Exchange_Names";
    pub const REPORT_DATE: &str = "Report_Date_as_YYYY-MM-DD";
    pub const PROD_CLASS: &str = "ProdClass";
    pub const COMM_LONG: &str = "Commercial_Positions_Long_All";
    pub const COMM_SHORT: &str = "Commercial_Positions_Short_All";
    pub const LS_LONG: &str = "Noncommercial_Positions_Long_All";
    pub const LS_SHORT: &str = "Noncommercial_Positions_Short_All";
    pub const SS_LONG: &str = "Nonreportable_Positions_Long_All";
    pub const SS_SHORT: &str = "Nonreportable_Positions_Short_All";

    // Optional.
    pub const OPEN_INTEREST: &str = "Open_Interest_All";
    pub const REGULATORY_CODE: &str = "CFTC_Contract_Market_Code";

    pub const REQUIRED: [&str; 9] = [
        CONTRACT_NAME,
        REPORT_DATE,
        PROD_CLASS,
        COMM_LONG,
        COMM_SHORT,
        LS_LONG,
        LS_SHORT,
        SS_LONG,
        SS_SHORT,
    ];
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("archive fetch for {year} failed with http {status} ({url})")]
    HttpStatus { year: i32, status: u16, url: String },
    #[error("archive fetch for {year} failed: {source}")]
    Transport {
        year: i32,
        #[source]
        source: FetchError,
    },
    #[error("storing archive snapshot for {year} failed: {source}")]
    Snapshot {
        year: i32,
        #[source]
        source: anyhow::Error,
    },
}

impl RetrievalError {
    pub fn year(&self) -> i32 {
        match self {
            RetrievalError::HttpStatus { year, .. }
            | RetrievalError::Transport { year, .. }
            | RetrievalError::Snapshot { year, .. } => *year,
        }
    }
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unreadable archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("reading archive entry: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive contains no delimited text entry")]
    NoTextEntry,
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("malformed delimited text: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: column {column} is not an integer: {value:?}")]
    InvalidNumber {
        line: u64,
        column: &'static str,
        value: String,
    },
    #[error("line {line}: invalid report date {value:?}")]
    InvalidDate { line: u64, value: String },
}

/// Supplies one year's raw compressed report archive.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn fetch_year(&self, year: i32) -> Result<Vec<u8>, RetrievalError>;
}

/// Fetches archives from a URL template containing a `{year}` placeholder.
#[derive(Debug, Clone)]
pub struct HttpArchiveSource {
    http: HttpFetcher,
    url_template: String,
    snapshots: Option<ArchiveSnapshots>,
}

impl HttpArchiveSource {
    pub fn new(http: HttpFetcher, url_template: impl Into<String>) -> Self {
        Self {
            http,
            url_template: url_template.into(),
            snapshots: None,
        }
    }

    pub fn with_snapshots(mut self, snapshots: ArchiveSnapshots) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn archive_url(&self, year: i32) -> String {
        self.url_template.replace("{year}", &year.to_string())
    }
}

#[async_trait]
impl ArchiveSource for HttpArchiveSource {
    async fn fetch_year(&self, year: i32) -> Result<Vec<u8>, RetrievalError> {
        let url = self.archive_url(year);
        info!(year, %url, "downloading report archive");

        let body = self.http.get_bytes(&url).await.map_err(|err| match err {
            FetchError::Status { status, url } => RetrievalError::HttpStatus { year, status, url },
            other => RetrievalError::Transport { year, source: other },
        })?;

        if let Some(snapshots) = &self.snapshots {
            let receipt = snapshots
                .record(year, &body)
                .await
                .map_err(|source| RetrievalError::Snapshot { year, source })?;
            if receipt.revised() {
                info!(
                    year,
                    sha256 = %receipt.sha256,
                    "upstream revised archive since last snapshot"
                );
            } else {
                debug!(year, path = %receipt.path.display(), "archive snapshot recorded");
            }
        }

        Ok(body)
    }
}

/// One parsed upstream line, before contract identity is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub contract_name: String,
    pub report_date: NaiveDate,
    pub prod_class: Option<String>,
    pub regulatory_code: Option<String>,
    pub comm_long: i64,
    pub comm_short: i64,
    pub ls_long: i64,
    pub ls_short: i64,
    pub ss_long: i64,
    pub ss_short: i64,
    pub open_interest: Option<i64>,
}

impl ReportRow {
    pub fn into_observation(self, contract_id: ContractId) -> WeeklyObservation {
        WeeklyObservation {
            contract_id,
            report_date: self.report_date,
            prod_class: self.prod_class,
            comm_long: self.comm_long,
            comm_short: self.comm_short,
            ls_long: self.ls_long,
            ls_short: self.ls_short,
            ss_long: self.ss_long,
            ss_short: self.ss_short,
            open_interest: self.open_interest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReport {
    pub entry_name: String,
    /// File order; not sorted.
    pub rows: Vec<ReportRow>,
    /// Lines skipped for a blank report date or contract name.
    pub dropped_rows: usize,
}

/// Locate the single delimited text entry in `bytes` and parse it.
pub fn parse_archive(bytes: &[u8]) -> Result<ParsedReport, FormatError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if !entry.is_file() || !is_delimited_text(entry.name()) {
            continue;
        }
        let entry_name = entry.name().to_string();
        let mut text = Vec::new();
        entry.read_to_end(&mut text)?;
        return parse_report_text(&entry_name, &text);
    }
    Err(FormatError::NoTextEntry)
}

fn is_delimited_text(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".txt") || lower.ends_with(".csv")
}

struct ColumnMap {
    contract_name: usize,
    report_date: usize,
    prod_class: usize,
    comm_long: usize,
    comm_short: usize,
    ls_long: usize,
    ls_short: usize,
    ss_long: usize,
    ss_short: usize,
    open_interest: Option<usize>,
    regulatory_code: Option<usize>,
}

impl ColumnMap {
    fn from_header(header: &[String]) -> Result<Self, FormatError> {
        let position = |name: &str| header.iter().position(|h| h == name);

        let missing = columns::REQUIRED
            .iter()
            .filter(|name| position(name).is_none())
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(FormatError::MissingColumns(missing));
        }

        let required = |name: &str| {
            position(name).ok_or_else(|| FormatError::MissingColumns(vec![name.to_string()]))
        };
        Ok(Self {
            contract_name: required(columns::CONTRACT_NAME)?,
            report_date: required(columns::REPORT_DATE)?,
            prod_class: required(columns::PROD_CLASS)?,
            comm_long: required(columns::COMM_LONG)?,
            comm_short: required(columns::COMM_SHORT)?,
            ls_long: required(columns::LS_LONG)?,
            ls_short: required(columns::LS_SHORT)?,
            ss_long: required(columns::SS_LONG)?,
            ss_short: required(columns::SS_SHORT)?,
            open_interest: position(columns::OPEN_INTEREST),
            regulatory_code: position(columns::REGULATORY_CODE),
        })
    }
}

/// Parse delimited report text. The header is validated before any row is read,
/// and a malformed numeric or date field rejects the whole file.
pub fn parse_report_text(entry_name: &str, text: &[u8]) -> Result<ParsedReport, FormatError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text);

    let header = reader
        .byte_headers()?
        .iter()
        .map(|h| {
            String::from_utf8_lossy(h)
                .trim_start_matches('\u{feff}')
                .trim()
                .to_string()
        })
        .collect::<Vec<_>>();
    let map = ColumnMap::from_header(&header)?;

    let mut rows = Vec::new();
    let mut dropped_rows = 0usize;

    for record in reader.byte_records() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let field = |idx: usize| {
            record
                .get(idx)
                .map(|raw| String::from_utf8_lossy(raw).trim().to_string())
                .unwrap_or_default()
        };

        let date_text = field(map.report_date);
        let contract_name = field(map.contract_name);
        if date_text.is_empty() || contract_name.is_empty() {
            dropped_rows += 1;
            continue;
        }

        let integer = |idx: usize, column: &'static str| -> Result<i64, FormatError> {
            let value = field(idx);
            value.parse::<i64>().map_err(|_| FormatError::InvalidNumber { line, column, value })
        };

        let open_interest = match map.open_interest {
            Some(idx) if !field(idx).is_empty() => Some(integer(idx, columns::OPEN_INTEREST)?),
            _ => None,
        };

        rows.push(ReportRow {
            report_date: parse_report_date(&date_text)
                .ok_or_else(|| FormatError::InvalidDate { line, value: date_text.clone() })?,
            contract_name,
            prod_class: Some(field(map.prod_class)).filter(|v| !v.is_empty()),
            regulatory_code: map
                .regulatory_code
                .map(field)
                .filter(|v| !v.is_empty()),
            comm_long: integer(map.comm_long, columns::COMM_LONG)?,
            comm_short: integer(map.comm_short, columns::COMM_SHORT)?,
            ls_long: integer(map.ls_long, columns::LS_LONG)?,
            ls_short: integer(map.ls_short, columns::LS_SHORT)?,
            ss_long: integer(map.ss_long, columns::SS_LONG)?,
            ss_short: integer(map.ss_short, columns::SS_SHORT)?,
            open_interest,
        });
    }

    if dropped_rows > 0 {
        warn!(entry_name, dropped_rows, "dropped rows without report date or contract name");
    }
    debug!(entry_name, rows = rows.len(), "parsed report entry");

    Ok(ParsedReport {
        entry_name: entry_name.to_string(),
        rows,
        dropped_rows,
    })
}

/// Accepts `YYYY-MM-DD`, optionally followed by a time part.
pub fn parse_report_date(value: &str) -> Option<NaiveDate> {
    let date_part = value
        .split(|c: char| c == ' ' || c == 'T')
        .next()
        .unwrap_or(value);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}
