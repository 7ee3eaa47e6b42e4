//! Bulk import of requirements from spreadsheet uploads
//!
//! Uploads land in a temporary file owned by a [`TempUpload`] guard, which
//! removes the file when it goes out of scope on every return path. Rows are
//! processed in two passes inside one transaction: pass 1 creates or reuses
//! requirements, pass 2 links them to their parents.

use crate::access;
use crate::db::{
    find_requirement, insert_requirement, non_blank, resolve_group_in_project, Database, DbError, RequirementDraft,
    Result, User, PARENT_SEPARATOR, STATUS_DRAFT,
};
use crate::graph::{self, LinkOutcome};
use calamine::{open_workbook_auto, Data, Range, Reader};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const REQUIRED_COLUMNS: [&str; 2] = ["Requirement ID", "Title"];

const COL_ID: &str = "Requirement ID";
const COL_TITLE: &str = "Title";
const COL_DESCRIPTION: &str = "Description";
const COL_STATUS: &str = "Status";
const COL_CHAPTER: [&str; 2] = ["Chapter", "Category"];
const COL_PARENT: &str = "Parent ID";

/// Uploaded file on disk, deleted on drop
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
}

impl TempUpload {
    /// Take ownership of an existing file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Write `bytes` into `dir` under a unique name that keeps the original extension
    pub fn store(dir: &Path, filename: &str, bytes: &[u8]) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}-{}", uuid::Uuid::new_v4().simple(), secure_filename(filename)));
        fs::write(&path, bytes)?;
        Ok(Self { path })
    }

    /// Copy a local file into `dir`
    pub fn copy_from(dir: &Path, source: &Path) -> Result<Self> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let bytes = fs::read(source)?;
        Self::store(dir, &name, &bytes)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove upload");
            }
        }
    }
}

/// Keep ASCII alphanumerics, dot, dash and underscore
pub fn secure_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Spreadsheet formats accepted for import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    Workbook,
}

impl TableFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => Ok(TableFormat::Csv),
            "xlsx" | "xlsm" | "xls" | "ods" => Ok(TableFormat::Workbook),
            _ => Err(DbError::Validation(format!(
                "Unsupported file type '{}'. Upload a .csv, .xlsx or .xls file.",
                ext
            ))),
        }
    }
}

/// Header row plus data rows, every cell as trimmed text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn missing_columns(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|c| self.column(c).is_none())
            .map(|c| c.to_string())
            .collect()
    }

    fn cell<'a>(&'a self, row: &'a [String], column: Option<usize>) -> &'a str {
        column.and_then(|i| row.get(i)).map(String::as_str).unwrap_or("")
    }
}

pub fn read_table(path: &Path) -> Result<Table> {
    match TableFormat::from_path(path)? {
        TableFormat::Csv => read_csv(path),
        TableFormat::Workbook => read_workbook(path),
    }
}

fn read_csv(path: &Path) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(|c| c.trim().to_string()).collect());
    }
    Ok(Table { headers, rows })
}

fn read_workbook(path: &Path) -> Result<Table> {
    let mut workbook = open_workbook_auto(path)?;
    let range: Range<Data> = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| DbError::Tabular("workbook has no sheets".to_string()))??;

    let mut rows = range.rows().map(|row| {
        row.iter()
            .map(|cell| cell.to_string().trim().to_string())
            .collect::<Vec<_>>()
    });
    let headers = rows.next().unwrap_or_default();
    Ok(Table {
        headers,
        rows: rows.collect(),
    })
}

/// Counts reported after an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub processed: usize,
    pub skipped: usize,
    pub links_created: usize,
}

struct ImportRow<'a> {
    requirement_id: String,
    title: &'a str,
    description: Option<&'a str>,
    status: &'a str,
    chapter: Option<&'a str>,
    parents: Vec<&'a str>,
}

fn parse_rows(table: &Table) -> Vec<ImportRow<'_>> {
    let id_col = table.column(COL_ID);
    let title_col = table.column(COL_TITLE);
    let description_col = table.column(COL_DESCRIPTION);
    let status_col = table.column(COL_STATUS);
    let chapter_col = COL_CHAPTER.iter().find_map(|c| table.column(c));
    let parent_col = table.column(COL_PARENT);

    table
        .rows
        .iter()
        .filter(|row| row.iter().any(|c| !c.is_empty()))
        .map(|row| {
            let requirement_id = match table.cell(row, id_col) {
                "" => format!("REQ_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
                id => id.to_string(),
            };
            ImportRow {
                requirement_id,
                title: table.cell(row, title_col),
                description: non_blank(Some(table.cell(row, description_col))),
                status: non_blank(Some(table.cell(row, status_col))).unwrap_or(STATUS_DRAFT),
                chapter: non_blank(Some(table.cell(row, chapter_col))),
                parents: table
                    .cell(row, parent_col)
                    .split(PARENT_SEPARATOR)
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .collect(),
            }
        })
        .collect()
}

impl Database {
    /// Import an uploaded table into `group_id` of `project_id`. The upload is
    /// removed when this returns, whatever the outcome.
    pub fn import_upload(&self, actor: &User, project_id: i32, group_id: i32, upload: TempUpload) -> Result<ImportSummary> {
        tracing::info!(
            project_id,
            group_id,
            file = %upload.path().display(),
            user = %actor.username,
            "import started"
        );

        let summary = self.write(|conn| {
            access::authorize(conn, actor.id, project_id)?;
            resolve_group_in_project(conn, group_id, project_id)?;

            let table = read_table(upload.path())?;
            let missing = table.missing_columns(&REQUIRED_COLUMNS);
            if !missing.is_empty() {
                return Err(DbError::MissingColumns(missing));
            }
            let rows = parse_rows(&table);

            let mut summary = ImportSummary::default();
            let mut id_mapping = HashMap::new();

            for row in &rows {
                if let Some(existing) = find_requirement(conn, project_id, &row.requirement_id)? {
                    summary.skipped += 1;
                    id_mapping.insert(row.requirement_id.as_str(), existing);
                    continue;
                }
                if row.title.trim().is_empty() {
                    tracing::warn!(requirement_id = %row.requirement_id, "row without title skipped");
                    summary.skipped += 1;
                    continue;
                }
                let created = insert_requirement(
                    conn,
                    &RequirementDraft {
                        requirement_id: &row.requirement_id,
                        title: row.title,
                        description: row.description,
                        status: row.status,
                        chapter: row.chapter,
                        group_id,
                        project_id,
                    },
                    &actor.username,
                )?;
                summary.processed += 1;
                id_mapping.insert(row.requirement_id.as_str(), created);
            }

            for row in &rows {
                let Some(child) = id_mapping.get(row.requirement_id.as_str()) else {
                    continue;
                };
                for parent_ext in &row.parents {
                    let Some(parent) = id_mapping.get(parent_ext) else {
                        tracing::debug!(child = %row.requirement_id, parent = %parent_ext, "unknown parent ignored");
                        continue;
                    };
                    if graph::add_link_in(conn, child, parent)? == LinkOutcome::Created {
                        summary.links_created += 1;
                    }
                }
            }
            Ok(summary)
        });

        match &summary {
            Ok(s) => tracing::info!(
                processed = s.processed,
                skipped = s.skipped,
                links_created = s.links_created,
                "import finished"
            ),
            Err(e) => tracing::warn!(error = %e, "import failed"),
        }
        drop(upload);
        summary
    }
}
