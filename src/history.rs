//! Field-level change tracking for requirements
//!
//! Updates go through [`apply_update_in`]: the payload is diffed against the
//! stored row, one `field_changes` row is written per differing field, then the
//! merged row is saved. Identical values produce no rows and no write.

use crate::access;
use crate::db::{
    find_requirement, non_blank, now, requirement_by_external, resolve_group_in_project, Database, DbError,
    FieldChange, NewFieldChange, Requirement, Result, User, STATUS_DELETED,
};
use crate::schema::*;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Deserializer, Serialize};

/// Field name of the row written when a requirement is created
pub const CREATED_FIELD: &str = "created";

/// Fields a batch update may touch
pub const BATCH_FIELDS: [&str; 3] = ["status", "chapter", "group_id"];

/// Distinguish an absent field (`None`) from an explicit `null` (`Some(None)`)
pub fn double_option<'de, T, D>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Partial update over the tracked fields. Unknown fields are rejected at decode time.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequirementUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub chapter: Option<Option<String>>,
    #[serde(default)]
    pub group_id: Option<i32>,
}

impl RequirementUpdate {
    /// Names of present fields outside the batch allow-list
    pub fn non_batch_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        fields
    }

    fn validate(&self) -> Result<()> {
        if matches!(self.title.as_deref().map(str::trim), Some("")) {
            return Err(DbError::Validation("Title must not be empty".to_string()));
        }
        if matches!(self.status.as_deref().map(str::trim), Some("")) {
            return Err(DbError::Validation("Status must not be empty".to_string()));
        }
        Ok(())
    }
}

/// One differing field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDiff {
    pub field: &'static str,
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Result of a tracked update
#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub requirement: Requirement,
    pub changes: Vec<FieldDiff>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchUpdateRequest {
    pub project_id: i32,
    pub requirement_ids: Vec<String>,
    pub updates: RequirementUpdate,
}

#[derive(AsChangeset)]
#[diesel(table_name = requirements, treat_none_as_null = true)]
struct RequirementChangeset<'a> {
    title: &'a str,
    description: Option<&'a str>,
    status: &'a str,
    chapter: Option<&'a str>,
    group_id: i32,
    updated_by: Option<&'a str>,
    updated_at: &'a str,
}

/// Fields in `update` whose value differs from `current`
pub fn diff_fields(current: &Requirement, update: &RequirementUpdate) -> Vec<FieldDiff> {
    let mut diffs = Vec::new();
    let mut compare = |field: &'static str, old: Option<String>, new: Option<String>| {
        if old != new {
            diffs.push(FieldDiff { field, old, new });
        }
    };

    if let Some(title) = &update.title {
        compare("title", Some(current.title.clone()), Some(title.clone()));
    }
    if let Some(description) = &update.description {
        compare("description", current.description.clone(), description.clone());
    }
    if let Some(status) = &update.status {
        compare("status", Some(current.status.clone()), Some(status.clone()));
    }
    if let Some(chapter) = &update.chapter {
        compare("chapter", current.chapter.clone(), chapter.clone());
    }
    if let Some(group_id) = update.group_id {
        compare("group_id", Some(current.group_id.to_string()), Some(group_id.to_string()));
    }
    diffs
}

pub(crate) fn record_change(
    conn: &mut SqliteConnection,
    requirement_id: i32,
    field_name: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
    changed_by: &str,
) -> Result<()> {
    diesel::insert_into(field_changes::table)
        .values(&NewFieldChange {
            requirement_id,
            field_name,
            old_value,
            new_value,
            changed_by,
            changed_at: &now(),
        })
        .execute(conn)?;
    Ok(())
}

/// Validate, diff, record and write. Caller owns the transaction.
pub(crate) fn apply_update_in(
    conn: &mut SqliteConnection,
    actor: &User,
    current: &Requirement,
    update: &RequirementUpdate,
) -> Result<Vec<FieldDiff>> {
    if let Some(group_id) = update.group_id {
        resolve_group_in_project(conn, group_id, current.project_id)?;
    }
    update.validate()?;

    let diffs = diff_fields(current, update);
    if diffs.is_empty() {
        return Ok(diffs);
    }

    for diff in &diffs {
        record_change(
            conn,
            current.id,
            diff.field,
            diff.old.as_deref(),
            diff.new.as_deref(),
            &actor.username,
        )?;
    }

    let description = match &update.description {
        Some(d) => d.as_deref(),
        None => current.description.as_deref(),
    };
    let chapter = match &update.chapter {
        Some(c) => c.as_deref(),
        None => current.chapter.as_deref(),
    };
    diesel::update(requirements::table.find(current.id))
        .set(&RequirementChangeset {
            title: update.title.as_deref().unwrap_or(&current.title),
            description,
            status: update.status.as_deref().unwrap_or(&current.status),
            chapter,
            group_id: update.group_id.unwrap_or(current.group_id),
            updated_by: Some(&actor.username),
            updated_at: &now(),
        })
        .execute(conn)?;

    Ok(diffs)
}

pub(crate) fn history_for(conn: &mut SqliteConnection, requirement_id: i32) -> Result<Vec<FieldChange>> {
    Ok(field_changes::table
        .filter(field_changes::requirement_id.eq(requirement_id))
        .order((field_changes::changed_at.desc(), field_changes::id.desc()))
        .load::<FieldChange>(conn)?)
}

impl Database {
    /// Tracked update of one requirement
    pub fn update_requirement(
        &self,
        actor: &User,
        project_id: i32,
        external_id: &str,
        update: &RequirementUpdate,
    ) -> Result<UpdateOutcome> {
        let outcome = self.write(|conn| {
            access::authorize(conn, actor.id, project_id)?;
            let current = requirement_by_external(conn, project_id, external_id)?;
            let changes = apply_update_in(conn, actor, &current, update)?;
            let requirement = requirement_by_external(conn, project_id, external_id)?;
            Ok(UpdateOutcome { requirement, changes })
        })?;
        tracing::info!(
            requirement_id = %external_id,
            changed = outcome.changes.len(),
            user = %actor.username,
            "requirement updated"
        );
        Ok(outcome)
    }

    /// Soft delete: set the status sentinel through the tracker
    pub fn delete_requirement(&self, actor: &User, project_id: i32, external_id: &str) -> Result<UpdateOutcome> {
        let update = RequirementUpdate {
            status: Some(STATUS_DELETED.to_string()),
            ..Default::default()
        };
        self.update_requirement(actor, project_id, external_id, &update)
    }

    /// Apply one payload to many requirements in one transaction. Unknown ids are skipped.
    pub fn batch_update(&self, actor: &User, request: &BatchUpdateRequest) -> Result<BatchResult> {
        let rejected = request.updates.non_batch_fields();
        if !rejected.is_empty() {
            return Err(DbError::Validation(format!(
                "Batch updates only support {}; got {}",
                BATCH_FIELDS.join(", "),
                rejected.join(", ")
            )));
        }
        let mut updates = request.updates.clone();
        updates.status = non_blank(updates.status.as_deref()).map(str::to_string);

        let result = self.write(|conn| {
            access::authorize(conn, actor.id, request.project_id)?;
            if let Some(group_id) = updates.group_id {
                resolve_group_in_project(conn, group_id, request.project_id)?;
            }

            let mut result = BatchResult::default();
            for external_id in &request.requirement_ids {
                match find_requirement(conn, request.project_id, external_id)? {
                    Some(current) => {
                        apply_update_in(conn, actor, &current, &updates)?;
                        result.updated += 1;
                    }
                    None => result.skipped += 1,
                }
            }
            Ok(result)
        })?;

        tracing::info!(
            project_id = request.project_id,
            updated = result.updated,
            skipped = result.skipped,
            user = %actor.username,
            "batch update"
        );
        Ok(result)
    }

    /// History rows for a requirement, newest first
    pub fn requirement_history(&self, actor: &User, project_id: i32, external_id: &str) -> Result<Vec<FieldChange>> {
        self.read(|conn| {
            access::authorize(conn, actor.id, project_id)?;
            let requirement = requirement_by_external(conn, project_id, external_id)?;
            history_for(conn, requirement.id)
        })
    }
}
