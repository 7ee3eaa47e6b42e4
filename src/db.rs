//! SQLite database with Diesel ORM
//!
//! Stores projects, groups, requirements, requirement links and field history.
//! The schema is created at open time; every mutating operation runs inside a
//! single `IMMEDIATE` transaction so a failed call never leaves partial state.

use crate::access;
use crate::graph;
use crate::history;
use crate::schema::*;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::result::DatabaseErrorKind;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Default status for new requirements
pub const STATUS_DRAFT: &str = "Draft";

/// Soft-delete sentinel. Rows with this status are hidden from default listings.
pub const STATUS_DELETED: &str = "Deleted";

/// Separates parent ids in the tabular `Parent ID` column
pub const PARENT_SEPARATOR: char = ',';

/// Path segments under `/api/requirements/` that are not requirement ids
pub const RESERVED_REQUIREMENT_IDS: [&str; 2] = ["graph", "batch-update"];

const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5_000;

/// Walk up directory tree to find .reqgraph folder (like git finds .git)
/// Can be overridden with REQGRAPH_DB_PATH env var
fn get_db_path() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("REQGRAPH_DB_PATH") {
        return std::path::PathBuf::from(path);
    }

    if let Ok(current_dir) = std::env::current_dir() {
        let mut dir = current_dir.as_path();
        loop {
            let data_dir = dir.join(".reqgraph");
            if data_dir.is_dir() {
                return data_dir.join("reqgraph.db");
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    std::path::PathBuf::from(".reqgraph/reqgraph.db")
}

/// Current schema version
pub const CURRENT_SCHEMA: StoreSchema = StoreSchema {
    major: 2,
    minor: 1,
    patch: 0,
    name: "requirement-graph",
    features: &[
        "projects",
        "project_members",
        "requirement_groups",
        "requirements",
        "requirement_links",
        "field_changes",
        "sessions",
    ],
};

/// Describes the version and capabilities of the schema
#[derive(Debug, Clone)]
pub struct StoreSchema {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub name: &'static str,
    pub features: &'static [&'static str],
}

impl StoreSchema {
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(&feature)
    }
}

impl std::fmt::Display for StoreSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{} ({})", self.version_string(), self.name)
    }
}

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS schema_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        version TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        features TEXT NOT NULL,
        introduced_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        email TEXT,
        is_active BOOLEAN NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sessions (
        token TEXT PRIMARY KEY NOT NULL,
        user_id INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS project_members (
        user_id INTEGER NOT NULL,
        project_id INTEGER NOT NULL,
        added_at TEXT NOT NULL,
        PRIMARY KEY (user_id, project_id),
        FOREIGN KEY (user_id) REFERENCES users(id),
        FOREIGN KEY (project_id) REFERENCES projects(id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS requirement_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        parent_id INTEGER,
        project_id INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (parent_id) REFERENCES requirement_groups(id),
        FOREIGN KEY (project_id) REFERENCES projects(id),
        UNIQUE(project_id, name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS requirements (
        id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        requirement_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        status TEXT NOT NULL DEFAULT 'Draft',
        chapter TEXT,
        group_id INTEGER NOT NULL,
        project_id INTEGER NOT NULL,
        graph_x REAL,
        graph_y REAL,
        created_by TEXT,
        updated_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (group_id) REFERENCES requirement_groups(id),
        FOREIGN KEY (project_id) REFERENCES projects(id),
        UNIQUE(project_id, requirement_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS requirement_links (
        parent_id INTEGER NOT NULL,
        child_id INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (parent_id, child_id),
        CHECK (parent_id <> child_id),
        FOREIGN KEY (parent_id) REFERENCES requirements(id),
        FOREIGN KEY (child_id) REFERENCES requirements(id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS field_changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        requirement_id INTEGER NOT NULL,
        field_name TEXT NOT NULL,
        old_value TEXT,
        new_value TEXT,
        changed_by TEXT NOT NULL,
        changed_at TEXT NOT NULL,
        FOREIGN KEY (requirement_id) REFERENCES requirements(id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_requirements_project ON requirements(project_id)",
    "CREATE INDEX IF NOT EXISTS idx_requirements_group ON requirements(group_id)",
    "CREATE INDEX IF NOT EXISTS idx_requirements_status ON requirements(status)",
    "CREATE INDEX IF NOT EXISTS idx_links_child ON requirement_links(child_id)",
    "CREATE INDEX IF NOT EXISTS idx_groups_parent ON requirement_groups(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_field_changes_requirement ON field_changes(requirement_id)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
];

// ============================================================================
// Diesel Models
// ============================================================================

/// Insertable schema version
#[derive(Insertable)]
#[diesel(table_name = schema_versions)]
pub struct NewSchemaVersion<'a> {
    pub version: &'a str,
    pub name: &'a str,
    pub features: &'a str,
    pub introduced_at: &'a str,
}

/// Queryable user account
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub email: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub password_hash: &'a str,
    pub email: Option<&'a str>,
    pub is_active: bool,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Queryable login session
#[derive(Queryable, Selectable, Insertable, Debug, Clone, Serialize)]
#[diesel(table_name = sessions)]
pub struct Session {
    pub token: String,
    pub user_id: i32,
    pub created_at: String,
    pub expires_at: String,
}

/// Queryable project
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = projects)]
pub struct Project {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = projects)]
pub struct NewProject<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Membership row; a user can read and mutate a project only through one of these
#[derive(Queryable, Selectable, Insertable, Debug, Clone, Serialize)]
#[diesel(table_name = project_members)]
pub struct ProjectMember {
    pub user_id: i32,
    pub project_id: i32,
    pub added_at: String,
}

/// Queryable requirement group
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = requirement_groups)]
pub struct Group {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<i32>,
    pub project_id: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = requirement_groups)]
pub struct NewGroup<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub parent_id: Option<i32>,
    pub project_id: i32,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

#[derive(AsChangeset)]
#[diesel(table_name = requirement_groups, treat_none_as_null = true)]
struct GroupChangeset<'a> {
    name: &'a str,
    description: Option<&'a str>,
    parent_id: Option<i32>,
    updated_at: &'a str,
}

/// Queryable requirement
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = requirements)]
pub struct Requirement {
    pub id: i32,
    pub requirement_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub chapter: Option<String>,
    pub group_id: i32,
    pub project_id: i32,
    pub graph_x: Option<f64>,
    pub graph_y: Option<f64>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Requirement {
    pub fn is_deleted(&self) -> bool {
        self.status == STATUS_DELETED
    }
}

#[derive(Insertable)]
#[diesel(table_name = requirements)]
pub struct NewRequirement<'a> {
    pub requirement_id: &'a str,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub status: &'a str,
    pub chapter: Option<&'a str>,
    pub group_id: i32,
    pub project_id: i32,
    pub graph_x: Option<f64>,
    pub graph_y: Option<f64>,
    pub created_by: Option<&'a str>,
    pub updated_by: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Queryable parent -> child edge
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq, Serialize)]
#[diesel(table_name = requirement_links)]
pub struct RequirementLink {
    pub parent_id: i32,
    pub child_id: i32,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = requirement_links)]
pub struct NewRequirementLink<'a> {
    pub parent_id: i32,
    pub child_id: i32,
    pub created_at: &'a str,
}

/// Queryable history row
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = field_changes)]
pub struct FieldChange {
    pub id: i32,
    pub requirement_id: i32,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by: String,
    pub changed_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = field_changes)]
pub struct NewFieldChange<'a> {
    pub requirement_id: i32,
    pub field_name: &'a str,
    pub old_value: Option<&'a str>,
    pub new_value: Option<&'a str>,
    pub changed_by: &'a str,
    pub changed_at: &'a str,
}

// ============================================================================
// Request payloads
// ============================================================================

/// Partial project update. `description: null` clears the description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "history::double_option")]
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGroupRequest {
    pub project_id: i32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<i32>,
}

/// Partial group update. `parent_id: null` detaches the group from its parent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "history::double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "history::double_option")]
    pub parent_id: Option<Option<i32>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRequirementRequest {
    pub project_id: i32,
    pub requirement_id: String,
    pub title: String,
    pub group_id: i32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub chapter: Option<String>,
    /// External ids of parents to link on creation
    #[serde(default)]
    pub parent_ids: Vec<String>,
}

/// Fields for a requirement row about to be inserted
#[derive(Debug, Clone)]
pub(crate) struct RequirementDraft<'a> {
    pub requirement_id: &'a str,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub status: &'a str,
    pub chapter: Option<&'a str>,
    pub group_id: i32,
    pub project_id: i32,
}

/// Listing filter; every field narrows the result
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequirementFilter {
    #[serde(default)]
    pub project_id: Option<i32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub group_id: Option<i32>,
    /// Internal id of a parent; only its direct children are returned
    #[serde(default)]
    pub parent_id: Option<i32>,
    #[serde(default)]
    pub include_deleted: bool,
}

// ============================================================================
// Response shapes
// ============================================================================

/// Requirement with resolved group name and parent external ids
#[derive(Debug, Clone, Serialize)]
pub struct RequirementView {
    #[serde(flatten)]
    pub requirement: Requirement,
    pub group_name: Option<String>,
    pub parents: Vec<String>,
    pub children_count: usize,
}

/// Short reference to a related requirement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequirementRef {
    pub id: i32,
    pub requirement_id: String,
    pub title: String,
    pub status: String,
}

impl From<&Requirement> for RequirementRef {
    fn from(r: &Requirement) -> Self {
        Self {
            id: r.id,
            requirement_id: r.requirement_id.clone(),
            title: r.title.clone(),
            status: r.status.clone(),
        }
    }
}

/// Single requirement with its neighbourhood and history
#[derive(Debug, Clone, Serialize)]
pub struct RequirementDetail {
    #[serde(flatten)]
    pub view: RequirementView,
    pub parent_objs: Vec<RequirementRef>,
    pub children: Vec<RequirementRef>,
    pub history: Vec<FieldChange>,
}

// ============================================================================
// Errors
// ============================================================================

/// Error type for database operations
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Validation(String),

    #[error("Invalid group: {0}")]
    InvalidGroup(String),

    #[error("Requirement {child} and parent {parent} belong to different projects")]
    CrossProjectViolation { child: String, parent: String },

    #[error("Linking {parent} -> {child} would create a circular reference")]
    CycleDetected { child: String, parent: String },

    #[error("Cannot set requirement {0} as its own parent")]
    SelfLink(String),

    #[error("Missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    #[error("Tabular file error: {0}")]
    Tabular(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    /// HTTP status for this error
    pub fn status_code(&self) -> u16 {
        match self {
            DbError::NotFound(_) => 404,
            DbError::AccessDenied(_) => 403,
            DbError::Unauthenticated(_) => 401,
            DbError::DuplicateName(_) => 409,
            DbError::Validation(_)
            | DbError::InvalidGroup(_)
            | DbError::CrossProjectViolation { .. }
            | DbError::CycleDetected { .. }
            | DbError::SelfLink(_)
            | DbError::MissingColumns(_)
            | DbError::Tabular(_) => 400,
            DbError::Connection(_)
            | DbError::Pool(_)
            | DbError::Query(_)
            | DbError::Io(_)
            | DbError::Json(_) => 500,
        }
    }

    /// Message safe to show to API clients
    pub fn public_message(&self) -> String {
        if self.status_code() >= 500 {
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<csv::Error> for DbError {
    fn from(e: csv::Error) -> Self {
        DbError::Tabular(e.to_string())
    }
}

impl From<calamine::Error> for DbError {
    fn from(e: calamine::Error) -> Self {
        DbError::Tabular(e.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for DbError {
    fn from(e: rust_xlsxwriter::XlsxError) -> Self {
        DbError::Tabular(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Map a unique-constraint failure to `DuplicateName`, pass everything else through
pub(crate) fn unique_or(e: diesel::result::Error, what: impl FnOnce() -> String) -> DbError {
    match e {
        diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            DbError::DuplicateName(what())
        }
        other => DbError::Query(other),
    }
}

pub(crate) fn now() -> String {
    chrono::Local::now().to_rfc3339()
}

pub(crate) fn last_insert_id(conn: &mut SqliteConnection) -> Result<i32> {
    let id: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()"))
        .first(conn)?;
    Ok(id)
}

/// Trim and turn blank strings into `None`
pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas applied when the pool hands out a connection
#[derive(Debug)]
struct ConnectionOptions {
    busy_timeout_ms: u32,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database connection wrapper with connection pool
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Get the database path that will be used
    pub fn db_path() -> std::path::PathBuf {
        get_db_path()
    }

    /// Open database at default path (respects REQGRAPH_DB_PATH env var)
    pub fn open() -> Result<Self> {
        Self::open_at(get_db_path())
    }

    /// Open database at specified path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    /// Open database at specified path with an explicit busy timeout
    pub fn open_with<P: AsRef<Path>>(path: P, busy_timeout_ms: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path_str = path.to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(5)
            .connection_customizer(Box::new(ConnectionOptions { busy_timeout_ms }))
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.init_schema()?;
        tracing::debug!(path = %path.display(), schema = %CURRENT_SCHEMA, "database opened");
        Ok(db)
    }

    pub(crate) fn get_conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside one immediate (write-locking) transaction
    pub(crate) fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T>,
    {
        let mut conn = self.get_conn()?;
        conn.immediate_transaction(f)
    }

    /// Run `f` against a pooled connection without opening a transaction
    pub(crate) fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T>,
    {
        let mut conn = self.get_conn()?;
        f(&mut *conn)
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;
        conn.batch_execute("PRAGMA journal_mode = WAL;")?;

        for statement in SCHEMA_STATEMENTS {
            diesel::sql_query(*statement).execute(&mut *conn)?;
        }

        let features_json = serde_json::to_string(&CURRENT_SCHEMA.features)?;
        let version = CURRENT_SCHEMA.version_string();
        let introduced_at = now();
        diesel::insert_or_ignore_into(schema_versions::table)
            .values(&NewSchemaVersion {
                version: &version,
                name: CURRENT_SCHEMA.name,
                features: &features_json,
                introduced_at: &introduced_at,
            })
            .execute(&mut *conn)?;
        Ok(())
    }

    // ========================================================================
    // Project Operations
    // ========================================================================

    /// Create a project; the creator becomes its first member
    pub fn create_project(&self, actor: &User, name: &str, description: Option<&str>) -> Result<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DbError::Validation("Project name is required".to_string()));
        }

        let project = self.write(|conn| {
            let ts = now();
            diesel::insert_into(projects::table)
                .values(&NewProject {
                    name,
                    description,
                    created_at: &ts,
                    updated_at: &ts,
                })
                .execute(conn)
                .map_err(|e| unique_or(e, || format!("project '{}' already exists", name)))?;
            let id = last_insert_id(conn)?;

            diesel::insert_into(project_members::table)
                .values(&ProjectMember {
                    user_id: actor.id,
                    project_id: id,
                    added_at: ts.clone(),
                })
                .execute(conn)?;

            Ok(projects::table.find(id).first::<Project>(conn)?)
        })?;

        tracing::info!(project_id = project.id, name = %project.name, user = %actor.username, "project created");
        Ok(project)
    }

    /// Projects the actor is a member of
    pub fn list_projects(&self, actor: &User) -> Result<Vec<Project>> {
        self.read(|conn| {
            let ids = access::member_project_ids(conn, actor.id)?;
            Ok(projects::table
                .filter(projects::id.eq_any(ids))
                .order(projects::name.asc())
                .load::<Project>(conn)?)
        })
    }

    pub fn get_project(&self, actor: &User, project_id: i32) -> Result<Project> {
        self.read(|conn| Ok(access::authorize(conn, actor.id, project_id)?.1))
    }

    pub fn update_project(&self, actor: &User, project_id: i32, update: &ProjectUpdate) -> Result<Project> {
        self.write(|conn| {
            let (_, project) = access::authorize(conn, actor.id, project_id)?;
            let name = match update.name.as_deref().map(str::trim) {
                Some("") => return Err(DbError::Validation("Project name is required".to_string())),
                Some(name) => name.to_string(),
                None => project.name.clone(),
            };
            let description = match &update.description {
                Some(description) => description.clone(),
                None => project.description.clone(),
            };

            diesel::update(projects::table.find(project_id))
                .set((
                    projects::name.eq(&name),
                    projects::description.eq(description.as_deref()),
                    projects::updated_at.eq(now()),
                ))
                .execute(conn)
                .map_err(|e| unique_or(e, || format!("project '{}' already exists", name)))?;

            Ok(projects::table.find(project_id).first::<Project>(conn)?)
        })
    }

    /// Delete a project. Refused while it still owns groups.
    pub fn delete_project(&self, actor: &User, project_id: i32) -> Result<()> {
        self.write(|conn| {
            access::authorize(conn, actor.id, project_id)?;
            let groups: i64 = requirement_groups::table
                .filter(requirement_groups::project_id.eq(project_id))
                .count()
                .get_result(conn)?;
            if groups > 0 {
                return Err(DbError::Validation(
                    "Cannot delete project with groups. Please delete all groups first.".to_string(),
                ));
            }
            diesel::delete(project_members::table.filter(project_members::project_id.eq(project_id)))
                .execute(conn)?;
            diesel::delete(projects::table.find(project_id)).execute(conn)?;
            Ok(())
        })?;
        tracing::info!(project_id, user = %actor.username, "project deleted");
        Ok(())
    }

    // ========================================================================
    // Group Operations
    // ========================================================================

    pub fn create_group(&self, actor: &User, request: &NewGroupRequest) -> Result<Group> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(DbError::Validation("Group name is required".to_string()));
        }

        let group = self.write(|conn| {
            access::authorize(conn, actor.id, request.project_id)?;
            if let Some(parent_id) = request.parent_id {
                let parent = find_group(conn, parent_id)?
                    .ok_or_else(|| DbError::NotFound(format!("parent group {}", parent_id)))?;
                if parent.project_id != request.project_id {
                    return Err(DbError::Validation(
                        "Parent group must belong to the same project".to_string(),
                    ));
                }
            }

            let ts = now();
            diesel::insert_into(requirement_groups::table)
                .values(&NewGroup {
                    name,
                    description: request.description.as_deref(),
                    parent_id: request.parent_id,
                    project_id: request.project_id,
                    created_at: &ts,
                    updated_at: &ts,
                })
                .execute(conn)
                .map_err(|e| unique_or(e, || format!("group '{}' already exists in this project", name)))?;
            let id = last_insert_id(conn)?;
            Ok(requirement_groups::table.find(id).first::<Group>(conn)?)
        })?;

        tracing::info!(group_id = group.id, project_id = group.project_id, name = %group.name, "group created");
        Ok(group)
    }

    pub fn update_group(&self, actor: &User, group_id: i32, update: &GroupUpdate) -> Result<Group> {
        self.write(|conn| {
            let group = find_group(conn, group_id)?
                .ok_or_else(|| DbError::NotFound(format!("group {}", group_id)))?;
            access::authorize(conn, actor.id, group.project_id)?;

            let name = match update.name.as_deref().map(str::trim) {
                Some("") => return Err(DbError::Validation("Group name is required".to_string())),
                Some(name) => name.to_string(),
                None => group.name.clone(),
            };
            let description = match &update.description {
                Some(d) => d.clone(),
                None => group.description.clone(),
            };
            let parent_id = match update.parent_id {
                Some(p) => p,
                None => group.parent_id,
            };

            if parent_id != group.parent_id {
                if let Some(new_parent) = parent_id {
                    let parent = find_group(conn, new_parent)?
                        .ok_or_else(|| DbError::NotFound(format!("parent group {}", new_parent)))?;
                    if parent.project_id != group.project_id {
                        return Err(DbError::Validation(
                            "Parent group must belong to the same project".to_string(),
                        ));
                    }
                    let siblings = requirement_groups::table
                        .filter(requirement_groups::project_id.eq(group.project_id))
                        .load::<Group>(conn)?;
                    if graph::group_would_cycle(&siblings, group.id, new_parent) {
                        return Err(DbError::Validation(format!(
                            "Group {} cannot be placed under its own descendant {}",
                            group.id, new_parent
                        )));
                    }
                }
            }

            diesel::update(requirement_groups::table.find(group_id))
                .set(&GroupChangeset {
                    name: &name,
                    description: description.as_deref(),
                    parent_id,
                    updated_at: &now(),
                })
                .execute(conn)
                .map_err(|e| unique_or(e, || format!("group '{}' already exists in this project", name)))?;

            Ok(requirement_groups::table.find(group_id).first::<Group>(conn)?)
        })
    }

    /// Delete a group. It must not own requirements or child groups.
    pub fn delete_group(&self, actor: &User, group_id: i32) -> Result<()> {
        self.write(|conn| {
            let group = find_group(conn, group_id)?
                .ok_or_else(|| DbError::NotFound(format!("group {}", group_id)))?;
            access::authorize(conn, actor.id, group.project_id)?;

            let owned: i64 = requirements::table
                .filter(requirements::group_id.eq(group_id))
                .count()
                .get_result(conn)?;
            if owned > 0 {
                return Err(DbError::Validation(
                    "Cannot delete group with requirements. Please move or delete all requirements first."
                        .to_string(),
                ));
            }

            let children: i64 = requirement_groups::table
                .filter(requirement_groups::parent_id.eq(group_id))
                .count()
                .get_result(conn)?;
            if children > 0 {
                return Err(DbError::Validation(
                    "Cannot delete group with child groups. Please move or delete all child groups first."
                        .to_string(),
                ));
            }

            diesel::delete(requirement_groups::table.find(group_id)).execute(conn)?;
            Ok(())
        })?;
        tracing::info!(group_id, user = %actor.username, "group deleted");
        Ok(())
    }

    pub fn list_groups(&self, actor: &User, project_id: i32) -> Result<Vec<Group>> {
        self.read(|conn| {
            access::authorize(conn, actor.id, project_id)?;
            Ok(requirement_groups::table
                .filter(requirement_groups::project_id.eq(project_id))
                .order(requirement_groups::name.asc())
                .load::<Group>(conn)?)
        })
    }

    // ========================================================================
    // Requirement Operations
    // ========================================================================

    /// Create a requirement, record its `created` history row and link any parents
    pub fn create_requirement(&self, actor: &User, request: &NewRequirementRequest) -> Result<Requirement> {
        let requirement = self.write(|conn| {
            access::authorize(conn, actor.id, request.project_id)?;
            let group = resolve_group_in_project(conn, request.group_id, request.project_id)?;

            let external_id = request.requirement_id.trim();
            if find_requirement(conn, request.project_id, external_id)?.is_some() {
                return Err(DbError::DuplicateName(format!(
                    "requirement '{}' already exists in this project",
                    external_id
                )));
            }

            let status = non_blank(request.status.as_deref()).unwrap_or(STATUS_DRAFT);
            let requirement = insert_requirement(
                conn,
                &RequirementDraft {
                    requirement_id: external_id,
                    title: &request.title,
                    description: request.description.as_deref(),
                    status,
                    chapter: non_blank(request.chapter.as_deref()),
                    group_id: group.id,
                    project_id: request.project_id,
                },
                &actor.username,
            )?;

            for parent_ext in request.parent_ids.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
                let parent = requirement_by_external(conn, request.project_id, parent_ext)?;
                graph::add_link_in(conn, &requirement, &parent)?;
            }

            Ok(requirement)
        })?;

        tracing::info!(
            id = requirement.id,
            requirement_id = %requirement.requirement_id,
            project_id = requirement.project_id,
            user = %actor.username,
            "requirement created"
        );
        Ok(requirement)
    }

    /// Requirement by external id, with parents, children and history
    pub fn get_requirement(&self, actor: &User, project_id: i32, external_id: &str) -> Result<RequirementDetail> {
        self.read(|conn| {
            access::authorize(conn, actor.id, project_id)?;
            let requirement = requirement_by_external(conn, project_id, external_id)?;
            let links = graph::load_project_links(conn, project_id)?;

            let related: Vec<i32> = links
                .parents(requirement.id)
                .iter()
                .chain(links.children(requirement.id))
                .copied()
                .collect();
            let by_id: HashMap<i32, Requirement> = requirements::table
                .filter(requirements::id.eq_any(&related))
                .load::<Requirement>(conn)?
                .into_iter()
                .map(|r| (r.id, r))
                .collect();
            let refs = |ids: &[i32]| -> Vec<RequirementRef> {
                ids.iter().filter_map(|id| by_id.get(id)).map(RequirementRef::from).collect()
            };
            let parent_objs = refs(links.parents(requirement.id));
            let children = refs(links.children(requirement.id));

            let history = history::history_for(conn, requirement.id)?;
            let mut views = build_views(conn, vec![requirement])?;
            let view = views
                .pop()
                .ok_or_else(|| DbError::NotFound(format!("requirement '{}'", external_id)))?;

            Ok(RequirementDetail {
                view,
                parent_objs,
                children,
                history,
            })
        })
    }

    /// List requirements across the actor's projects (or one project), soft-deleted rows excluded
    /// unless `include_deleted` is set or the status filter asks for them explicitly
    pub fn list_requirements(&self, actor: &User, filter: &RequirementFilter) -> Result<Vec<RequirementView>> {
        self.read(|conn| {
            let project_ids = match filter.project_id {
                Some(project_id) => {
                    access::authorize(conn, actor.id, project_id)?;
                    vec![project_id]
                }
                None => access::member_project_ids(conn, actor.id)?,
            };

            let mut query = requirements::table
                .filter(requirements::project_id.eq_any(project_ids))
                .into_boxed();

            let status = non_blank(filter.status.as_deref());
            if let Some(status) = status {
                query = query.filter(requirements::status.eq(status.to_string()));
            }
            if !filter.include_deleted && status != Some(STATUS_DELETED) {
                query = query.filter(requirements::status.ne(STATUS_DELETED));
            }
            if let Some(chapter) = non_blank(filter.chapter.as_deref()) {
                query = query.filter(requirements::chapter.eq(chapter.to_string()));
            }
            if let Some(group_id) = filter.group_id {
                query = query.filter(requirements::group_id.eq(group_id));
            }
            if let Some(parent_id) = filter.parent_id {
                let child_ids: Vec<i32> = requirement_links::table
                    .filter(requirement_links::parent_id.eq(parent_id))
                    .select(requirement_links::child_id)
                    .load(conn)?;
                query = query.filter(requirements::id.eq_any(child_ids));
            }

            let rows = query.order(requirements::id.asc()).load::<Requirement>(conn)?;
            tracing::debug!(count = rows.len(), "requirements listed");
            build_views(conn, rows)
        })
    }

    /// Persist the visualization position; not a tracked field
    pub fn update_position(
        &self,
        actor: &User,
        project_id: i32,
        external_id: &str,
        x: Option<f64>,
        y: Option<f64>,
    ) -> Result<Requirement> {
        self.write(|conn| {
            access::authorize(conn, actor.id, project_id)?;
            let requirement = requirement_by_external(conn, project_id, external_id)?;
            diesel::update(requirements::table.find(requirement.id))
                .set((
                    requirements::graph_x.eq(x),
                    requirements::graph_y.eq(y),
                    requirements::updated_by.eq(Some(actor.username.as_str())),
                    requirements::updated_at.eq(now()),
                ))
                .execute(conn)?;
            Ok(requirements::table.find(requirement.id).first::<Requirement>(conn)?)
        })
    }
}

// ============================================================================
// Connection-level helpers shared by the graph, history and import modules
// ============================================================================

pub(crate) fn find_group(conn: &mut SqliteConnection, group_id: i32) -> Result<Option<Group>> {
    Ok(requirement_groups::table
        .find(group_id)
        .first::<Group>(conn)
        .optional()?)
}

/// The group must exist and belong to `project_id`, otherwise `InvalidGroup`
pub(crate) fn resolve_group_in_project(conn: &mut SqliteConnection, group_id: i32, project_id: i32) -> Result<Group> {
    match find_group(conn, group_id)? {
        Some(group) if group.project_id == project_id => Ok(group),
        Some(_) => Err(DbError::InvalidGroup(format!(
            "group {} does not belong to project {}",
            group_id, project_id
        ))),
        None => Err(DbError::InvalidGroup(format!("group {} does not exist", group_id))),
    }
}

pub(crate) fn find_requirement_by_id(conn: &mut SqliteConnection, id: i32) -> Result<Option<Requirement>> {
    Ok(requirements::table.find(id).first::<Requirement>(conn).optional()?)
}

pub(crate) fn find_requirement(
    conn: &mut SqliteConnection,
    project_id: i32,
    external_id: &str,
) -> Result<Option<Requirement>> {
    Ok(requirements::table
        .filter(requirements::project_id.eq(project_id))
        .filter(requirements::requirement_id.eq(external_id))
        .first::<Requirement>(conn)
        .optional()?)
}

pub(crate) fn requirement_by_external(
    conn: &mut SqliteConnection,
    project_id: i32,
    external_id: &str,
) -> Result<Requirement> {
    find_requirement(conn, project_id, external_id)?
        .ok_or_else(|| DbError::NotFound(format!("requirement '{}'", external_id)))
}

/// Insert a requirement row plus its `created` history row
pub(crate) fn validate_external_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(DbError::Validation("Requirement ID is required".to_string()));
    }
    if id.contains(PARENT_SEPARATOR) {
        return Err(DbError::Validation(format!(
            "Requirement ID '{}' must not contain '{}'",
            id, PARENT_SEPARATOR
        )));
    }
    if RESERVED_REQUIREMENT_IDS.contains(&id) {
        return Err(DbError::Validation(format!("Requirement ID '{}' is reserved", id)));
    }
    Ok(())
}

pub(crate) fn insert_requirement(
    conn: &mut SqliteConnection,
    draft: &RequirementDraft<'_>,
    changed_by: &str,
) -> Result<Requirement> {
    validate_external_id(draft.requirement_id)?;
    if draft.title.trim().is_empty() {
        return Err(DbError::Validation("Title is required".to_string()));
    }

    let ts = now();
    diesel::insert_into(requirements::table)
        .values(&NewRequirement {
            requirement_id: draft.requirement_id,
            title: draft.title,
            description: draft.description,
            status: draft.status,
            chapter: draft.chapter,
            group_id: draft.group_id,
            project_id: draft.project_id,
            graph_x: None,
            graph_y: None,
            created_by: Some(changed_by),
            updated_by: Some(changed_by),
            created_at: &ts,
            updated_at: &ts,
        })
        .execute(conn)
        .map_err(|e| {
            unique_or(e, || {
                format!("requirement '{}' already exists in this project", draft.requirement_id)
            })
        })?;
    let id = last_insert_id(conn)?;

    history::record_change(
        conn,
        id,
        history::CREATED_FIELD,
        None,
        Some(draft.requirement_id),
        changed_by,
    )?;

    Ok(requirements::table.find(id).first::<Requirement>(conn)?)
}

/// Attach group names and parent external ids with one query per table
pub(crate) fn build_views(conn: &mut SqliteConnection, rows: Vec<Requirement>) -> Result<Vec<RequirementView>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let group_ids: HashSet<i32> = rows.iter().map(|r| r.group_id).collect();
    let group_names: HashMap<i32, String> = requirement_groups::table
        .filter(requirement_groups::id.eq_any(group_ids))
        .load::<Group>(conn)?
        .into_iter()
        .map(|g| (g.id, g.name))
        .collect();

    let project_ids: Vec<i32> = rows
        .iter()
        .map(|r| r.project_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let links = graph::load_links_for_projects(conn, &project_ids)?;
    let external_ids: HashMap<i32, String> = requirements::table
        .filter(requirements::project_id.eq_any(&project_ids))
        .select((requirements::id, requirements::requirement_id))
        .load::<(i32, String)>(conn)?
        .into_iter()
        .collect();

    Ok(rows
        .into_iter()
        .map(|requirement| {
            let parents = links
                .parents(requirement.id)
                .iter()
                .filter_map(|p| external_ids.get(p).cloned())
                .collect();
            RequirementView {
                group_name: group_names.get(&requirement.group_id).cloned(),
                parents,
                children_count: links.children(requirement.id).len(),
                requirement,
            }
        })
        .collect())
}
