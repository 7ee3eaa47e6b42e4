//! Export utilities for requirement graphs
//!
//! Provides tabular export (csv, xlsx), the visualization node/edge view and
//! DOT graph export.

use crate::access;
use crate::db::{
    build_views, Database, DbError, Group, Project, Requirement, Result, User, PARENT_SEPARATOR, STATUS_DELETED,
};
use crate::graph;
use crate::schema::*;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use rust_xlsxwriter::{Format, Workbook};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Write;

/// Column order of tabular exports
pub const EXPORT_COLUMNS: [&str; 12] = [
    "Requirement ID",
    "Title",
    "Description",
    "Status",
    "Chapter",
    "Group",
    "Project",
    "Parent ID",
    "Created At",
    "Updated At",
    "Created By",
    "Updated By",
];

const LABEL_TITLE_LEN: usize = 50;

/// One exported requirement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    #[serde(rename = "Requirement ID")]
    pub requirement_id: String,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Chapter")]
    pub chapter: String,
    #[serde(rename = "Group")]
    pub group: String,
    #[serde(rename = "Project")]
    pub project: String,
    #[serde(rename = "Parent ID")]
    pub parent_ids: String,
    #[serde(rename = "Created At")]
    pub created_at: String,
    #[serde(rename = "Updated At")]
    pub updated_at: String,
    #[serde(rename = "Created By")]
    pub created_by: String,
    #[serde(rename = "Updated By")]
    pub updated_by: String,
}

impl ExportRow {
    fn cells(&self) -> [&str; 12] {
        [
            self.requirement_id.as_str(),
            self.title.as_str(),
            self.description.as_str(),
            self.status.as_str(),
            self.chapter.as_str(),
            self.group.as_str(),
            self.project.as_str(),
            self.parent_ids.as_str(),
            self.created_at.as_str(),
            self.updated_at.as_str(),
            self.created_by.as_str(),
            self.updated_by.as_str(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "xlsx" | "excel" => Ok(ExportFormat::Xlsx),
            other => Err(DbError::Validation(format!("Unknown export format '{}'", other))),
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
        }
    }

    pub fn render(self, rows: &[ExportRow]) -> Result<Vec<u8>> {
        match self {
            ExportFormat::Csv => rows_to_csv(rows),
            ExportFormat::Xlsx => rows_to_xlsx(rows),
        }
    }
}

pub fn rows_to_csv(rows: &[ExportRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if rows.is_empty() {
        writer.write_record(EXPORT_COLUMNS)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| DbError::Tabular(e.to_string()))
}

pub fn rows_to_xlsx(rows: &[ExportRow]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Requirements")?;

    for (col, header) in EXPORT_COLUMNS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *header, &bold)?;
    }
    for (i, row) in rows.iter().enumerate() {
        for (col, value) in row.cells().iter().enumerate() {
            sheet.write_string(i as u32 + 1, col as u16, *value)?;
        }
    }
    Ok(workbook.save_to_buffer()?)
}

/// Visualization node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: i32,
    pub label: String,
    pub title: String,
    pub requirement_id: String,
    pub status: String,
    pub color: &'static str,
    pub group: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
}

/// Visualization edge, parent to child
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphEdge {
    pub from: i32,
    pub to: i32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphView {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphView {
    /// Keep only nodes reachable downward from `roots`
    pub fn from_roots(&self, roots: &[i32]) -> GraphView {
        let links = graph::LinkGraph::from_edges(self.edges.iter().map(|e| (e.from, e.to)));
        let mut keep: HashSet<i32> = roots.iter().copied().collect();
        for &root in roots {
            keep.extend(links.descendants(root));
        }
        GraphView {
            nodes: self.nodes.iter().filter(|n| keep.contains(&n.id)).cloned().collect(),
            edges: self
                .edges
                .iter()
                .filter(|e| keep.contains(&e.from) && keep.contains(&e.to))
                .cloned()
                .collect(),
        }
    }

    pub fn node_by_requirement_id(&self, requirement_id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.requirement_id == requirement_id)
    }
}

pub fn status_color(status: &str) -> &'static str {
    match status {
        "Completed" => "#28a745",
        "In Progress" => "#007bff",
        "Review" => "#ffc107",
        STATUS_DELETED => "#dc3545",
        _ => "#6c757d",
    }
}

/// Truncate to `max_chars` characters, marking the cut with "..."
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

fn node_label(requirement: &Requirement) -> String {
    format!(
        "{}\n{}",
        requirement.requirement_id,
        truncate(&requirement.title, LABEL_TITLE_LEN)
    )
}

/// Configuration for DOT export
#[derive(Debug, Clone)]
pub struct DotConfig {
    /// Title for the graph
    pub title: Option<String>,
    /// Orientation: "TB" (top-bottom), "LR" (left-right)
    pub rankdir: String,
    /// Cluster nodes by group
    pub cluster_groups: bool,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            title: None,
            rankdir: "TB".to_string(),
            cluster_groups: false,
        }
    }
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Convert a graph view to DOT format
pub fn graph_to_dot(view: &GraphView, config: &DotConfig) -> String {
    let mut dot = String::new();
    // Writing into a String cannot fail
    let _ = write_dot(&mut dot, view, config);
    dot
}

fn write_dot(dot: &mut String, view: &GraphView, config: &DotConfig) -> std::fmt::Result {
    writeln!(dot, "digraph RequirementGraph {{")?;
    writeln!(dot, "  rankdir={};", config.rankdir)?;
    writeln!(dot, "  node [fontname=\"Arial\" fontsize=10 shape=\"box\" style=\"rounded,filled\"];")?;
    writeln!(dot, "  edge [fontname=\"Arial\" fontsize=9];")?;
    if let Some(title) = &config.title {
        writeln!(dot, "  label=\"{}\";", escape_dot(title))?;
        writeln!(dot, "  labelloc=t;")?;
        writeln!(dot, "  fontsize=14;")?;
    }
    writeln!(dot)?;

    let node_line = |node: &GraphNode| {
        format!(
            "  {} [label=\"{}\" fillcolor=\"{}\"];",
            node.id,
            escape_dot(&node.label),
            node.color
        )
    };

    if config.cluster_groups {
        let mut clusters: Vec<(Option<&str>, Vec<&GraphNode>)> = Vec::new();
        for node in &view.nodes {
            let key = node.group.as_deref();
            match clusters.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(node),
                None => clusters.push((key, vec![node])),
            }
        }
        for (i, (name, members)) in clusters.iter().enumerate() {
            writeln!(dot, "  subgraph cluster_{} {{", i)?;
            writeln!(dot, "    label=\"{}\";", escape_dot(name.unwrap_or("(no group)")))?;
            for node in members {
                writeln!(dot, "  {}", node_line(node))?;
            }
            writeln!(dot, "  }}")?;
        }
    } else {
        for node in &view.nodes {
            writeln!(dot, "{}", node_line(node))?;
        }
    }

    writeln!(dot)?;
    for edge in &view.edges {
        writeln!(dot, "  {} -> {};", edge.from, edge.to)?;
    }
    writeln!(dot, "}}")
}

fn accessible_projects(
    conn: &mut SqliteConnection,
    actor: &User,
    project_id: Option<i32>,
) -> Result<Vec<Project>> {
    match project_id {
        Some(project_id) => Ok(vec![access::authorize(conn, actor.id, project_id)?.1]),
        None => {
            let ids = access::member_project_ids(conn, actor.id)?;
            Ok(projects::table.filter(projects::id.eq_any(ids)).load::<Project>(conn)?)
        }
    }
}

fn load_requirements(conn: &mut SqliteConnection, project_ids: &[i32], include_deleted: bool) -> Result<Vec<Requirement>> {
    let mut query = requirements::table
        .filter(requirements::project_id.eq_any(project_ids))
        .into_boxed();
    if !include_deleted {
        query = query.filter(requirements::status.ne(STATUS_DELETED));
    }
    Ok(query.order(requirements::id.asc()).load::<Requirement>(conn)?)
}

impl Database {
    /// Rows for a tabular export of one project or every project the actor can access
    pub fn export_rows(&self, actor: &User, project_id: Option<i32>, include_deleted: bool) -> Result<Vec<ExportRow>> {
        let rows = self.read(|conn| {
            let projects = accessible_projects(conn, actor, project_id)?;
            let project_names: HashMap<i32, String> = projects.iter().map(|p| (p.id, p.name.clone())).collect();
            let project_ids: Vec<i32> = projects.iter().map(|p| p.id).collect();

            let requirements = load_requirements(conn, &project_ids, include_deleted)?;
            let views = build_views(conn, requirements)?;
            Ok(views
                .into_iter()
                .map(|v| {
                    let r = v.requirement;
                    ExportRow {
                        project: project_names.get(&r.project_id).cloned().unwrap_or_default(),
                        group: v.group_name.unwrap_or_default(),
                        parent_ids: v.parents.join(&PARENT_SEPARATOR.to_string()),
                        requirement_id: r.requirement_id,
                        title: r.title,
                        description: r.description.unwrap_or_default(),
                        status: r.status,
                        chapter: r.chapter.unwrap_or_default(),
                        created_at: r.created_at,
                        updated_at: r.updated_at,
                        created_by: r.created_by.unwrap_or_default(),
                        updated_by: r.updated_by.unwrap_or_default(),
                    }
                })
                .collect::<Vec<_>>())
        })?;
        tracing::info!(rows = rows.len(), ?project_id, user = %actor.username, "export");
        Ok(rows)
    }

    /// Nodes and edges for visualization. Soft-deleted nodes and their edges
    /// are left out unless `include_deleted` is set.
    pub fn graph_view(&self, actor: &User, project_id: Option<i32>, include_deleted: bool) -> Result<GraphView> {
        self.read(|conn| {
            let projects = accessible_projects(conn, actor, project_id)?;
            let project_ids: Vec<i32> = projects.iter().map(|p| p.id).collect();
            let requirements = load_requirements(conn, &project_ids, include_deleted)?;
            let groups: HashMap<i32, String> = requirement_groups::table
                .filter(requirement_groups::project_id.eq_any(&project_ids))
                .load::<Group>(conn)?
                .into_iter()
                .map(|g| (g.id, g.name))
                .collect();
            let links = graph::load_links_for_projects(conn, &project_ids)?;

            let visible: HashSet<i32> = requirements.iter().map(|r| r.id).collect();
            let mut edges = Vec::new();
            for r in &requirements {
                for &parent in links.parents(r.id) {
                    if visible.contains(&parent) {
                        edges.push(GraphEdge { from: parent, to: r.id });
                    }
                }
            }

            let nodes = requirements
                .iter()
                .map(|r| GraphNode {
                    id: r.id,
                    label: node_label(r),
                    title: r.title.clone(),
                    requirement_id: r.requirement_id.clone(),
                    status: r.status.clone(),
                    color: status_color(&r.status),
                    group: groups.get(&r.group_id).cloned(),
                    x: r.graph_x,
                    y: r.graph_y,
                })
                .collect();
            Ok(GraphView { nodes, edges })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::TempUpload;
    use crate::test_support::{add_requirement, fixture};

    fn node(id: i32, requirement_id: &str, group: Option<&str>) -> GraphNode {
        GraphNode {
            id,
            label: format!("{}\nTitle", requirement_id),
            title: "Title".to_string(),
            requirement_id: requirement_id.to_string(),
            status: "Draft".to_string(),
            color: status_color("Draft"),
            group: group.map(str::to_string),
            x: None,
            y: None,
        }
    }

    fn sample_view() -> GraphView {
        GraphView {
            nodes: vec![node(1, "R1", Some("Core")), node(2, "R2", Some("Core")), node(3, "R3", None)],
            edges: vec![GraphEdge { from: 1, to: 2 }],
        }
    }

    #[test]
    fn test_status_colors() {
        assert_eq!(status_color("Completed"), "#28a745");
        assert_eq!(status_color("In Progress"), "#007bff");
        assert_eq!(status_color("Review"), "#ffc107");
        assert_eq!(status_color("Deleted"), "#dc3545");
        assert_eq!(status_color("Draft"), "#6c757d");
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 50), "short");
        assert_eq!(truncate("ééééé", 3), "ééé...");
    }

    #[test]
    fn test_graph_to_dot() {
        let dot = graph_to_dot(&sample_view(), &DotConfig::default());
        assert!(dot.contains("digraph RequirementGraph"));
        assert!(dot.contains("1 [label=\"R1\\nTitle\""));
        assert!(dot.contains("1 -> 2;"));
        assert!(!dot.contains("subgraph"));
    }

    #[test]
    fn test_graph_to_dot_clusters() {
        let config = DotConfig {
            title: Some("Apollo".to_string()),
            cluster_groups: true,
            ..Default::default()
        };
        let dot = graph_to_dot(&sample_view(), &config);
        assert!(dot.contains("subgraph cluster_0"));
        assert!(dot.contains("label=\"Core\";"));
        assert!(dot.contains("label=\"(no group)\";"));
        assert!(dot.contains("label=\"Apollo\";"));
    }

    #[test]
    fn test_from_roots() {
        let filtered = sample_view().from_roots(&[1]);
        assert_eq!(filtered.nodes.len(), 2);
        assert_eq!(filtered.edges.len(), 1);
        assert!(filtered.node_by_requirement_id("R3").is_none());
    }

    #[test]
    fn test_graph_view_hides_deleted() {
        let f = fixture();
        let a = add_requirement(&f, "A", "A title that is definitely longer than fifty characters in total");
        let b = add_requirement(&f, "B", "Child");
        f.db.add_link(&f.user, b.id, a.id).unwrap();

        let view = f.db.graph_view(&f.user, Some(f.project.id), false).unwrap();
        assert_eq!(view.nodes.len(), 2);
        assert_eq!(view.edges, vec![GraphEdge { from: a.id, to: b.id }]);
        let label = &view.node_by_requirement_id("A").unwrap().label;
        assert!(label.starts_with("A\n"));
        assert!(label.ends_with("..."));

        f.db.delete_requirement(&f.user, f.project.id, "A").unwrap();
        let view = f.db.graph_view(&f.user, Some(f.project.id), false).unwrap();
        assert_eq!(view.nodes.len(), 1);
        assert!(view.edges.is_empty());

        let view = f.db.graph_view(&f.user, Some(f.project.id), true).unwrap();
        assert_eq!(view.nodes.len(), 2);
        assert_eq!(view.node_by_requirement_id("A").unwrap().color, "#dc3545");
    }

    #[test]
    fn test_export_rows_and_csv_reimport() {
        let f = fixture();
        let a = add_requirement(&f, "A", "Top");
        let b = add_requirement(&f, "B", "Child");
        f.db.add_link(&f.user, b.id, a.id).unwrap();

        let rows = f.db.export_rows(&f.user, Some(f.project.id), false).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].parent_ids, "A");
        assert_eq!(rows[1].group, "Core");
        assert_eq!(rows[1].project, "Apollo");

        let bytes = ExportFormat::Csv.render(&rows).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("Requirement ID,Title,Description,Status,Chapter,Group,Project,Parent ID"));

        let other = f.db.create_project(&f.user, "Gemini", None).unwrap();
        let group = f
            .db
            .create_group(
                &f.user,
                &crate::db::NewGroupRequest {
                    project_id: other.id,
                    name: "Imported".to_string(),
                    description: None,
                    parent_id: None,
                },
            )
            .unwrap();
        let upload = TempUpload::store(f.dir.path(), "export.csv", &bytes).unwrap();
        let summary = f.db.import_upload(&f.user, other.id, group.id, upload).unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.links_created, 1);
    }

    #[test]
    fn test_empty_csv_has_header() {
        let bytes = rows_to_csv(&[]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.trim_end(), EXPORT_COLUMNS.join(","));
    }

    #[test]
    fn test_xlsx_export_is_zip() {
        let f = fixture();
        add_requirement(&f, "A", "Top");
        let rows = f.db.export_rows(&f.user, None, false).unwrap();
        let bytes = ExportFormat::Xlsx.render(&rows).unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(ExportFormat::parse("CSV").unwrap(), ExportFormat::Csv);
        assert_eq!(ExportFormat::parse("excel").unwrap(), ExportFormat::Xlsx);
        assert!(ExportFormat::parse("pdf").is_err());
    }
}
