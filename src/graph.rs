//! Requirement link graph
//!
//! Requirements form a many-to-many DAG through `requirement_links`. All
//! traversals run over an in-memory [`LinkGraph`] built from one query, so a
//! request never issues per-node lookups. Walks keep a visited set and a step
//! bound, which makes them terminate even if stored data already holds a cycle.

use crate::access;
use crate::db::{
    find_requirement_by_id, now, requirement_by_external, Database, DbError, Group, NewRequirementLink, Requirement,
    RequirementLink, Result, User,
};
use crate::history;
use crate::schema::*;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Trees deeper than this are cut off
pub const MAX_TREE_DEPTH: usize = 64;

/// Adjacency maps over (parent, child) edges
#[derive(Debug, Clone, Default)]
pub struct LinkGraph {
    parents: HashMap<i32, Vec<i32>>,
    children: HashMap<i32, Vec<i32>>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(parent, child)` pairs
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (i32, i32)>,
    {
        let mut graph = Self::new();
        for (parent, child) in edges {
            graph.insert(parent, child);
        }
        graph
    }

    /// Returns false if the edge was already present
    pub fn insert(&mut self, parent: i32, child: i32) -> bool {
        if self.contains(parent, child) {
            return false;
        }
        self.parents.entry(child).or_default().push(parent);
        self.children.entry(parent).or_default().push(child);
        true
    }

    pub fn remove(&mut self, parent: i32, child: i32) -> bool {
        let removed = match self.parents.get_mut(&child) {
            Some(ps) => {
                let before = ps.len();
                ps.retain(|p| *p != parent);
                before != ps.len()
            }
            None => false,
        };
        if let Some(cs) = self.children.get_mut(&parent) {
            cs.retain(|c| *c != child);
        }
        removed
    }

    pub fn contains(&self, parent: i32, child: i32) -> bool {
        self.parents(child).contains(&parent)
    }

    pub fn parents(&self, id: i32) -> &[i32] {
        self.parents.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn children(&self, id: i32) -> &[i32] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge_count(&self) -> usize {
        self.parents.values().map(Vec::len).sum()
    }

    /// Number of distinct ids touching an edge
    pub fn node_count(&self) -> usize {
        self.parents
            .keys()
            .chain(self.children.keys())
            .collect::<HashSet<_>>()
            .len()
    }

    /// True when `to` is reached from `from` by walking parent edges upward
    pub fn reachable(&self, from: i32, to: i32) -> bool {
        if from == to {
            return true;
        }

        let bound = self.node_count() + 1;
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        let mut steps = 0;

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            steps += 1;
            if steps > bound {
                break;
            }
            for &parent in self.parents(current) {
                if parent == to {
                    return true;
                }
                if !visited.contains(&parent) {
                    stack.push(parent);
                }
            }
        }
        false
    }

    /// Whether adding `parent -> child` would close a cycle
    pub fn would_cycle(&self, child: i32, parent: i32) -> bool {
        child == parent || self.reachable(parent, child)
    }

    /// Every id below `id`, excluding `id` itself
    pub fn descendants(&self, id: i32) -> HashSet<i32> {
        let mut seen = HashSet::new();
        let mut queue = std::collections::VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for &child in self.children(current) {
                if child != id && seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        seen
    }
}

/// Outcome of an idempotent link request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkOutcome {
    Created,
    AlreadyLinked,
}

/// Which way a requirement tree expands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeDirection {
    #[default]
    Descendants,
    Ancestors,
}

/// Nested requirement hierarchy rooted at one requirement
#[derive(Debug, Clone, Serialize)]
pub struct RequirementTree {
    pub id: i32,
    pub requirement_id: String,
    pub title: String,
    pub status: String,
    /// Already expanded elsewhere in this tree; children omitted
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub repeated: bool,
    pub children: Vec<RequirementTree>,
}

/// Nested group hierarchy with requirement counts
#[derive(Debug, Clone, Serialize)]
pub struct GroupNode {
    #[serde(flatten)]
    pub group: Group,
    pub requirements_count: i64,
    pub children_count: usize,
    pub children: Vec<GroupNode>,
}

/// Result of `/requirements/{id}/parent`
#[derive(Debug, Clone, Serialize)]
pub struct ParentChange {
    pub requirement_id: String,
    pub parent_id: Option<String>,
    pub linked: Option<LinkOutcome>,
    pub removed: usize,
}

// ============================================================================
// Loading
// ============================================================================

/// All links whose child belongs to one of `project_ids`
pub(crate) fn load_links_for_projects(conn: &mut SqliteConnection, project_ids: &[i32]) -> Result<LinkGraph> {
    let in_projects = requirements::table
        .filter(requirements::project_id.eq_any(project_ids))
        .select(requirements::id);
    let links = requirement_links::table
        .filter(requirement_links::child_id.eq_any(in_projects))
        .load::<RequirementLink>(conn)?;
    Ok(LinkGraph::from_edges(links.into_iter().map(|l| (l.parent_id, l.child_id))))
}

pub(crate) fn load_project_links(conn: &mut SqliteConnection, project_id: i32) -> Result<LinkGraph> {
    load_links_for_projects(conn, &[project_id])
}

// ============================================================================
// Link mutations (connection level, caller owns the transaction)
// ============================================================================

pub(crate) fn add_link_in(conn: &mut SqliteConnection, child: &Requirement, parent: &Requirement) -> Result<LinkOutcome> {
    if child.project_id != parent.project_id {
        return Err(DbError::CrossProjectViolation {
            child: child.requirement_id.clone(),
            parent: parent.requirement_id.clone(),
        });
    }
    if child.id == parent.id {
        return Err(DbError::SelfLink(child.requirement_id.clone()));
    }

    let links = load_project_links(conn, child.project_id)?;
    if links.contains(parent.id, child.id) {
        return Ok(LinkOutcome::AlreadyLinked);
    }
    if links.would_cycle(child.id, parent.id) {
        return Err(DbError::CycleDetected {
            child: child.requirement_id.clone(),
            parent: parent.requirement_id.clone(),
        });
    }

    diesel::insert_into(requirement_links::table)
        .values(&NewRequirementLink {
            parent_id: parent.id,
            child_id: child.id,
            created_at: &now(),
        })
        .execute(conn)?;
    tracing::debug!(parent = %parent.requirement_id, child = %child.requirement_id, "link created");
    Ok(LinkOutcome::Created)
}

pub(crate) fn remove_link_in(conn: &mut SqliteConnection, child_id: i32, parent_id: i32) -> Result<bool> {
    let removed = diesel::delete(
        requirement_links::table
            .filter(requirement_links::child_id.eq(child_id))
            .filter(requirement_links::parent_id.eq(parent_id)),
    )
    .execute(conn)?;
    Ok(removed > 0)
}

pub(crate) fn remove_all_parents_in(conn: &mut SqliteConnection, child_id: i32) -> Result<usize> {
    Ok(diesel::delete(requirement_links::table.filter(requirement_links::child_id.eq(child_id))).execute(conn)?)
}

fn requirement_or_not_found(conn: &mut SqliteConnection, id: i32) -> Result<Requirement> {
    find_requirement_by_id(conn, id)?.ok_or_else(|| DbError::NotFound(format!("requirement {}", id)))
}

// ============================================================================
// Hierarchy materialization
// ============================================================================

/// Whether making `new_parent` the parent of `group_id` would loop the group tree
pub fn group_would_cycle(groups: &[Group], group_id: i32, new_parent: i32) -> bool {
    let tree = LinkGraph::from_edges(groups.iter().filter_map(|g| g.parent_id.map(|p| (p, g.id))));
    tree.would_cycle(group_id, new_parent)
}

/// Nest groups under their parents; groups whose parent is missing become roots
pub fn build_group_tree(groups: &[Group], requirement_counts: &HashMap<i32, i64>) -> Vec<GroupNode> {
    let by_id: HashMap<i32, &Group> = groups.iter().map(|g| (g.id, g)).collect();
    let tree = LinkGraph::from_edges(groups.iter().filter_map(|g| g.parent_id.map(|p| (p, g.id))));

    let mut visited = HashSet::new();
    groups
        .iter()
        .filter(|g| g.parent_id.map_or(true, |p| !by_id.contains_key(&p)))
        .filter_map(|root| group_node(root.id, &by_id, &tree, requirement_counts, &mut visited, 0))
        .collect()
}

fn group_node(
    id: i32,
    by_id: &HashMap<i32, &Group>,
    tree: &LinkGraph,
    counts: &HashMap<i32, i64>,
    visited: &mut HashSet<i32>,
    depth: usize,
) -> Option<GroupNode> {
    if depth > MAX_TREE_DEPTH || !visited.insert(id) {
        return None;
    }
    let group = by_id.get(&id)?;
    let children: Vec<GroupNode> = tree
        .children(id)
        .iter()
        .filter_map(|&child| group_node(child, by_id, tree, counts, visited, depth + 1))
        .collect();
    Some(GroupNode {
        group: (*group).clone(),
        requirements_count: counts.get(&id).copied().unwrap_or(0),
        children_count: children.len(),
        children,
    })
}

/// Expand a requirement into its descendants or ancestors. Each node is expanded
/// once; later occurrences are leaves marked `repeated`, so the output has at
/// most one entry per link plus the root.
pub fn build_requirement_tree(
    links: &LinkGraph,
    nodes: &HashMap<i32, Requirement>,
    root: i32,
    direction: TreeDirection,
) -> Option<RequirementTree> {
    let mut walk = TreeWalk {
        links,
        nodes,
        direction,
        on_path: HashSet::new(),
        expanded: HashSet::new(),
    };
    walk.node(root, 0)
}

struct TreeWalk<'a> {
    links: &'a LinkGraph,
    nodes: &'a HashMap<i32, Requirement>,
    direction: TreeDirection,
    on_path: HashSet<i32>,
    expanded: HashSet<i32>,
}

impl TreeWalk<'_> {
    fn node(&mut self, id: i32, depth: usize) -> Option<RequirementTree> {
        let requirement = self.nodes.get(&id)?;
        let mut tree = RequirementTree {
            id,
            requirement_id: requirement.requirement_id.clone(),
            title: requirement.title.clone(),
            status: requirement.status.clone(),
            repeated: false,
            children: Vec::new(),
        };
        if self.expanded.contains(&id) {
            tree.repeated = true;
            return Some(tree);
        }
        if depth >= MAX_TREE_DEPTH {
            return Some(tree);
        }
        self.expanded.insert(id);
        self.on_path.insert(id);

        let links = self.links;
        let next = match self.direction {
            TreeDirection::Descendants => links.children(id),
            TreeDirection::Ancestors => links.parents(id),
        };
        for &neighbour in next {
            // Stored cycles: skip the back edge
            if self.on_path.contains(&neighbour) {
                continue;
            }
            if let Some(child) = self.node(neighbour, depth + 1) {
                tree.children.push(child);
            }
        }
        self.on_path.remove(&id);
        Some(tree)
    }
}

// ============================================================================
// Database operations
// ============================================================================

impl Database {
    /// Link `parent_id -> child_id` by internal ids
    pub fn add_link(&self, actor: &User, child_id: i32, parent_id: i32) -> Result<LinkOutcome> {
        let outcome = self.write(|conn| {
            let child = requirement_or_not_found(conn, child_id)?;
            let parent = requirement_or_not_found(conn, parent_id)?;
            access::authorize(conn, actor.id, child.project_id)?;
            add_link_in(conn, &child, &parent)
        })?;
        tracing::info!(child_id, parent_id, ?outcome, user = %actor.username, "add link");
        Ok(outcome)
    }

    /// Remove one edge. Absence of the edge is success.
    pub fn remove_link(&self, actor: &User, child_id: i32, parent_id: i32) -> Result<bool> {
        let removed = self.write(|conn| {
            let child = requirement_or_not_found(conn, child_id)?;
            access::authorize(conn, actor.id, child.project_id)?;
            remove_link_in(conn, child_id, parent_id)
        })?;
        tracing::info!(child_id, parent_id, removed, user = %actor.username, "remove link");
        Ok(removed)
    }

    pub fn remove_all_parents(&self, actor: &User, child_id: i32) -> Result<usize> {
        self.write(|conn| {
            let child = requirement_or_not_found(conn, child_id)?;
            access::authorize(conn, actor.id, child.project_id)?;
            remove_all_parents_in(conn, child_id)
        })
    }

    /// Walk parent edges upward from `from_id` looking for `to_id`
    pub fn is_reachable(&self, actor: &User, from_id: i32, to_id: i32) -> Result<bool> {
        self.read(|conn| {
            let from = requirement_or_not_found(conn, from_id)?;
            access::authorize(conn, actor.id, from.project_id)?;
            Ok(load_project_links(conn, from.project_id)?.reachable(from_id, to_id))
        })
    }

    /// Link or unlink by external ids within a project. With `remove_only`, the
    /// edge (or every parent edge when `parent_ext` is `None`) is removed;
    /// otherwise the edge is upserted.
    pub fn set_parent(
        &self,
        actor: &User,
        project_id: i32,
        child_ext: &str,
        parent_ext: Option<&str>,
        remove_only: bool,
    ) -> Result<ParentChange> {
        self.write(|conn| {
            access::authorize(conn, actor.id, project_id)?;
            let child = requirement_by_external(conn, project_id, child_ext)?;

            let mut change = ParentChange {
                requirement_id: child.requirement_id.clone(),
                parent_id: parent_ext.map(str::to_string),
                linked: None,
                removed: 0,
            };

            match (parent_ext, remove_only) {
                (None, _) => {
                    change.removed = remove_all_parents_in(conn, child.id)?;
                }
                (Some(parent_ext), true) => {
                    if let Some(parent) = crate::db::find_requirement(conn, project_id, parent_ext)? {
                        change.removed = usize::from(remove_link_in(conn, child.id, parent.id)?);
                    }
                }
                (Some(parent_ext), false) => {
                    if parent_ext == child.requirement_id {
                        return Err(DbError::SelfLink(child.requirement_id.clone()));
                    }
                    let parent = requirement_by_external(conn, project_id, parent_ext)?;
                    change.linked = Some(add_link_in(conn, &child, &parent)?);
                }
            }
            tracing::info!(
                child = %child.requirement_id,
                parent = ?parent_ext,
                remove_only,
                user = %actor.username,
                "set parent"
            );
            Ok(change)
        })
    }

    /// Move a requirement to another group; this also clears its parent links
    pub fn move_requirement(
        &self,
        actor: &User,
        project_id: i32,
        external_id: &str,
        group_id: i32,
    ) -> Result<Requirement> {
        self.write(|conn| {
            access::authorize(conn, actor.id, project_id)?;
            let requirement = requirement_by_external(conn, project_id, external_id)?;
            let update = history::RequirementUpdate {
                group_id: Some(group_id),
                ..Default::default()
            };
            history::apply_update_in(conn, actor, &requirement, &update)?;
            let cleared = remove_all_parents_in(conn, requirement.id)?;
            tracing::info!(
                requirement_id = %requirement.requirement_id,
                group_id,
                cleared,
                user = %actor.username,
                "requirement moved"
            );
            requirement_or_not_found(conn, requirement.id)
        })
    }

    /// Group hierarchy of a project with per-group requirement counts
    pub fn group_hierarchy(&self, actor: &User, project_id: i32) -> Result<Vec<GroupNode>> {
        self.read(|conn| {
            access::authorize(conn, actor.id, project_id)?;
            let groups = requirement_groups::table
                .filter(requirement_groups::project_id.eq(project_id))
                .order(requirement_groups::name.asc())
                .load::<Group>(conn)?;
            let counts: HashMap<i32, i64> = requirements::table
                .filter(requirements::project_id.eq(project_id))
                .group_by(requirements::group_id)
                .select((requirements::group_id, diesel::dsl::count_star()))
                .load::<(i32, i64)>(conn)?
                .into_iter()
                .collect();
            Ok(build_group_tree(&groups, &counts))
        })
    }

    /// Descendant or ancestor tree of one requirement
    pub fn requirement_tree(
        &self,
        actor: &User,
        project_id: i32,
        external_id: &str,
        direction: TreeDirection,
    ) -> Result<RequirementTree> {
        self.read(|conn| {
            access::authorize(conn, actor.id, project_id)?;
            let root = requirement_by_external(conn, project_id, external_id)?;
            let links = load_project_links(conn, project_id)?;
            let nodes: HashMap<i32, Requirement> = requirements::table
                .filter(requirements::project_id.eq(project_id))
                .load::<Requirement>(conn)?
                .into_iter()
                .map(|r| (r.id, r))
                .collect();
            build_requirement_tree(&links, &nodes, root.id, direction)
                .ok_or_else(|| DbError::NotFound(format!("requirement '{}'", external_id)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::STATUS_DRAFT;
    use crate::test_support::{add_requirement, fixture};
    use proptest::prelude::*;

    fn chain() -> LinkGraph {
        // 1 -> 2 -> 3 -> 4
        LinkGraph::from_edges([(1, 2), (2, 3), (3, 4)])
    }

    #[test]
    fn test_reachable_walks_upward() {
        let g = chain();
        assert!(g.reachable(4, 1));
        assert!(g.reachable(3, 2));
        assert!(!g.reachable(1, 4));
        assert!(!g.reachable(4, 99));
    }

    #[test]
    fn test_would_cycle() {
        let g = chain();
        assert!(g.would_cycle(1, 4), "4 is below 1");
        assert!(g.would_cycle(2, 2));
        assert!(!g.would_cycle(4, 1));
        assert!(!g.would_cycle(5, 1));
    }

    #[test]
    fn test_reachable_terminates_on_cycle() {
        let g = LinkGraph::from_edges([(1, 2), (2, 3), (3, 1)]);
        assert!(g.reachable(1, 3));
        assert!(!g.reachable(1, 42));
    }

    #[test]
    fn test_insert_and_remove() {
        let mut g = LinkGraph::new();
        assert!(g.insert(1, 2));
        assert!(!g.insert(1, 2));
        assert_eq!(g.edge_count(), 1);
        assert!(g.remove(1, 2));
        assert!(!g.remove(1, 2));
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_descendants_diamond() {
        let g = LinkGraph::from_edges([(1, 2), (1, 3), (2, 4), (3, 4)]);
        let d = g.descendants(1);
        assert_eq!(d.len(), 3);
        assert!(d.contains(&4));
    }

    fn group(id: i32, parent: Option<i32>) -> Group {
        Group {
            id,
            name: format!("G{}", id),
            description: None,
            parent_id: parent,
            project_id: 1,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_group_tree() {
        let groups = vec![group(1, None), group(2, Some(1)), group(3, Some(2)), group(4, Some(99))];
        let counts = HashMap::from([(3, 7)]);
        let tree = build_group_tree(&groups, &counts);

        assert_eq!(tree.len(), 2, "missing parent makes a root");
        let root = &tree[0];
        assert_eq!(root.group.id, 1);
        assert_eq!(root.children_count, 1);
        assert_eq!(root.children[0].children[0].requirements_count, 7);
    }

    #[test]
    fn test_group_would_cycle() {
        let groups = vec![group(1, None), group(2, Some(1)), group(3, Some(2))];
        assert!(group_would_cycle(&groups, 1, 3));
        assert!(group_would_cycle(&groups, 2, 2));
        assert!(!group_would_cycle(&groups, 3, 1));
    }

    #[test]
    fn test_link_rules_against_store() {
        let f = fixture();
        let a = add_requirement(&f, "A", "Top");
        let b = add_requirement(&f, "B", "Middle");
        let c = add_requirement(&f, "C", "Bottom");

        assert_eq!(f.db.add_link(&f.user, b.id, a.id).unwrap(), LinkOutcome::Created);
        assert_eq!(f.db.add_link(&f.user, c.id, b.id).unwrap(), LinkOutcome::Created);
        assert_eq!(f.db.add_link(&f.user, c.id, b.id).unwrap(), LinkOutcome::AlreadyLinked);
        assert!(f.db.is_reachable(&f.user, c.id, a.id).unwrap());

        let err = f.db.add_link(&f.user, a.id, c.id).unwrap_err();
        assert!(matches!(err, DbError::CycleDetected { .. }));
        assert!(!f.db.is_reachable(&f.user, a.id, c.id).unwrap(), "link set unchanged");

        assert!(matches!(f.db.add_link(&f.user, a.id, a.id), Err(DbError::SelfLink(_))));
        assert!(matches!(f.db.add_link(&f.user, a.id, 9999), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_cross_project_link_rejected() {
        let f = fixture();
        let a = add_requirement(&f, "A", "Top");
        let other = f.db.create_project(&f.user, "Gemini", None).unwrap();
        let group = f
            .db
            .create_group(
                &f.user,
                &crate::db::NewGroupRequest {
                    project_id: other.id,
                    name: "Ops".to_string(),
                    description: None,
                    parent_id: None,
                },
            )
            .unwrap();
        let foreign = f
            .db
            .create_requirement(
                &f.user,
                &crate::db::NewRequirementRequest {
                    project_id: other.id,
                    requirement_id: "X".to_string(),
                    title: "Elsewhere".to_string(),
                    group_id: group.id,
                    description: None,
                    status: None,
                    chapter: None,
                    parent_ids: vec![],
                },
            )
            .unwrap();

        assert!(matches!(
            f.db.add_link(&f.user, foreign.id, a.id),
            Err(DbError::CrossProjectViolation { .. })
        ));
    }

    #[test]
    fn test_remove_link_is_idempotent() {
        let f = fixture();
        let a = add_requirement(&f, "A", "Top");
        let b = add_requirement(&f, "B", "Middle");
        f.db.add_link(&f.user, b.id, a.id).unwrap();

        assert!(f.db.remove_link(&f.user, b.id, a.id).unwrap());
        assert!(!f.db.remove_link(&f.user, b.id, a.id).unwrap());
    }

    #[test]
    fn test_remove_all_parents() {
        let f = fixture();
        let a = add_requirement(&f, "A", "One");
        let b = add_requirement(&f, "B", "Two");
        let c = add_requirement(&f, "C", "Child");
        f.db.add_link(&f.user, c.id, a.id).unwrap();
        f.db.add_link(&f.user, c.id, b.id).unwrap();

        assert_eq!(f.db.remove_all_parents(&f.user, c.id).unwrap(), 2);
        assert_eq!(f.db.remove_all_parents(&f.user, c.id).unwrap(), 0);
    }

    #[test]
    fn test_set_parent_by_external_ids() {
        let f = fixture();
        add_requirement(&f, "A", "Top");
        add_requirement(&f, "B", "Child");

        let change = f.db.set_parent(&f.user, f.project.id, "B", Some("A"), false).unwrap();
        assert_eq!(change.linked, Some(LinkOutcome::Created));

        let change = f.db.set_parent(&f.user, f.project.id, "B", Some("A"), true).unwrap();
        assert_eq!(change.removed, 1);

        let change = f.db.set_parent(&f.user, f.project.id, "B", Some("A"), true).unwrap();
        assert_eq!(change.removed, 0);

        assert!(matches!(
            f.db.set_parent(&f.user, f.project.id, "B", Some("B"), false),
            Err(DbError::SelfLink(_))
        ));
    }

    #[test]
    fn test_move_clears_parents() {
        let f = fixture();
        let a = add_requirement(&f, "A", "Top");
        let b = add_requirement(&f, "B", "Child");
        f.db.add_link(&f.user, b.id, a.id).unwrap();
        let target = f
            .db
            .create_group(
                &f.user,
                &crate::db::NewGroupRequest {
                    project_id: f.project.id,
                    name: "Archive".to_string(),
                    description: None,
                    parent_id: None,
                },
            )
            .unwrap();

        let moved = f.db.move_requirement(&f.user, f.project.id, "B", target.id).unwrap();
        assert_eq!(moved.group_id, target.id);

        let detail = f.db.get_requirement(&f.user, f.project.id, "B").unwrap();
        assert!(detail.view.parents.is_empty());
        assert!(detail.history.iter().any(|h| h.field_name == "group_id"));
    }

    #[test]
    fn test_requirement_tree_both_directions() {
        let f = fixture();
        let a = add_requirement(&f, "A", "Top");
        let b = add_requirement(&f, "B", "Middle");
        let c = add_requirement(&f, "C", "Bottom");
        f.db.add_link(&f.user, b.id, a.id).unwrap();
        f.db.add_link(&f.user, c.id, b.id).unwrap();

        let down = f
            .db
            .requirement_tree(&f.user, f.project.id, "A", TreeDirection::Descendants)
            .unwrap();
        assert_eq!(down.children[0].requirement_id, "B");
        assert_eq!(down.children[0].children[0].requirement_id, "C");

        let up = f
            .db
            .requirement_tree(&f.user, f.project.id, "C", TreeDirection::Ancestors)
            .unwrap();
        assert_eq!(up.children[0].children[0].requirement_id, "A");
    }

    #[test]
    fn test_group_hierarchy_counts() {
        let f = fixture();
        add_requirement(&f, "A", "Top");
        add_requirement(&f, "B", "Child");
        let tree = f.db.group_hierarchy(&f.user, f.project.id).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].requirements_count, 2);
    }

    fn tree_size(tree: &RequirementTree) -> usize {
        1 + tree.children.iter().map(tree_size).sum::<usize>()
    }

    fn bare_requirements(ids: impl IntoIterator<Item = i32>) -> HashMap<i32, Requirement> {
        ids.into_iter()
            .map(|id| {
                (
                    id,
                    Requirement {
                        id,
                        requirement_id: format!("R{}", id),
                        title: format!("Requirement {}", id),
                        description: None,
                        status: STATUS_DRAFT.to_string(),
                        chapter: None,
                        group_id: 1,
                        project_id: 1,
                        graph_x: None,
                        graph_y: None,
                        created_by: None,
                        updated_by: None,
                        created_at: String::new(),
                        updated_at: String::new(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_requirement_tree_layered_diamonds_stay_linear() {
        // 40 layers of two nodes, every node linked to both nodes of the layer above
        let layers = 40;
        let mut edges = Vec::new();
        for layer in 1..layers {
            for above in [2 * layer - 1, 2 * layer] {
                for below in [2 * layer + 1, 2 * layer + 2] {
                    edges.push((above, below));
                }
            }
        }
        let edge_count = edges.len();
        let links = LinkGraph::from_edges(edges);
        let nodes = bare_requirements(1..=2 * layers);

        let tree = build_requirement_tree(&links, &nodes, 1, TreeDirection::Descendants).unwrap();
        assert!(tree_size(&tree) <= edge_count + 1);

        let up = build_requirement_tree(&links, &nodes, 2 * layers, TreeDirection::Ancestors).unwrap();
        assert!(tree_size(&up) <= edge_count + 1);
    }

    #[test]
    fn test_requirement_tree_marks_shared_descendant() {
        let links = LinkGraph::from_edges([(1, 2), (1, 3), (2, 4), (3, 4)]);
        let nodes = bare_requirements(1..=4);
        let tree = build_requirement_tree(&links, &nodes, 1, TreeDirection::Descendants).unwrap();

        let fours: Vec<&RequirementTree> = tree
            .children
            .iter()
            .flat_map(|c| c.children.iter())
            .filter(|n| n.id == 4)
            .collect();
        assert_eq!(fours.len(), 2);
        assert_eq!(fours.iter().filter(|n| n.repeated).count(), 1);

        let json = serde_json::to_value(&tree).unwrap();
        assert!(json.get("repeated").is_none());
    }

    #[test]
    fn test_requirement_tree_on_stored_cycle() {
        let links = LinkGraph::from_edges([(1, 2), (2, 3), (3, 1)]);
        let nodes = bare_requirements(1..=3);
        let tree = build_requirement_tree(&links, &nodes, 1, TreeDirection::Descendants).unwrap();
        assert_eq!(tree_size(&tree), 3);
    }

    proptest! {
        #[test]
        fn prop_requirement_tree_is_bounded(edges in prop::collection::vec((0i32..15, 0i32..15), 0..80), root in 0i32..15) {
            let links = LinkGraph::from_edges(edges);
            let nodes = bare_requirements(0..15);
            for direction in [TreeDirection::Descendants, TreeDirection::Ancestors] {
                let tree = build_requirement_tree(&links, &nodes, root, direction).unwrap();
                prop_assert!(tree_size(&tree) <= links.edge_count() + 1);
            }
        }

        #[test]
        fn prop_reachable_terminates(edges in prop::collection::vec((0i32..12, 0i32..12), 0..60), from in 0i32..12, to in 0i32..12) {
            let g = LinkGraph::from_edges(edges);
            let _ = g.reachable(from, to);
        }

        #[test]
        fn prop_guarded_inserts_stay_acyclic(edges in prop::collection::vec((0i32..10, 0i32..10), 0..40)) {
            let mut g = LinkGraph::new();
            for (parent, child) in edges {
                if !g.would_cycle(child, parent) {
                    g.insert(parent, child);
                    prop_assert!(g.reachable(child, parent));
                }
            }
            for node in 0..10 {
                for &parent in g.parents(node) {
                    prop_assert!(!g.reachable(parent, node), "edge {} -> {} closes a loop", parent, node);
                }
            }
        }
    }
}
