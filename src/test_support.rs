//! Shared fixtures for unit tests

use crate::db::{Database, Group, NewGroupRequest, NewRequirementRequest, Project, Requirement, User};
use tempfile::TempDir;

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub db: Database,
    pub user: User,
    pub project: Project,
    pub group: Group,
}

/// Fresh database with user `alice` (password `password1`), project `Apollo`
/// and group `Core`
pub(crate) fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let db = Database::open_at(dir.path().join("test.db")).unwrap();
    let user = db.register_user("alice", "password1", None).unwrap();
    let project = db.create_project(&user, "Apollo", Some("Lunar program")).unwrap();
    let group = db
        .create_group(
            &user,
            &NewGroupRequest {
                project_id: project.id,
                name: "Core".to_string(),
                description: None,
                parent_id: None,
            },
        )
        .unwrap();
    Fixture {
        dir,
        db,
        user,
        project,
        group,
    }
}

pub(crate) fn add_requirement(f: &Fixture, external_id: &str, title: &str) -> Requirement {
    f.db.create_requirement(
        &f.user,
        &NewRequirementRequest {
            project_id: f.project.id,
            requirement_id: external_id.to_string(),
            title: title.to_string(),
            group_id: f.group.id,
            description: None,
            status: None,
            chapter: None,
            parent_ids: vec![],
        },
    )
    .unwrap()
}
