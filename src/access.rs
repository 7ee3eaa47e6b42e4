//! Project membership gate, accounts and sessions
//!
//! Every project-scoped operation calls [`authorize`] before touching data.

use crate::db::{now, unique_or, Database, DbError, NewUser, Project, ProjectMember, Result, Session, User};
use crate::schema::*;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use sha2::{Digest, Sha256};

pub const MIN_PASSWORD_LEN: usize = 6;

const HASH_SCHEME: &str = "sha256";

/// `sha256$<salt>$<hex digest of salt + password>`
pub fn hash_password(password: &str) -> String {
    let salt = uuid::Uuid::new_v4().simple().to_string();
    format!("{}${}${}", HASH_SCHEME, salt, digest(&salt, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(HASH_SCHEME), Some(salt), Some(expected)) => {
            let actual = digest(salt, password);
            actual.len() == expected.len()
                && actual
                    .bytes()
                    .zip(expected.bytes())
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
        }
        _ => false,
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub fn has_access(conn: &mut SqliteConnection, user_id: i32, project_id: i32) -> Result<bool> {
    let count: i64 = project_members::table
        .filter(project_members::user_id.eq(user_id))
        .filter(project_members::project_id.eq(project_id))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

/// Resolve user and project and require membership
pub fn authorize(conn: &mut SqliteConnection, user_id: i32, project_id: i32) -> Result<(User, Project)> {
    let user = users::table
        .find(user_id)
        .first::<User>(conn)
        .optional()?
        .filter(|u| u.is_active)
        .ok_or_else(|| DbError::NotFound(format!("user {}", user_id)))?;
    let project = projects::table
        .find(project_id)
        .first::<Project>(conn)
        .optional()?
        .ok_or_else(|| DbError::NotFound(format!("project {}", project_id)))?;

    if !has_access(conn, user_id, project_id)? {
        tracing::warn!(user = %user.username, project_id, "access denied");
        return Err(DbError::AccessDenied(format!(
            "user '{}' is not a member of project {}",
            user.username, project_id
        )));
    }
    Ok((user, project))
}

pub(crate) fn member_project_ids(conn: &mut SqliteConnection, user_id: i32) -> Result<Vec<i32>> {
    Ok(project_members::table
        .filter(project_members::user_id.eq(user_id))
        .select(project_members::project_id)
        .load(conn)?)
}

fn session_expired(session: &Session) -> bool {
    match chrono::DateTime::parse_from_rfc3339(&session.expires_at) {
        Ok(expires) => expires <= chrono::Local::now(),
        Err(_) => true,
    }
}

impl Database {
    pub fn register_user(&self, username: &str, password: &str, email: Option<&str>) -> Result<User> {
        let username = username.trim();
        if username.is_empty() {
            return Err(DbError::Validation("Username is required".to_string()));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(DbError::Validation(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let password_hash = hash_password(password);
        let user = self.write(|conn| {
            let ts = now();
            diesel::insert_into(users::table)
                .values(&NewUser {
                    username,
                    password_hash: &password_hash,
                    email,
                    is_active: true,
                    created_at: &ts,
                    updated_at: &ts,
                })
                .execute(conn)
                .map_err(|e| unique_or(e, || format!("username '{}' is taken", username)))?;
            Ok(users::table
                .filter(users::username.eq(username))
                .first::<User>(conn)?)
        })?;
        tracing::info!(user = %user.username, "user registered");
        Ok(user)
    }

    pub fn find_user(&self, username: &str) -> Result<User> {
        self.read(|conn| {
            users::table
                .filter(users::username.eq(username))
                .first::<User>(conn)
                .optional()?
                .ok_or_else(|| DbError::NotFound(format!("user '{}'", username)))
        })
    }

    /// Check credentials and open a session valid for `ttl_hours`
    pub fn login(&self, username: &str, password: &str, ttl_hours: i64) -> Result<(User, Session)> {
        let user = self
            .read(|conn| {
                Ok(users::table
                    .filter(users::username.eq(username))
                    .first::<User>(conn)
                    .optional()?)
            })?
            .filter(|u| u.is_active && verify_password(password, &u.password_hash));
        let user = match user {
            Some(user) => user,
            None => {
                tracing::warn!(user = %username, "login rejected");
                return Err(DbError::Unauthenticated("Invalid username or password".to_string()));
            }
        };

        let created = chrono::Local::now();
        let session = Session {
            token: uuid::Uuid::new_v4().to_string(),
            user_id: user.id,
            created_at: created.to_rfc3339(),
            expires_at: (created + chrono::Duration::hours(ttl_hours)).to_rfc3339(),
        };
        self.write(|conn| {
            diesel::insert_into(sessions::table).values(&session).execute(conn)?;
            Ok(())
        })?;
        tracing::info!(user = %user.username, "login");
        Ok((user, session))
    }

    /// Drop a session. Unknown tokens are ignored.
    pub fn logout(&self, token: &str) -> Result<()> {
        self.write(|conn| {
            diesel::delete(sessions::table.find(token)).execute(conn)?;
            Ok(())
        })
    }

    /// User behind a session token. Expired sessions are purged and rejected.
    /// Only the purge takes the write lock.
    pub fn user_for_session(&self, token: &str) -> Result<User> {
        let unauthenticated = || DbError::Unauthenticated("Authentication required".to_string());
        let session = self
            .read(|conn| Ok(sessions::table.find(token).first::<Session>(conn).optional()?))?
            .ok_or_else(unauthenticated)?;
        if session_expired(&session) {
            self.write(|conn| Ok(diesel::delete(sessions::table.find(token)).execute(conn)?))?;
            tracing::debug!(user_id = session.user_id, "expired session purged");
            return Err(unauthenticated());
        }
        self.read(|conn| {
            users::table
                .find(session.user_id)
                .first::<User>(conn)
                .optional()?
                .filter(|u| u.is_active)
                .ok_or_else(unauthenticated)
        })
    }

    pub fn has_access(&self, user_id: i32, project_id: i32) -> Result<bool> {
        self.read(|conn| has_access(conn, user_id, project_id))
    }

    /// Add `username` to a project the actor already belongs to
    pub fn add_project_member(&self, actor: &User, project_id: i32, username: &str) -> Result<User> {
        let member = self.write(|conn| {
            authorize(conn, actor.id, project_id)?;
            let member = users::table
                .filter(users::username.eq(username))
                .first::<User>(conn)
                .optional()?
                .ok_or_else(|| DbError::NotFound(format!("user '{}'", username)))?;
            diesel::insert_or_ignore_into(project_members::table)
                .values(&ProjectMember {
                    user_id: member.id,
                    project_id,
                    added_at: now(),
                })
                .execute(conn)?;
            Ok(member)
        })?;
        tracing::info!(project_id, member = %member.username, user = %actor.username, "member added");
        Ok(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;

    #[test]
    fn test_password_roundtrip() {
        let stored = hash_password("hunter22");
        assert!(stored.starts_with("sha256$"));
        assert_eq!(stored.split('$').count(), 3);
        assert!(verify_password("hunter22", &stored));
        assert!(!verify_password("hunter23", &stored));
        assert!(!verify_password("hunter22", "plain"));
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(hash_password("same-pass"), hash_password("same-pass"));
    }

    #[test]
    fn test_register_rules() {
        let f = fixture();
        assert!(matches!(
            f.db.register_user("bob", "short", None),
            Err(DbError::Validation(_))
        ));
        assert!(matches!(
            f.db.register_user("alice", "another-pass", None),
            Err(DbError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_login_session_logout() {
        let f = fixture();
        let (user, session) = f.db.login("alice", "password1", 24).unwrap();
        assert_eq!(user.id, f.user.id);
        assert_eq!(f.db.user_for_session(&session.token).unwrap().username, "alice");

        f.db.logout(&session.token).unwrap();
        assert!(matches!(
            f.db.user_for_session(&session.token),
            Err(DbError::Unauthenticated(_))
        ));

        assert!(matches!(
            f.db.login("alice", "wrong-pass", 24),
            Err(DbError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_expired_session_rejected() {
        let f = fixture();
        let (_, session) = f.db.login("alice", "password1", -1).unwrap();
        assert!(matches!(
            f.db.user_for_session(&session.token),
            Err(DbError::Unauthenticated(_))
        ));
        let left: i64 = f
            .db
            .read(|conn| Ok(sessions::table.count().get_result(conn)?))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn test_session_resolves_while_writer_holds_lock() {
        let f = fixture();
        let (_, session) = f.db.login("alice", "password1", 24).unwrap();
        let user = f
            .db
            .write(|_conn| f.db.user_for_session(&session.token))
            .unwrap();
        assert_eq!(user.username, "alice");
    }

    #[test]
    fn test_authorize_and_membership() {
        let f = fixture();
        let bob = f.db.register_user("bob", "password2", Some("bob@example.com")).unwrap();
        assert!(!f.db.has_access(bob.id, f.project.id).unwrap());
        assert!(matches!(
            f.db.get_project(&bob, f.project.id),
            Err(DbError::AccessDenied(_))
        ));
        assert!(matches!(
            f.db.get_project(&bob, 9999),
            Err(DbError::NotFound(_))
        ));

        assert!(matches!(
            f.db.add_project_member(&bob, f.project.id, "bob"),
            Err(DbError::AccessDenied(_))
        ));
        f.db.add_project_member(&f.user, f.project.id, "bob").unwrap();
        f.db.add_project_member(&f.user, f.project.id, "bob").unwrap();
        assert!(f.db.has_access(bob.id, f.project.id).unwrap());
        assert_eq!(f.db.list_projects(&bob).unwrap().len(), 1);
    }
}
