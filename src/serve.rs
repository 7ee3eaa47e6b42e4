//! HTTP JSON API
//!
//! `reqgraph serve` starts a fixed pool of worker threads that pull requests off
//! one shared listener. Every response body is an [`ApiResponse`] envelope,
//! except file downloads.

use crate::config::Config;
use crate::db::{
    Database, DbError, GroupUpdate, NewGroupRequest, NewRequirementRequest, ProjectUpdate, RequirementFilter, Result,
    User, CURRENT_SCHEMA,
};
use crate::export::ExportFormat;
use crate::graph::TreeDirection;
use crate::history::{BatchUpdateRequest, RequirementUpdate};
use crate::import::TempUpload;
use colored::Colorize;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tiny_http::{Header, Method, Request, Response, Server};

#[derive(Serialize)]
struct ApiResponse<T> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn failure(message: String) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Shared by every worker thread
pub struct AppState {
    pub db: Database,
    pub config: Config,
}

/// Start the API server and block until every worker exits
pub fn start_server(state: AppState) -> std::io::Result<()> {
    let addr = state.config.bind_address();
    let server = Server::http(&addr).map_err(|e| std::io::Error::other(e.to_string()))?;
    let server = Arc::new(server);
    let state = Arc::new(state);
    let workers = state.config.server.workers.max(1);

    eprintln!("\n{}", "reqgraph".bold().green());
    eprintln!("   API: http://{}/api/health", addr);
    eprintln!("   Press Ctrl+C to stop\n");
    tracing::info!(%addr, workers, "server listening");

    let handles = (0..workers)
        .map(|i| {
            let server = Arc::clone(&server);
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name(format!("reqgraph-worker-{}", i))
                .spawn(move || {
                    for request in server.incoming_requests() {
                        if let Err(e) = handle_request(&state, request) {
                            tracing::error!(error = %e, "failed to send response");
                        }
                    }
                })
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }
    Ok(())
}

/// Everything routing needs, read off the wire up front
#[derive(Debug, Clone)]
pub(crate) struct ApiRequest {
    method: Method,
    path: String,
    query: String,
    session: Option<String>,
    body: Vec<u8>,
}

impl ApiRequest {
    fn read(request: &mut Request, cookie_name: &str, max_bytes: u64) -> Result<Self> {
        let url = request.url().to_string();
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (url.clone(), String::new()),
        };
        let session = request
            .headers()
            .iter()
            .filter(|h| h.field.equiv("Cookie"))
            .find_map(|h| cookie_value(h.value.as_str(), cookie_name));

        let mut body = Vec::new();
        if !matches!(request.method(), Method::Get | Method::Head | Method::Delete) {
            request.as_reader().take(max_bytes + 1).read_to_end(&mut body)?;
            if body.len() as u64 > max_bytes {
                return Err(DbError::Validation(format!(
                    "Request body exceeds {} bytes",
                    max_bytes
                )));
            }
        }

        Ok(Self {
            method: request.method().clone(),
            path,
            query,
            session,
            body,
        })
    }

    fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| DbError::Validation(format!("Invalid JSON body: {}", e)))
    }

    fn query<T: DeserializeOwned>(&self) -> Result<T> {
        serde_urlencoded::from_str(&self.query).map_err(|e| DbError::Validation(format!("Invalid query: {}", e)))
    }
}

/// Response about to be written
#[derive(Debug)]
pub(crate) struct Reply {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
}

impl Reply {
    fn json<T: Serialize>(data: T) -> Result<Self> {
        Self::json_status(200, data)
    }

    fn json_status<T: Serialize>(status: u16, data: T) -> Result<Self> {
        Ok(Self {
            status,
            content_type: "application/json",
            body: serde_json::to_vec(&ApiResponse::success(data))?,
            headers: Vec::new(),
        })
    }

    fn error(err: &DbError) -> Self {
        let status = err.status_code();
        if status >= 500 {
            tracing::error!(error = %err, "request failed");
        } else if status == 401 || status == 403 {
            tracing::warn!(error = %err, "request rejected");
        } else {
            tracing::debug!(error = %err, "request invalid");
        }
        let body = serde_json::to_vec(&ApiResponse::<()>::failure(err.public_message()))
            .unwrap_or_else(|_| br#"{"ok":false,"data":null,"error":"Internal server error"}"#.to_vec());
        Self {
            status,
            content_type: "application/json",
            body,
            headers: Vec::new(),
        }
    }

    fn file(body: Vec<u8>, content_type: &'static str, filename: &str) -> Self {
        Self {
            status: 200,
            content_type,
            body,
            headers: vec![(
                "Content-Disposition".to_string(),
                format!("attachment; filename=\"{}\"", filename),
            )],
        }
    }

    fn with_header(mut self, name: &str, value: String) -> Self {
        self.headers.push((name.to_string(), value));
        self
    }
}

fn header(name: &str, value: &str) -> std::io::Result<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid header {}", name)))
}

fn respond(request: Request, reply: Reply) -> std::io::Result<()> {
    let mut response = Response::from_data(reply.body)
        .with_status_code(reply.status)
        .with_header(header("Content-Type", reply.content_type)?);
    for (name, value) in &reply.headers {
        response = response.with_header(header(name, value)?);
    }
    request.respond(response)
}

fn handle_request(state: &AppState, mut request: Request) -> std::io::Result<()> {
    let started = Instant::now();
    let method = request.method().clone();
    let url = request.url().to_string();

    let reply = ApiRequest::read(
        &mut request,
        &state.config.session.cookie_name,
        state.config.uploads.max_bytes,
    )
    .and_then(|api| route(state, &api))
    .unwrap_or_else(|e| Reply::error(&e));

    tracing::debug!(
        %method,
        url = %url,
        status = reply.status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    respond(request, reply)
}

/// Value of cookie `name` in a `Cookie:` header
fn cookie_value(header: &str, name: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Decode `%XX` escapes in a path segment
fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_id(raw: &str) -> Result<i32> {
    raw.parse()
        .map_err(|_| DbError::Validation(format!("Invalid id '{}'", raw)))
}

fn current_user(state: &AppState, req: &ApiRequest) -> Result<User> {
    let token = req
        .session
        .as_deref()
        .ok_or_else(|| DbError::Unauthenticated("Authentication required".to_string()))?;
    state.db.user_for_session(token)
}

// ============================================================================
// Request payloads
// ============================================================================

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct NewProjectRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct AddMemberRequest {
    username: String,
}

#[derive(Deserialize)]
struct ProjectQuery {
    project_id: i32,
}

#[derive(Deserialize)]
struct GraphQuery {
    #[serde(default)]
    project_id: Option<i32>,
    #[serde(default)]
    include_deleted: bool,
}

#[derive(Deserialize)]
struct TreeQuery {
    project_id: i32,
    #[serde(default)]
    direction: TreeDirection,
}

#[derive(Deserialize)]
struct SetParentRequest {
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    remove_only: bool,
}

#[derive(Deserialize)]
struct MoveRequest {
    group_id: i32,
}

#[derive(Deserialize)]
struct PositionRequest {
    #[serde(default)]
    x: Option<f64>,
    #[serde(default)]
    y: Option<f64>,
}

#[derive(Deserialize)]
struct LinkRequest {
    child_id: i32,
    parent_id: i32,
    #[serde(default)]
    remove_only: bool,
}

#[derive(Deserialize)]
struct ImportQuery {
    project_id: i32,
    group_id: i32,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Deserialize)]
struct ExportQuery {
    #[serde(default)]
    project_id: Option<i32>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    include_deleted: bool,
}

// ============================================================================
// Routing
// ============================================================================

pub(crate) fn route(state: &AppState, req: &ApiRequest) -> Result<Reply> {
    let db = &state.db;
    let segments: Vec<String> = req.path.trim_matches('/').split('/').map(percent_decode).collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    match (&req.method, segments.as_slice()) {
        (Method::Get, ["api", "health"]) => Reply::json(serde_json::json!({
            "status": "healthy",
            "schema": CURRENT_SCHEMA.version_string(),
            "timestamp": chrono::Local::now().to_rfc3339(),
        })),

        // Accounts
        (Method::Post, ["api", "register"]) => {
            let body: RegisterRequest = req.json()?;
            let user = db.register_user(&body.username, &body.password, body.email.as_deref())?;
            Reply::json_status(201, user)
        }
        (Method::Post, ["api", "login"]) => {
            let body: LoginRequest = req.json()?;
            let ttl_hours = state.config.session.ttl_hours;
            let (user, session) = db.login(&body.username, &body.password, ttl_hours)?;
            let cookie = format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
                state.config.session.cookie_name,
                session.token,
                ttl_hours * 3600
            );
            Ok(Reply::json(user)?.with_header("Set-Cookie", cookie))
        }
        (Method::Post, ["api", "logout"]) => {
            if let Some(token) = &req.session {
                db.logout(token)?;
            }
            let cookie = format!("{}=; Path=/; Max-Age=0", state.config.session.cookie_name);
            Ok(Reply::json(serde_json::json!({ "logged_out": true }))?.with_header("Set-Cookie", cookie))
        }
        (Method::Get, ["api", "user", "current"]) => Reply::json(current_user(state, req)?),

        // Projects
        (Method::Get, ["api", "projects"]) => Reply::json(db.list_projects(&current_user(state, req)?)?),
        (Method::Post, ["api", "projects"]) => {
            let user = current_user(state, req)?;
            let body: NewProjectRequest = req.json()?;
            Reply::json_status(201, db.create_project(&user, &body.name, body.description.as_deref())?)
        }
        (Method::Get, ["api", "projects", id]) => {
            Reply::json(db.get_project(&current_user(state, req)?, parse_id(id)?)?)
        }
        (Method::Put, ["api", "projects", id]) => {
            let user = current_user(state, req)?;
            let body: ProjectUpdate = req.json()?;
            Reply::json(db.update_project(&user, parse_id(id)?, &body)?)
        }
        (Method::Delete, ["api", "projects", id]) => {
            db.delete_project(&current_user(state, req)?, parse_id(id)?)?;
            Reply::json(serde_json::json!({ "deleted": true }))
        }
        (Method::Post, ["api", "projects", id, "members"]) => {
            let user = current_user(state, req)?;
            let body: AddMemberRequest = req.json()?;
            Reply::json(db.add_project_member(&user, parse_id(id)?, &body.username)?)
        }

        // Groups
        (Method::Get, ["api", "groups"]) => {
            let user = current_user(state, req)?;
            let query: ProjectQuery = req.query()?;
            Reply::json(db.group_hierarchy(&user, query.project_id)?)
        }
        (Method::Post, ["api", "groups"]) => {
            let user = current_user(state, req)?;
            let body: NewGroupRequest = req.json()?;
            Reply::json_status(201, db.create_group(&user, &body)?)
        }
        (Method::Put, ["api", "groups", id]) => {
            let user = current_user(state, req)?;
            let body: GroupUpdate = req.json()?;
            Reply::json(db.update_group(&user, parse_id(id)?, &body)?)
        }
        (Method::Delete, ["api", "groups", id]) => {
            db.delete_group(&current_user(state, req)?, parse_id(id)?)?;
            Reply::json(serde_json::json!({ "deleted": true }))
        }

        // Requirements
        (Method::Get, ["api", "requirements"]) => {
            let user = current_user(state, req)?;
            let filter: RequirementFilter = req.query()?;
            Reply::json(db.list_requirements(&user, &filter)?)
        }
        (Method::Post, ["api", "requirements"]) => {
            let user = current_user(state, req)?;
            let body: NewRequirementRequest = req.json()?;
            Reply::json_status(201, db.create_requirement(&user, &body)?)
        }
        (Method::Get, ["api", "requirements", "graph"]) => {
            let user = current_user(state, req)?;
            let query: GraphQuery = req.query()?;
            Reply::json(db.graph_view(&user, query.project_id, query.include_deleted)?)
        }
        (Method::Post, ["api", "requirements", "batch-update"]) => {
            let user = current_user(state, req)?;
            let body: BatchUpdateRequest = req.json()?;
            Reply::json(db.batch_update(&user, &body)?)
        }
        (Method::Get, ["api", "requirements", ext]) => {
            let user = current_user(state, req)?;
            let query: ProjectQuery = req.query()?;
            Reply::json(db.get_requirement(&user, query.project_id, ext)?)
        }
        (Method::Put, ["api", "requirements", ext]) => {
            let user = current_user(state, req)?;
            let query: ProjectQuery = req.query()?;
            let body: RequirementUpdate = req.json()?;
            Reply::json(db.update_requirement(&user, query.project_id, ext, &body)?)
        }
        (Method::Delete, ["api", "requirements", ext]) => {
            let user = current_user(state, req)?;
            let query: ProjectQuery = req.query()?;
            Reply::json(db.delete_requirement(&user, query.project_id, ext)?)
        }
        (Method::Get, ["api", "requirements", ext, "history"]) => {
            let user = current_user(state, req)?;
            let query: ProjectQuery = req.query()?;
            Reply::json(db.requirement_history(&user, query.project_id, ext)?)
        }
        (Method::Get, ["api", "requirements", ext, "tree"]) => {
            let user = current_user(state, req)?;
            let query: TreeQuery = req.query()?;
            Reply::json(db.requirement_tree(&user, query.project_id, ext, query.direction)?)
        }
        (Method::Post, ["api", "requirements", ext, "parent"]) => {
            let user = current_user(state, req)?;
            let query: ProjectQuery = req.query()?;
            let body: SetParentRequest = req.json()?;
            let parent = body.parent_id.as_deref().map(str::trim).filter(|p| !p.is_empty());
            Reply::json(db.set_parent(&user, query.project_id, ext, parent, body.remove_only)?)
        }
        (Method::Post, ["api", "requirements", ext, "move"]) => {
            let user = current_user(state, req)?;
            let query: ProjectQuery = req.query()?;
            let body: MoveRequest = req.json()?;
            Reply::json(db.move_requirement(&user, query.project_id, ext, body.group_id)?)
        }
        (Method::Post, ["api", "requirements", ext, "position"]) => {
            let user = current_user(state, req)?;
            let query: ProjectQuery = req.query()?;
            let body: PositionRequest = req.json()?;
            Reply::json(db.update_position(&user, query.project_id, ext, body.x, body.y)?)
        }

        // Links by internal id
        (Method::Post, ["api", "links"]) => {
            let user = current_user(state, req)?;
            let body: LinkRequest = req.json()?;
            if body.remove_only {
                let removed = db.remove_link(&user, body.child_id, body.parent_id)?;
                Reply::json(serde_json::json!({ "removed": removed }))
            } else {
                let outcome = db.add_link(&user, body.child_id, body.parent_id)?;
                Reply::json(serde_json::json!({ "outcome": outcome }))
            }
        }

        // Bulk
        (Method::Post, ["api", "import"]) => {
            let user = current_user(state, req)?;
            let query: ImportQuery = req.query()?;
            if req.body.is_empty() {
                return Err(DbError::Validation("No file provided".to_string()));
            }
            let filename = query.filename.as_deref().unwrap_or("upload.xlsx");
            let upload = TempUpload::store(&state.config.uploads.dir, filename, &req.body)?;
            Reply::json(db.import_upload(&user, query.project_id, query.group_id, upload)?)
        }
        (Method::Get, ["api", "export"]) => {
            let user = current_user(state, req)?;
            let query: ExportQuery = req.query()?;
            let format = ExportFormat::parse(query.format.as_deref().unwrap_or("xlsx"))?;
            let rows = db.export_rows(&user, query.project_id, query.include_deleted)?;
            let filename = format!(
                "requirements_export_{}.{}",
                chrono::Local::now().format("%Y%m%d_%H%M%S"),
                format.extension()
            );
            Ok(Reply::file(format.render(&rows)?, format.content_type(), &filename))
        }

        _ => Err(DbError::NotFound(format!("route {} {}", req.method, req.path))),
    }
}
