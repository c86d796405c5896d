use actix_web::body::{BoxBody, MessageBody};
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::error::InternalError;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use futures_util::future::{ok, Ready};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::auth::{self, AuthDevice, AuthService};
use crate::models::*;
use crate::ratelimit::RateLimiter;
use crate::store::{Store, StoreError};
use crate::sync::SyncEngine;

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_BYTES: usize = 72; // bcrypt limit
const MAX_EMAIL_LEN: usize = 254;
const MAX_DISPLAY_NAME_LEN: usize = 200;
const MAX_TITLE_LEN: usize = 500;
const MAX_CONTENT_LEN: usize = 500_000;
const MAX_TODO_CONTENT_LEN: usize = 10_000;

const DEFAULT_PAGE_LIMIT: i64 = 50;
const MAX_PAGE_LIMIT: i64 = 200;

/// Request bodies above this are rejected by the JSON codec.
const MAX_BODY_BYTES: usize = 1 << 20;

pub struct AppState {
    pub store: Arc<Store>,
    pub auth: Arc<AuthService>,
    pub sync: SyncEngine,
    pub auth_limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

/// JSON codec settings shared by the server and the test harness:
/// 1 MiB body cap, unknown fields rejected, failures surfaced in the
/// standard error envelope.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(MAX_BODY_BYTES)
        .error_handler(|err, _req| {
            InternalError::from_response(
                err,
                HttpResponse::BadRequest().json(ErrorResponse::new("invalid request body")),
            )
            .into()
        })
}

// ==================== Panic Recovery ====================

/// Turns a panicking handler into a logged `internal error` response.
/// Without this a panic would unwind into the runtime and the client
/// would see a dropped connection instead of a well-formed 500.
pub struct CatchPanic;

impl<S, B> Transform<S, ServiceRequest> for CatchPanic
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type InitError = ();
    type Transform = CatchPanicMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(CatchPanicMiddleware { service })
    }
}

pub struct CatchPanicMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for CatchPanicMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let method = req.method().to_string();
        let path = req.path().to_string();
        let http_req = req.request().clone();

        let fut = self.service.call(req);

        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result.map(|res| res.map_into_boxed_body()),
                Err(panic) => {
                    log::error!(
                        "handler panicked: {} {}: {}",
                        method,
                        path,
                        panic_message(&panic)
                    );
                    Ok(ServiceResponse::new(
                        http_req,
                        HttpResponse::InternalServerError()
                            .json(ErrorResponse::new("internal error")),
                    ))
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

// Response helpers. Client-visible messages come from a bounded set;
// underlying causes only go to the log.

fn bad_request(msg: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse::new(msg))
}

fn unauthorized(msg: &str) -> HttpResponse {
    HttpResponse::Unauthorized().json(ErrorResponse::new(msg))
}

fn not_found(msg: &str) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponse::new(msg))
}

fn conflict(msg: &str) -> HttpResponse {
    HttpResponse::Conflict().json(ErrorResponse::new(msg))
}

fn too_many_requests() -> HttpResponse {
    HttpResponse::TooManyRequests().json(ErrorResponse::new("rate limit exceeded"))
}

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(ErrorResponse::new("internal error"))
}

/// Query integer with a default; unparseable or negative values fall
/// back to the default.
fn query_int(query: &HashMap<String, String>, key: &str, default: i64) -> i64 {
    query
        .get(key)
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|v| *v >= 0)
        .unwrap_or(default)
}

fn page_params(query: &HashMap<String, String>) -> (i64, i64) {
    let limit = query_int(query, "limit", DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
    let offset = query_int(query, "offset", 0);
    (limit, offset)
}

fn rate_limit_key(req: &HttpRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Basic email shape: exactly one `@`, non-empty local part, dotted domain.
fn is_valid_email(email: &str) -> bool {
    let mut parts = email.splitn(2, '@');
    let local = parts.next().unwrap_or_default();
    let domain = parts.next().unwrap_or_default();
    !local.is_empty() && !domain.contains('@') && domain.contains('.')
}

// ==================== Health ====================

pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "uptime": format!("{:?}", state.started_at.elapsed()),
    }))
}

// ==================== Auth Endpoints ====================

pub async fn register(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<RegisterRequest>,
) -> HttpResponse {
    if !state.auth_limiter.allow(&rate_limit_key(&req)) {
        return too_many_requests();
    }

    let email = body.email.trim().to_lowercase();
    let display_name = body.display_name.trim().to_string();
    if email.is_empty() || body.password.is_empty() || display_name.is_empty() {
        return bad_request("email, password, and display_name are required");
    }
    if !is_valid_email(&email) {
        return bad_request("invalid email address");
    }
    if email.chars().count() > MAX_EMAIL_LEN {
        return bad_request("email too long");
    }
    if body.password.chars().count() < MIN_PASSWORD_LEN {
        return bad_request("password must be at least 8 characters");
    }
    if body.password.len() > MAX_PASSWORD_BYTES {
        return bad_request("password too long");
    }
    if display_name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return bad_request("display name too long");
    }

    let password_hash = match state.auth.hash_password(&body.password) {
        Ok(hash) => hash,
        Err(e) => {
            log::error!("bcrypt hash: {}", e);
            return internal_error();
        }
    };

    let user = User {
        id: new_id(),
        email,
        password_hash,
        display_name,
        created_at: now_millis(),
    };

    match state.store.create_user(&user) {
        Ok(()) => HttpResponse::Created().json(user),
        Err(StoreError::Conflict(_)) => conflict("email already registered"),
        Err(e) => {
            log::error!("create user: {}", e);
            internal_error()
        }
    }
}

pub async fn login(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<LoginRequest>,
) -> HttpResponse {
    if !state.auth_limiter.allow(&rate_limit_key(&req)) {
        return too_many_requests();
    }

    let email = body.email.trim().to_lowercase();
    if email.is_empty() || body.password.is_empty() || body.device_id.is_empty() {
        return bad_request("email, password, and device_id are required");
    }

    // Unknown email and wrong password produce the same response so the
    // endpoint cannot be used to enumerate accounts.
    let user = match state.store.get_user_by_email(&email) {
        Ok(u) => u,
        Err(StoreError::NotFound(_)) => return unauthorized("invalid credentials"),
        Err(e) => {
            log::error!("get user by email: {}", e);
            return internal_error();
        }
    };

    match state.auth.verify_password(&body.password, &user.password_hash) {
        Ok(true) => {}
        Ok(false) => return unauthorized("invalid credentials"),
        Err(e) => {
            log::error!("verify password: {}", e);
            return internal_error();
        }
    }

    match issue_token_pair(&state, &user, &body.device_id) {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(resp) => resp,
    }
}

pub async fn refresh(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<RefreshRequest>,
) -> HttpResponse {
    if !state.auth_limiter.allow(&rate_limit_key(&req)) {
        return too_many_requests();
    }

    if body.refresh_token.is_empty() {
        return bad_request("refresh_token is required");
    }

    let claims = match state.auth.verify_refresh_token(&body.refresh_token) {
        Ok(c) => c,
        Err(_) => return unauthorized("invalid refresh token"),
    };

    // The stored record is keyed by token digest; a rotated-away token
    // no longer has one.
    let stored = match state.store.get_refresh_token_by_hash(&auth::hash_token(&body.refresh_token)) {
        Ok(t) => t,
        Err(StoreError::NotFound(_)) => return unauthorized("refresh token revoked"),
        Err(e) => {
            log::error!("get refresh token: {}", e);
            return internal_error();
        }
    };
    if stored.id != claims.token_id || stored.user_id != claims.user_id {
        return unauthorized("invalid refresh token");
    }

    // Rotation: the presented token becomes unusable before a new pair
    // is issued.
    if let Err(e) = state.store.delete_refresh_token(&stored.id) {
        log::error!("delete old refresh token: {}", e);
    }

    let user = match state.store.get_user(&claims.user_id) {
        Ok(u) => u,
        Err(e) => {
            log::error!("get user for refresh: {}", e);
            return unauthorized("user not found");
        }
    };

    match issue_token_pair(&state, &user, &claims.device_id) {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(resp) => resp,
    }
}

pub async fn logout(state: web::Data<AppState>, auth_device: AuthDevice) -> HttpResponse {
    if let Err(e) = state.store.delete_refresh_tokens_for_user(&auth_device.user_id) {
        log::error!("delete refresh tokens on logout: {}", e);
        return internal_error();
    }
    HttpResponse::NoContent().finish()
}

/// Create an access/refresh pair and register the refresh token record.
fn issue_token_pair(
    state: &AppState,
    user: &User,
    device_id: &str,
) -> Result<AuthResponse, HttpResponse> {
    let access_token = state
        .auth
        .issue_access_token(&user.id, device_id)
        .map_err(|e| {
            log::error!("issue access token: {}", e);
            internal_error()
        })?;

    let token_id = new_id();
    let refresh_token = state
        .auth
        .issue_refresh_token(&token_id, &user.id, device_id)
        .map_err(|e| {
            log::error!("issue refresh token: {}", e);
            internal_error()
        })?;

    let now = now_millis();
    let expiry_secs = state.auth.refresh_token_expiry().as_secs() as i64;
    let record = RefreshToken {
        id: token_id,
        user_id: user.id.clone(),
        device_id: device_id.to_string(),
        token_hash: auth::hash_token(&refresh_token),
        expires_at: now + chrono::Duration::seconds(expiry_secs),
        created_at: now,
    };
    state.store.create_refresh_token(&record).map_err(|e| {
        log::error!("store refresh token: {}", e);
        internal_error()
    })?;

    Ok(AuthResponse {
        access_token,
        refresh_token,
        user: user.clone(),
    })
}

// ==================== Note Endpoints ====================

pub async fn list_notes(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let (limit, offset) = page_params(&query);

    match state.store.list_notes(&auth_device.user_id, limit, offset) {
        Ok((notes, total)) => HttpResponse::Ok().json(NoteListResponse {
            notes,
            total,
            limit,
            offset,
        }),
        Err(e) => {
            log::error!("list notes: {}", e);
            internal_error()
        }
    }
}

pub async fn get_note(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    path: web::Path<String>,
) -> HttpResponse {
    match state.store.get_note(&path.into_inner(), &auth_device.user_id) {
        Ok(note) => HttpResponse::Ok().json(note),
        Err(StoreError::NotFound(_)) => not_found("note not found"),
        Err(e) => {
            log::error!("get note: {}", e);
            internal_error()
        }
    }
}

pub async fn create_note(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    body: web::Json<CreateNoteRequest>,
) -> HttpResponse {
    if body.device_id.is_empty() {
        return bad_request("device_id is required");
    }
    if body.title.chars().count() > MAX_TITLE_LEN {
        return bad_request("title too long");
    }
    if body.content.chars().count() > MAX_CONTENT_LEN {
        return bad_request("content too long");
    }

    let note_type = if body.note_type.is_empty() {
        "note".to_string()
    } else {
        body.note_type.clone()
    };
    if note_type != "note" && note_type != "todo_list" {
        return bad_request("type must be 'note' or 'todo_list'");
    }

    let now = now_millis();
    let note = Note {
        id: new_id(),
        user_id: auth_device.user_id.clone(),
        title: body.title.clone(),
        content: body.content.clone(),
        note_type,
        modified_at: now,
        modified_by_device: body.device_id.clone(),
        deleted_at: None,
        created_at: now,
    };

    match state.store.create_note(&note) {
        Ok(()) => HttpResponse::Created().json(note),
        Err(e) => {
            log::error!("create note: {}", e);
            internal_error()
        }
    }
}

pub async fn update_note(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    path: web::Path<String>,
    body: web::Json<UpdateNoteRequest>,
) -> HttpResponse {
    if body.device_id.is_empty() {
        return bad_request("device_id is required");
    }
    if let Some(title) = &body.title {
        if title.chars().count() > MAX_TITLE_LEN {
            return bad_request("title too long");
        }
    }
    if let Some(content) = &body.content {
        if content.chars().count() > MAX_CONTENT_LEN {
            return bad_request("content too long");
        }
    }

    let mut note = match state.store.get_note(&path.into_inner(), &auth_device.user_id) {
        Ok(n) => n,
        Err(StoreError::NotFound(_)) => return not_found("note not found"),
        Err(e) => {
            log::error!("get note for update: {}", e);
            return internal_error();
        }
    };

    if let Some(title) = &body.title {
        note.title = title.clone();
    }
    if let Some(content) = &body.content {
        note.content = content.clone();
    }
    if let Some(note_type) = &body.note_type {
        if note_type != "note" && note_type != "todo_list" {
            return bad_request("type must be 'note' or 'todo_list'");
        }
        note.note_type = note_type.clone();
    }
    note.modified_at = now_millis();
    note.modified_by_device = body.device_id.clone();

    match state.store.update_note(&note) {
        Ok(()) => HttpResponse::Ok().json(note),
        Err(e) => {
            log::error!("update note: {}", e);
            internal_error()
        }
    }
}

pub async fn delete_note(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    path: web::Path<String>,
) -> HttpResponse {
    let result = state.store.delete_note(
        &path.into_inner(),
        &auth_device.user_id,
        now_millis(),
        &auth_device.device_id,
    );
    match result {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(StoreError::NotFound(_)) => not_found("note not found"),
        Err(e) => {
            log::error!("delete note: {}", e);
            internal_error()
        }
    }
}

pub async fn search_notes(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let q = match query.get("q") {
        Some(q) if !q.is_empty() => q,
        _ => return bad_request("q parameter is required"),
    };
    let (limit, offset) = page_params(&query);

    match state.store.search_notes(&auth_device.user_id, q, limit, offset) {
        Ok((notes, total)) => HttpResponse::Ok().json(NoteListResponse {
            notes,
            total,
            limit,
            offset,
        }),
        Err(e) => {
            log::error!("search notes: {}", e);
            internal_error()
        }
    }
}

// ==================== Todo Endpoints ====================

pub async fn list_todos(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let (limit, offset) = page_params(&query);

    match state.store.list_todos(&auth_device.user_id, limit, offset) {
        Ok((todos, total)) => HttpResponse::Ok().json(TodoListResponse {
            todos,
            total,
            limit,
            offset,
        }),
        Err(e) => {
            log::error!("list todos: {}", e);
            internal_error()
        }
    }
}

pub async fn get_todo(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    path: web::Path<String>,
) -> HttpResponse {
    match state.store.get_todo(&path.into_inner(), &auth_device.user_id) {
        Ok(todo) => HttpResponse::Ok().json(todo),
        Err(StoreError::NotFound(_)) => not_found("todo not found"),
        Err(e) => {
            log::error!("get todo: {}", e);
            internal_error()
        }
    }
}

pub async fn create_todo(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    body: web::Json<CreateTodoRequest>,
) -> HttpResponse {
    if body.device_id.is_empty() {
        return bad_request("device_id is required");
    }
    if body.content.chars().count() > MAX_TODO_CONTENT_LEN {
        return bad_request("content too long");
    }

    let now = now_millis();
    let todo = Todo {
        id: new_id(),
        user_id: auth_device.user_id.clone(),
        note_id: body.note_id.clone(),
        line_ref: body.line_ref.clone(),
        content: body.content.clone(),
        due_date: body.due_date,
        completed: false,
        modified_at: now,
        modified_by_device: body.device_id.clone(),
        deleted_at: None,
        created_at: now,
    };

    match state.store.create_todo(&todo) {
        Ok(()) => HttpResponse::Created().json(todo),
        Err(e) => {
            log::error!("create todo: {}", e);
            internal_error()
        }
    }
}

pub async fn update_todo(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    path: web::Path<String>,
    body: web::Json<UpdateTodoRequest>,
) -> HttpResponse {
    if body.device_id.is_empty() {
        return bad_request("device_id is required");
    }
    if let Some(content) = &body.content {
        if content.chars().count() > MAX_TODO_CONTENT_LEN {
            return bad_request("content too long");
        }
    }

    let mut todo = match state.store.get_todo(&path.into_inner(), &auth_device.user_id) {
        Ok(t) => t,
        Err(StoreError::NotFound(_)) => return not_found("todo not found"),
        Err(e) => {
            log::error!("get todo for update: {}", e);
            return internal_error();
        }
    };

    if let Some(content) = &body.content {
        todo.content = content.clone();
    }
    if body.due_date.is_some() {
        todo.due_date = body.due_date;
    }
    if let Some(completed) = body.completed {
        todo.completed = completed;
    }
    if body.note_id.is_some() {
        todo.note_id = body.note_id.clone();
    }
    if body.line_ref.is_some() {
        todo.line_ref = body.line_ref.clone();
    }
    todo.modified_at = now_millis();
    todo.modified_by_device = body.device_id.clone();

    match state.store.update_todo(&todo) {
        Ok(()) => HttpResponse::Ok().json(todo),
        Err(e) => {
            log::error!("update todo: {}", e);
            internal_error()
        }
    }
}

pub async fn delete_todo(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    path: web::Path<String>,
) -> HttpResponse {
    let result = state.store.delete_todo(
        &path.into_inner(),
        &auth_device.user_id,
        now_millis(),
        &auth_device.device_id,
    );
    match result {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(StoreError::NotFound(_)) => not_found("todo not found"),
        Err(e) => {
            log::error!("delete todo: {}", e);
            internal_error()
        }
    }
}

pub async fn overdue_todos(state: web::Data<AppState>, auth_device: AuthDevice) -> HttpResponse {
    match state.store.overdue_todos(&auth_device.user_id) {
        Ok(todos) => HttpResponse::Ok().json(todos),
        Err(e) => {
            log::error!("get overdue todos: {}", e);
            internal_error()
        }
    }
}

// ==================== Sync Endpoints ====================

pub async fn sync_changes(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let since = match query.get("since") {
        Some(s) => s,
        None => return bad_request("since parameter is required"),
    };
    let since_ms: i64 = match since.parse() {
        Ok(ms) => ms,
        Err(_) => return bad_request("since must be a unix timestamp in milliseconds"),
    };

    match state.sync.changes_since(&auth_device.user_id, since_ms) {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(e) => {
            log::error!("sync changes: {}", e);
            internal_error()
        }
    }
}

pub async fn sync_push(
    state: web::Data<AppState>,
    auth_device: AuthDevice,
    body: web::Json<SyncPushRequest>,
) -> HttpResponse {
    let req = body.into_inner();

    match state.sync.apply_batch(&auth_device.user_id, req.notes, req.todos) {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(e) => {
            log::error!("sync push: {}", e);
            internal_error()
        }
    }
}

// ==================== Route Configuration ====================

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check
        .route("/api/v1/health", web::get().to(health))
        // Auth (register/login/refresh are rate limited inside the handlers)
        .route("/api/v1/auth/register", web::post().to(register))
        .route("/api/v1/auth/login", web::post().to(login))
        .route("/api/v1/auth/refresh", web::post().to(refresh))
        .route("/api/v1/auth/logout", web::post().to(logout))
        // Notes (search before {id} so it is not swallowed by the id route)
        .route("/api/v1/notes/search", web::get().to(search_notes))
        .route("/api/v1/notes/{id}", web::get().to(get_note))
        .route("/api/v1/notes", web::get().to(list_notes))
        .route("/api/v1/notes", web::post().to(create_note))
        .route("/api/v1/notes/{id}", web::put().to(update_note))
        .route("/api/v1/notes/{id}", web::delete().to(delete_note))
        // Todos
        .route("/api/v1/todos/overdue", web::get().to(overdue_todos))
        .route("/api/v1/todos/{id}", web::get().to(get_todo))
        .route("/api/v1/todos", web::get().to(list_todos))
        .route("/api/v1/todos", web::post().to(create_todo))
        .route("/api/v1/todos/{id}", web::put().to(update_todo))
        .route("/api/v1/todos/{id}", web::delete().to(delete_todo))
        // Sync
        .route("/api/v1/sync/changes", web::get().to(sync_changes))
        .route("/api/v1/sync/push", web::post().to(sync_push));
}
