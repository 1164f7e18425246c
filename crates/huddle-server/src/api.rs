use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use huddle_shared::constants::PROTOCOL_VERSION;
use huddle_shared::models::UserSnapshot;
use huddle_shared::types::{ChannelId, GroupId, MessageType, UserId};
use huddle_store::MembershipStore;

use crate::error::ApiError;
use crate::groups::GroupService;
use crate::relay::RelayContext;
use crate::users::{NewUser, UserChanges, UserService};
use crate::ws::ws_handler;

/// Header carrying the authenticated user's id, set by the session layer in
/// front of this service.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MembershipStore>,
    pub groups: GroupService,
    pub users: UserService,
    pub relay: RelayContext,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        // users
        .route("/api/users", get(list_users))
        .route("/api/users/register", post(register_user))
        .route("/api/users/auth", post(auth_user))
        .route("/api/users/reports", get(reported_users))
        .route("/api/users/:id", put(update_user).delete(delete_user))
        .route("/api/users/:id/avatar", put(set_avatar))
        .route("/api/users/:id/report", post(report_user).delete(remove_reported_user))
        // groups
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/:id", get(view_group).delete(delete_group))
        .route("/api/groups/:id/register", post(register).delete(deregister))
        .route("/api/groups/:id/leave", post(leave_group))
        .route("/api/groups/:id/approve", post(approve_registration))
        .route("/api/groups/:id/ban", post(ban_user))
        .route("/api/groups/:id/admins", post(add_group_admin))
        .route("/api/groups/:id/admins/:username", axum::routing::delete(remove_admin))
        .route("/api/groups/:id/users/:username", axum::routing::delete(remove_user))
        .route("/api/groups/:id/channels", post(create_channel))
        .route("/api/groups/:id/channels/:cid", get(view_channel).delete(delete_channel))
        .route("/api/groups/:id/channels/:cid/join", post(join_channel))
        .route("/api/groups/:id/channels/:cid/leave", post(leave_channel))
        .route("/api/groups/:id/channels/:cid/messages", get(get_messages).post(add_message))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the acting user from the trusted id header. Unknown and inactive
/// accounts are rejected.
pub(crate) async fn actor(headers: &HeaderMap, state: &AppState) -> Result<UserSnapshot, ApiError> {
    let unauthenticated = || ApiError::Unauthorized("Unauthorised: please sign in".into());
    let id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(unauthenticated)?;

    match state.store.load_user(UserId(id)).await? {
        Some(user) if user.active => Ok(user.snapshot()),
        _ => Err(unauthenticated()),
    }
}

fn reply(message: &str, extra: Value) -> Json<Value> {
    let mut body = json!({ "success": true, "message": message });
    if let (Value::Object(body), Value::Object(extra)) = (&mut body, extra) {
        body.extend(extra);
    }
    Json(body)
}

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    protocol: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
    })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct AvatarRequest {
    avatar: String,
}

#[derive(Deserialize)]
struct ReportRequest {
    reason: String,
}

async fn register_user(State(state): State<AppState>, Json(new): Json<NewUser>) -> ApiResult {
    let user = state.users.register(new).await?;
    Ok(reply("User registered", json!({ "user": user })))
}

async fn auth_user(State(state): State<AppState>, Json(creds): Json<Credentials>) -> ApiResult {
    let user = state.users.auth(&creds.username, &creds.password).await?;
    Ok(reply("Authenticated", json!({ "user": user })))
}

async fn list_users(headers: HeaderMap, State(state): State<AppState>) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let users = state.users.list_users(&me).await?;
    Ok(reply("Users", json!({ "users": users })))
}

async fn update_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(changes): Json<UserChanges>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let user = state.users.update_user(&me, UserId(id), changes).await?;
    Ok(reply("User updated", json!({ "user": user })))
}

async fn delete_user(headers: HeaderMap, State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let outcome = state.users.delete_user(&me, UserId(id)).await?;
    Ok(reply(
        "User deleted",
        json!({
            "groupsDeleted": outcome.groups_deleted,
            "groupsModified": outcome.groups_modified,
        }),
    ))
}

async fn set_avatar(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<AvatarRequest>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let user = state.users.set_avatar(&me, UserId(id), &req.avatar).await?;
    Ok(reply("Avatar updated", json!({ "user": user })))
}

async fn report_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ReportRequest>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let report = state.users.report_user(&me, UserId(id), &req.reason).await?;
    Ok(reply("User reported", json!({ "report": report })))
}

async fn reported_users(headers: HeaderMap, State(state): State<AppState>) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let reports = state.users.reported_users(&me).await?;
    Ok(reply("Reported users", json!({ "reports": reports })))
}

async fn remove_reported_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state.users.remove_reported_user(&me, UserId(id)).await?;
    Ok(reply("Report removed", json!({})))
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupRequest {
    group_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChannelRequest {
    channel_name: String,
}

#[derive(Deserialize)]
struct TargetUser {
    username: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewMessage {
    #[serde(default)]
    message_type: MessageType,
    message: String,
}

async fn list_groups(headers: HeaderMap, State(state): State<AppState>) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let groups = state.groups.list_groups(&me).await?;
    Ok(reply("Groups", json!({ "groups": groups })))
}

async fn create_group(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let group = state.groups.create_group(&me, &req.group_name).await?;
    Ok(reply("Group created", json!({ "group": group })))
}

async fn view_group(headers: HeaderMap, State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let group = state.groups.view_group(&me, GroupId(id)).await?;
    Ok(reply("Group", json!({ "group": group })))
}

async fn delete_group(headers: HeaderMap, State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state.groups.delete_group(&me, GroupId(id)).await?;
    Ok(reply("Group deleted", json!({})))
}

async fn register(headers: HeaderMap, State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state.groups.register(&me, GroupId(id)).await?;
    Ok(reply("Registration requested", json!({})))
}

async fn deregister(headers: HeaderMap, State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state.groups.deregister(&me, GroupId(id)).await?;
    Ok(reply("Registration withdrawn", json!({})))
}

async fn leave_group(headers: HeaderMap, State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state.groups.leave_group(&me, GroupId(id)).await?;
    Ok(reply("Left group", json!({})))
}

async fn approve_registration(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(target): Json<TargetUser>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state
        .groups
        .approve_registration(&me, GroupId(id), &target.username)
        .await?;
    Ok(reply("Registration approved", json!({})))
}

async fn ban_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(target): Json<TargetUser>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state.groups.ban_user(&me, GroupId(id), &target.username).await?;
    Ok(reply("User banned", json!({})))
}

async fn add_group_admin(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(target): Json<TargetUser>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state.groups.add_group_admin(&me, GroupId(id), &target.username).await?;
    Ok(reply("Admin added", json!({})))
}

async fn remove_admin(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((id, username)): Path<(i64, String)>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state.groups.remove_admin(&me, GroupId(id), &username).await?;
    Ok(reply("Admin removed", json!({})))
}

async fn remove_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((id, username)): Path<(i64, String)>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state.groups.remove_user(&me, GroupId(id), &username).await?;
    Ok(reply("User removed", json!({})))
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

async fn create_channel(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CreateChannelRequest>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let channel = state
        .groups
        .create_channel(&me, GroupId(id), &req.channel_name)
        .await?;
    Ok(reply("Channel created", json!({ "channel": channel })))
}

async fn view_channel(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((id, cid)): Path<(i64, i64)>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let (group, channel) = state
        .groups
        .view_channel(&me, GroupId(id), ChannelId(cid))
        .await?;
    Ok(reply("Channel", json!({ "group": group, "channel": channel })))
}

async fn delete_channel(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((id, cid)): Path<(i64, i64)>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state
        .groups
        .delete_channel(&me, GroupId(id), ChannelId(cid))
        .await?;
    Ok(reply("Channel deleted", json!({})))
}

async fn join_channel(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((id, cid)): Path<(i64, i64)>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let (_, channel) = state
        .groups
        .add_channel_member(&me, GroupId(id), ChannelId(cid))
        .await?;
    Ok(reply("Joined channel", json!({ "channel": channel })))
}

async fn leave_channel(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((id, cid)): Path<(i64, i64)>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    state
        .groups
        .leave_channel(&me, GroupId(id), ChannelId(cid))
        .await?;
    Ok(reply("Left channel", json!({})))
}

async fn get_messages(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((id, cid)): Path<(i64, i64)>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let messages = state
        .groups
        .get_messages(&me, GroupId(id), ChannelId(cid))
        .await?;
    Ok(reply("Messages", json!({ "messages": messages })))
}

async fn add_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((id, cid)): Path<(i64, i64)>,
    Json(req): Json<NewMessage>,
) -> ApiResult {
    let me = actor(&headers, &state).await?;
    let message = state
        .groups
        .add_message(&me, GroupId(id), ChannelId(cid), req.message_type, &req.message)
        .await?;
    Ok(reply("Message added", json!({ "message": message })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
