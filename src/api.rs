use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;

use crate::error::{ErrorKind, LibError};
use crate::models::{CreateRolePayload, ListRolesQuery, RoleId, UpdateRolePayload};
use crate::operations::RoleService;
use crate::store::RoleStore;

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::RoleNotFound | ErrorKind::ParentNotFound => StatusCode::NOT_FOUND,
            ErrorKind::DuplicateName | ErrorKind::RootPolicy => StatusCode::CONFLICT,
            ErrorKind::SelfReference | ErrorKind::CycleDetected | ErrorKind::InvalidInput => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(kind = ?self.0.kind, error = %self.0.source, "role api request failed");
        } else {
            tracing::debug!(kind = ?self.0.kind, error = %self.0.source, "role api request rejected");
        }
        let body = Json(json!({
            "error": {
                "code": self.0.code,
                "message": self.0.public
            }
        }));
        (status, body).into_response()
    }
}

pub trait HasRoleService {
    type Store: RoleStore + 'static;

    fn roles(&self) -> RoleService<Self::Store>;
}

async fn create_role_handler<S>(
    State(app): State<S>,
    Json(payload): Json<CreateRolePayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: HasRoleService + Clone + Send + Sync + 'static,
{
    let role = app.roles().create(payload).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

async fn list_roles_handler<S>(
    State(app): State<S>,
    Query(query): Query<ListRolesQuery>,
) -> Result<impl IntoResponse, AppError>
where
    S: HasRoleService + Clone + Send + Sync + 'static,
{
    let page = app.roles().list_roles(query).await?;
    Ok(Json(page))
}

async fn get_role_handler<S>(
    State(app): State<S>,
    Path(role_id): Path<RoleId>,
) -> Result<impl IntoResponse, AppError>
where
    S: HasRoleService + Clone + Send + Sync + 'static,
{
    let role = app.roles().get(role_id).await?;
    Ok(Json(role))
}

async fn update_role_handler<S>(
    State(app): State<S>,
    Path(role_id): Path<RoleId>,
    Json(payload): Json<UpdateRolePayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: HasRoleService + Clone + Send + Sync + 'static,
{
    let role = app.roles().update(role_id, payload).await?;
    Ok(Json(role))
}

async fn delete_role_handler<S>(
    State(app): State<S>,
    Path(role_id): Path<RoleId>,
) -> Result<impl IntoResponse, AppError>
where
    S: HasRoleService + Clone + Send + Sync + 'static,
{
    let removed = app.roles().remove(role_id).await?;
    Ok(Json(removed))
}

async fn role_tree_handler<S>(
    State(app): State<S>,
    Path(role_id): Path<RoleId>,
) -> Result<impl IntoResponse, AppError>
where
    S: HasRoleService + Clone + Send + Sync + 'static,
{
    let tree = app.roles().read_subtree(role_id).await?;
    Ok(Json(tree))
}

async fn role_children_handler<S>(
    State(app): State<S>,
    Path(role_id): Path<RoleId>,
) -> Result<impl IntoResponse, AppError>
where
    S: HasRoleService + Clone + Send + Sync + 'static,
{
    let children = app.roles().list_children(role_id).await?;
    Ok(Json(children))
}

async fn audit_handler<S>(State(app): State<S>) -> Result<impl IntoResponse, AppError>
where
    S: HasRoleService + Clone + Send + Sync + 'static,
{
    let violations = app.roles().audit().await?;
    Ok(Json(json!({
        "valid": violations.is_empty(),
        "violations": violations
    })))
}

pub fn routes<S>() -> Router<S>
where
    S: HasRoleService + Clone + Send + Sync + 'static,
{
    tracing::info!("Registering route /roles [GET,POST]");
    tracing::info!("Registering route /roles/audit [GET]");
    tracing::info!("Registering route /roles/{{role_id}} [GET,PATCH,DELETE]");
    tracing::info!("Registering route /roles/{{role_id}}/tree [GET]");
    tracing::info!("Registering route /roles/{{role_id}}/children [GET]");

    Router::new()
        .route(
            "/roles",
            get(list_roles_handler::<S>).post(create_role_handler::<S>),
        )
        .route("/roles/audit", get(audit_handler::<S>))
        .route(
            "/roles/{role_id}",
            get(get_role_handler::<S>)
                .patch(update_role_handler::<S>)
                .delete(delete_role_handler::<S>),
        )
        .route("/roles/{role_id}/tree", get(role_tree_handler::<S>))
        .route("/roles/{role_id}/children", get(role_children_handler::<S>))
}
