use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, Uri};
use axum::Extension;
use serde::Deserialize;

use lp_services::database::{CreateDatabaseRequest, CreateDbUserRequest};
use lp_services::RequestIdentity;

use crate::handlers::{parse_body, require_post};
use crate::http::envelope::{ApiError, ApiSuccess};
use crate::http::gateway::{require_auth, MaybeSession};
use crate::http::query;
use crate::state::AppContext;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NamedDatabaseBody {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeleteUserBody {
    username: String,
    host: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BackupBody {
    database: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RestoreBody {
    backup_id: Option<i64>,
    database: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImportBody {
    database: String,
    sql: String,
}

/// MySQL databases and accounts. The only group open to non-admin
/// users; every other group requires the admin role.
pub async fn dispatch(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<RequestIdentity>,
    Extension(session): Extension<MaybeSession>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<ApiSuccess, ApiError> {
    require_auth(&session)?;
    let q = uri.query();
    let action = query::param(q, "action").unwrap_or_default();
    match action.as_str() {
        "list" => {
            let list = ctx.databases.list().await?;
            Ok(ApiSuccess::data(list).message("Databases retrieved successfully"))
        }
        "create" => {
            require_post(&method)?;
            let req: CreateDatabaseRequest = parse_body(&body)?;
            let created = ctx.databases.create(&identity, &req).await?;
            let message = format!("Database '{}' created successfully", created.name);
            Ok(ApiSuccess::data(created).message(message))
        }
        "delete" => {
            require_post(&method)?;
            let req: NamedDatabaseBody = parse_body(&body)?;
            ctx.databases
                .delete(
                    &identity,
                    &req.name,
                    query::flag(q, "confirm"),
                    query::flag(q, "drop_user"),
                )
                .await?;
            Ok(ApiSuccess::empty()
                .message(format!("Database '{}' deleted successfully", req.name)))
        }
        "users" => {
            let users = ctx.databases.list_users().await?;
            Ok(ApiSuccess::data(users).message("Database users retrieved successfully"))
        }
        "create_user" => {
            require_post(&method)?;
            let req: CreateDbUserRequest = parse_body(&body)?;
            let user = ctx.databases.create_user(&identity, &req).await?;
            let message = format!("User '{}' created successfully", user.username);
            Ok(ApiSuccess::data(user).message(message))
        }
        "delete_user" => {
            require_post(&method)?;
            let req: DeleteUserBody = parse_body(&body)?;
            let host = req.host.as_deref().unwrap_or("localhost");
            ctx.databases
                .delete_user(&identity, &req.username, host)
                .await?;
            Ok(ApiSuccess::empty()
                .message(format!("User '{}' deleted successfully", req.username)))
        }
        "backup" => {
            require_post(&method)?;
            let req: BackupBody = parse_body(&body)?;
            let backup = ctx
                .backups
                .create_database_backup(&identity, &req.database)
                .await?;
            Ok(ApiSuccess::data(backup).message("Database backup created successfully"))
        }
        "restore" => {
            require_post(&method)?;
            let req: RestoreBody = parse_body(&body)?;
            let backup_id = req
                .backup_id
                .ok_or_else(|| ApiError::Validation("Backup ID is required".to_string()))?;
            let restored = ctx
                .backups
                .restore_database(&identity, backup_id, req.database.as_deref())
                .await?;
            Ok(ApiSuccess::data(restored).message("Database restored successfully"))
        }
        "import" => {
            require_post(&method)?;
            let req: ImportBody = parse_body(&body)?;
            let outcome = ctx
                .databases
                .import(&identity, &req.database, &req.sql)
                .await?;
            Ok(ApiSuccess::data(outcome).message("Database imported successfully"))
        }
        "export" => {
            require_post(&method)?;
            let req: BackupBody = parse_body(&body)?;
            let exported = ctx.databases.export(&identity, &req.database).await?;
            Ok(ApiSuccess::data(exported).message("Database exported successfully"))
        }
        _ => Err(ApiError::Validation("Invalid action".to_string())),
    }
}
