use crate::backup;
use crate::db;
use crate::ipc::auth::require_super_admin;
use crate::ipc::error::{err, ok};
use crate::ipc::params::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_super_admin(req.actor.as_ref()) {
        return e.response(&req.id);
    }
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match required_str(&req.params, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "path": out_path.to_string_lossy(),
                "bundleFormat": summary.bundle_format,
                "dbSha256": summary.db_sha256,
            }),
        ),
        Err(e) => err(&req.id, "export_failed", format!("{e:#}"), None),
    }
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_super_admin(req.actor.as_ref()) {
        return e.response(&req.id);
    }
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let in_path = match required_str(&req.params, "inPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };

    // Release the live connection before the database file is replaced.
    state.db = None;
    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(s) => s,
        Err(e) => {
            // Reopen whatever is on disk so the session stays usable.
            state.db = db::open_db(&workspace).ok();
            return err(&req.id, "import_failed", format!("{e:#}"), None);
        }
    };

    match db::open_db(&workspace) {
        Ok(conn) => {
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "bundleFormat": summary.bundle_format_detected,
                    "checksumVerified": summary.checksum_verified,
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        _ => None,
    }
}
