use crate::ipc::auth::require_super_admin;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::report::assemble_result_card;
use crate::ipc::params::{optional_i64, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::token::{issue_token, redeem_token, RedeemOutcome};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const DEFAULT_MAX_USES: i64 = 3;

fn token_state(uses_count: i64, max_uses: i64) -> &'static str {
    if uses_count >= max_uses {
        "exhausted"
    } else if uses_count > 0 {
        "partially_used"
    } else {
        "issued"
    }
}

fn tokens_issue(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let student_id = required_str(&req.params, "studentId")?;
    let term_id = required_str(&req.params, "termId")?;
    let max_uses = optional_i64(&req.params, "maxUses", DEFAULT_MAX_USES);
    if max_uses < 1 {
        return Err(HandlerErr::bad_params("maxUses must be at least 1"));
    }

    let student_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if student_exists.is_none() {
        return Err(HandlerErr::not_found("student not found"));
    }
    let term_found: Option<i64> = conn
        .query_row("SELECT 1 FROM terms WHERE id = ?", [&term_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::db_query)?;
    if term_found.is_none() {
        return Err(HandlerErr::not_found("term not found"));
    }

    let issued = issue_token(conn, &student_id, &term_id, max_uses)?;
    Ok(json!({
        "token": issued.token,
        "maxUses": issued.max_uses,
        "usesCount": issued.uses_count,
        "state": token_state(issued.uses_count, issued.max_uses),
        "alreadyExisted": issued.already_existed,
    }))
}

fn tokens_issue_for_term(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let term_id = required_str(&req.params, "termId")?;
    let max_uses = optional_i64(&req.params, "maxUses", DEFAULT_MAX_USES);
    if max_uses < 1 {
        return Err(HandlerErr::bad_params("maxUses must be at least 1"));
    }

    let term_found: Option<i64> = conn
        .query_row("SELECT 1 FROM terms WHERE id = ?", [&term_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::db_query)?;
    if term_found.is_none() {
        return Err(HandlerErr::not_found("term not found"));
    }

    let mut stmt = conn
        .prepare("SELECT id FROM students ORDER BY class_id, sort_order")
        .map_err(HandlerErr::db_query)?;
    let student_ids: Vec<String> = stmt
        .query_map([], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut created = 0usize;
    for sid in &student_ids {
        let issued = issue_token(conn, sid, &term_id, max_uses)?;
        if !issued.already_existed {
            created += 1;
        }
    }

    Ok(json!({
        "students": student_ids.len(),
        "created": created,
        "existing": student_ids.len() - created,
    }))
}

/// Public entry: consume one use and return the assembled card. No actor
/// required; the token is the credential.
fn tokens_redeem(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let raw = required_str(&req.params, "token")?;

    match redeem_token(conn, &raw)? {
        RedeemOutcome::Redeemed {
            student_id,
            term_id,
            uses_count,
            max_uses,
        } => {
            let card = assemble_result_card(conn, &student_id, &term_id)?;
            Ok(json!({
                "studentId": student_id,
                "termId": term_id,
                "card": card,
                "usesCount": uses_count,
                "maxUses": max_uses,
                "usesRemaining": max_uses - uses_count,
            }))
        }
        RedeemOutcome::Exhausted => Err(HandlerErr::exhausted()),
        RedeemOutcome::NotFound => Err(HandlerErr::not_found("invalid token")),
    }
}

fn tokens_list(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let term_filter = optional_str(&req.params, "termId");

    let sql = "SELECT rt.token, rt.student_id, s.student_no, s.last_name, s.first_name,
                      rt.term_id, rt.max_uses, rt.uses_count, rt.created_at
               FROM result_tokens rt
               JOIN students s ON s.id = rt.student_id
               WHERE (?1 IS NULL OR rt.term_id = ?1)
               ORDER BY rt.created_at DESC, rt.token";
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db_query)?;
    let tokens: Vec<serde_json::Value> = stmt
        .query_map([&term_filter], |r| {
            let last: String = r.get(3)?;
            let first: String = r.get(4)?;
            let max_uses: i64 = r.get(6)?;
            let uses_count: i64 = r.get(7)?;
            Ok(json!({
                "token": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentNo": r.get::<_, String>(2)?,
                "displayName": format!("{}, {}", last, first),
                "termId": r.get::<_, String>(5)?,
                "maxUses": max_uses,
                "usesCount": uses_count,
                "state": token_state(uses_count, max_uses),
                "createdAt": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "tokens": tokens }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: &dyn Fn(&Connection, &Request) -> Result<serde_json::Value, HandlerErr>| {
        let resp = match state.conn() {
            Ok(conn) => f(conn, req),
            Err(e) => Err(e),
        };
        Some(match resp {
            Ok(v) => ok(&req.id, v),
            Err(e) => e.response(&req.id),
        })
    };

    match req.method.as_str() {
        "tokens.issue" => run(&tokens_issue),
        "tokens.issueForTerm" => run(&tokens_issue_for_term),
        "tokens.redeem" => run(&tokens_redeem),
        "tokens.list" => run(&tokens_list),
        _ => None,
    }
}
