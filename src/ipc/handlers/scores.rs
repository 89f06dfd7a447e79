use crate::calc;
use crate::ipc::auth::{require_class_read, require_subject_write};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::params::{required_f64, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct ComponentRow {
    class_id: String,
    subject_id: String,
    max_score: i64,
}

fn load_component(conn: &Connection, component_id: &str) -> Result<ComponentRow, HandlerErr> {
    conn.query_row(
        "SELECT class_id, subject_id, max_score FROM result_components WHERE id = ?",
        [component_id],
        |r| {
            Ok(ComponentRow {
                class_id: r.get(0)?,
                subject_id: r.get(1)?,
                max_score: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)?
    .ok_or_else(|| HandlerErr::not_found("component not found"))
}

fn student_class(conn: &Connection, student_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT class_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::db_query)?
    .ok_or_else(|| HandlerErr::not_found("student not found"))
}

fn term_exists(conn: &Connection, term_id: &str) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM terms WHERE id = ?", [term_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::db_query)?;
    if found.is_none() {
        return Err(HandlerErr::not_found("term not found"));
    }
    Ok(())
}

/// Validated component-score write plus subject recompute, one transaction.
/// A rejected score never reaches the store; a stored score is never seen
/// without its recomputed subject total.
fn scores_upsert(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(&req.params, "studentId")?;
    let component_id = required_str(&req.params, "componentId")?;
    let term_id = required_str(&req.params, "termId")?;
    let raw_score = required_f64(&req.params, "rawScore")?;

    let component = load_component(conn, &component_id)?;
    require_subject_write(
        conn,
        req.actor.as_ref(),
        &component.subject_id,
        &component.class_id,
    )?;

    let class_id = student_class(conn, &student_id)?;
    if class_id != component.class_id {
        return Err(HandlerErr::bad_params(
            "component does not belong to the student's class",
        ));
    }
    term_exists(conn, &term_id)?;

    if !raw_score.is_finite() || raw_score < 0.0 || raw_score > component.max_score as f64 {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("rawScore must be between 0 and {}", component.max_score),
            details: Some(json!({ "rawScore": raw_score, "maxScore": component.max_score })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_query)?;
    let score_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO component_scores(id, student_id, component_id, term_id, raw_score, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, component_id, term_id) DO UPDATE SET
           raw_score = excluded.raw_score,
           updated_at = excluded.updated_at",
        (
            &score_id,
            &student_id,
            &component_id,
            &term_id,
            raw_score,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db_insert(e, "component_scores"))?;

    let outcome =
        calc::recompute_subject_result(&tx, &student_id, &component.subject_id, &term_id)
            .map_err(HandlerErr::from)?;
    tx.commit().map_err(HandlerErr::db_query)?;

    Ok(json!({
        "subjectId": component.subject_id,
        "result": outcome,
    }))
}

/// Standalone recompute for callers that batch component writes and defer
/// the fold until the last one lands.
fn results_recompute(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(&req.params, "studentId")?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let term_id = required_str(&req.params, "termId")?;

    let class_id = student_class(conn, &student_id)?;
    require_subject_write(conn, req.actor.as_ref(), &subject_id, &class_id)?;
    term_exists(conn, &term_id)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_query)?;
    let outcome = calc::recompute_subject_result(&tx, &student_id, &subject_id, &term_id)
        .map_err(HandlerErr::from)?;
    tx.commit().map_err(HandlerErr::db_query)?;

    Ok(json!({ "result": outcome }))
}

fn results_get(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(&req.params, "studentId")?;
    let term_id = required_str(&req.params, "termId")?;

    let class_id = student_class(conn, &student_id)?;
    require_class_read(conn, req.actor.as_ref(), &class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT sub.name, sub.code, sr.total_score, sr.grade, sr.grade_point, sr.remark
             FROM subject_results sr
             JOIN subjects sub ON sub.id = sr.subject_id
             WHERE sr.student_id = ? AND sr.term_id = ?
             ORDER BY sub.name",
        )
        .map_err(HandlerErr::db_query)?;
    let results: Vec<serde_json::Value> = stmt
        .query_map((&student_id, &term_id), |r| {
            Ok(json!({
                "subject": r.get::<_, String>(0)?,
                "subjectCode": r.get::<_, String>(1)?,
                "totalScore": r.get::<_, f64>(2)?,
                "grade": r.get::<_, String>(3)?,
                "gradePoint": r.get::<_, f64>(4)?,
                "remark": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "results": results }))
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
        "scores.upsert" => run(&scores_upsert),
        "results.recompute" => run(&results_recompute),
        "results.get" => run(&results_get),
        _ => None,
    }
}
