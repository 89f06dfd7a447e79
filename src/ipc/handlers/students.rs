use crate::ipc::auth::{require_class_read, require_super_admin};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::params::required_str;
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn students_create(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let class_id = required_str(&req.params, "classId")?;
    let student_no = required_str(&req.params, "studentNo")?;
    let last_name = required_str(&req.params, "lastName")?;
    let first_name = required_str(&req.params, "firstName")?;

    let class_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if class_exists.is_none() {
        return Err(HandlerErr::not_found("class not found"));
    }

    // Append at the end of the roster.
    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, student_no, last_name, first_name, active, sort_order)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (
            &student_id,
            &class_id,
            student_no.trim(),
            &last_name,
            &first_name,
            next_sort,
        ),
    )
    .map_err(|e| HandlerErr::db_insert(e, "students"))?;

    Ok(json!({ "studentId": student_id, "sortOrder": next_sort }))
}

fn students_list(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(&req.params, "classId")?;
    require_class_read(conn, req.actor.as_ref(), &class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, student_no, last_name, first_name, active, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order, id",
        )
        .map_err(HandlerErr::db_query)?;
    let students: Vec<serde_json::Value> = stmt
        .query_map([&class_id], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "studentNo": r.get::<_, String>(1)?,
                "displayName": format!("{}, {}", last, first),
                "active": r.get::<_, i64>(4)? != 0,
                "sortOrder": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "students": students }))
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
        "students.create" => run(&students_create),
        "students.list" => run(&students_list),
        _ => None,
    }
}
