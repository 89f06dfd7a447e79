use crate::calc;
use crate::ipc::auth::require_super_admin;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::params::{optional_i64, optional_str, required_i64, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn classes_create(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let name = required_str(&req.params, "name")?;
    let stream = optional_str(&req.params, "stream").unwrap_or_default();
    if name.trim().is_empty() {
        return Err(HandlerErr::bad_params("name must not be blank"));
    }

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, stream) VALUES(?, ?, ?)",
        (&class_id, name.trim(), stream.trim()),
    )
    .map_err(|e| HandlerErr::db_insert(e, "classes"))?;

    Ok(json!({ "classId": class_id, "name": name.trim(), "stream": stream.trim() }))
}

fn classes_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, stream FROM classes ORDER BY name, stream")
        .map_err(HandlerErr::db_query)?;
    let classes: Vec<serde_json::Value> = stmt
        .query_map([], |r| {
            Ok(json!({
                "classId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "stream": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "classes": classes }))
}

fn subjects_create(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let name = required_str(&req.params, "name")?;
    let code = required_str(&req.params, "code")?;
    let pass_mark = optional_i64(&req.params, "passMark", 50);
    if !(0..=100).contains(&pass_mark) {
        return Err(HandlerErr::bad_params("passMark must be between 0 and 100"));
    }

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code, pass_mark) VALUES(?, ?, ?, ?)",
        (&subject_id, name.trim(), code.trim(), pass_mark),
    )
    .map_err(|e| HandlerErr::db_insert(e, "subjects"))?;

    Ok(json!({ "subjectId": subject_id, "name": name.trim(), "code": code.trim() }))
}

fn subjects_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, code, pass_mark FROM subjects ORDER BY name")
        .map_err(HandlerErr::db_query)?;
    let subjects: Vec<serde_json::Value> = stmt
        .query_map([], |r| {
            Ok(json!({
                "subjectId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "passMark": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "subjects": subjects }))
}

fn terms_create(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let name = required_str(&req.params, "name")?;
    let start_date = required_str(&req.params, "startDate")?;
    let end_date = required_str(&req.params, "endDate")?;

    let start = NaiveDate::parse_from_str(&start_date, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params("startDate must be YYYY-MM-DD"))?;
    let end = NaiveDate::parse_from_str(&end_date, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params("endDate must be YYYY-MM-DD"))?;
    if end < start {
        return Err(HandlerErr::bad_params("endDate precedes startDate"));
    }

    let term_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO terms(id, name, start_date, end_date) VALUES(?, ?, ?, ?)",
        (&term_id, name.trim(), &start_date, &end_date),
    )
    .map_err(|e| HandlerErr::db_insert(e, "terms"))?;

    Ok(json!({ "termId": term_id, "name": name.trim() }))
}

fn terms_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, start_date, end_date FROM terms ORDER BY start_date")
        .map_err(HandlerErr::db_query)?;
    let terms: Vec<serde_json::Value> = stmt
        .query_map([], |r| {
            Ok(json!({
                "termId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "endDate": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "terms": terms }))
}

fn teachers_create(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let employee_no = required_str(&req.params, "employeeNo")?;
    let last_name = required_str(&req.params, "lastName")?;
    let first_name = required_str(&req.params, "firstName")?;

    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, employee_no, last_name, first_name) VALUES(?, ?, ?, ?)",
        (&teacher_id, employee_no.trim(), &last_name, &first_name),
    )
    .map_err(|e| HandlerErr::db_insert(e, "teachers"))?;

    Ok(json!({ "teacherId": teacher_id }))
}

fn teachers_assign(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let teacher_id = required_str(&req.params, "teacherId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("teacher not found"));
    }

    let subject_ids: Vec<String> = req
        .params
        .get("subjectIds")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let class_ids: Vec<String> = req
        .params
        .get("classIds")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    for sid in &subject_ids {
        conn.execute(
            "INSERT OR IGNORE INTO teacher_subjects(teacher_id, subject_id) VALUES(?, ?)",
            (&teacher_id, sid),
        )
        .map_err(|e| HandlerErr::db_insert(e, "teacher_subjects"))?;
    }
    for cid in &class_ids {
        conn.execute(
            "INSERT OR IGNORE INTO teacher_classes(teacher_id, class_id) VALUES(?, ?)",
            (&teacher_id, cid),
        )
        .map_err(|e| HandlerErr::db_insert(e, "teacher_classes"))?;
    }

    Ok(json!({
        "teacherId": teacher_id,
        "subjectsAssigned": subject_ids.len(),
        "classesAssigned": class_ids.len(),
    }))
}

fn class_teachers_assign(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let teacher_id = required_str(&req.params, "teacherId")?;
    let class_id = required_str(&req.params, "classId")?;

    let taken: Option<String> = conn
        .query_row(
            "SELECT teacher_id FROM class_teachers WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if let Some(t) = taken {
        if t != teacher_id {
            return Err(HandlerErr::bad_params("class already has a class teacher"));
        }
        return Ok(json!({ "teacherId": teacher_id, "classId": class_id }));
    }
    let leading: Option<String> = conn
        .query_row(
            "SELECT class_id FROM class_teachers WHERE teacher_id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if leading.is_some() {
        return Err(HandlerErr::bad_params("teacher already leads a class"));
    }

    conn.execute(
        "INSERT INTO class_teachers(teacher_id, class_id) VALUES(?, ?)",
        (&teacher_id, &class_id),
    )
    .map_err(|e| HandlerErr::db_insert(e, "class_teachers"))?;

    Ok(json!({ "teacherId": teacher_id, "classId": class_id }))
}

fn grading_replace_table(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let Some(bands_arr) = req.params.get("bands").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing bands[]"));
    };

    let mut bands: Vec<calc::GradingBand> = Vec::with_capacity(bands_arr.len());
    for (i, b) in bands_arr.iter().enumerate() {
        let min = b.get("min").and_then(|v| v.as_i64());
        let max = b.get("max").and_then(|v| v.as_i64());
        let grade = b.get("grade").and_then(|v| v.as_str());
        let point = b.get("gradePoint").and_then(|v| v.as_f64());
        let remark = b.get("remark").and_then(|v| v.as_str()).unwrap_or("");
        let (Some(min), Some(max), Some(grade), Some(point)) = (min, max, grade, point) else {
            return Err(HandlerErr::bad_params(format!(
                "band at index {} needs min, max, grade, gradePoint",
                i
            )));
        };
        if min > max {
            return Err(HandlerErr::bad_params(format!(
                "band at index {} has min > max",
                i
            )));
        }
        if grade.trim().is_empty() {
            return Err(HandlerErr::bad_params(format!(
                "band at index {} has blank grade",
                i
            )));
        }
        bands.push(calc::GradingBand {
            min_score: min,
            max_score: max,
            grade: grade.trim().to_string(),
            grade_point: point,
            remark: remark.trim().to_string(),
        });
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_query)?;
    tx.execute("DELETE FROM grading_bands", [])
        .map_err(HandlerErr::db_query)?;
    for b in &bands {
        tx.execute(
            "INSERT INTO grading_bands(id, min_score, max_score, grade, grade_point, remark)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                b.min_score,
                b.max_score,
                &b.grade,
                b.grade_point,
                &b.remark,
            ),
        )
        .map_err(|e| HandlerErr::db_insert(e, "grading_bands"))?;
    }
    tx.commit().map_err(HandlerErr::db_query)?;

    let gaps = calc::band_coverage_gaps(&bands);
    let overlaps = calc::band_overlaps(&bands);
    if !gaps.is_empty() || !overlaps.is_empty() {
        tracing::warn!(
            ?gaps,
            ?overlaps,
            "grading table does not cover 0-100 exactly once; lookups in these ranges are ungraded or ambiguous"
        );
    }

    Ok(json!({
        "count": bands.len(),
        "gaps": gaps.iter().map(|(a, b)| json!([a, b])).collect::<Vec<_>>(),
        "overlaps": overlaps.iter().map(|(a, b)| json!([a, b])).collect::<Vec<_>>(),
    }))
}

fn grading_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let bands = calc::load_grading_bands(conn)?;
    Ok(json!({ "bands": bands }))
}

fn subject_weight_sum(
    conn: &Connection,
    class_id: &str,
    subject_id: &str,
) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(SUM(weight), 0) FROM result_components
         WHERE class_id = ? AND subject_id = ?",
        (class_id, subject_id),
        |r| r.get(0),
    )
    .map_err(HandlerErr::db_query)
}

fn components_upsert(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let class_id = required_str(&req.params, "classId")?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let name = required_str(&req.params, "name")?;
    let weight = required_i64(&req.params, "weight")?;
    let max_score = optional_i64(&req.params, "maxScore", 100);

    if !(0..=100).contains(&weight) {
        return Err(HandlerErr::bad_params("weight must be between 0 and 100"));
    }
    if max_score < 1 {
        return Err(HandlerErr::bad_params("maxScore must be at least 1"));
    }

    let component_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO result_components(id, class_id, subject_id, name, weight, max_score)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, subject_id, name) DO UPDATE SET
           weight = excluded.weight,
           max_score = excluded.max_score",
        (
            &component_id,
            &class_id,
            &subject_id,
            name.trim(),
            weight,
            max_score,
        ),
    )
    .map_err(|e| HandlerErr::db_insert(e, "result_components"))?;

    // The insert id is discarded on conflict; read back the surviving row.
    let stored_id: String = conn
        .query_row(
            "SELECT id FROM result_components
             WHERE class_id = ? AND subject_id = ? AND name = ?",
            (&class_id, &subject_id, name.trim()),
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;

    let weight_sum = subject_weight_sum(conn, &class_id, &subject_id)?;
    Ok(json!({
        "componentId": stored_id,
        "weightSum": weight_sum,
        "weightsComplete": weight_sum == 100,
    }))
}

fn components_list(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(&req.params, "classId")?;
    let subject_id = required_str(&req.params, "subjectId")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, weight, max_score FROM result_components
             WHERE class_id = ? AND subject_id = ?
             ORDER BY name",
        )
        .map_err(HandlerErr::db_query)?;
    let components: Vec<serde_json::Value> = stmt
        .query_map((&class_id, &subject_id), |r| {
            Ok(json!({
                "componentId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "weight": r.get::<_, i64>(2)?,
                "maxScore": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let weight_sum = subject_weight_sum(conn, &class_id, &subject_id)?;
    Ok(json!({
        "components": components,
        "weightSum": weight_sum,
        "weightsComplete": weight_sum == 100,
    }))
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
        "classes.create" => run(&classes_create),
        "classes.list" => run(&|c, _| classes_list(c)),
        "subjects.create" => run(&subjects_create),
        "subjects.list" => run(&|c, _| subjects_list(c)),
        "terms.create" => run(&terms_create),
        "terms.list" => run(&|c, _| terms_list(c)),
        "teachers.create" => run(&teachers_create),
        "teachers.assign" => run(&teachers_assign),
        "classTeachers.assign" => run(&class_teachers_assign),
        "grading.replaceTable" => run(&grading_replace_table),
        "grading.list" => run(&|c, _| grading_list(c)),
        "components.upsert" => run(&components_upsert),
        "components.list" => run(&components_list),
        _ => None,
    }
}
