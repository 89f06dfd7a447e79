use crate::calc;
use crate::ipc::auth::require_class_read;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::params::required_str;
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn write_text_file(path: &str, contents: &str) -> Result<(), HandlerErr> {
    let out = PathBuf::from(path);
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).map_err(|e| HandlerErr {
            code: "export_failed",
            message: e.to_string(),
            details: Some(json!({ "path": path })),
        })?;
    }
    std::fs::write(&out, contents).map_err(|e| HandlerErr {
        code: "export_failed",
        message: e.to_string(),
        details: Some(json!({ "path": path })),
    })
}

/// One CSV row per student of the class: total/grade/point/remark for the
/// chosen subject and term. Students without a result export blank cells.
fn results_export_csv(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(&req.params, "classId")?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let term_id = required_str(&req.params, "termId")?;
    let out_path = required_str(&req.params, "outPath")?;

    require_class_read(conn, req.actor.as_ref(), &class_id)?;

    let subject_code: Option<String> = conn
        .query_row(
            "SELECT code FROM subjects WHERE id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if subject_code.is_none() {
        return Err(HandlerErr::not_found("subject not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.student_no, s.last_name, s.first_name,
                    sr.total_score, sr.grade, sr.grade_point, sr.remark
             FROM students s
             LEFT JOIN subject_results sr
               ON sr.student_id = s.id AND sr.subject_id = ?1 AND sr.term_id = ?2
             WHERE s.class_id = ?3
             ORDER BY s.sort_order, s.id",
        )
        .map_err(HandlerErr::db_query)?;
    type Row = (String, String, String, Option<f64>, Option<String>, Option<f64>, Option<String>);
    let rows: Vec<Row> = stmt
        .query_map((&subject_id, &term_id, &class_id), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut csv = String::from("student_no,student_name,total_score,grade,grade_point,remark\n");
    for (no, last, first, total, grade, point, remark) in &rows {
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            csv_quote(no),
            csv_quote(&format!("{}, {}", last, first)),
            total.map(|t| t.to_string()).unwrap_or_default(),
            csv_quote(grade.as_deref().unwrap_or("")),
            point.map(|p| p.to_string()).unwrap_or_default(),
            csv_quote(remark.as_deref().unwrap_or("")),
        ));
    }
    write_text_file(&out_path, &csv)?;

    Ok(json!({ "path": out_path, "rows": rows.len() }))
}

/// Subject-level analytics for one class and term: average, pass/fail
/// against the subject's pass mark, and the per-grade distribution.
fn analytics_subject(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(&req.params, "classId")?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let term_id = required_str(&req.params, "termId")?;

    require_class_read(conn, req.actor.as_ref(), &class_id)?;

    let pass_mark: Option<i64> = conn
        .query_row(
            "SELECT pass_mark FROM subjects WHERE id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(pass_mark) = pass_mark else {
        return Err(HandlerErr::not_found("subject not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT sr.total_score, sr.grade
             FROM subject_results sr
             JOIN students s ON s.id = sr.student_id
             WHERE s.class_id = ? AND sr.subject_id = ? AND sr.term_id = ?",
        )
        .map_err(HandlerErr::db_query)?;
    let rows: Vec<(f64, String)> = stmt
        .query_map((&class_id, &subject_id, &term_id), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let total_students = rows.len();
    let avg = if total_students > 0 {
        calc::round2(rows.iter().map(|(t, _)| t).sum::<f64>() / total_students as f64)
    } else {
        0.0
    };
    let pass_count = rows
        .iter()
        .filter(|(t, _)| *t >= pass_mark as f64)
        .count();

    let mut distribution: Vec<(String, usize)> = Vec::new();
    for (_, grade) in &rows {
        let label = if grade.is_empty() {
            "ungraded"
        } else {
            grade.as_str()
        };
        match distribution.iter_mut().find(|(g, _)| g.as_str() == label) {
            Some((_, n)) => *n += 1,
            None => distribution.push((label.to_string(), 1)),
        }
    }
    distribution.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(json!({
        "totalStudents": total_students,
        "averageScore": avg,
        "passMark": pass_mark,
        "passCount": pass_count,
        "failCount": total_students - pass_count,
        "gradeDistribution": distribution
            .iter()
            .map(|(g, n)| json!({
                "grade": g,
                "count": n,
                "percentage": if total_students > 0 {
                    calc::round2(*n as f64 * 100.0 / total_students as f64)
                } else {
                    0.0
                },
            }))
            .collect::<Vec<_>>(),
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
        "results.exportCsv" => run(&results_export_csv),
        "analytics.subject" => run(&analytics_subject),
        _ => None,
    }
}
