use crate::calc;
use crate::ipc::auth::{require_class_read, require_super_admin};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::params::{optional_str, required_i64, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

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

fn ranking_class(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(&req.params, "classId")?;
    let term_id = required_str(&req.params, "termId")?;
    require_class_read(conn, req.actor.as_ref(), &class_id)?;

    let ranking = calc::rank_class(conn, &class_id, &term_id)?;
    Ok(serde_json::to_value(&ranking).unwrap_or_else(|_| json!({})))
}

fn broadsheet_class(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(&req.params, "classId")?;
    let term_id = required_str(&req.params, "termId")?;
    require_class_read(conn, req.actor.as_ref(), &class_id)?;

    let mut subj_stmt = conn
        .prepare("SELECT id, code, name FROM subjects ORDER BY name")
        .map_err(HandlerErr::db_query)?;
    let subjects: Vec<(String, String, String)> = subj_stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut roster_stmt = conn
        .prepare(
            "SELECT id, student_no, last_name, first_name
             FROM students WHERE class_id = ?
             ORDER BY sort_order, id",
        )
        .map_err(HandlerErr::db_query)?;
    let roster: Vec<(String, String, String, String)> = roster_stmt
        .query_map([&class_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut result_stmt = conn
        .prepare(
            "SELECT sr.subject_id, sr.total_score, sr.grade
             FROM subject_results sr
             WHERE sr.student_id = ? AND sr.term_id = ?",
        )
        .map_err(HandlerErr::db_query)?;

    let mut rows: Vec<serde_json::Value> = Vec::with_capacity(roster.len());
    for (student_id, student_no, last, first) in &roster {
        let per_subject: std::collections::HashMap<String, (f64, String)> = result_stmt
            .query_map((student_id, &term_id), |r| {
                Ok((r.get::<_, String>(0)?, (r.get::<_, f64>(1)?, r.get(2)?)))
            })
            .and_then(|it| it.collect::<Result<_, _>>())
            .map_err(HandlerErr::db_query)?;

        let mut cells = serde_json::Map::new();
        let mut total = 0.0_f64;
        let mut counted = 0usize;
        for (subject_id, code, _) in &subjects {
            match per_subject.get(subject_id) {
                Some((score, grade)) => {
                    cells.insert(
                        code.clone(),
                        json!({ "total": score, "grade": grade, "recorded": true }),
                    );
                    total += score;
                    counted += 1;
                }
                None => {
                    cells.insert(code.clone(), json!({ "recorded": false }));
                }
            }
        }
        let average = if counted > 0 {
            calc::round2(total / counted as f64)
        } else {
            0.0
        };
        rows.push(json!({
            "studentId": student_id,
            "studentNo": student_no,
            "displayName": format!("{}, {}", last, first),
            "results": cells,
            "average": average,
            "subjectsCounted": counted,
        }));
    }

    Ok(json!({
        "subjects": subjects
            .iter()
            .map(|(_, code, name)| json!({ "code": code, "name": name }))
            .collect::<Vec<_>>(),
        "rows": rows,
    }))
}

/// Full card payload for one (student, term). Every sub-lookup that finds
/// nothing degrades to a `recorded: false` placeholder; the card always
/// assembles.
pub fn assemble_result_card(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let student: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT class_id, student_no, last_name, first_name FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((class_id, student_no, last, first)) = student else {
        return Err(HandlerErr::not_found("student not found"));
    };

    let class_row: Option<(String, String)> = conn
        .query_row(
            "SELECT name, stream FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;

    let term_name: Option<String> = conn
        .query_row("SELECT name FROM terms WHERE id = ?", [term_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(term_name) = term_name else {
        return Err(HandlerErr::not_found("term not found"));
    };

    let mut result_stmt = conn
        .prepare(
            "SELECT sub.name, sub.code, sr.total_score, sr.grade, sr.grade_point, sr.remark
             FROM subject_results sr
             JOIN subjects sub ON sub.id = sr.subject_id
             WHERE sr.student_id = ? AND sr.term_id = ?
             ORDER BY sub.name",
        )
        .map_err(HandlerErr::db_query)?;
    let subject_rows: Vec<(String, String, f64, String, f64, String)> = result_stmt
        .query_map((student_id, term_id), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let total_score: f64 = subject_rows.iter().map(|r| r.2).sum();
    let subject_count = subject_rows.len();
    let average = if subject_count > 0 {
        calc::round2(total_score / subject_count as f64)
    } else {
        0.0
    };

    // Second, independent band resolution of the overall average; a card
    // with no results carries an explicit ungraded marker instead.
    let bands = calc::load_grading_bands(conn)?;
    let overall = if subject_count > 0 {
        match calc::resolve_band(&bands, average) {
            Some(b) => json!({
                "graded": true,
                "grade": b.grade,
                "remark": b.remark,
            }),
            None => json!({ "graded": false }),
        }
    } else {
        json!({ "graded": false })
    };

    let ranking = calc::rank_class(conn, &class_id, term_id)?;
    let position = ranking
        .ordered
        .iter()
        .find(|r| r.student_id == student_id)
        .map(|r| r.position);

    let attendance: Option<(i64, i64, i64)> = conn
        .query_row(
            "SELECT days_present, days_absent, total_days
             FROM attendance WHERE student_id = ? AND term_id = ?",
            (student_id, term_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let attendance = match attendance {
        Some((present, absent, total)) => json!({
            "recorded": true,
            "daysPresent": present,
            "daysAbsent": absent,
            "totalDays": total,
            "percentage": calc::attendance_percentage(present, total),
        }),
        None => json!({ "recorded": false }),
    };

    let comments: Option<(String, String)> = conn
        .query_row(
            "SELECT teacher_comment, proprietor_comment
             FROM term_comments WHERE student_id = ? AND term_id = ?",
            (student_id, term_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let comments = match comments {
        Some((teacher, proprietor)) => json!({
            "recorded": true,
            "teacherComment": teacher,
            "proprietorComment": proprietor,
        }),
        None => json!({ "recorded": false }),
    };

    let mut rating_stmt = conn
        .prepare(
            "SELECT domain, trait, rating FROM behavior_ratings
             WHERE student_id = ? AND term_id = ?
             ORDER BY domain, trait",
        )
        .map_err(HandlerErr::db_query)?;
    let rating_rows: Vec<(String, String, String)> = rating_stmt
        .query_map((student_id, term_id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    let mut ratings = serde_json::Map::new();
    for domain in ["psychomotor", "conduct"] {
        let entries: serde_json::Map<String, serde_json::Value> = rating_rows
            .iter()
            .filter(|(d, _, _)| d.as_str() == domain)
            .map(|(_, t, v)| (t.clone(), json!(v)))
            .collect();
        ratings.insert(
            domain.to_string(),
            if entries.is_empty() {
                json!({ "recorded": false })
            } else {
                json!({ "recorded": true, "entries": entries })
            },
        );
    }

    Ok(json!({
        "student": {
            "studentId": student_id,
            "studentNo": student_no,
            "displayName": format!("{}, {}", last, first),
            "class": class_row
                .map(|(name, stream)| json!({ "name": name, "stream": stream }))
                .unwrap_or_else(|| json!(null)),
        },
        "term": { "termId": term_id, "name": term_name },
        "results": subject_rows
            .iter()
            .map(|(name, code, score, grade, point, remark)| json!({
                "subject": name,
                "subjectCode": code,
                "totalScore": score,
                "grade": grade,
                "gradePoint": point,
                "remark": remark,
            }))
            .collect::<Vec<_>>(),
        "totalScore": calc::round2(total_score),
        "average": average,
        "overall": overall,
        "position": position,
        "totalStudents": ranking.total_students,
        "classHighest": ranking.highest,
        "classLowest": ranking.lowest,
        "classAverage": ranking.mean,
        "attendance": attendance,
        "comments": comments,
        "ratings": ratings,
    }))
}

fn result_card_render(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_super_admin(req.actor.as_ref())?;
    let student_id = required_str(&req.params, "studentId")?;
    let term_id = required_str(&req.params, "termId")?;
    assemble_result_card(conn, &student_id, &term_id)
}

fn attendance_upsert(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(&req.params, "studentId")?;
    let term_id = required_str(&req.params, "termId")?;
    let days_present = required_i64(&req.params, "daysPresent")?;
    let days_absent = required_i64(&req.params, "daysAbsent")?;
    let total_days = required_i64(&req.params, "totalDays")?;

    let class_id = student_class(conn, &student_id)?;
    require_class_read(conn, req.actor.as_ref(), &class_id)?;

    if days_present < 0 || days_absent < 0 || total_days < 0 {
        return Err(HandlerErr::bad_params("attendance counts must be >= 0"));
    }
    if total_days > 0 && days_present + days_absent > total_days {
        return Err(HandlerErr::bad_params(
            "daysPresent + daysAbsent exceeds totalDays",
        ));
    }

    conn.execute(
        "INSERT INTO attendance(student_id, term_id, days_present, days_absent, total_days)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, term_id) DO UPDATE SET
           days_present = excluded.days_present,
           days_absent = excluded.days_absent,
           total_days = excluded.total_days",
        (&student_id, &term_id, days_present, days_absent, total_days),
    )
    .map_err(|e| HandlerErr::db_insert(e, "attendance"))?;

    Ok(json!({
        "percentage": calc::attendance_percentage(days_present, total_days),
    }))
}

fn comments_upsert(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(&req.params, "studentId")?;
    let term_id = required_str(&req.params, "termId")?;
    let teacher_comment = optional_str(&req.params, "teacherComment").unwrap_or_default();
    let proprietor_comment = optional_str(&req.params, "proprietorComment").unwrap_or_default();

    let class_id = student_class(conn, &student_id)?;
    require_class_read(conn, req.actor.as_ref(), &class_id)?;

    conn.execute(
        "INSERT INTO term_comments(student_id, term_id, teacher_comment, proprietor_comment)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(student_id, term_id) DO UPDATE SET
           teacher_comment = excluded.teacher_comment,
           proprietor_comment = excluded.proprietor_comment",
        (&student_id, &term_id, &teacher_comment, &proprietor_comment),
    )
    .map_err(|e| HandlerErr::db_insert(e, "term_comments"))?;

    Ok(json!({ "ok": true }))
}

fn ratings_upsert(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(&req.params, "studentId")?;
    let term_id = required_str(&req.params, "termId")?;
    let domain = required_str(&req.params, "domain")?;
    if domain != "psychomotor" && domain != "conduct" {
        return Err(HandlerErr::bad_params(
            "domain must be psychomotor or conduct",
        ));
    }
    let Some(ratings) = req.params.get("ratings").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing ratings object"));
    };

    let class_id = student_class(conn, &student_id)?;
    require_class_read(conn, req.actor.as_ref(), &class_id)?;

    let mut written = 0usize;
    for (trait_code, rating) in ratings {
        let Some(rating) = rating.as_str() else {
            return Err(HandlerErr::bad_params(format!(
                "rating for {} must be a string",
                trait_code
            )));
        };
        conn.execute(
            "INSERT INTO behavior_ratings(student_id, term_id, domain, trait, rating)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id, term_id, domain, trait) DO UPDATE SET
               rating = excluded.rating",
            (&student_id, &term_id, &domain, trait_code, rating),
        )
        .map_err(|e| HandlerErr::db_insert(e, "behavior_ratings"))?;
        written += 1;
    }

    Ok(json!({ "written": written }))
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
        "ranking.class" => run(&ranking_class),
        "broadsheet.class" => run(&broadsheet_class),
        "resultCard.render" => run(&result_card_render),
        "records.attendance.upsert" => run(&attendance_upsert),
        "records.comments.upsert" => run(&comments_upsert),
        "records.ratings.upsert" => run(&ratings_upsert),
        _ => None,
    }
}
