use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

/// Two-decimal rounding used for averages on cards and broadsheets.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingBand {
    pub min_score: i64,
    pub max_score: i64,
    pub grade: String,
    pub grade_point: f64,
    pub remark: String,
}

/// Bands sorted by descending `min_score`, regardless of storage order.
pub fn load_grading_bands(conn: &Connection) -> Result<Vec<GradingBand>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT min_score, max_score, grade, grade_point, remark
             FROM grading_bands
             ORDER BY min_score DESC",
        )
        .map_err(CalcError::db)?;
    stmt.query_map([], |r| {
        Ok(GradingBand {
            min_score: r.get(0)?,
            max_score: r.get(1)?,
            grade: r.get(2)?,
            grade_point: r.get(3)?,
            remark: r.get(4)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::db)
}

/// First band (descending `min_score` order) whose inclusive range contains
/// the floored score. Bands hold integer bounds; flooring keeps fractional
/// scores inside their band (49.999 matches 0-49) instead of falling in the
/// integer gap between bands.
pub fn resolve_band(bands: &[GradingBand], score: f64) -> Option<&GradingBand> {
    if !score.is_finite() {
        return None;
    }
    let floored = score.floor() as i64;
    bands
        .iter()
        .find(|b| b.min_score <= floored && floored <= b.max_score)
}

/// Ranges of 0-100 no band covers, for flagging at configuration time.
pub fn band_coverage_gaps(bands: &[GradingBand]) -> Vec<(i64, i64)> {
    let mut covered = [false; 101];
    for b in bands {
        let lo = b.min_score.max(0);
        let hi = b.max_score.min(100);
        for s in lo..=hi {
            covered[s as usize] = true;
        }
    }
    let mut gaps = Vec::new();
    let mut start: Option<i64> = None;
    for s in 0..=100_i64 {
        if !covered[s as usize] {
            if start.is_none() {
                start = Some(s);
            }
        } else if let Some(g) = start.take() {
            gaps.push((g, s - 1));
        }
    }
    if let Some(g) = start {
        gaps.push((g, 100));
    }
    gaps
}

/// Ranges of 0-100 covered by more than one band.
pub fn band_overlaps(bands: &[GradingBand]) -> Vec<(i64, i64)> {
    let mut coverage = [0u32; 101];
    for b in bands {
        let lo = b.min_score.max(0);
        let hi = b.max_score.min(100);
        for s in lo..=hi {
            coverage[s as usize] += 1;
        }
    }
    let mut overlaps = Vec::new();
    let mut start: Option<i64> = None;
    for s in 0..=100_i64 {
        if coverage[s as usize] > 1 {
            if start.is_none() {
                start = Some(s);
            }
        } else if let Some(o) = start.take() {
            overlaps.push((o, s - 1));
        }
    }
    if let Some(o) = start {
        overlaps.push((o, 100));
    }
    overlaps
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeOutcome {
    pub total_score: f64,
    pub grade: String,
    pub grade_point: f64,
    pub remark: String,
    pub graded: bool,
    pub components_counted: usize,
    pub weight_sum: i64,
    pub weights_complete: bool,
}

/// Recompute one (student, subject, term) result from its component scores
/// and upsert the `subject_results` row. Idempotent: unchanged inputs write
/// identical derived fields. Callers wanting score-write + recompute
/// atomicity run this inside their own transaction.
pub fn recompute_subject_result(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    term_id: &str,
) -> Result<RecomputeOutcome, CalcError> {
    let class_id: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(CalcError::db)?;
    let Some(class_id) = class_id else {
        return Err(CalcError::new("not_found", "student not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT cs.raw_score, rc.weight, rc.max_score
             FROM component_scores cs
             JOIN result_components rc ON rc.id = cs.component_id
             WHERE cs.student_id = ? AND cs.term_id = ?
               AND rc.subject_id = ? AND rc.class_id = ?",
        )
        .map_err(CalcError::db)?;
    let rows: Vec<(f64, i64, i64)> = stmt
        .query_map((student_id, term_id, subject_id, &class_id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let mut total = 0.0_f64;
    for (raw, weight, max_score) in &rows {
        if *max_score <= 0 {
            tracing::warn!(
                subject_id,
                "component has non-positive max_score; contributes nothing"
            );
            continue;
        }
        total += (raw / *max_score as f64) * *weight as f64;
    }

    // Weight sum over the configured layout, not just the scored rows, so a
    // partially configured subject is visible even before scores exist.
    let weight_sum: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(weight), 0) FROM result_components
             WHERE class_id = ? AND subject_id = ?",
            (&class_id, subject_id),
            |r| r.get(0),
        )
        .map_err(CalcError::db)?;
    if weight_sum != 100 {
        tracing::warn!(
            subject_id,
            class_id = %class_id,
            weight_sum,
            "component weights do not sum to 100; totals are skewed"
        );
    }

    let bands = load_grading_bands(conn)?;
    let band = resolve_band(&bands, total);
    if band.is_none() {
        tracing::warn!(
            subject_id,
            total_score = total,
            "no grading band matches computed total; result left ungraded"
        );
    }
    let (grade, grade_point, remark) = match band {
        Some(b) => (b.grade.clone(), b.grade_point, b.remark.clone()),
        None => (String::new(), 0.0, String::new()),
    };

    let result_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO subject_results(
            id, student_id, subject_id, term_id,
            total_score, grade, grade_point, remark, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, term_id) DO UPDATE SET
           total_score = excluded.total_score,
           grade = excluded.grade,
           grade_point = excluded.grade_point,
           remark = excluded.remark,
           updated_at = excluded.updated_at",
        (
            &result_id,
            student_id,
            subject_id,
            term_id,
            total,
            &grade,
            grade_point,
            &remark,
            &now,
        ),
    )
    .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;

    Ok(RecomputeOutcome {
        total_score: total,
        graded: band.is_some(),
        grade,
        grade_point,
        remark,
        components_counted: rows.len(),
        weight_sum,
        weights_complete: weight_sum == 100,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedStudent {
    pub student_id: String,
    pub student_no: String,
    pub display_name: String,
    pub average: f64,
    pub position: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRanking {
    pub ordered: Vec<RankedStudent>,
    pub highest: f64,
    pub lowest: f64,
    pub mean: f64,
    pub total_students: usize,
}

/// Descending by average; ties keep roster order (stable sort over rows
/// already in roster order, then by student id from the roster query).
fn order_by_average(mut rows: Vec<RankedStudent>) -> Vec<RankedStudent> {
    rows.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for (i, r) in rows.iter_mut().enumerate() {
        r.position = i + 1;
    }
    rows
}

/// Per-student average of subject totals across a class and term, ranked
/// descending. Students with no subject results are excluded from the
/// ranked list but still counted in `total_students`.
pub fn rank_class(
    conn: &Connection,
    class_id: &str,
    term_id: &str,
) -> Result<ClassRanking, CalcError> {
    let mut roster_stmt = conn
        .prepare(
            "SELECT id, student_no, last_name, first_name
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order, id",
        )
        .map_err(CalcError::db)?;
    let roster: Vec<(String, String, String, String)> = roster_stmt
        .query_map([class_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let mut avg_stmt = conn
        .prepare(
            "SELECT sr.student_id, AVG(sr.total_score)
             FROM subject_results sr
             JOIN students s ON s.id = sr.student_id
             WHERE s.class_id = ? AND sr.term_id = ?
             GROUP BY sr.student_id",
        )
        .map_err(CalcError::db)?;
    let averages: std::collections::HashMap<String, f64> = avg_stmt
        .query_map((class_id, term_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<_, _>>())
        .map_err(CalcError::db)?;

    let mut rows: Vec<RankedStudent> = Vec::new();
    for (id, student_no, last, first) in &roster {
        let Some(avg) = averages.get(id) else {
            continue;
        };
        rows.push(RankedStudent {
            student_id: id.clone(),
            student_no: student_no.clone(),
            display_name: format!("{}, {}", last, first),
            average: round2(*avg),
            position: 0,
        });
    }
    let ordered = order_by_average(rows);

    let (highest, lowest, mean) = if ordered.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        let sum: f64 = ordered.iter().map(|r| r.average).sum();
        (
            ordered.first().map(|r| r.average).unwrap_or(0.0),
            ordered.last().map(|r| r.average).unwrap_or(0.0),
            round2(sum / ordered.len() as f64),
        )
    };

    Ok(ClassRanking {
        ordered,
        highest,
        lowest,
        mean,
        total_students: roster.len(),
    })
}

pub fn attendance_percentage(days_present: i64, total_days: i64) -> f64 {
    if total_days > 0 {
        round2(100.0 * days_present as f64 / total_days as f64)
    } else {
        0.0
    }
}
