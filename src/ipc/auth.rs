use rusqlite::{Connection, OptionalExtension};

use super::error::HandlerErr;
use super::types::{Actor, Role};

/// Authorization gates run before any mutation. Requests without an actor
/// are treated as anonymous: only the public token-redemption path accepts
/// them, and it never calls into this module.

pub fn require_super_admin(actor: Option<&Actor>) -> Result<(), HandlerErr> {
    match actor {
        Some(a) if a.role == Role::SuperAdmin => Ok(()),
        _ => Err(HandlerErr::unauthorized("super admin role required")),
    }
}

/// Score writes: a subject teacher must be assigned both the subject and
/// the class the component belongs to. Super admins bypass.
pub fn require_subject_write(
    conn: &Connection,
    actor: Option<&Actor>,
    subject_id: &str,
    class_id: &str,
) -> Result<(), HandlerErr> {
    let Some(actor) = actor else {
        return Err(HandlerErr::unauthorized("authentication required"));
    };
    match actor.role {
        Role::SuperAdmin => Ok(()),
        Role::SubjectTeacher => {
            let Some(teacher_id) = actor.teacher_id.as_deref() else {
                return Err(HandlerErr::unauthorized("teacherId required"));
            };
            let covered: Option<i64> = conn
                .query_row(
                    "SELECT 1
                     FROM teacher_subjects ts
                     JOIN teacher_classes tc ON tc.teacher_id = ts.teacher_id
                     WHERE ts.teacher_id = ? AND ts.subject_id = ? AND tc.class_id = ?",
                    (teacher_id, subject_id, class_id),
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::db_query)?;
            if covered.is_some() {
                Ok(())
            } else {
                Err(HandlerErr::unauthorized(
                    "teacher is not assigned this subject and class",
                ))
            }
        }
        _ => Err(HandlerErr::unauthorized(
            "subject teacher or super admin role required",
        )),
    }
}

/// Class-scoped reads (roster, ranking, broadsheet): the class teacher
/// leading that class, or a super admin.
pub fn require_class_read(
    conn: &Connection,
    actor: Option<&Actor>,
    class_id: &str,
) -> Result<(), HandlerErr> {
    let Some(actor) = actor else {
        return Err(HandlerErr::unauthorized("authentication required"));
    };
    match actor.role {
        Role::SuperAdmin => Ok(()),
        Role::ClassTeacher => {
            let Some(teacher_id) = actor.teacher_id.as_deref() else {
                return Err(HandlerErr::unauthorized("teacherId required"));
            };
            let leads: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM class_teachers WHERE teacher_id = ? AND class_id = ?",
                    (teacher_id, class_id),
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::db_query)?;
            if leads.is_some() {
                Ok(())
            } else {
                Err(HandlerErr::unauthorized(
                    "teacher does not lead this class",
                ))
            }
        }
        _ => Err(HandlerErr::unauthorized(
            "class teacher or super admin role required",
        )),
    }
}
