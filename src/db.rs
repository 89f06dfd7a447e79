use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("results.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            stream TEXT NOT NULL DEFAULT '',
            UNIQUE(name, stream)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            code TEXT NOT NULL UNIQUE,
            pass_mark INTEGER NOT NULL DEFAULT 50
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_no TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            employee_no TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_subjects(
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(teacher_id, subject_id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_classes(
            teacher_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            PRIMARY KEY(teacher_id, class_id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    // One leading teacher per class, one class per leading teacher.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_teachers(
            teacher_id TEXT NOT NULL UNIQUE,
            class_id TEXT NOT NULL UNIQUE,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_bands(
            id TEXT PRIMARY KEY,
            min_score INTEGER NOT NULL,
            max_score INTEGER NOT NULL,
            grade TEXT NOT NULL,
            grade_point REAL NOT NULL,
            remark TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_components(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight INTEGER NOT NULL,
            max_score INTEGER NOT NULL DEFAULT 100,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(class_id, subject_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_result_components_class_subject
         ON result_components(class_id, subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS component_scores(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            component_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            raw_score REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(component_id) REFERENCES result_components(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            UNIQUE(student_id, component_id, term_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_component_scores_student_term
         ON component_scores(student_id, term_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            total_score REAL NOT NULL,
            grade TEXT NOT NULL DEFAULT '',
            grade_point REAL NOT NULL DEFAULT 0,
            remark TEXT NOT NULL DEFAULT '',
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            UNIQUE(student_id, subject_id, term_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_results_student_term
         ON subject_results(student_id, term_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_results_term ON subject_results(term_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_tokens(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            token TEXT NOT NULL UNIQUE,
            max_uses INTEGER NOT NULL DEFAULT 3,
            uses_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            UNIQUE(student_id, term_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            student_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            days_present INTEGER NOT NULL DEFAULT 0,
            days_absent INTEGER NOT NULL DEFAULT 0,
            total_days INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(student_id, term_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(term_id) REFERENCES terms(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_comments(
            student_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            teacher_comment TEXT NOT NULL DEFAULT '',
            proprietor_comment TEXT NOT NULL DEFAULT '',
            PRIMARY KEY(student_id, term_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(term_id) REFERENCES terms(id)
        )",
        [],
    )?;

    // domain is 'psychomotor' or 'conduct'; traits are short codes like
    // 'handwriting' or 'punctuality'.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS behavior_ratings(
            student_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            domain TEXT NOT NULL,
            trait TEXT NOT NULL,
            rating TEXT NOT NULL,
            PRIMARY KEY(student_id, term_id, domain, trait),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(term_id) REFERENCES terms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_behavior_ratings_student_term
         ON behavior_ratings(student_id, term_id)",
        [],
    )?;

    Ok(conn)
}
