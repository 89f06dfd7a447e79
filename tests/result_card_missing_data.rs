use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_resultsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn admin() -> serde_json::Value {
    json!({ "role": "super_admin" })
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    actor: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
        "actor": actor,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    actor: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params, actor);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Fixture {
    term_id: String,
    component_id: String,
    student_id: String,
}

fn setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Fixture {
    request_ok(
        stdin,
        reader,
        "f1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        json!(null),
    );
    let class = request_ok(
        stdin,
        reader,
        "f2",
        "classes.create",
        json!({ "name": "SS 3", "stream": "Science" }),
        admin(),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let subject = request_ok(
        stdin,
        reader,
        "f3",
        "subjects.create",
        json!({ "name": "Chemistry", "code": "CHM" }),
        admin(),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let term = request_ok(
        stdin,
        reader,
        "f4",
        "terms.create",
        json!({ "name": "Second Term", "startDate": "2026-01-05", "endDate": "2026-04-02" }),
        admin(),
    );
    let term_id = term["termId"].as_str().expect("termId").to_string();
    request_ok(
        stdin,
        reader,
        "f5",
        "grading.replaceTable",
        json!({ "bands": [
            { "min": 80, "max": 100, "grade": "A", "gradePoint": 4.0, "remark": "Very Good" },
            { "min": 50, "max": 79, "grade": "C", "gradePoint": 2.0, "remark": "Credit" },
            { "min": 0, "max": 49, "grade": "F", "gradePoint": 0.0, "remark": "Fail" }
        ] }),
        admin(),
    );
    let comp = request_ok(
        stdin,
        reader,
        "f6",
        "components.upsert",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "name": "Exam",
            "weight": 100,
            "maxScore": 100,
        }),
        admin(),
    );
    let component_id = comp["componentId"].as_str().expect("componentId").to_string();
    let student = request_ok(
        stdin,
        reader,
        "f7",
        "students.create",
        json!({
            "classId": class_id,
            "studentNo": "STU-400",
            "lastName": "Suleiman",
            "firstName": "Amina",
        }),
        admin(),
    );
    Fixture {
        term_id,
        component_id,
        student_id: student["studentId"].as_str().expect("studentId").to_string(),
    }
}

#[test]
fn card_renders_fully_structured_with_no_term_records() {
    let workspace = temp_dir("resultsd-card-missing");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "scores.upsert",
        json!({
            "studentId": fx.student_id,
            "componentId": fx.component_id,
            "termId": fx.term_id,
            "rawScore": 82.0,
        }),
        admin(),
    );

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "resultCard.render",
        json!({ "studentId": fx.student_id, "termId": fx.term_id }),
        admin(),
    );

    assert_eq!(card["average"].as_f64(), Some(82.0));
    assert_eq!(card["overall"]["graded"].as_bool(), Some(true));
    assert_eq!(card["overall"]["grade"].as_str(), Some("A"));
    assert_eq!(card["position"].as_i64(), Some(1));
    assert_eq!(card["totalStudents"].as_u64(), Some(1));

    // No attendance, comments, or ratings recorded: explicit placeholders,
    // never a fault.
    assert_eq!(card["attendance"]["recorded"].as_bool(), Some(false));
    assert_eq!(card["comments"]["recorded"].as_bool(), Some(false));
    assert_eq!(
        card["ratings"]["psychomotor"]["recorded"].as_bool(),
        Some(false)
    );
    assert_eq!(card["ratings"]["conduct"]["recorded"].as_bool(), Some(false));

    let _ = child.kill();
}

#[test]
fn card_renders_for_a_student_with_no_results_at_all() {
    let workspace = temp_dir("resultsd-card-empty");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace);

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "resultCard.render",
        json!({ "studentId": fx.student_id, "termId": fx.term_id }),
        admin(),
    );

    assert_eq!(card["results"].as_array().map(|a| a.len()), Some(0));
    assert_eq!(card["average"].as_f64(), Some(0.0));
    assert_eq!(card["overall"]["graded"].as_bool(), Some(false));
    assert!(card["position"].is_null());
    assert_eq!(card["totalStudents"].as_u64(), Some(1));

    let _ = child.kill();
}

#[test]
fn recorded_term_records_appear_on_the_card() {
    let workspace = temp_dir("resultsd-card-records");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "records.attendance.upsert",
        json!({
            "studentId": fx.student_id,
            "termId": fx.term_id,
            "daysPresent": 54,
            "daysAbsent": 6,
            "totalDays": 60,
        }),
        admin(),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "records.comments.upsert",
        json!({
            "studentId": fx.student_id,
            "termId": fx.term_id,
            "teacherComment": "A diligent term.",
        }),
        admin(),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "records.ratings.upsert",
        json!({
            "studentId": fx.student_id,
            "termId": fx.term_id,
            "domain": "psychomotor",
            "ratings": { "handwriting": "B", "sports_games": "A" },
        }),
        admin(),
    );

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "resultCard.render",
        json!({ "studentId": fx.student_id, "termId": fx.term_id }),
        admin(),
    );

    assert_eq!(card["attendance"]["recorded"].as_bool(), Some(true));
    assert_eq!(card["attendance"]["percentage"].as_f64(), Some(90.0));
    assert_eq!(card["comments"]["recorded"].as_bool(), Some(true));
    assert_eq!(
        card["comments"]["teacherComment"].as_str(),
        Some("A diligent term.")
    );
    assert_eq!(
        card["ratings"]["psychomotor"]["recorded"].as_bool(),
        Some(true)
    );
    assert_eq!(
        card["ratings"]["psychomotor"]["entries"]["handwriting"].as_str(),
        Some("B")
    );
    // Conduct stays an explicit placeholder.
    assert_eq!(card["ratings"]["conduct"]["recorded"].as_bool(), Some(false));

    // Attendance that cannot add up is rejected, not clamped.
    let inconsistent = request(
        &mut stdin,
        &mut reader,
        "5",
        "records.attendance.upsert",
        json!({
            "studentId": fx.student_id,
            "termId": fx.term_id,
            "daysPresent": 58,
            "daysAbsent": 6,
            "totalDays": 60,
        }),
        admin(),
    );
    assert_eq!(inconsistent["ok"].as_bool(), Some(false));
    assert_eq!(inconsistent["error"]["code"].as_str(), Some("bad_params"));

    let _ = child.kill();
}
