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

#[test]
fn ranking_orders_descending_with_roster_tie_break() {
    let workspace = temp_dir("resultsd-ranking");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        json!(null),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "JSS 1", "stream": "B" }),
        admin(),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "name": "Mathematics", "code": "MTH" }),
        admin(),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let term = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "terms.create",
        json!({ "name": "First Term", "startDate": "2025-09-08", "endDate": "2025-12-12" }),
        admin(),
    );
    let term_id = term["termId"].as_str().expect("termId").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grading.replaceTable",
        json!({ "bands": [
            { "min": 50, "max": 100, "grade": "P", "gradePoint": 1.0, "remark": "Pass" },
            { "min": 0, "max": 49, "grade": "F", "gradePoint": 0.0, "remark": "Fail" }
        ] }),
        admin(),
    );
    let comp = request_ok(
        &mut stdin,
        &mut reader,
        "6",
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

    // Roster order A, B, C, D plus E who never writes a score.
    let names = [("A", "Abah"), ("B", "Bassey"), ("C", "Chukwu"), ("D", "Danjuma"), ("E", "Effiong")];
    let mut student_ids = Vec::new();
    for (i, (tag, last)) in names.iter().enumerate() {
        let student = request_ok(
            &mut stdin,
            &mut reader,
            &format!("st{}", i),
            "students.create",
            json!({
                "classId": class_id,
                "studentNo": format!("STU-30{}", i),
                "lastName": last,
                "firstName": tag,
            }),
            admin(),
        );
        student_ids.push(student["studentId"].as_str().expect("studentId").to_string());
    }

    for (i, (student_id, score)) in student_ids
        .iter()
        .zip([70.0, 85.0, 85.0, 60.0].iter())
        .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("sc{}", i),
            "scores.upsert",
            json!({
                "studentId": student_id,
                "componentId": component_id,
                "termId": term_id,
                "rawScore": score,
            }),
            admin(),
        );
    }

    let ranking = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "ranking.class",
        json!({ "classId": class_id, "termId": term_id }),
        admin(),
    );

    let ordered = ranking["ordered"].as_array().expect("ordered");
    let ids: Vec<&str> = ordered
        .iter()
        .map(|r| r["studentId"].as_str().expect("studentId"))
        .collect();
    // Tie at 85 resolves by roster order: B before C.
    assert_eq!(
        ids,
        vec![
            student_ids[1].as_str(),
            student_ids[2].as_str(),
            student_ids[0].as_str(),
            student_ids[3].as_str(),
        ]
    );
    let positions: Vec<i64> = ordered
        .iter()
        .map(|r| r["position"].as_i64().expect("position"))
        .collect();
    assert_eq!(positions, vec![1, 2, 3, 4]);

    assert_eq!(ranking["highest"].as_f64(), Some(85.0));
    assert_eq!(ranking["lowest"].as_f64(), Some(60.0));
    assert_eq!(ranking["mean"].as_f64(), Some(75.0));
    // E has no results: absent from the ranked list, present in the count.
    assert_eq!(ranking["totalStudents"].as_u64(), Some(5));

    let _ = child.kill();
}

#[test]
fn ranking_is_scoped_to_the_leading_class_teacher() {
    let workspace = temp_dir("resultsd-ranking-auth");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        json!(null),
    );
    let class_a = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "JSS 2", "stream": "A" }),
        admin(),
    );
    let class_a_id = class_a["classId"].as_str().expect("classId").to_string();
    let class_b = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "JSS 2", "stream": "B" }),
        admin(),
    );
    let class_b_id = class_b["classId"].as_str().expect("classId").to_string();
    let term = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "terms.create",
        json!({ "name": "First Term", "startDate": "2025-09-08", "endDate": "2025-12-12" }),
        admin(),
    );
    let term_id = term["termId"].as_str().expect("termId").to_string();

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.create",
        json!({ "employeeNo": "EMP-10", "lastName": "Nwosu", "firstName": "Ifeoma" }),
        admin(),
    );
    let teacher_id = teacher["teacherId"].as_str().expect("teacherId").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classTeachers.assign",
        json!({ "teacherId": teacher_id, "classId": class_a_id }),
        admin(),
    );

    let as_class_teacher = json!({ "role": "class_teacher", "teacherId": teacher_id });

    let own = request(
        &mut stdin,
        &mut reader,
        "7",
        "ranking.class",
        json!({ "classId": class_a_id, "termId": term_id }),
        as_class_teacher.clone(),
    );
    assert_eq!(own["ok"].as_bool(), Some(true), "unexpected: {}", own);

    let other = request(
        &mut stdin,
        &mut reader,
        "8",
        "ranking.class",
        json!({ "classId": class_b_id, "termId": term_id }),
        as_class_teacher,
    );
    assert_eq!(other["ok"].as_bool(), Some(false));
    assert_eq!(other["error"]["code"].as_str(), Some("unauthorized"));

    // A second leading assignment for the same teacher is refused.
    let second_class = request(
        &mut stdin,
        &mut reader,
        "9",
        "classTeachers.assign",
        json!({ "teacherId": teacher_id, "classId": class_b_id }),
        admin(),
    );
    assert_eq!(second_class["ok"].as_bool(), Some(false));
    assert_eq!(second_class["error"]["code"].as_str(), Some("bad_params"));

    let _ = child.kill();
}
