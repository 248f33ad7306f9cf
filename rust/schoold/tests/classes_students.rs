mod test_support;

use serde_json::json;
use test_support::{
    app_state, bootstrap_admin, create_account, create_class, create_student, id_of, request,
    request_err, request_ok,
};

#[test]
fn classes_and_sections_enforce_uniqueness() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let class_id = create_class(&mut state, &admin, "Primary 5");

    request_err(
        &mut state,
        Some(&admin),
        "classes.create",
        json!({ "name": "Primary 5" }),
        "conflict",
    );
    request_err(
        &mut state,
        Some(&admin),
        "classes.create",
        json!({ "name": "Primary 6", "classTeacherId": "missing" }),
        "not_found",
    );

    let a = request_ok(
        &mut state,
        &admin,
        "sections.create",
        json!({ "id": class_id, "name": "A", "capacity": 30 }),
    );
    assert_eq!(a["classId"], class_id.as_str());
    assert_eq!(a["capacity"], 30);
    request_err(
        &mut state,
        Some(&admin),
        "sections.create",
        json!({ "id": class_id, "name": "A" }),
        "conflict",
    );
    request_err(
        &mut state,
        Some(&admin),
        "sections.create",
        json!({ "id": class_id, "name": "B", "capacity": -1 }),
        "bad_params",
    );

    let fetched = request_ok(&mut state, &admin, "classes.get", json!({ "id": class_id }));
    assert_eq!(fetched["name"], "Primary 5");
    assert_eq!(fetched["sections"].as_array().map(Vec::len), Some(1));
}

#[test]
fn student_placement_must_be_consistent() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let p5 = create_class(&mut state, &admin, "Primary 5");
    let p6 = create_class(&mut state, &admin, "Primary 6");
    let p5a = id_of(&request_ok(
        &mut state,
        &admin,
        "sections.create",
        json!({ "id": p5, "name": "A" }),
    ));

    request_err(
        &mut state,
        Some(&admin),
        "students.create",
        json!({ "admissionNo": "S-1", "firstName": "Ada", "lastName": "Eze", "classId": p6, "sectionId": p5a }),
        "bad_params",
    );
    request_err(
        &mut state,
        Some(&admin),
        "students.create",
        json!({ "admissionNo": "S-1", "firstName": "Ada", "lastName": "Eze", "sectionId": p5a }),
        "bad_params",
    );

    let sid = create_student(
        &mut state,
        &admin,
        "S-1",
        "Ada",
        json!({ "classId": p5, "sectionId": p5a, "dateOfBirth": "2015-04-09" }),
    );
    request_err(
        &mut state,
        Some(&admin),
        "students.create",
        json!({ "admissionNo": "S-1", "firstName": "Dup", "lastName": "Eze" }),
        "conflict",
    );

    // Moving class without a section drops the old section.
    let moved = request_ok(
        &mut state,
        &admin,
        "students.update",
        json!({ "id": sid, "classId": p6 }),
    );
    assert_eq!(moved["classId"], p6.as_str());
    assert!(moved["sectionId"].is_null());
    assert_eq!(moved["dateOfBirth"], "2015-04-09");

    request_err(
        &mut state,
        Some(&admin),
        "students.update",
        json!({ "id": sid, "status": "expelled" }),
        "bad_params",
    );
}

#[test]
fn student_list_filters_and_counts() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let teacher = create_account(&mut state, &admin, "mr.bello", "teacher", json!({}));
    let parent = create_account(&mut state, &admin, "parent1", "parent", json!({}));
    let p5 = create_class(&mut state, &admin, "Primary 5");
    create_student(&mut state, &admin, "S-1", "Ada", json!({ "classId": p5 }));
    create_student(&mut state, &admin, "S-2", "Chidi", json!({ "classId": p5 }));
    create_student(&mut state, &admin, "S-3", "Femi", json!({ "status": "graduated" }));

    let in_class = request(
        &mut state,
        Some(&teacher.token),
        "students.list",
        json!({ "classId": p5 }),
    );
    assert_eq!(in_class["count"], 2);
    assert_eq!(in_class["data"][0]["className"], "Primary 5");

    let search = request(&mut state, Some(&admin), "students.list", json!({ "search": "chi" }));
    assert_eq!(search["count"], 1);
    assert_eq!(search["data"][0]["admissionNo"], "S-2");

    let graduated = request(
        &mut state,
        Some(&admin),
        "students.list",
        json!({ "status": "graduated" }),
    );
    assert_eq!(graduated["count"], 1);

    let classes = request(&mut state, Some(&parent.token), "classes.list", json!({}));
    assert_eq!(classes["data"][0]["studentCount"], 2);

    request_err(&mut state, Some(&parent.token), "students.list", json!({}), "forbidden");
    request_err(
        &mut state,
        Some(&teacher.token),
        "students.create",
        json!({ "admissionNo": "S-9", "firstName": "X", "lastName": "Y" }),
        "forbidden",
    );
}

#[test]
fn deleting_a_class_detaches_its_students() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let p5 = create_class(&mut state, &admin, "Primary 5");
    let sec = id_of(&request_ok(
        &mut state,
        &admin,
        "sections.create",
        json!({ "id": p5, "name": "A" }),
    ));
    let sid = create_student(&mut state, &admin, "S-1", "Ada", json!({ "classId": p5, "sectionId": sec }));

    let deleted = request_ok(&mut state, &admin, "classes.delete", json!({ "id": p5 }));
    assert_eq!(deleted["detachedStudents"], 1);

    let student = request_ok(&mut state, &admin, "students.get", json!({ "id": sid }));
    assert!(student["classId"].is_null());
    assert!(student["sectionId"].is_null());
    request_err(&mut state, Some(&admin), "classes.get", json!({ "id": p5 }), "not_found");
}

#[test]
fn deleting_a_student_removes_links() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let sid = create_student(&mut state, &admin, "S-1", "Ada", json!({}));
    let pid = id_of(&request_ok(
        &mut state,
        &admin,
        "parents.create",
        json!({ "firstName": "Grace", "lastName": "Okafor" }),
    ));
    request_ok(
        &mut state,
        &admin,
        "parents.linkStudent",
        json!({ "id": pid, "studentId": sid, "relation": "mother" }),
    );

    request_ok(&mut state, &admin, "students.delete", json!({ "id": sid }));
    let parent = request_ok(&mut state, &admin, "parents.get", json!({ "id": pid }));
    assert_eq!(parent["children"].as_array().map(Vec::len), Some(0));
}
