mod test_support;

use serde_json::json;
use test_support::{
    app_state, bootstrap_admin, create_account, create_class, create_student, id_of, request,
    request_err, request_ok, Account,
};

use schoold::api::AppState;

/// A parent account linked to the given students through an explicit user link.
fn parent_of(state: &mut AppState, admin: &str, username: &str, children: &[&str]) -> Account {
    let account = create_account(state, admin, username, "parent", json!({}));
    let pid = id_of(&request_ok(
        state,
        admin,
        "parents.create",
        json!({ "firstName": username, "lastName": "Okafor", "userId": account.id }),
    ));
    for sid in children {
        request_ok(
            state,
            admin,
            "parents.linkStudent",
            json!({ "id": pid, "studentId": sid }),
        );
    }
    account
}

#[test]
fn parent_applies_and_staff_review_once() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let class_id = create_class(&mut state, &admin, "Primary 5");
    let ada = create_student(&mut state, &admin, "S-1", "Ada", json!({ "classId": class_id }));
    let parent = parent_of(&mut state, &admin, "grace", &[ada.as_str()]);
    let teacher = create_account(&mut state, &admin, "mr.bello", "teacher", json!({}));

    let leave = request_ok(
        &mut state,
        &parent.token,
        "leaves.create",
        json!({ "fromDate": "2024-03-04", "toDate": "2024-03-06", "reason": "Fever", "status": "approved" }),
    );
    assert_eq!(leave["studentId"], ada.as_str());
    assert_eq!(leave["studentName"], "Ada Okafor");
    assert_eq!(leave["classId"], class_id.as_str());
    assert_eq!(leave["days"], 3);
    assert_eq!(leave["leaveType"], "casual");
    assert_eq!(leave["applicantUserId"], parent.id.as_str());
    assert_eq!(leave["applicantRole"], "parent");
    assert_eq!(leave["status"], "pending");
    let leave_id = id_of(&leave);

    request_err(
        &mut state,
        Some(&parent.token),
        "leaves.review",
        json!({ "id": leave_id, "status": "approved" }),
        "forbidden",
    );
    request_err(
        &mut state,
        Some(&teacher.token),
        "leaves.review",
        json!({ "id": leave_id, "status": "maybe" }),
        "bad_params",
    );

    let reviewed = request_ok(
        &mut state,
        &teacher.token,
        "leaves.review",
        json!({ "id": leave_id, "status": "Approved", "remarks": "Get well soon" }),
    );
    assert_eq!(reviewed["status"], "approved");
    assert_eq!(reviewed["reviewerUserId"], teacher.id.as_str());
    assert_eq!(reviewed["reviewRemarks"], "Get well soon");

    let again = request_err(
        &mut state,
        Some(&admin),
        "leaves.review",
        json!({ "id": leave_id, "status": "rejected" }),
        "conflict",
    );
    assert!(again["message"]
        .as_str()
        .unwrap_or_default()
        .contains("approved"));

    request_err(
        &mut state,
        Some(&parent.token),
        "leaves.cancel",
        json!({ "id": leave_id }),
        "conflict",
    );

    let by_class = request(
        &mut state,
        Some(&teacher.token),
        "leaves.list",
        json!({ "classId": class_id, "status": "approved" }),
    );
    assert_eq!(by_class["count"], 1);
}

#[test]
fn application_input_is_validated() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let ada = create_student(&mut state, &admin, "S-1", "Ada", json!({}));
    let parent = parent_of(&mut state, &admin, "grace", &[ada.as_str()]);

    request_err(
        &mut state,
        Some(&parent.token),
        "leaves.create",
        json!({ "fromDate": "2024-03-06", "toDate": "2024-03-04", "reason": "Trip" }),
        "bad_params",
    );
    request_err(
        &mut state,
        Some(&parent.token),
        "leaves.create",
        json!({ "fromDate": "2024-03-04", "toDate": "2024-03-04" }),
        "bad_params",
    );
    request_err(
        &mut state,
        Some(&parent.token),
        "leaves.create",
        json!({ "fromDate": "2024-03-04", "toDate": "2024-03-04", "reason": "x", "leaveType": "vacation" }),
        "bad_params",
    );
    request_err(
        &mut state,
        Some(&admin),
        "leaves.create",
        json!({ "fromDate": "2024-03-04", "toDate": "2024-03-04", "reason": "x" }),
        "forbidden",
    );

    let unlinked = create_account(&mut state, &admin, "stranger", "parent", json!({}));
    request_err(
        &mut state,
        Some(&unlinked.token),
        "leaves.create",
        json!({ "fromDate": "2024-03-04", "toDate": "2024-03-04", "reason": "x" }),
        "not_found",
    );
    let empty = request(&mut state, Some(&unlinked.token), "leaves.list", json!({}));
    assert_eq!(empty["status"], "success");
    assert_eq!(empty["count"], 0);
}

#[test]
fn blank_leave_type_falls_back_to_casual() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let ada = create_student(&mut state, &admin, "S-1", "Ada", json!({}));
    let parent = parent_of(&mut state, &admin, "grace", &[ada.as_str()]);

    for leave_type in [json!(""), json!("   "), json!(null)] {
        let leave = request_ok(
            &mut state,
            &parent.token,
            "leaves.create",
            json!({ "fromDate": "2024-03-04", "toDate": "2024-03-04", "reason": "Dentist", "leaveType": leave_type }),
        );
        assert_eq!(leave["leaveType"], "casual");
    }
    let sick = request_ok(
        &mut state,
        &parent.token,
        "leaves.create",
        json!({ "fromDate": "2024-03-05", "toDate": "2024-03-05", "reason": "Flu", "leaveType": " sick " }),
    );
    assert_eq!(sick["leaveType"], "sick");
}

#[test]
fn parents_with_several_children_pick_one_they_are_linked_to() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let ada = create_student(&mut state, &admin, "S-1", "Ada", json!({}));
    let femi = create_student(&mut state, &admin, "S-2", "Femi", json!({}));
    let other = create_student(&mut state, &admin, "S-3", "Kemi", json!({}));
    let parent = parent_of(&mut state, &admin, "grace", &[ada.as_str(), femi.as_str()]);
    let body = json!({ "fromDate": "2024-05-01", "toDate": "2024-05-02", "reason": "Wedding", "leaveType": "family" });

    request_err(&mut state, Some(&parent.token), "leaves.create", body.clone(), "bad_params");

    let mut for_other = body.clone();
    for_other["studentId"] = json!(other);
    request_err(&mut state, Some(&parent.token), "leaves.create", for_other, "forbidden");

    let mut for_femi = body;
    for_femi["studentId"] = json!(femi);
    let leave = request_ok(&mut state, &parent.token, "leaves.create", for_femi);
    assert_eq!(leave["studentId"], femi.as_str());
    assert_eq!(leave["leaveType"], "family");
}

#[test]
fn applications_are_visible_to_the_family_and_cancellable_by_the_applicant() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let ada = create_student(&mut state, &admin, "S-1", "Ada", json!({}));
    let femi = create_student(&mut state, &admin, "S-2", "Femi", json!({}));
    let mother = parent_of(&mut state, &admin, "grace", &[ada.as_str()]);
    let father = parent_of(&mut state, &admin, "emeka", &[ada.as_str()]);
    let other = parent_of(&mut state, &admin, "bola", &[femi.as_str()]);

    let leave_id = id_of(&request_ok(
        &mut state,
        &mother.token,
        "leaves.create",
        json!({ "fromDate": "2024-03-04", "toDate": "2024-03-04", "reason": "Dentist", "leaveType": "sick" }),
    ));

    let seen = request(&mut state, Some(&father.token), "leaves.list", json!({}));
    assert_eq!(seen["count"], 1);
    request_ok(&mut state, &father.token, "leaves.get", json!({ "id": leave_id }));

    let hidden = request(&mut state, Some(&other.token), "leaves.list", json!({}));
    assert_eq!(hidden["count"], 0);
    request_err(
        &mut state,
        Some(&other.token),
        "leaves.get",
        json!({ "id": leave_id }),
        "forbidden",
    );

    request_err(
        &mut state,
        Some(&father.token),
        "leaves.cancel",
        json!({ "id": leave_id }),
        "forbidden",
    );
    let cancelled = request_ok(&mut state, &mother.token, "leaves.cancel", json!({ "id": leave_id }));
    assert_eq!(cancelled["status"], "cancelled");
    request_err(
        &mut state,
        Some(&admin),
        "leaves.review",
        json!({ "id": leave_id, "status": "approved" }),
        "conflict",
    );

    request_ok(&mut state, &admin, "leaves.delete", json!({ "id": leave_id }));
    request_err(
        &mut state,
        Some(&admin),
        "leaves.get",
        json!({ "id": leave_id }),
        "not_found",
    );
}

#[test]
fn students_apply_for_themselves() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let account = create_account(&mut state, &admin, "ada", "student", json!({ "phone": "0801 555 0101" }));
    let sid = create_student(&mut state, &admin, "S-1", "Ada", json!({ "phone": "08015550101" }));
    create_student(&mut state, &admin, "S-2", "Femi", json!({}));

    let leave = request_ok(
        &mut state,
        &account.token,
        "leaves.create",
        json!({ "fromDate": "2024-03-04", "toDate": "2024-03-05", "reason": "Match day" }),
    );
    assert_eq!(leave["studentId"], sid.as_str());
    assert_eq!(leave["applicantRole"], "student");

    let mine = request(&mut state, Some(&account.token), "leaves.list", json!({}));
    assert_eq!(mine["count"], 1);
}
