mod test_support;

use serde_json::{json, Value};
use test_support::{app_state, bootstrap_admin, create_account, request, request_err, request_ok};

fn conversation_with<'a>(list: &'a Value, user_id: &str) -> &'a Value {
    list["data"]
        .as_array()
        .and_then(|rows| rows.iter().find(|c| c["participant"]["id"] == user_id))
        .unwrap_or_else(|| panic!("no conversation with {} in {}", user_id, list))
}

#[test]
fn messages_open_one_conversation_per_pair() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let teacher = create_account(&mut state, &admin, "mr.bello", "teacher", json!({}));
    let parent = create_account(&mut state, &admin, "grace", "parent", json!({}));

    let first = request_ok(
        &mut state,
        &parent.token,
        "chats.send",
        json!({ "recipientId": teacher.id, "body": "Is Ada in class today?" }),
    );
    let reply = request_ok(
        &mut state,
        &teacher.token,
        "chats.send",
        json!({ "recipientId": parent.id, "body": "Yes, she is." }),
    );
    assert_eq!(first["conversationId"], reply["conversationId"]);
    let conversation_id = first["conversationId"].as_str().expect("id").to_string();
    request_ok(
        &mut state,
        &parent.token,
        "chats.send",
        json!({ "recipientId": teacher.id, "body": "Thanks" }),
    );

    let history = request(
        &mut state,
        Some(&teacher.token),
        "chats.messages",
        json!({ "id": conversation_id }),
    );
    assert_eq!(history["count"], 3);
    let bodies: Vec<&str> = history["data"]
        .as_array()
        .expect("messages")
        .iter()
        .filter_map(|m| m["body"].as_str())
        .collect();
    assert_eq!(bodies, vec!["Is Ada in class today?", "Yes, she is.", "Thanks"]);

    let inbox = request(&mut state, Some(&teacher.token), "chats.list", json!({}));
    assert_eq!(inbox["count"], 1);
    let chat = conversation_with(&inbox, &parent.id);
    assert_eq!(chat["participant"]["username"], "grace");
    assert_eq!(chat["participant"]["role"], "parent");
    assert_eq!(chat["lastMessage"], "Thanks");
    assert_eq!(chat["lastSenderId"], parent.id.as_str());
    assert_eq!(chat["unreadCount"], 2);

    let read = request_ok(
        &mut state,
        &teacher.token,
        "chats.markRead",
        json!({ "id": conversation_id }),
    );
    assert_eq!(read["marked"], 2);
    let inbox = request(&mut state, Some(&teacher.token), "chats.list", json!({}));
    assert_eq!(conversation_with(&inbox, &parent.id)["unreadCount"], 0);

    // The parent still has the teacher's reply unread.
    let inbox = request(&mut state, Some(&parent.token), "chats.list", json!({}));
    assert_eq!(conversation_with(&inbox, &teacher.id)["unreadCount"], 1);
}

#[test]
fn chat_access_and_input_rules() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let a = create_account(&mut state, &admin, "alice", "staff", json!({}));
    let b = create_account(&mut state, &admin, "bob", "teacher", json!({}));
    let c = create_account(&mut state, &admin, "carol", "parent", json!({}));

    request_err(
        &mut state,
        Some(&a.token),
        "chats.send",
        json!({ "recipientId": a.id, "body": "note to self" }),
        "bad_params",
    );
    request_err(
        &mut state,
        Some(&a.token),
        "chats.send",
        json!({ "recipientId": "missing", "body": "hello" }),
        "not_found",
    );
    request_err(
        &mut state,
        Some(&a.token),
        "chats.send",
        json!({ "recipientId": b.id, "body": "x".repeat(4001) }),
        "bad_params",
    );

    let sent = request_ok(
        &mut state,
        &a.token,
        "chats.send",
        json!({ "recipientId": b.id, "body": "x".repeat(4000) }),
    );
    let conversation_id = sent["conversationId"].as_str().expect("id").to_string();

    request_err(
        &mut state,
        Some(&c.token),
        "chats.messages",
        json!({ "id": conversation_id }),
        "forbidden",
    );
    request_err(
        &mut state,
        Some(&c.token),
        "chats.markRead",
        json!({ "id": conversation_id }),
        "forbidden",
    );
    request_err(
        &mut state,
        Some(&a.token),
        "chats.messages",
        json!({ "id": "missing" }),
        "not_found",
    );

    let empty = request(&mut state, Some(&c.token), "chats.list", json!({}));
    assert_eq!(empty["count"], 0);
}

#[test]
fn message_bodies_keep_their_whitespace() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let a = create_account(&mut state, &admin, "alice", "staff", json!({}));
    let b = create_account(&mut state, &admin, "bob", "teacher", json!({}));

    request_err(
        &mut state,
        Some(&a.token),
        "chats.send",
        json!({ "recipientId": b.id, "body": " \n\t " }),
        "bad_params",
    );
    request_err(
        &mut state,
        Some(&a.token),
        "chats.send",
        json!({ "recipientId": b.id, "body": 42 }),
        "bad_params",
    );

    let poem = "  roses are red\n    violets are blue\n";
    let sent = request_ok(
        &mut state,
        &a.token,
        "chats.send",
        json!({ "recipientId": b.id, "body": poem }),
    );
    assert_eq!(sent["body"], poem);
    let history = request(
        &mut state,
        Some(&b.token),
        "chats.messages",
        json!({ "id": sent["conversationId"] }),
    );
    assert_eq!(history["data"][0]["body"], poem);
}

#[test]
fn calls_follow_the_ring_answer_hangup_cycle() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let caller = create_account(&mut state, &admin, "grace", "parent", json!({}));
    let callee = create_account(&mut state, &admin, "mr.bello", "teacher", json!({}));
    let outsider = create_account(&mut state, &admin, "bola", "parent", json!({}));

    let call = request_ok(
        &mut state,
        &caller.token,
        "calls.start",
        json!({ "calleeId": callee.id, "callType": "Video" }),
    );
    assert_eq!(call["status"], "ringing");
    assert_eq!(call["callType"], "video");
    assert_eq!(call["callerName"], "grace");
    assert_eq!(call["calleeName"], "mr.bello");
    let id = call["id"].as_str().expect("id").to_string();

    request_err(
        &mut state,
        Some(&caller.token),
        "calls.update",
        json!({ "id": id, "action": "accept" }),
        "conflict",
    );
    request_err(
        &mut state,
        Some(&outsider.token),
        "calls.update",
        json!({ "id": id, "action": "end" }),
        "forbidden",
    );
    request_err(
        &mut state,
        Some(&callee.token),
        "calls.update",
        json!({ "id": id, "action": "hold" }),
        "bad_params",
    );

    let live = request_ok(
        &mut state,
        &callee.token,
        "calls.update",
        json!({ "id": id, "action": "accept" }),
    );
    assert_eq!(live["status"], "ongoing");
    assert!(live["startedAt"].is_string());

    let ended = request_ok(
        &mut state,
        &caller.token,
        "calls.update",
        json!({ "id": id, "action": "end" }),
    );
    assert_eq!(ended["status"], "ended");
    assert!(ended["endedAt"].is_string());
    assert!(ended["durationSecs"].as_i64().is_some_and(|d| d >= 0));

    request_err(
        &mut state,
        Some(&callee.token),
        "calls.update",
        json!({ "id": id, "action": "end" }),
        "conflict",
    );

    let history = request(&mut state, Some(&callee.token), "calls.list", json!({ "status": "ended" }));
    assert_eq!(history["count"], 1);
    let none = request(&mut state, Some(&outsider.token), "calls.list", json!({}));
    assert_eq!(none["count"], 0);
}

#[test]
fn unanswered_calls_are_missed_or_rejected() {
    let mut state = app_state();
    let admin = bootstrap_admin(&mut state);
    let caller = create_account(&mut state, &admin, "grace", "parent", json!({}));
    let callee = create_account(&mut state, &admin, "mr.bello", "teacher", json!({}));

    request_err(
        &mut state,
        Some(&caller.token),
        "calls.start",
        json!({ "calleeId": caller.id }),
        "bad_params",
    );
    request_err(
        &mut state,
        Some(&caller.token),
        "calls.start",
        json!({ "calleeId": callee.id, "callType": "fax" }),
        "bad_params",
    );

    let first = request_ok(&mut state, &caller.token, "calls.start", json!({ "calleeId": callee.id }));
    assert_eq!(first["callType"], "audio");
    let cancelled = request_ok(
        &mut state,
        &caller.token,
        "calls.update",
        json!({ "id": first["id"], "action": "cancel" }),
    );
    assert_eq!(cancelled["status"], "missed");
    assert!(cancelled["durationSecs"].is_null());

    let second = request_ok(&mut state, &caller.token, "calls.start", json!({ "calleeId": callee.id }));
    request_err(
        &mut state,
        Some(&callee.token),
        "calls.update",
        json!({ "id": second["id"], "action": "cancel" }),
        "conflict",
    );
    let rejected = request_ok(
        &mut state,
        &callee.token,
        "calls.update",
        json!({ "id": second["id"], "action": "reject" }),
    );
    assert_eq!(rejected["status"], "rejected");

    let all = request(&mut state, Some(&caller.token), "calls.list", json!({}));
    assert_eq!(all["count"], 2);
}
