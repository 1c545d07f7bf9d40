//! Golden wire examples: full frames as the control server emits them,
//! decoded and re-encoded through the public API.

use mb_protocol::{FieldMap, Message, Value, XorKey, parse_payload};

fn frame(text: &[u8]) -> Vec<u8> {
    let mut v = vec![0x01];
    v.extend_from_slice(text);
    v.push(0x03);
    v
}

#[test]
fn greeting_frame_decodes_machines_and_auth_key() {
    let mut wire = Vec::new();
    wire.extend_from_slice(&[0x01]);
    wire.extend_from_slice(b"id=7;msg=greet");
    wire.push(0x02);
    wire.extend_from_slice(b"machines=ActiveW;auth-key=0x2A");
    wire.push(0x03);

    let msgs = parse_payload(&wire).unwrap();
    assert_eq!(msgs.len(), 1);
    let greet = &msgs[0];
    assert_eq!(greet.id(), Some(7));
    assert_eq!(greet.body.get("machines"), Some(&Value::Str("ActiveW".to_owned())));
    assert_eq!(greet.body.get("auth-key"), Some(&Value::Int(42)));
}

#[test]
fn connect_request_encodes_auth_key_as_hex() {
    let mut body = FieldMap::new();
    body.insert("sender".to_owned(), Value::Str("client".to_owned()));
    body.insert("machine".to_owned(), Value::Str("ActiveW".to_owned()));
    body.insert("auth-lvl".to_owned(), Value::Int(0));
    body.insert("auth-key".to_owned(), Value::Int(0x55));
    let msg = Message::with_header([
        ("id", Value::Int(1)),
        ("rep-to", Value::Int(7)),
        ("msg", Value::Str("connect".to_owned())),
    ])
    .with_body(body);

    let wire = msg.encode();
    let text = std::str::from_utf8(&wire[1..wire.len() - 1]).unwrap();
    assert_eq!(
        text,
        "id=1;rep-to=7;msg=connect\u{2}sender=client;machine=ActiveW;auth-lvl=0;auth-key=0x55"
    );
}

#[test]
fn obfuscated_frame_round_trips_through_the_key() {
    let mut body = FieldMap::new();
    body.insert("generic-status".to_owned(), Value::Str("WORK".to_owned()));
    let msg = Message::with_header([("msg", Value::Str("news".to_owned()))]).with_body(body);

    let key = XorKey::new(0x55).unwrap();
    let mut wire = msg.encode();
    key.apply(&mut wire);
    // Obfuscated bytes are not parseable as-is.
    assert!(parse_payload(&wire).unwrap().is_empty());

    key.apply(&mut wire);
    let msgs = parse_payload(&wire).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0], msg);
}

#[test]
fn step_data_literal_from_the_machine_decodes_to_nested_maps() {
    let wire = frame(
        b"id=12;msg=news\x02step-data=\"status:{stack:0 proc:1}, sheet:{size:3210x2400}\"",
    );
    let msgs = parse_payload(&wire).unwrap();
    let step = msgs[0].body.get("step-data").unwrap();
    assert_eq!(
        step.to_json(),
        serde_json::json!({
            "status": {"stack": 0, "proc": 1},
            "sheet": {"size": "3210x2400"}
        })
    );
}

#[test]
fn emg_list_decodes_to_an_int_list() {
    let wire = frame(b"id=3;msg=event\x02event=alarms-changed;emg-list=123,30800012");
    let msgs = parse_payload(&wire).unwrap();
    assert_eq!(
        msgs[0].body.get("emg-list"),
        Some(&Value::IntList(vec![123, 30_800_012]))
    );
}
