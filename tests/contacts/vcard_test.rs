//! Tests for `src/contacts/vcard.rs` against records as directories serve them.

use chrono::{TimeZone, Utc};

use smstoxmpp::contacts::vcard::{normalize_phone, parse, parse_revision};

#[test]
fn apple_style_card_with_grouped_labels() {
    let raw = "BEGIN:VCARD\r\n\
VERSION:3.0\r\n\
N:Example;Carol;;;\r\n\
FN:Carol Example\r\n\
item1.TEL;type=pref:+64 21 111 1111\r\n\
item1.X-ABLabel:_$!<Mobile>!$_\r\n\
item2.X-ABLabel:Boat\r\n\
item2.TEL:+64 21 222 2222\r\n\
TEL;type=HOME;type=VOICE:09 555 0000\r\n\
REV:2024-03-04T05:06:07Z\r\n\
END:VCARD\r\n";

    let card = parse(raw);
    assert_eq!(card.name.as_deref(), Some("Carol Example"));
    assert_eq!(card.revision, Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).single());

    let phones: Vec<(&str, &str)> = card
        .phones
        .iter()
        .map(|p| (p.number.as_str(), p.label.as_str()))
        .collect();
    assert_eq!(phones.len(), 3);
    assert!(phones.contains(&("+64 21 111 1111", "Mobile")));
    assert!(phones.contains(&("+64 21 222 2222", "Boat")));
    assert!(phones.contains(&("09 555 0000", "home")));
}

#[test]
fn folded_name_lines_are_joined() {
    let raw = "BEGIN:VCARD\r\nFN:Dorothy Long\r\n  Surname\r\nTEL:123\r\nEND:VCARD\r\n";
    let card = parse(raw);
    assert_eq!(card.name.as_deref(), Some("Dorothy Long Surname"));
    assert_eq!(card.phones.len(), 1);
    assert_eq!(card.phones[0].label, "");
}

#[test]
fn card_without_name_is_nameless() {
    let card = parse("BEGIN:VCARD\r\nTEL:123\r\nEND:VCARD\r\n");
    assert_eq!(card.name, None);
}

#[test]
fn revision_forms() {
    let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single();
    assert_eq!(parse_revision("20240102T030405Z"), expected);
    assert_eq!(parse_revision("2024-01-02T03:04:05Z"), expected);
    assert_eq!(
        parse_revision("2024-01-02"),
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).single()
    );
    assert_eq!(parse_revision("yesterday"), None);
}

#[test]
fn normalization_keeps_plus_and_digits() {
    assert_eq!(normalize_phone("+1 (555) 010-0.99"), "+1555010099");
}
