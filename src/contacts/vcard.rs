//! Minimal vCard reader for the fields the resolver needs.
//!
//! Phone numbers show up in two shapes:
//!
//! ```text
//! TEL;TYPE=CELL:+64 21 000 000
//!
//! item1.TEL:+64 21 000 001
//! item1.X-ABLabel:_$!<Mobile>!$_
//! ```
//!
//! Grouped lines may come in either order, so unresolved groups are
//! buffered until both halves have been seen or the card ends.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// One phone number on a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneEntry {
    /// Number as written on the card.
    pub number: String,
    /// Label such as "cell" or "Mobile", possibly empty.
    pub label: String,
}

/// Fields extracted from one card.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VCard {
    /// Display name from `FN`, falling back to `N`.
    pub name: Option<String>,
    /// Revision from `REV`.
    pub revision: Option<DateTime<Utc>>,
    /// Every phone number, in card order of completion.
    pub phones: Vec<PhoneEntry>,
}

#[derive(Default)]
struct ItemGroup {
    number: Option<String>,
    type_label: String,
    label: Option<String>,
}

/// Parse a single card.
pub fn parse(raw: &str) -> VCard {
    let mut card = VCard::default();
    let mut structured_name: Option<String> = None;
    let mut groups: HashMap<String, ItemGroup> = HashMap::new();
    let mut group_order: Vec<String> = Vec::new();

    for line in unfold(raw) {
        let Some((head, value)) = line.split_once(':') else {
            continue;
        };
        let mut parts = head.split(';');
        let qualified = parts.next().unwrap_or_default();
        let params: Vec<&str> = parts.collect();
        let (group, property) = match qualified.split_once('.') {
            Some((group, property)) => (Some(group), property),
            None => (None, qualified),
        };

        match property.to_ascii_uppercase().as_str() {
            "FN" => {
                let name = unescape(value);
                if !name.trim().is_empty() {
                    card.name = Some(name.trim().to_owned());
                }
            }
            "N" => structured_name = name_from_components(value),
            "REV" => card.revision = parse_revision(value.trim()),
            "TEL" => {
                let number = unescape(value).trim().to_owned();
                if number.is_empty() {
                    continue;
                }
                match group {
                    Some(group) => {
                        let item = group_entry(&mut groups, &mut group_order, group);
                        item.number = Some(number);
                        item.type_label = type_label(&params);
                    }
                    None => card.phones.push(PhoneEntry {
                        number,
                        label: type_label(&params),
                    }),
                }
            }
            "X-ABLABEL" => {
                if let Some(group) = group {
                    let item = group_entry(&mut groups, &mut group_order, group);
                    item.label = Some(unwrap_apple_label(&unescape(value)));
                }
            }
            _ => {}
        }

        if let Some(group) = group {
            if let Some(phone) = take_complete(&mut groups, group) {
                card.phones.push(phone);
            }
        }
    }

    // Groups whose label never arrived keep their TYPE label.
    for group in group_order {
        if let Some(item) = groups.remove(&group) {
            if let Some(number) = item.number {
                card.phones.push(PhoneEntry {
                    number,
                    label: item.label.unwrap_or(item.type_label),
                });
            }
        }
    }

    if card.name.is_none() {
        card.name = structured_name;
    }
    card
}

fn group_entry<'a>(
    groups: &'a mut HashMap<String, ItemGroup>,
    order: &mut Vec<String>,
    group: &str,
) -> &'a mut ItemGroup {
    let key = group.to_ascii_lowercase();
    if !groups.contains_key(&key) && !order.contains(&key) {
        order.push(key.clone());
    }
    groups.entry(key).or_default()
}

fn take_complete(groups: &mut HashMap<String, ItemGroup>, group: &str) -> Option<PhoneEntry> {
    let key = group.to_ascii_lowercase();
    let complete = groups
        .get(&key)
        .is_some_and(|item| item.number.is_some() && item.label.is_some());
    if !complete {
        return None;
    }
    let item = groups.remove(&key)?;
    Some(PhoneEntry {
        number: item.number?,
        label: item.label?,
    })
}

/// Join folded continuation lines (leading space or tab).
fn unfold(raw: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        lines.push(line.to_owned());
    }
    lines
}

fn unescape(value: &str) -> String {
    value
        .replace("\\n", " ")
        .replace("\\N", " ")
        .replace("\\,", ",")
        .replace("\\;", ";")
        .replace("\\\\", "\\")
}

/// `Family;Given;Additional;Prefix;Suffix` -> `Given Family`.
fn name_from_components(value: &str) -> Option<String> {
    let parts: Vec<String> = value.split(';').map(unescape).collect();
    let family = parts.first().map(String::as_str).unwrap_or_default();
    let given = parts.get(1).map(String::as_str).unwrap_or_default();
    let name = format!("{} {}", given.trim(), family.trim());
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_owned())
}

/// First meaningful `TYPE` value, lowercased. Accepts `TYPE=CELL,VOICE`,
/// repeated `TYPE=` params and bare vCard 2.1 params.
fn type_label(params: &[&str]) -> String {
    params
        .iter()
        .filter_map(|param| match param.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case("type") => Some(value),
            Some(_) => None,
            None => Some(*param),
        })
        .flat_map(|value| value.split(','))
        .map(|value| value.trim_matches('"').to_ascii_lowercase())
        .find(|value| !value.is_empty() && value != "pref" && value != "voice")
        .unwrap_or_default()
}

/// `_$!<Mobile>!$_` -> `Mobile`.
fn unwrap_apple_label(label: &str) -> String {
    label
        .strip_prefix("_$!<")
        .and_then(|rest| rest.strip_suffix(">!$_"))
        .unwrap_or(label)
        .to_owned()
}

/// Parse `REV` in basic (`20240102T030405Z`) or extended
/// (`2024-01-02T03:04:05Z`) ISO 8601 form, or a bare date.
pub fn parse_revision(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    let trimmed = value.trim_end_matches('Z');
    for format in ["%Y%m%dT%H%M%S", "%Y-%m-%dT%H:%M:%S", "%Y%m%dT%H%M%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    for format in ["%Y%m%d", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

/// Canonical phone key: spaces, hyphens, dots and parentheses removed.
pub fn normalize_phone(number: &str) -> String {
    number
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect()
}
