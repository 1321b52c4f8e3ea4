//! Chat command surface.
//!
//! Anything starting with a known `_command` word is a command; everything
//! else is free text for the gateway.

use std::sync::LazyLock;

use regex::Regex;

use crate::app::{identity, APP_HOMEPAGE, APP_LICENSE};

/// `<phone>[:] <text>` at the start of a free-text message.
static DESTINATION_PREFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)^(\+?[0-9]{3,}):?\s+(.+)$").ok());

/// A phone number after normalization.
static PHONE_NUMBER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9]+$").ok());

/// A parsed chat message from the allow-listed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// `_help`
    Help,
    /// `_about`
    About,
    /// `_license`
    License,
    /// `_version`
    Version,
    /// `_usage`
    Usage,
    /// `_health_check`
    HealthCheck,
    /// `_chat <target>`; target is trimmed, possibly empty.
    Chat(&'a str),
    /// `_find <query>`; query is trimmed, possibly empty.
    Find(&'a str),
    /// Anything else.
    Text(&'a str),
}

/// Classify a message body.
pub fn parse(body: &str) -> Command<'_> {
    let trimmed = body.trim();
    let (word, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (trimmed, ""),
    };
    match word.to_ascii_lowercase().as_str() {
        "_help" => Command::Help,
        "_about" => Command::About,
        "_license" => Command::License,
        "_version" => Command::Version,
        "_usage" => Command::Usage,
        "_health_check" => Command::HealthCheck,
        "_chat" => Command::Chat(rest),
        "_find" => Command::Find(rest),
        _ => Command::Text(body),
    }
}

/// Split `"+640000000: hello"` into destination and text.
pub fn split_destination(body: &str) -> Option<(&str, &str)> {
    let captures = DESTINATION_PREFIX.as_ref()?.captures(body)?;
    let phone = captures.get(1)?.as_str();
    let text = captures.get(2)?.as_str();
    Some((phone, text))
}

/// Strip spaces and hyphens from a `_chat` target.
pub fn normalize_target(target: &str) -> String {
    target
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}

/// Whether `value` looks like a phone number.
pub fn is_phone_number(value: &str) -> bool {
    PHONE_NUMBER
        .as_ref()
        .is_some_and(|re| re.is_match(value))
}

/// Reply lines for `_help`.
pub fn help_lines() -> Vec<String> {
    vec![
        identity(),
        "Available commands:".to_owned(),
        "_help           this message".to_owned(),
        "_usage          examples of sending messages".to_owned(),
        "_about          application information".to_owned(),
        "_license        license information".to_owned(),
        "_version        application version".to_owned(),
        "_health_check   check that the gateway device is reachable".to_owned(),
        "_chat <number>  send unaddressed messages to <number>".to_owned(),
        "_find <name>    search the contacts directory".to_owned(),
        "Any other text is sent as an SMS, see \"_usage\".".to_owned(),
    ]
}

/// Reply lines for `_usage`.
pub fn usage_lines() -> Vec<String> {
    vec![
        "Send an SMS to a specific number by prefixing it:".to_owned(),
        "  +640000000: Hello there".to_owned(),
        "  +640000000 Hello there".to_owned(),
        "Replies without a prefix go to whoever you last talked to.".to_owned(),
        "Switch the current recipient with:".to_owned(),
        "  _chat +64 000-0000".to_owned(),
    ]
}

/// Reply lines for `_about`.
pub fn about_lines() -> Vec<String> {
    vec![identity(), APP_HOMEPAGE.to_owned(), license_line()]
}

/// Reply line for `_license`.
pub fn license_line() -> String {
    format!("Licensed under the {APP_LICENSE} license.")
}
