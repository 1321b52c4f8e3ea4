//! Application identity strings shown to chat peers and on the command line.

/// Application name.
pub const APP_NAME: &str = "SMStoXMPP";

/// Application version, taken from the package manifest.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// License the application is distributed under.
pub const APP_LICENSE: &str = "GNU AGPLv3";

/// Project homepage.
pub const APP_HOMEPAGE: &str = "https://projects.jethrocarr.com/p/oss-smstoxmpp/";

/// `"<name> (<version>)"`, used in greetings and `_version`.
pub fn identity() -> String {
    format!("{APP_NAME} ({APP_VERSION})")
}
