//! System notifications raised from push payloads.

use serde::Serialize;

const TITLE: &str = "B2B Portal";
const ICON: &str = "/static/images/icon-192.png";

/// Page focused or opened when a notification is clicked.
pub const CLICK_TARGET: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
}

impl Notification {
  /// Build the notification for a push payload; the body is shown verbatim.
  pub fn from_payload(payload: &[u8]) -> Self {
    Self {
      title: TITLE.to_string(),
      body: String::from_utf8_lossy(payload).into_owned(),
      icon: ICON.to_string(),
      badge: ICON.to_string(),
    }
  }
}
