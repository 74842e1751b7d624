//! Testing helpers and mock utilities.
//!
//! Convenience constructors for the mocked collaborators used by broker and
//! propagator tests.

use crate::directory::{ChatInfo, MockNotifier, UserInfo};
use std::sync::{Arc, Mutex};

/// Build a [`ChatInfo`] literal.
#[must_use]
pub fn chat(id: i64, title: &str) -> ChatInfo {
    ChatInfo {
        id,
        title: title.to_string(),
    }
}

/// Build a [`UserInfo`] with just a first name.
#[must_use]
pub fn user(id: i64, first_name: &str) -> UserInfo {
    UserInfo {
        id,
        first_name: first_name.to_string(),
        username: None,
    }
}

/// A notifier that accepts any send and drops it.
#[must_use]
pub fn quiet_notifier() -> MockNotifier {
    let mut mock = MockNotifier::new();
    mock.expect_notify().returning(|_, _| ());
    mock
}

/// A notifier that records every `(recipient, text)` pair it is handed.
#[must_use]
pub fn recording_notifier() -> (Arc<MockNotifier>, Arc<Mutex<Vec<(i64, String)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let mut mock = MockNotifier::new();
    mock.expect_notify().returning(move |chat_id, text| {
        sink.lock()
            .expect("notifier log poisoned")
            .push((chat_id, text.to_string()));
    });
    (Arc::new(mock), log)
}
