//! Interest set of package codes.
//!
//! The registry records intent; the connection may or may not be up.  It is
//! the only thing replayed after a reconnect, because the server keeps
//! subscriptions per physical connection.

use pt_protocol::ClientMessage;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    codes: BTreeSet<String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record interest in `package_code`, sending a subscribe message if the
    /// code is new and the connection is up.  Returns false only for a blank
    /// code.
    pub fn subscribe(&mut self, conn: &ConnectionManager, package_code: &str) -> bool {
        let code = package_code.trim();
        if code.is_empty() {
            warn!("refusing to subscribe to an empty package code");
            return false;
        }
        if !self.codes.insert(code.to_owned()) {
            debug!(package_code = code, "already subscribed");
            return true;
        }
        if conn.is_connected() {
            let sent = conn.send_message(&ClientMessage::subscribe(
                code,
                conn.user_id().map(str::to_owned),
            ));
            debug!(package_code = code, sent, "subscribe sent");
        } else {
            debug!(package_code = code, "subscription recorded, will send on connect");
        }
        true
    }

    /// Drop interest in `package_code`.  Unknown codes are a no-op.
    /// Returns whether the code was subscribed.
    pub fn unsubscribe(&mut self, conn: &ConnectionManager, package_code: &str) -> bool {
        let code = package_code.trim();
        if !self.codes.remove(code) {
            return false;
        }
        if conn.is_connected() {
            conn.send_message(&ClientMessage::unsubscribe(code));
        }
        debug!(package_code = code, "unsubscribed");
        true
    }

    /// Re-issue a subscribe for every code.  Returns how many were sent.
    pub fn replay(&self, conn: &ConnectionManager) -> usize {
        let user_id = conn.user_id().map(str::to_owned);
        let sent = self
            .codes
            .iter()
            .filter(|code| conn.send_message(&ClientMessage::subscribe(code.as_str(), user_id.clone())))
            .count();
        if !self.codes.is_empty() {
            info!(sent, total = self.codes.len(), "replayed subscriptions");
        }
        sent
    }

    /// Forget everything.  Only for session teardown.
    pub fn clear(&mut self) {
        self.codes.clear();
    }

    pub fn contains(&self, package_code: &str) -> bool {
        self.codes.contains(package_code.trim())
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.codes.iter().map(String::as_str)
    }
}
