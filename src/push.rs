//! Push-notification delivery is an external collaborator (spec §1):
//! the manager only ever calls this narrow trait, never owns a queue or
//! a delivery mechanism itself. Mirrors the dependency-injection style
//! the template's `BbsServer` uses for its storage and device handles —
//! passed in at construction, not looked up through a global.

use async_trait::async_trait;

/// One notification the manager wants delivered to whatever downstream
/// consumer subscribes to it (mobile app, webhook, etc). Kept to the
/// fields the handlers in §4.4/§4.9 actually produce.
#[derive(Debug, Clone)]
pub struct PushNotification {
    pub from_num: u32,
    pub channel: i32,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, notification: PushNotification);
}

/// No-op notifier used when no push backend is configured, and in tests.
pub struct NullPushNotifier;

#[async_trait]
impl PushNotifier for NullPushNotifier {
    async fn notify(&self, _notification: PushNotification) {}
}
