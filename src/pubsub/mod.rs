//! Continuous queries: subscriptions, their rewriting, matching and the
//! notifications they produce.

pub mod delivery;
pub mod ephemeral;
pub mod matching;
pub mod notification;
pub mod rewriter;
pub mod subscription;
pub mod subscriptions_store;

pub use ephemeral::EphemeralSubscription;
pub use matching::Binding;
pub use notification::{Notification, NotificationId, SubscriberEndpoint};
pub use rewriter::SubscriptionRewriter;
pub use subscription::{NotificationType, Subscription, SubscriptionId};
