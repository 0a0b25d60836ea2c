//! Rewriting of subscriptions after their leading pattern is satisfied.

use std::sync::Arc;

use crate::core::Quadruple;
use crate::error::{Error, Result};
use crate::parsing::sparql_decomposer::Decomposer;
use crate::pubsub::matching::{match_atomic, Binding};
use crate::pubsub::subscription::Subscription;

pub struct SubscriptionRewriter {
    decomposer: Arc<dyn Decomposer>,
}

impl SubscriptionRewriter {
    pub fn new(decomposer: Arc<dyn Decomposer>) -> Self {
        Self { decomposer }
    }

    /// Rewrite with the values `fact` gives to the leading pattern's variables.
    pub fn rewrite(
        &self,
        subscription: &Subscription,
        fact: &Quadruple,
    ) -> Result<Subscription> {
        let binding = match_atomic(fact, subscription.first()).unwrap_or_default();
        self.rewrite_with_binding(subscription, &binding)
    }

    /// Drop the leading pattern and substitute the bound variables in the
    /// remaining ones. The result has a fresh id and `subscription` as parent.
    ///
    /// A subscription with a single pattern left is terminal: it is notified,
    /// never rewritten, and asking for it is an error.
    pub fn rewrite_with_binding(
        &self,
        subscription: &Subscription,
        binding: &Binding,
    ) -> Result<Subscription> {
        if subscription.sub_subscriptions().len() < 2 {
            return Err(Error::InvalidSubscription(format!(
                "subscription {} has a single pattern left and cannot be rewritten",
                subscription.id()
            )));
        }

        let query = self.decomposer.parse(subscription.query())?;
        let rewritten = query.without_first_pattern(binding.values());
        Ok(Subscription::derived(subscription, rewritten.to_string(), self.decomposer.as_ref())?)
    }
}
