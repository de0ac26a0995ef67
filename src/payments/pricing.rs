use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::{Currency, Money, SubscriptionDuration, SubscriptionPlan};
use bigdecimal::BigDecimal;
use std::collections::HashMap;
use std::str::FromStr;

/// Subscription prices quoted at payment creation.
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<(SubscriptionPlan, SubscriptionDuration, Currency), BigDecimal>,
}

impl Default for PricingTable {
    fn default() -> Self {
        use Currency::*;
        use SubscriptionDuration::*;
        use SubscriptionPlan::*;

        let mut table = Self::empty();
        table.set(Basic, Monthly, Ugx, "15000");
        table.set(Basic, Yearly, Ugx, "150000");
        table.set(Premium, Monthly, Ugx, "30000");
        table.set(Premium, Yearly, Ugx, "300000");
        table.set(Basic, Monthly, Usd, "4.99");
        table.set(Basic, Yearly, Usd, "49.99");
        table.set(Premium, Monthly, Usd, "8.99");
        table.set(Premium, Yearly, Usd, "89.99");
        table
    }
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            prices: HashMap::new(),
        }
    }

    fn set(
        &mut self,
        plan: SubscriptionPlan,
        duration: SubscriptionDuration,
        currency: Currency,
        amount: &str,
    ) {
        if let Ok(amount) = BigDecimal::from_str(amount) {
            self.prices.insert((plan, duration, currency), amount);
        }
    }

    pub fn with_price(
        mut self,
        plan: SubscriptionPlan,
        duration: SubscriptionDuration,
        amount: Money,
    ) -> Self {
        self.prices
            .insert((plan, duration, amount.currency), amount.amount);
        self
    }

    /// Fails unless every plan and duration has a price in `currency`.
    pub fn ensure_covers(&self, currency: Currency) -> PaymentResult<()> {
        for plan in [SubscriptionPlan::Basic, SubscriptionPlan::Premium] {
            for duration in [SubscriptionDuration::Monthly, SubscriptionDuration::Yearly] {
                self.quote(plan, duration, currency)?;
            }
        }
        Ok(())
    }

    pub fn quote(
        &self,
        plan: SubscriptionPlan,
        duration: SubscriptionDuration,
        currency: Currency,
    ) -> PaymentResult<Money> {
        self.prices
            .get(&(plan, duration, currency))
            .map(|amount| Money::new(amount.clone(), currency))
            .ok_or(PaymentError::ValidationError {
                message: format!(
                    "no {} price for {} {} subscription",
                    currency,
                    duration.as_str(),
                    plan.as_str()
                ),
                field: Some("subscription_plan".to_string()),
            })
    }
}
