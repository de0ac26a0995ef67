use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::{
    CallbackRef, Currency, PaymentRequest, ProviderHandle, ProviderName, ProviderStatusEvent,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    fn supported_currencies(&self) -> &'static [Currency];

    /// Currency the subscription is charged in on this provider.
    fn default_currency(&self) -> Currency;

    async fn initiate(&self, request: PaymentRequest) -> PaymentResult<ProviderHandle>;

    async fn query_status(&self, external_ref: &str) -> PaymentResult<ProviderStatusEvent>;

    /// Verifies and decodes a signed webhook. `Ok(None)` means the event is
    /// authentic but not about a payment.
    fn parse_webhook(
        &self,
        _payload: &[u8],
        _signature: &str,
    ) -> PaymentResult<Option<ProviderStatusEvent>> {
        Err(PaymentError::Unsupported {
            provider: self.name().to_string(),
            operation: "webhook".to_string(),
        })
    }

    /// Extracts the tracking reference from an unsigned callback / IPN body.
    fn parse_callback(&self, _payload: &[u8]) -> PaymentResult<CallbackRef> {
        Err(PaymentError::Unsupported {
            provider: self.name().to_string(),
            operation: "callback".to_string(),
        })
    }

    /// Body returned to the provider after a callback, whatever happened inside.
    fn callback_ack(&self, callback: Option<&CallbackRef>) -> JsonValue {
        serde_json::json!({
            "status": "received",
            "reference": callback.map(|c| c.tracking_ref.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{
        CanonicalOutcome, HandleKind, Money, ProviderPayload, StripeDetails, SubscriptionDuration,
        SubscriptionPlan,
    };
    use bigdecimal::BigDecimal;
    use uuid::Uuid;

    struct MockProvider;

    #[async_trait]
    impl PaymentProvider for MockProvider {
        fn name(&self) -> ProviderName {
            ProviderName::Stripe
        }

        fn supported_currencies(&self) -> &'static [Currency] {
            &[Currency::Usd]
        }

        fn default_currency(&self) -> Currency {
            Currency::Usd
        }

        async fn initiate(&self, request: PaymentRequest) -> PaymentResult<ProviderHandle> {
            Ok(ProviderHandle {
                external_ref: format!("pi_{}", request.merchant_reference),
                handle: HandleKind::ClientSecret("secret".to_string()),
                metadata: serde_json::json!({}),
            })
        }

        async fn query_status(&self, external_ref: &str) -> PaymentResult<ProviderStatusEvent> {
            Ok(ProviderStatusEvent {
                external_ref: external_ref.to_string(),
                raw_status: "succeeded".to_string(),
                outcome: CanonicalOutcome::Succeeded,
                payload: ProviderPayload::Stripe(StripeDetails {
                    payment_intent_id: external_ref.to_string(),
                    event_id: None,
                    event_type: None,
                    reported_amount: None,
                    reported_currency: None,
                    failure_message: None,
                }),
            })
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_provider() {
        let provider: Box<dyn PaymentProvider> = Box::new(MockProvider);
        let handle = provider
            .initiate(PaymentRequest {
                merchant_reference: "STR-1".to_string(),
                user_id: Uuid::new_v4(),
                amount: Money::new(BigDecimal::from(5), Currency::Usd),
                plan: SubscriptionPlan::Basic,
                duration: SubscriptionDuration::Monthly,
                description: "Basic monthly".to_string(),
                email: None,
                phone_number: None,
                callback_url: None,
            })
            .await
            .expect("initiate should succeed");
        assert_eq!(handle.external_ref, "pi_STR-1");

        let event = provider
            .query_status(&handle.external_ref)
            .await
            .expect("status should succeed");
        assert_eq!(event.outcome, CanonicalOutcome::Succeeded);
        assert_eq!(event.provider(), ProviderName::Stripe);
    }

    #[test]
    fn default_webhook_and_callback_are_unsupported() {
        let provider = MockProvider;
        assert!(matches!(
            provider.parse_webhook(b"{}", "sig"),
            Err(PaymentError::Unsupported { .. })
        ));
        assert!(matches!(
            provider.parse_callback(b"{}"),
            Err(PaymentError::Unsupported { .. })
        ));
    }
}
