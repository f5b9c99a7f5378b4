pub mod checkout;
pub mod events;

pub use checkout::{create_checkout, CheckoutRequest, CheckoutResponse, PaymentClient};
pub use events::{billing_webhook, tier_change, verify_signature, BillingEvent, SIGNATURE_HEADER};
