pub mod error;
pub mod factory;
pub mod pricing;
pub mod provider;
pub mod providers;
pub mod token_cache;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use factory::{PaymentFactoryConfig, ProviderRegistry};
pub use provider::PaymentProvider;
