pub mod airtel;
pub mod pesapal;
pub mod stripe;

pub use airtel::{AirtelConfig, AirtelMoneyProvider};
pub use pesapal::{PesapalConfig, PesapalProvider};
pub use stripe::{StripeConfig, StripeProvider};
