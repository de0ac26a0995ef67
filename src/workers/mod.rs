pub mod pending_expiry;
