//! Built-in payment gateway adapters.

pub mod manual;
pub mod sandbox;
pub mod stripe;

pub use manual::ManualGateway;
pub use sandbox::SandboxGateway;
pub use stripe::StripeGateway;

use crate::config::Settings;
use crate::domain::gateway::GatewayRegistry;
use crate::error::{PaymentError, Result};
use std::sync::Arc;
use tracing::info;

impl GatewayRegistry {
    /// Builds a registry holding every adapter named in `ENABLED_GATEWAYS`.
    ///
    /// # Errors
    ///
    /// Fails on an unknown adapter name, or when `stripe` is enabled without
    /// `STRIPE_SECRET_KEY`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut registry = GatewayRegistry::new();
        for name in &settings.enabled_gateways {
            let name = name.trim();
            match name {
                "" => continue,
                manual::NAME => {
                    registry.register(Arc::new(ManualGateway::new(
                        settings.manual_gateway_delay(),
                    )));
                }
                sandbox::NAME => {
                    registry.register(Arc::new(SandboxGateway::new()));
                }
                stripe::NAME => {
                    let key = settings.stripe_secret_key.as_deref().ok_or_else(|| {
                        PaymentError::Config(
                            "STRIPE_SECRET_KEY is required when stripe is enabled".to_string(),
                        )
                    })?;
                    registry.register(Arc::new(StripeGateway::new(
                        key,
                        &settings.stripe_api_base,
                        settings.gateway_timeout(),
                    )?));
                }
                other => {
                    return Err(PaymentError::Config(format!("unknown gateway: {other}")));
                }
            }
            info!(gateway = name, "gateway registered");
        }
        Ok(registry)
    }
}
