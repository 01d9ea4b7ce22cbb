mod webhook;

pub use webhook::WebhookHandler;

use std::sync::Arc;

use tracing::info;

use crate::config::HandlersConfig;
use crate::jobs::registry::HandlerRegistry;
use crate::jobs::types::JobType;

/// Registers a webhook handler for every job type with a configured URL.
///
/// Job types without a URL are left unregistered; the caller decides
/// whether that is fatal via [`HandlerRegistry::validate`].
pub fn webhook_registry(config: &HandlersConfig, client: reqwest::Client) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    for job_type in JobType::ALL {
        if let Some(url) = config.webhook_for(job_type) {
            info!(job_type = %job_type, url = %url, "Registering webhook handler");
            registry.register_arc(
                job_type,
                Arc::new(WebhookHandler::new(client.clone(), url, job_type.provider())),
            );
        }
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_only_configured_types() {
        let config = HandlersConfig {
            price_publish_url: Some("http://localhost:9000/publish".to_string()),
            market_data_sync_url: Some("http://localhost:9000/market".to_string()),
            ..HandlersConfig::default()
        };

        let registry = webhook_registry(&config, reqwest::Client::new());
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.missing(),
            vec![JobType::CatalogSync, JobType::FeatureCompute]
        );
        assert!(registry.validate().is_err());
    }
}
