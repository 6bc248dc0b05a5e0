//! Shared unit-test fixtures.

use crate::api::{
    ErrorHistory, GatewayAuthenticator, RateLimiter, RestClient, RestConfig, RetryPolicy,
    TokenManager, TokenManagerConfig,
};
use std::sync::Arc;
use std::time::Duration;

/// A REST client in dry-run mode: mutation endpoints succeed without any
/// network traffic, so enforcement paths can run under test.
pub fn dry_run_rest_client() -> Arc<RestClient> {
    let config = RestConfig {
        base_url: "http://127.0.0.1:0".to_string(),
        username: "test".to_string(),
        api_key: "test".to_string(),
        request_timeout: Duration::from_secs(1),
        dry_run: true,
    };
    let auth = Arc::new(GatewayAuthenticator::new(&config).unwrap());
    let tokens = Arc::new(TokenManager::new(auth, None, TokenManagerConfig::default()));
    Arc::new(
        RestClient::new(
            &config,
            Arc::new(RateLimiter::default()),
            tokens,
            RetryPolicy::default(),
            Arc::new(ErrorHistory::default()),
        )
        .unwrap(),
    )
}
