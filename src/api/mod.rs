//! Brokerage API layer: REST transport, auth lifecycle, wire conversion.

pub mod convert;
pub mod error;
pub mod rate_limiter;
pub mod rest_client;
pub mod token_manager;
pub mod token_store;

pub use error::{ApiError, ErrorHistory, RetryPolicy};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use rest_client::{GatewayAuthenticator, RestClient, RestConfig};
pub use token_manager::{AuthService, AuthToken, TokenManager, TokenManagerConfig, TokenState};
pub use token_store::{TokenStore, TokenStoreError};
