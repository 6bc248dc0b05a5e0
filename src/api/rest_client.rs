//! Authenticated brokerage REST client.
//!
//! Every request flows through the same pipeline: rate-limiter slot →
//! bearer token → send → classify → retry (transient / rate-limit only).
//! A 401 mid-flight invalidates the token and retries exactly once after a
//! forced re-auth. In dry-run mode mutation endpoints log and succeed
//! without touching the wire.

use super::convert::{
    AuthRequest, AuthResponse, CancelOrderRequest, ClosePositionRequest, GatewayResponse,
    ModifyOrderRequest, PlaceOrderRequest, SearchContractRequest, SearchContractResponse,
    SearchOpenPositionsRequest, SearchPositionsResponse,
};
use super::convert::{order_side_to_wire, order_type_to_wire};
use super::error::{classify, ApiError, ErrorHistory, RetryPolicy};
use super::rate_limiter::RateLimiter;
use super::token_manager::{AuthService, AuthToken, TokenManager};
use crate::models::{Contract, OrderSide, OrderType, Position};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const AUTH_ENDPOINT: &str = "/api/Auth/loginKey";
pub const CLOSE_POSITION_ENDPOINT: &str = "/api/Position/closeContract";
pub const CANCEL_ORDER_ENDPOINT: &str = "/api/Order/cancel";
pub const PLACE_ORDER_ENDPOINT: &str = "/api/Order/place";
pub const MODIFY_ORDER_ENDPOINT: &str = "/api/Order/modify";
pub const SEARCH_OPEN_POSITIONS_ENDPOINT: &str = "/api/Position/searchOpen";
pub const SEARCH_CONTRACT_ENDPOINT: &str = "/api/Contract/searchById";

const DEFAULT_TOKEN_LIFETIME_HOURS: i64 = 23;

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub username: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub dry_run: bool,
}

impl RestConfig {
    pub fn request_timeout_from_env() -> Duration {
        std::env::var("RISKWARDEN_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30))
    }
}

#[derive(Deserialize)]
struct JwtClaims {
    exp: i64,
}

/// Best-effort expiry extraction from the broker JWT; falls back to a
/// conservative default lifetime when the claims cannot be read.
fn token_expiry(token: &str) -> DateTime<Utc> {
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    let key = jsonwebtoken::DecodingKey::from_secret(&[]);

    match jsonwebtoken::decode::<JwtClaims>(token, &key, &validation) {
        Ok(data) => Utc
            .timestamp_opt(data.claims.exp, 0)
            .single()
            .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(DEFAULT_TOKEN_LIFETIME_HOURS)),
        Err(err) => {
            debug!(error = %err, "could not decode token expiry, using default lifetime");
            Utc::now() + chrono::Duration::hours(DEFAULT_TOKEN_LIFETIME_HOURS)
        }
    }
}

/// Credential exchange used by the token manager. Deliberately free of any
/// token dependency so it can run before one exists.
pub struct GatewayAuthenticator {
    http: reqwest::Client,
    base_url: String,
    username: String,
    api_key: String,
}

impl GatewayAuthenticator {
    pub fn new(config: &RestConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Permanent {
                status: None,
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl AuthService for GatewayAuthenticator {
    async fn authenticate(&self) -> Result<AuthToken, ApiError> {
        let url = format!("{}{}", self.base_url, AUTH_ENDPOINT);
        let response = self
            .http
            .post(&url)
            .json(&AuthRequest {
                user_name: &self.username,
                api_key: &self.api_key,
            })
            .send()
            .await
            .map_err(|e| ApiError::from_network(&e))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        if status == 401 {
            return Err(ApiError::Authentication("invalid credentials".to_string()));
        }
        if !(200..300).contains(&status) {
            return Err(classify(Some(status), &body));
        }

        let parsed: AuthResponse = serde_json::from_str(&body).map_err(|_| ApiError::Unknown {
            status: Some(status),
            message: "unparseable auth response".to_string(),
        })?;

        if !parsed.success {
            return Err(ApiError::Authentication(
                parsed
                    .error_message
                    .unwrap_or_else(|| "authentication rejected".to_string()),
            ));
        }
        let token = parsed
            .token
            .ok_or_else(|| ApiError::Authentication("no token in auth response".to_string()))?;
        let expires_at = token_expiry(&token);

        info!(expires_at = %expires_at, "gateway authentication successful");
        Ok(AuthToken { token, expires_at })
    }
}

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
    tokens: Arc<TokenManager>,
    policy: RetryPolicy,
    errors: Arc<ErrorHistory>,
    dry_run: bool,
    // Synthetic ids handed out for orders "placed" in dry-run mode.
    dry_run_order_id: AtomicI64,
}

impl RestClient {
    pub fn new(
        config: &RestConfig,
        rate_limiter: Arc<RateLimiter>,
        tokens: Arc<TokenManager>,
        policy: RetryPolicy,
        errors: Arc<ErrorHistory>,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| ApiError::Permanent {
                status: None,
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            rate_limiter,
            tokens,
            policy,
            errors,
            dry_run: config.dry_run,
            dry_run_order_id: AtomicI64::new(-1),
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Obtain (or refresh) a session token.
    pub async fn authenticate(&self) -> Result<(), ApiError> {
        self.tokens.get_token().await.map(|_| ())
    }

    async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: &impl Serialize,
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut auth_retried = false;
        let mut attempt: u32 = 0;

        loop {
            self.rate_limiter.acquire(endpoint).await;
            let token = self.tokens.get_token().await?;

            let outcome = self
                .http
                .post(&url)
                .bearer_auth(&token)
                .json(payload)
                .send()
                .await;

            let error = match outcome {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if (200..300).contains(&status) {
                        let body = response.text().await.unwrap_or_default();
                        return serde_json::from_str(&body).map_err(|e| ApiError::Unknown {
                            status: Some(status),
                            message: format!("unparseable response: {e}"),
                        });
                    }
                    let body = response.text().await.unwrap_or_default();
                    classify(Some(status), &body)
                }
                // Timeouts and connection failures are transient.
                Err(err) => ApiError::from_network(&err),
            };

            self.errors.record(&error, endpoint);

            if let ApiError::Authentication(_) = &error {
                if !auth_retried {
                    warn!(endpoint, "401 mid-flight, forcing token refresh and retrying once");
                    auth_retried = true;
                    self.tokens.invalidate();
                    continue;
                }
                return Err(error);
            }

            if !self.policy.should_retry(&error, attempt) {
                return Err(error);
            }

            let delay = self.policy.retry_delay(attempt, &error);
            warn!(
                endpoint,
                attempt = attempt + 1,
                delay_s = delay.as_secs_f64(),
                error = %error,
                "retryable request failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn check_gateway(response: GatewayResponse, endpoint: &str) -> Result<(), ApiError> {
        if response.success {
            Ok(())
        } else {
            let message = response
                .error_message
                .unwrap_or_else(|| format!("{endpoint} reported failure"));
            Err(classify(None, &message))
        }
    }

    pub async fn close_position(&self, account_id: i64, contract_id: &str) -> Result<(), ApiError> {
        if self.dry_run {
            info!(account_id, contract_id, "[dry-run] close position");
            return Ok(());
        }
        let response: GatewayResponse = self
            .post(
                CLOSE_POSITION_ENDPOINT,
                &ClosePositionRequest {
                    account_id,
                    contract_id,
                },
            )
            .await?;
        Self::check_gateway(response, CLOSE_POSITION_ENDPOINT)?;
        info!(account_id, contract_id, "position closed");
        Ok(())
    }

    pub async fn cancel_order(&self, account_id: i64, order_id: i64) -> Result<(), ApiError> {
        if self.dry_run {
            info!(account_id, order_id, "[dry-run] cancel order");
            return Ok(());
        }
        let response: GatewayResponse = self
            .post(
                CANCEL_ORDER_ENDPOINT,
                &CancelOrderRequest {
                    account_id,
                    order_id,
                },
            )
            .await?;
        Self::check_gateway(response, CANCEL_ORDER_ENDPOINT)?;
        info!(account_id, order_id, "order cancelled");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn place_order(
        &self,
        account_id: i64,
        contract_id: &str,
        order_type: OrderType,
        side: OrderSide,
        size: i64,
        stop_price: Option<f64>,
        limit_price: Option<f64>,
    ) -> Result<i64, ApiError> {
        if self.dry_run {
            let synthetic = self.dry_run_order_id.fetch_sub(1, Ordering::SeqCst);
            info!(
                account_id,
                contract_id,
                ?order_type,
                ?side,
                size,
                stop_price,
                synthetic_order_id = synthetic,
                "[dry-run] place order"
            );
            return Ok(synthetic);
        }
        let response: PlaceOrderResponseChecked = self
            .post(
                PLACE_ORDER_ENDPOINT,
                &PlaceOrderRequest {
                    account_id,
                    contract_id,
                    order_type: order_type_to_wire(order_type),
                    side: order_side_to_wire(side),
                    size,
                    limit_price,
                    stop_price,
                    trail_price: None,
                    custom_tag: Some("riskwarden"),
                },
            )
            .await
            .map(PlaceOrderResponseChecked)?;
        response.order_id()
    }

    pub async fn modify_order(
        &self,
        account_id: i64,
        order_id: i64,
        new_stop_price: Option<f64>,
    ) -> Result<(), ApiError> {
        if self.dry_run {
            info!(account_id, order_id, new_stop_price, "[dry-run] modify order");
            return Ok(());
        }
        let response: GatewayResponse = self
            .post(
                MODIFY_ORDER_ENDPOINT,
                &ModifyOrderRequest {
                    account_id,
                    order_id,
                    size: None,
                    limit_price: None,
                    stop_price: new_stop_price,
                    trail_price: None,
                },
            )
            .await?;
        Self::check_gateway(response, MODIFY_ORDER_ENDPOINT)?;
        info!(account_id, order_id, new_stop_price, "order modified");
        Ok(())
    }

    pub async fn search_open_positions(&self, account_id: i64) -> Result<Vec<Position>, ApiError> {
        let response: SearchPositionsResponse = self
            .post(
                SEARCH_OPEN_POSITIONS_ENDPOINT,
                &SearchOpenPositionsRequest { account_id },
            )
            .await?;
        let mut positions = Vec::with_capacity(response.positions.len());
        for wire in response.positions {
            match wire.into_position() {
                Ok(position) => positions.push(position),
                Err(err) => warn!(error = %err, "skipping unparseable position in search reply"),
            }
        }
        debug!(account_id, count = positions.len(), "open positions fetched");
        Ok(positions)
    }

    pub async fn search_contract(&self, contract_id: &str) -> Result<Contract, ApiError> {
        let response: SearchContractResponse = self
            .post(SEARCH_CONTRACT_ENDPOINT, &SearchContractRequest { contract_id })
            .await?;
        Ok(response.contract.into())
    }
}

struct PlaceOrderResponseChecked(super::convert::PlaceOrderResponse);

impl PlaceOrderResponseChecked {
    fn order_id(self) -> Result<i64, ApiError> {
        if !self.0.success {
            let message = self
                .0
                .error_message
                .unwrap_or_else(|| "order placement reported failure".to_string());
            return Err(classify(None, &message));
        }
        self.0.order_id.ok_or_else(|| ApiError::Unknown {
            status: None,
            message: "order placement succeeded without an order id".to_string(),
        })
    }
}
