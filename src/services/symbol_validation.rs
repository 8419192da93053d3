//! Checks that a symbol is tradable on a market-data backend.
//!
//! Definitive answers (valid / not found) are cached per `(backend, symbol)`
//! for a TTL; transient failures are never cached so the next call retries.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use crate::config::AppConfig;
use crate::error::{Result, TradebotError};
use crate::market::{BackpackMarketDataClient, BinanceMarketDataClient, Candle, MarketDataClient};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorType {
    None,
    SymbolNotFound,
    NetworkError,
    ApiError,
    UnknownBackend,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub error_type: ValidationErrorType,
    pub message: String,
    pub backend: String,
}

impl ValidationResult {
    fn valid(backend: &str) -> Self {
        Self {
            is_valid: true,
            error_type: ValidationErrorType::None,
            message: String::new(),
            backend: backend.to_string(),
        }
    }

    fn invalid(backend: &str, error_type: ValidationErrorType, message: String) -> Self {
        Self {
            is_valid: false,
            error_type,
            message,
            backend: backend.to_string(),
        }
    }

    /// Only definitive answers are worth caching.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self.error_type,
            ValidationErrorType::None | ValidationErrorType::SymbolNotFound
        )
    }

    pub fn into_tuple(self) -> (bool, String) {
        (self.is_valid, self.message)
    }
}

struct CacheEntry {
    result: ValidationResult,
    cached_at: Instant,
}

pub struct SymbolValidationService {
    binance_base_url: String,
    backpack_base_url: String,
    timeout: Duration,
    ttl: Duration,
    cache: DashMap<(String, String), CacheEntry>,
    binance: OnceCell<Arc<BinanceMarketDataClient>>,
    backpack: OnceCell<Arc<BackpackMarketDataClient>>,
}

impl SymbolValidationService {
    pub fn new(binance_base_url: &str, backpack_base_url: &str, timeout: Duration) -> Self {
        Self {
            binance_base_url: binance_base_url.to_string(),
            backpack_base_url: backpack_base_url.to_string(),
            timeout,
            ttl: DEFAULT_CACHE_TTL,
            cache: DashMap::new(),
            binance: OnceCell::new(),
            backpack: OnceCell::new(),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            &cfg.market_data.binance_base_url,
            &cfg.market_data.backpack_base_url,
            Duration::from_secs(cfg.http.timeout_secs.max(1)),
        )
        .with_ttl(Duration::from_secs(cfg.market_data.symbol_cache_ttl_secs))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    fn cached(&self, key: &(String, String)) -> Option<ValidationResult> {
        let entry = self.cache.get(key)?;
        if entry.cached_at.elapsed() < self.ttl {
            return Some(entry.result.clone());
        }
        drop(entry);
        self.cache.remove(key);
        None
    }

    fn store(&self, key: (String, String), result: &ValidationResult) {
        if result.is_cacheable() {
            self.cache.insert(
                key,
                CacheEntry {
                    result: result.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
    }

    async fn binance_client(&self) -> Result<Arc<BinanceMarketDataClient>> {
        self.binance
            .get_or_try_init(|| async {
                BinanceMarketDataClient::new(&self.binance_base_url, self.timeout).map(Arc::new)
            })
            .await
            .cloned()
    }

    async fn backpack_client(&self) -> Result<Arc<BackpackMarketDataClient>> {
        self.backpack
            .get_or_try_init(|| async {
                BackpackMarketDataClient::new(&self.backpack_base_url, self.timeout).map(Arc::new)
            })
            .await
            .cloned()
    }

    pub async fn validate(&self, symbol: &str, backend: &str) -> ValidationResult {
        let symbol = symbol.trim().to_ascii_uppercase();
        let backend = backend.trim().to_ascii_lowercase();
        let key = (backend.clone(), symbol.clone());
        if let Some(hit) = self.cached(&key) {
            debug!("Symbol validation cache hit: {} on {}", symbol, backend);
            return hit;
        }

        let result = match backend.as_str() {
            "binance" => match self.binance_client().await {
                Ok(client) => {
                    let lookup = client.get_klines(&symbol, "1m", 1).await;
                    classify_binance(&symbol, &backend, lookup)
                }
                Err(e) => internal_error(&symbol, &backend, &e),
            },
            "backpack" => match self.backpack_client().await {
                Ok(client) => {
                    let lookup = client.symbol_exists(&symbol).await;
                    classify_backpack(&symbol, &backend, lookup)
                }
                Err(e) => internal_error(&symbol, &backend, &e),
            },
            other => {
                warn!(
                    "Unknown MARKET_DATA_BACKEND '{}' for symbol validation of {}",
                    other, symbol
                );
                ValidationResult::invalid(
                    &backend,
                    ValidationErrorType::UnknownBackend,
                    format!(
                        "Symbol '{}' cannot be validated: unknown backend '{}'",
                        symbol, other
                    ),
                )
            }
        };

        self.store(key, &result);
        result
    }

    /// `(is_valid, message)`; never fails.
    pub async fn validate_symbol_for_backend(&self, symbol: &str, backend: &str) -> (bool, String) {
        self.validate(symbol, backend).await.into_tuple()
    }
}

fn internal_error(symbol: &str, backend: &str, err: &TradebotError) -> ValidationResult {
    error!(
        "Symbol validation internal error for {} on {}: {}",
        symbol, backend, err
    );
    ValidationResult::invalid(
        backend,
        ValidationErrorType::ApiError,
        format!(
            "Symbol '{}' validation failed (backend: {}, error: internal error: {})",
            symbol, backend, err
        ),
    )
}

fn is_network_error(err: &TradebotError) -> bool {
    if err.is_transient() {
        return true;
    }
    // exchange bodies sometimes wrap upstream transport failures as plain text
    let text = err.to_string().to_lowercase();
    text.contains("timeout") || text.contains("timed out") || text.contains("connection")
}

fn not_supported(symbol: &str, backend: &str) -> String {
    format!(
        "Symbol '{}' is not supported by the current backend (backend: {})",
        symbol, backend
    )
}

pub(crate) fn classify_binance(
    symbol: &str,
    backend: &str,
    lookup: Result<Vec<Candle>>,
) -> ValidationResult {
    let err = match lookup {
        Ok(candles) if !candles.is_empty() => return ValidationResult::valid(backend),
        Ok(_) => {
            return ValidationResult::invalid(
                backend,
                ValidationErrorType::SymbolNotFound,
                not_supported(symbol, backend),
            )
        }
        Err(e) => e,
    };

    let text = err.to_string();
    if text.to_lowercase().contains("invalid symbol") {
        warn!("Symbol validation failed for {} on binance: {}", symbol, text);
        ValidationResult::invalid(
            backend,
            ValidationErrorType::SymbolNotFound,
            not_supported(symbol, backend),
        )
    } else if is_network_error(&err) {
        warn!("Binance network error for symbol {}: {}", symbol, text);
        ValidationResult::invalid(
            backend,
            ValidationErrorType::NetworkError,
            format!(
                "Symbol '{}' validation failed: network error (backend: {}, error: {})",
                symbol, backend, text
            ),
        )
    } else {
        warn!("Binance symbol validation error for {}: {}", symbol, text);
        ValidationResult::invalid(
            backend,
            ValidationErrorType::ApiError,
            format!(
                "Symbol '{}' validation failed (backend: {}, error: {})",
                symbol, backend, text
            ),
        )
    }
}

pub(crate) fn classify_backpack(
    symbol: &str,
    backend: &str,
    lookup: Result<(bool, String)>,
) -> ValidationResult {
    match lookup {
        Ok((true, _)) => ValidationResult::valid(backend),
        Ok((false, normalized)) => ValidationResult::invalid(
            backend,
            ValidationErrorType::SymbolNotFound,
            format!(
                "Symbol '{}' (Backpack: {}) not found among Backpack USDC perpetuals (backend: {})",
                symbol, normalized, backend
            ),
        ),
        Err(err) => {
            let text = err.to_string();
            if is_network_error(&err) || text.to_lowercase().contains("network") {
                warn!("Backpack network error for symbol {}: {}", symbol, text);
                ValidationResult::invalid(
                    backend,
                    ValidationErrorType::NetworkError,
                    format!(
                        "Symbol '{}' validation failed: network error (backend: {}, error: {})",
                        symbol, backend, text
                    ),
                )
            } else {
                warn!("Backpack API error for symbol {}: {}", symbol, text);
                ValidationResult::invalid(
                    backend,
                    ValidationErrorType::ApiError,
                    format!(
                        "Symbol '{}' validation failed (backend: {}, error: {})",
                        symbol, backend, text
                    ),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn candle() -> Candle {
        Candle {
            open_time: Utc::now(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        }
    }

    #[test]
    fn binance_invalid_symbol_is_cached_not_found() {
        let result = classify_binance(
            "FOOUSDT",
            "binance",
            Err(TradebotError::Exchange(
                "Binance API error (HTTP 400, code -1121): Invalid symbol.".to_string(),
            )),
        );
        assert!(!result.is_valid);
        assert_eq!(result.error_type, ValidationErrorType::SymbolNotFound);
        assert!(result.is_cacheable());
    }

    #[test]
    fn binance_timeout_is_network_error_and_not_cached() {
        let result = classify_binance(
            "BTCUSDT",
            "binance",
            Err(TradebotError::Exchange("request timeout".to_string())),
        );
        assert_eq!(result.error_type, ValidationErrorType::NetworkError);
        assert!(!result.is_cacheable());

        let other = classify_binance(
            "BTCUSDT",
            "binance",
            Err(TradebotError::Exchange("HTTP 500".to_string())),
        );
        assert_eq!(other.error_type, ValidationErrorType::ApiError);
        assert!(!other.is_cacheable());
    }

    #[test]
    fn binance_candles_mean_valid() {
        let result = classify_binance("BTCUSDT", "binance", Ok(vec![candle()]));
        assert!(result.is_valid);
        assert!(result.message.is_empty());
    }

    #[test]
    fn backpack_absent_symbol_names_normalized_contract() {
        let result = classify_backpack(
            "FOOUSDT",
            "backpack",
            Ok((false, "FOO_USDC_PERP".to_string())),
        );
        assert_eq!(result.error_type, ValidationErrorType::SymbolNotFound);
        assert!(result.message.contains("FOO_USDC_PERP"));

        let network = classify_backpack(
            "BTCUSDT",
            "backpack",
            Err(TradebotError::Exchange("connection reset".to_string())),
        );
        assert_eq!(network.error_type, ValidationErrorType::NetworkError);
    }

    /// Serves one canned JSON response per connection and counts requests.
    async fn canned_server(status_line: &'static str, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind local listener");
        let addr = listener.local_addr().expect("listener address");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), hits)
    }

    async fn invalid_symbol_server() -> (String, Arc<AtomicUsize>) {
        canned_server("400 Bad Request", r#"{"code":-1121,"msg":"Invalid symbol."}"#).await
    }

    #[tokio::test]
    async fn not_found_result_is_served_from_cache() {
        let (base, hits) = invalid_symbol_server().await;
        let service = SymbolValidationService::new(&base, "", Duration::from_secs(2));

        let first = service.validate("fooUSDT", "binance").await;
        assert_eq!(first.error_type, ValidationErrorType::SymbolNotFound);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(service.cached_entries(), 1);

        let second = service.validate("FOOUSDT", "BINANCE").await;
        assert_eq!(second, first);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "second lookup must not hit the network");
    }

    #[tokio::test]
    async fn zero_ttl_expires_entries() {
        let (base, hits) = invalid_symbol_server().await;
        let service =
            SymbolValidationService::new(&base, "", Duration::from_secs(2)).with_ttl(Duration::ZERO);

        service.validate("FOOUSDT", "binance").await;
        let again = service.validate("FOOUSDT", "binance").await;
        assert_eq!(again.error_type, ValidationErrorType::SymbolNotFound);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_klines_are_cached_as_not_found() {
        let (base, hits) = canned_server("200 OK", "[]").await;
        let service = SymbolValidationService::new(&base, "", Duration::from_secs(2));

        let result = service.validate("FOOUSDT", "binance").await;
        assert_eq!(result.error_type, ValidationErrorType::SymbolNotFound);
        service.validate("FOOUSDT", "binance").await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn network_errors_are_not_cached() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind local listener");
        let port = listener.local_addr().expect("listener address").port();
        drop(listener);

        let base = format!("http://127.0.0.1:{}", port);
        let service = SymbolValidationService::new(&base, &base, Duration::from_secs(2));

        let binance = service.validate("BTCUSDT", "binance").await;
        assert!(!binance.is_valid);
        assert_eq!(binance.error_type, ValidationErrorType::NetworkError);

        let backpack = service.validate("BTCUSDT", "backpack").await;
        assert_eq!(backpack.error_type, ValidationErrorType::NetworkError);
        assert_eq!(service.cached_entries(), 0);
    }

    #[tokio::test]
    async fn clear_cache_empties_entries() {
        let (base, hits) = invalid_symbol_server().await;
        let service = SymbolValidationService::new(&base, "", Duration::from_secs(2));

        service.validate("FOOUSDT", "binance").await;
        service.validate("BARUSDT", "binance").await;
        assert_eq!(service.cached_entries(), 2);

        service.clear_cache();
        assert_eq!(service.cached_entries(), 0);

        service.validate("FOOUSDT", "binance").await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rate_limit_counts_as_network_error() {
        let result = classify_binance(
            "BTCUSDT",
            "binance",
            Err(TradebotError::RateLimited("Binance market data HTTP 429".to_string())),
        );
        assert_eq!(result.error_type, ValidationErrorType::NetworkError);
        assert!(!result.is_cacheable());
    }

    #[tokio::test]
    async fn unknown_backend_is_reported_without_network() {
        let service = SymbolValidationService::new("", "", Duration::from_secs(1));
        let (ok, message) = service
            .validate_symbol_for_backend("BTCUSDT", "kraken")
            .await;
        assert!(!ok);
        assert!(message.contains("unknown backend 'kraken'"));
        assert_eq!(service.cached_entries(), 0);
    }
}
