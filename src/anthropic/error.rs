//! Tipos de erro para o cliente da API Anthropic.

use thiserror::Error;

/// Falhas do cliente da API Anthropic.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// HTTP 429; `retry_after_ms` vem do cabeçalho `retry-after`.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Qualquer outro status HTTP de erro, com o corpo da resposta.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// A resposta não trouxe nenhum bloco de texto.
    #[error("empty response from model")]
    EmptyResponse,
}

impl AnthropicError {
    /// Verdadeiro quando a requisição excedeu o timeout do cliente HTTP.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AnthropicError::NetworkError(e) if e.is_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display() {
        let err = AnthropicError::ApiError {
            status: 503,
            message: "overloaded".into(),
        };
        assert_eq!(err.to_string(), "API error (status 503): overloaded");
    }

    #[test]
    fn only_network_errors_time_out() {
        assert!(!AnthropicError::EmptyResponse.is_timeout());
        assert!(!AnthropicError::RateLimited { retry_after_ms: 0 }.is_timeout());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AnthropicError>();
    }
}
