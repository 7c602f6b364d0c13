use std::sync::Mutex;

use http::HeaderMap;
use http::header::CONNECTION;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Keep-alive negotiation from the response headers alone: a
/// `Connection: close` token (any casing, possibly inside a token list)
/// disables reuse of the channel.
pub(crate) fn connection_wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

pub(crate) fn is_chunked_transfer(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn connection_close_detected_in_token_list() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade, Close"));
        assert!(connection_wants_close(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(!connection_wants_close(&headers));
    }

    #[test]
    fn chunked_transfer_detected() {
        let mut headers = HeaderMap::new();
        assert!(!is_chunked_transfer(&headers));
        headers.insert(
            http::header::TRANSFER_ENCODING,
            HeaderValue::from_static("gzip, chunked"),
        );
        assert!(is_chunked_transfer(&headers));
    }
}
