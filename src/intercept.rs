use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, SET_COOKIE, WWW_AUTHENTICATE,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use tracing::debug;

use crate::ConnexResult;
use crate::config::ClientConfig;
use crate::error::ConnexError;
use crate::future::Exchange;
use crate::partition::PartitionKey;
use crate::request::Request;
use crate::util::is_chunked_transfer;

const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

/// What happens to the current channel while a replay goes out.
#[derive(Debug)]
pub(crate) enum DrainPlan {
    /// Drain the remaining chunks, then send the next request on this
    /// very channel.
    ReuseChannel,
    /// Drain the remaining chunks, then hand the channel back to the
    /// pool under the partition it was borrowed for; the next request
    /// runs on a fresh or newly-pooled channel.
    OfferChannel {
        keep_alive: bool,
        partition: PartitionKey,
    },
    /// The channel cannot be reused (no keep-alive, or chunked leftovers
    /// not worth draining); close it and move on.
    CloseChannel,
}

/// Decision produced by the status dispatcher. The sender executes the
/// side effects; this layer only decides.
#[derive(Debug)]
pub(crate) enum ExchangeAction {
    /// A final response: stream it to the handler and assemble it.
    Deliver,
    /// 100-continue interim response: write the deferred body on the
    /// same channel, headers stay as written.
    WriteBodyAfterContinue,
    /// 401/407 challenge answered: replay with the rebuilt request.
    ReplayWithAuth {
        request: Request,
        proxy: bool,
        drain: DrainPlan,
    },
    /// 3xx redirect: replay the rebuilt request at the new location.
    ReplayRedirect { request: Request, drain: DrainPlan },
    /// CONNECT accepted: upgrade the pipeline and replay the original
    /// request through the tunnel.
    EstablishTunnel { request: Request },
}

fn follow_redirect(config: &ClientConfig, request: &Request) -> bool {
    request.follow_redirect().unwrap_or(config.follow_redirect)
}

fn drain_plan_for_replay(exchange: &Exchange, headers: &HeaderMap, reuse: bool) -> DrainPlan {
    if !exchange.is_keep_alive() || is_chunked_transfer(headers) {
        return DrainPlan::CloseChannel;
    }
    if reuse {
        DrainPlan::ReuseChannel
    } else {
        DrainPlan::OfferChannel {
            keep_alive: exchange.is_keep_alive(),
            partition: exchange.partition_key(),
        }
    }
}

/// The retry/redirect/auth state machine, as a single dispatcher from
/// `(exchange, status, headers)` to the action the sender must execute.
/// Free of I/O so the protocol flow is unit-testable in isolation.
pub(crate) fn on_status_received(
    config: &ClientConfig,
    exchange: &Exchange,
    status: StatusCode,
    headers: &HeaderMap,
) -> ConnexResult<ExchangeAction> {
    if status == StatusCode::CONTINUE {
        return Ok(ExchangeAction::WriteBodyAfterContinue);
    }

    if status == StatusCode::UNAUTHORIZED {
        if let Some(action) = challenge_replay(config, exchange, headers, false) {
            return Ok(action);
        }
        return Ok(ExchangeAction::Deliver);
    }

    if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        if let Some(action) = challenge_replay(config, exchange, headers, true) {
            return Ok(action);
        }
        return Ok(ExchangeAction::Deliver);
    }

    if exchange.current_request().method() == Method::CONNECT && status.is_success() {
        return Ok(ExchangeAction::EstablishTunnel {
            request: exchange.target_request(),
        });
    }

    let target = exchange.target_request();
    if REDIRECT_STATUSES.contains(&status.as_u16()) && follow_redirect(config, &target) {
        if exchange.increment_redirect_count() > config.max_redirects {
            return Err(ConnexError::MaxRedirect {
                max: config.max_redirects,
            });
        }

        // auth may have to run again against the redirect target
        exchange.set_in_auth(false);
        exchange.set_in_proxy_auth(false);

        let (request, same_base) = redirect_request(config, &target, status, headers)?;
        debug!(location = %request.uri(), same_base, "following redirect");
        let drain = drain_plan_for_replay(exchange, headers, same_base);
        return Ok(ExchangeAction::ReplayRedirect { request, drain });
    }

    Ok(ExchangeAction::Deliver)
}

/// 401/407 handling: at most one authentication round per exchange and
/// scheme; a challenge with no configured authenticator, or while a
/// round is already in progress, is delivered as the final response.
fn challenge_replay(
    config: &ClientConfig,
    exchange: &Exchange,
    headers: &HeaderMap,
    proxy: bool,
) -> Option<ExchangeAction> {
    let already_in_auth = if proxy {
        exchange.is_in_proxy_auth()
    } else {
        exchange.is_in_auth()
    };
    if already_in_auth {
        return None;
    }

    let authenticator = if proxy {
        config.proxy_authenticator.as_ref()?
    } else {
        config.authenticator.as_ref()?
    };
    let challenge_header = if proxy {
        PROXY_AUTHENTICATE
    } else {
        WWW_AUTHENTICATE
    };
    let challenge = headers.get(challenge_header)?;

    let target = exchange.target_request();
    let authorization = authenticator.authorization(challenge, &target)?;

    let mut parts = target.into_parts();
    let authorization_header = if proxy {
        PROXY_AUTHORIZATION
    } else {
        AUTHORIZATION
    };
    parts.headers.insert(authorization_header, authorization);
    let request = Request::from_parts(parts);

    let drain = drain_plan_for_replay(exchange, headers, true);
    Some(ExchangeAction::ReplayWithAuth {
        request,
        proxy,
        drain,
    })
}

/// Rebuilds a request for a 3xx response per the redirect policy:
/// 301/303 (and 302 outside strict mode) force the method to GET and
/// drop the body; 307/308 (and strict 302) keep both. Returns the new
/// request and whether it targets the same base as the old one.
pub(crate) fn redirect_request(
    config: &ClientConfig,
    request: &Request,
    status: StatusCode,
    response_headers: &HeaderMap,
) -> ConnexResult<(Request, bool)> {
    let status_code = status.as_u16();
    let location = response_headers
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(ConnexError::MissingRedirectLocation { status: status_code })?;

    let base = url::Url::parse(&request.uri().to_string()).map_err(|_| {
        ConnexError::InvalidRedirectLocation {
            location: location.to_owned(),
        }
    })?;
    let mut resolved = base
        .join(location)
        .map_err(|_| ConnexError::InvalidRedirectLocation {
            location: location.to_owned(),
        })?;
    if config.remove_query_params_on_redirect {
        resolved.set_query(None);
    }
    let new_uri: Uri =
        resolved
            .as_str()
            .parse()
            .map_err(|_| ConnexError::InvalidRedirectLocation {
                location: location.to_owned(),
            })?;

    let original_method = request.method().clone();
    let switch_to_get = original_method != Method::GET
        && (status_code == 301
            || status_code == 303
            || (status_code == 302 && !config.strict_302_handling));
    let keep_body = status_code == 307
        || status_code == 308
        || (status_code == 302 && config.strict_302_handling);

    let same_base = {
        let old = request.uri();
        old.scheme_str() == new_uri.scheme_str()
            && old.host().map(str::to_ascii_lowercase)
                == new_uri.host().map(str::to_ascii_lowercase)
            && crate::partition::explicit_port(old) == crate::partition::explicit_port(&new_uri)
    };

    let mut parts = request.clone().into_parts();
    parts.method = if switch_to_get {
        Method::GET
    } else {
        original_method
    };
    parts.uri = new_uri;
    parts.headers.remove(HOST);
    parts.headers.remove(CONTENT_LENGTH);
    if !keep_body {
        parts.headers.remove(CONTENT_TYPE);
        parts.body = None;
    }
    if !same_base {
        // only a same-base redirect can assume the virtual host stays valid
        parts.virtual_host = None;
    }
    fold_set_cookies(&mut parts.headers, response_headers);

    Ok((Request::from_parts(parts), same_base))
}

/// Folds `Set-Cookie`/`Set-Cookie2` response headers into the replayed
/// request's `Cookie` header with replace-by-name semantics.
fn fold_set_cookies(request_headers: &mut HeaderMap, response_headers: &HeaderMap) {
    let mut pairs: Vec<(String, String)> = request_headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.to_owned(), value.to_owned()))
        })
        .collect();

    let set_cookie2 = http::HeaderName::from_static("set-cookie2");
    let incoming = response_headers
        .get_all(SET_COOKIE)
        .iter()
        .chain(response_headers.get_all(&set_cookie2).iter());
    let mut any = false;
    for value in incoming {
        let Ok(text) = value.to_str() else {
            continue;
        };
        let Some((name, value)) = text.split(';').next().and_then(|pair| pair.split_once('='))
        else {
            continue;
        };
        any = true;
        let name = name.trim();
        let value = value.trim();
        if let Some(existing) = pairs.iter_mut().find(|(existing, _)| existing == name) {
            existing.1 = value.to_owned();
        } else {
            pairs.push((name.to_owned(), value.to_owned()));
        }
    }

    if !any && pairs.is_empty() {
        return;
    }

    let joined = pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ");
    request_headers.remove(COOKIE);
    if let Ok(value) = HeaderValue::from_str(&joined) {
        request_headers.insert(COOKIE, value);
    }
}
