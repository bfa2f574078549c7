//! The one-time warning page shown to browsers visiting an HTTP tunnel,
//! §4.8. Consent is recorded as a per-subdomain cookie so a visitor who
//! clicks through isn't shown the page again for the rest of their
//! session.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};

const SKIP_WARNING_HEADER: &str = "x-fxtunnel-skip-warning";

pub fn consent_cookie_name(subdomain: &str) -> String {
    format!("_fxt_consent_{subdomain}")
}

/// Gated by every condition in §4.8 step 5: non-admin client, not a
/// custom domain, a GET request, no prior consent cookie, and no
/// `X-FxTunnel-Skip-Warning` header.
pub fn should_show(
    method: &axum::http::Method,
    headers: &HeaderMap,
    subdomain: &str,
    is_admin: bool,
    is_custom_domain: bool,
) -> bool {
    if is_admin || is_custom_domain {
        return false;
    }
    if method != axum::http::Method::GET {
        return false;
    }
    if headers.contains_key(SKIP_WARNING_HEADER) {
        return false;
    }
    !has_consent(headers, subdomain)
}

fn has_consent(headers: &HeaderMap, subdomain: &str) -> bool {
    let cookie_name = consent_cookie_name(subdomain);
    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|raw| raw.split(';').any(|pair| pair.trim().starts_with(&format!("{cookie_name}="))))
}

/// "ru" if `Accept-Language` mentions it anywhere, else "en".
fn pick_language(headers: &HeaderMap) -> &'static str {
    let accept_language = headers
        .get(axum::http::header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if accept_language.to_ascii_lowercase().contains("ru") {
        "ru"
    } else {
        "en"
    }
}

struct Strings {
    title: &'static str,
    heading: &'static str,
    body: &'static str,
    continue_label: &'static str,
}

fn strings(lang: &str) -> Strings {
    match lang {
        "ru" => Strings {
            title: "Вы переходите на {subdomain}",
            heading: "Вы переходите на туннелированный сайт",
            body: "<strong>{subdomain}</strong> обслуживается через временный туннель для \
                   разработки, а не через рабочее развёртывание. Продолжайте, только если \
                   доверяете тому, кто поделился этой ссылкой.",
            continue_label: "Перейти на сайт &rarr;",
        },
        _ => Strings {
            title: "You're about to visit {subdomain}",
            heading: "You're about to visit a tunneled site",
            body: "<strong>{subdomain}</strong> is being served through a temporary developer \
                   tunnel, not a production deployment. Only continue if you trust whoever \
                   shared this link.",
            continue_label: "Continue to the site &rarr;",
        },
    }
}

/// Renders the warning page, localized from `Accept-Language`.
/// `continue_href` is the original request path with `_fxt_consent=1`
/// appended, which [`consent_redirect`] recognizes and turns into a
/// Set-Cookie + redirect back to the clean path.
pub fn page(subdomain: &str, continue_href: &str, headers: &HeaderMap) -> Response {
    let strings = strings(pick_language(headers));
    let title = strings.title.replace("{subdomain}", subdomain);
    let body_text = strings.body.replace("{subdomain}", subdomain);
    let body = format!(
        r#"<!DOCTYPE html>
<html><head><title>{title}</title>
<meta name="viewport" content="width=device-width, initial-scale=1"></head>
<body style="font-family: sans-serif; max-width: 40rem; margin: 4rem auto; line-height: 1.5;">
<h1>{heading}</h1>
<p>{body_text}</p>
<p><a href="{continue_href}">{continue_label}</a></p>
</body></html>"#,
        heading = strings.heading,
        continue_label = strings.continue_label,
    );
    (StatusCode::OK, [(axum::http::header::CACHE_CONTROL, "no-store")], Html(body)).into_response()
}

/// Handles the `?_fxt_consent=1` marker on a GET request: sets the
/// consent cookie and 302s back to the same path with the marker
/// stripped.
pub fn consent_redirect(subdomain: &str, clean_path_and_query: &str) -> Response {
    let cookie = format!(
        "{}=1; Path=/; Max-Age=86400; SameSite=Lax",
        consent_cookie_name(subdomain)
    );
    (
        StatusCode::FOUND,
        [
            (axum::http::header::SET_COOKIE, cookie),
            (axum::http::header::LOCATION, clean_path_and_query.to_string()),
        ],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Method};

    #[test]
    fn non_get_never_shown() {
        let headers = HeaderMap::new();
        assert!(!should_show(&Method::POST, &headers, "bench", false, false));
    }

    #[test]
    fn get_without_cookie_is_shown() {
        let headers = HeaderMap::new();
        assert!(should_show(&Method::GET, &headers, "bench", false, false));
    }

    #[test]
    fn get_with_matching_cookie_is_not_shown() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_str("_fxt_consent_bench=1; other=2").unwrap(),
        );
        assert!(!should_show(&Method::GET, &headers, "bench", false, false));
    }

    #[test]
    fn cookie_for_different_subdomain_does_not_count() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_str("_fxt_consent_other=1").unwrap(),
        );
        assert!(should_show(&Method::GET, &headers, "bench", false, false));
    }

    #[test]
    fn skip_warning_header_bypasses_the_page() {
        let mut headers = HeaderMap::new();
        headers.insert("x-fxtunnel-skip-warning", HeaderValue::from_static("1"));
        assert!(!should_show(&Method::GET, &headers, "bench", false, false));
    }

    #[test]
    fn admin_client_never_shown() {
        let headers = HeaderMap::new();
        assert!(!should_show(&Method::GET, &headers, "bench", true, false));
    }

    #[test]
    fn custom_domain_never_shown() {
        let headers = HeaderMap::new();
        assert!(!should_show(&Method::GET, &headers, "bench", false, true));
    }
}
