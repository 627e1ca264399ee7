use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Uri};

/// Opaque, store-assigned identifier for a persisted [`Exchange`].
///
/// Treated as plain text at every boundary that crosses out of this crate
/// (inspection surface, replay/scan callers) — nothing here parses its
/// internal shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ExchangeId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ExchangeId(s.to_string()))
    }
}

/// An ordered multimap of header name to value.
///
/// Lookups are case-insensitive; insertion order and original casing are
/// preserved so a captured request/response can be re-emitted faithfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBag(Vec<(String, String)>);

impl HeaderBag {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value matching `name`, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values matching `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_all(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<&HeaderMap> for HeaderBag {
    fn from(headers: &HeaderMap) -> Self {
        let mut bag = HeaderBag::new();
        for (name, value) in headers.iter() {
            bag.push(name.as_str(), value.to_str().unwrap_or_default());
        }
        bag
    }
}

/// Parses a `Cookie` header's `k=v; k2=v2` pairs.
fn parse_cookie_pairs(header_value: &str) -> Vec<(String, String)> {
    header_value
        .split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (name, value) = pair.split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Parses a `Set-Cookie` header's leading `name=value` attribute pair,
/// ignoring `Path=`/`Expires=`/etc. attributes that follow.
fn parse_set_cookie(header_value: &str) -> Option<(String, String)> {
    let first = header_value.split(';').next()?.trim();
    let (name, value) = first.split_once('=')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

fn parse_query_form(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn is_url_encoded_form(headers: &HeaderBag) -> bool {
    headers
        .get("content-type")
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("application/x-www-form-urlencoded"))
}

/// One HTTP request as observed by the interception engine, always carrying
/// an absolute URL so it can be replayed from the capture alone.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderBag,
    pub body: Bytes,
    pub content_length: usize,
    pub host: String,
    pub cookies: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub post_form: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
}

impl CapturedRequest {
    /// Builds a capture from a method, an already-absolutized URL, headers
    /// and a fully-buffered body. `url` must carry scheme and authority —
    /// the engine is responsible for prepending `https://<authority>` for
    /// requests read off a TLS tunnel before calling this.
    pub fn new(method: &str, url: &Uri, headers: &HeaderMap, body: Bytes) -> Self {
        let header_bag = HeaderBag::from(headers);
        let host = url
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| header_bag.get("host").map(str::to_string))
            .unwrap_or_default();

        let cookies = header_bag
            .get_all("cookie")
            .flat_map(parse_cookie_pairs)
            .collect::<Vec<_>>();

        let query_form = url.query().map(parse_query_form).unwrap_or_default();
        let post_form = if is_url_encoded_form(&header_bag) {
            parse_query_form(std::str::from_utf8(&body).unwrap_or_default())
        } else {
            Vec::new()
        };

        let mut form = query_form;
        form.extend(post_form.clone());

        CapturedRequest {
            method: method.to_string(),
            url: url.to_string(),
            content_length: body.len(),
            headers: header_bag,
            body,
            host,
            cookies,
            form,
            post_form,
            timestamp: Utc::now(),
        }
    }
}

/// One HTTP response as observed by the interception engine.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status_code: u16,
    pub status_line: String,
    pub headers: HeaderBag,
    pub body: Bytes,
    pub content_length: usize,
    pub cookies: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
}

impl CapturedResponse {
    pub fn new(status: http::StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let header_bag = HeaderBag::from(headers);
        let cookies = header_bag
            .get_all("set-cookie")
            .filter_map(parse_set_cookie)
            .collect::<Vec<_>>();

        CapturedResponse {
            status_code: status.as_u16(),
            status_line: format!(
                "{} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            ),
            content_length: body.len(),
            headers: header_bag,
            body,
            cookies,
            timestamp: Utc::now(),
        }
    }
}

/// A captured request/response pair plus its capture instant.
///
/// Does not carry its own [`ExchangeId`]: the store assigns that on
/// insertion and hands it back, per the §6 collaborator contract.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: CapturedRequest,
    pub response: CapturedResponse,
    pub captured_at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(request: CapturedRequest, response: CapturedResponse) -> Self {
        Exchange {
            request,
            response,
            captured_at: Utc::now(),
        }
    }
}

/// Mapping from probed parameter name to the request/response pair that
/// reflected its marker token back in the response body.
pub type ParamScanResult = std::collections::HashMap<String, (CapturedRequest, CapturedResponse)>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                http::header::HeaderName::try_from(*k).unwrap(),
                http::HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn header_bag_lookup_is_case_insensitive_and_preserves_casing_on_iter() {
        let mut bag = HeaderBag::new();
        bag.push("Content-Type", "text/plain");
        assert_eq!(bag.get("content-type"), Some("text/plain"));
        assert_eq!(bag.iter().next(), Some(("Content-Type", "text/plain")));
    }

    #[test]
    fn header_bag_get_all_preserves_insertion_order() {
        let mut bag = HeaderBag::new();
        bag.push("Set-Cookie", "a=1");
        bag.push("Set-Cookie", "b=2");
        let values: Vec<&str> = bag.get_all("set-cookie").collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[test]
    fn captured_request_parses_cookies_and_merges_query_and_post_form() {
        let uri: Uri = "http://example.test/a?x=1".parse().unwrap();
        let headers = headers(&[
            ("Cookie", "session=abc; theme=dark"),
            ("Content-Type", "application/x-www-form-urlencoded"),
        ]);
        let body = Bytes::from_static(b"y=2");

        let req = CapturedRequest::new("POST", &uri, &headers, body);

        assert_eq!(req.host, "example.test");
        assert_eq!(
            req.cookies,
            vec![
                ("session".to_string(), "abc".to_string()),
                ("theme".to_string(), "dark".to_string())
            ]
        );
        assert_eq!(req.post_form, vec![("y".to_string(), "2".to_string())]);
        assert_eq!(
            req.form,
            vec![
                ("x".to_string(), "1".to_string()),
                ("y".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn captured_request_ignores_body_as_form_without_the_content_type() {
        let uri: Uri = "http://example.test/a".parse().unwrap();
        let headers = headers(&[]);
        let body = Bytes::from_static(b"y=2");

        let req = CapturedRequest::new("POST", &uri, &headers, body);
        assert!(req.post_form.is_empty());
        assert!(req.form.is_empty());
    }

    #[test]
    fn captured_response_parses_set_cookie_name_value_ignoring_attributes() {
        let headers = headers(&[("Set-Cookie", "id=42; Path=/; HttpOnly")]);
        let resp = CapturedResponse::new(http::StatusCode::OK, &headers, Bytes::new());
        assert_eq!(resp.cookies, vec![("id".to_string(), "42".to_string())]);
        assert_eq!(resp.status_line, "200 OK");
    }

    #[test]
    fn exchange_id_round_trips_through_display_and_from_str() {
        let id: ExchangeId = "abc123".parse().unwrap();
        assert_eq!(id.to_string(), "abc123");
    }
}
