//! MOPS remote-service adapter: listing query shape, detail-page addressing and table extraction.

use async_trait::async_trait;
use mops_core::{ListingWindow, RawRow};
use mops_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "mops-adapters";

pub const DEFAULT_LISTING_URL: &str = "https://mops.twse.com.tw/mops/web/ajax_t51sb10";
pub const DEFAULT_DETAIL_URL: &str = "https://mops.twse.com.tw/mops/web/ajax_t05st01";

/// JSON pointer to the row array inside a listing response.
pub const LISTING_ROWS_POINTER: &str = "/result/data";

/// Class that marks the disclosure table on a detail page.
pub const BORDERED_TABLE_CLASS: &str = "hasBorder";

pub const LISTING_FIXED_PARAMS: &[(&str, &str)] = &[
    ("encodeURIComponent", "1"),
    ("step", "1"),
    ("firstin", "true"),
    ("off", "1"),
    ("TYPEK", "sii,otc"),
    ("market", "all"),
    ("keyword", "股利"),
    ("lang", "zh_TW"),
];

pub const DETAIL_DEFAULT_PARAMS: &[(&str, &str)] = &[
    ("encodeURIComponent", "1"),
    ("step", "2"),
    ("firstin", "1"),
    ("off", "1"),
    ("TYPEK", "all"),
    ("year", ""),
    ("month", "all"),
    ("b_date", ""),
    ("e_date", ""),
    ("queryName", "co_id"),
    ("inpuType", "co_id"),
    ("pgname", "t05st01"),
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid {role} url {url:?}: {source}")]
    InvalidUrl {
        role: &'static str,
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Outcome of a detail-page GET; a failed fetch is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailPage {
    Markup(String),
    NoData,
}

#[async_trait]
pub trait DisclosureSource: Send + Sync {
    /// Base address that detail-page parameters are appended to.
    fn detail_base(&self) -> &Url;

    async fn fetch_listing(&self, window: &ListingWindow) -> Result<Vec<RawRow>, FetchError>;

    async fn fetch_detail_page(&self, address: &Url) -> DetailPage;
}

fn owned_params(params: &[(&str, &str)]) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Right-biased merge: an override replaces the value in place, new keys go to the end.
pub fn merge_params(
    mut merged: Vec<(String, String)>,
    overrides: impl IntoIterator<Item = (String, String)>,
) -> Vec<(String, String)> {
    for (key, value) in overrides {
        match merged.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => merged.push((key, value)),
        }
    }
    merged
}

pub fn listing_params(window: &ListingWindow) -> Vec<(String, String)> {
    merge_params(
        owned_params(LISTING_FIXED_PARAMS),
        [
            ("startDate".to_string(), window.start_date.clone()),
            ("endDate".to_string(), window.end_date.clone()),
        ],
    )
}

/// `key=percent(value)` pairs joined with `&`; keys go out verbatim.
pub fn encode_form(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn json_scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn decode_listing_rows(url: &str, body: &[u8]) -> Result<Vec<RawRow>, FetchError> {
    let invalid = |reason: String| FetchError::InvalidBody {
        url: url.to_string(),
        reason,
    };

    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| invalid(format!("not JSON: {e}")))?;
    let rows = value
        .pointer(LISTING_ROWS_POINTER)
        .ok_or_else(|| invalid(format!("missing {LISTING_ROWS_POINTER}")))?
        .as_array()
        .ok_or_else(|| invalid(format!("{LISTING_ROWS_POINTER} is not an array")))?;

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let object = row
                .as_object()
                .ok_or_else(|| invalid(format!("row {i} is not an object")))?;
            let row: RawRow = object
                .iter()
                .map(|(k, v)| (k.clone(), json_scalar_to_string(v)))
                .collect();
            Ok(row)
        })
        .collect()
}

/// Query parameters carried by a record's hyperlink (`a=1`, `?a=1`, `/path?a=1`, full URL).
pub fn hyperlink_params(hyperlink: &str) -> Vec<(String, String)> {
    let hyperlink = hyperlink.trim();
    let query = match hyperlink.split_once('?') {
        Some((_, query)) => query,
        None if hyperlink.contains('=') => hyperlink,
        None => "",
    };
    let query = query.split_once('#').map_or(query, |(q, _)| q);
    url::form_urlencoded::parse(query.trim_start_matches(|c: char| c == '?' || c == '&').as_bytes())
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

pub fn build_detail_address(base: &Url, hyperlink: &str) -> Url {
    let params = merge_params(owned_params(DETAIL_DEFAULT_PARAMS), hyperlink_params(hyperlink));
    let mut address = base.clone();
    address
        .query_pairs_mut()
        .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    address
}

/// Source text of the first `table.hasBorder` in `markup`, byte for byte as served.
///
/// The page is not re-serialized, so stray text and missing `<tbody>` wrappers
/// come back exactly as the remote service wrote them.
pub fn extract_bordered_table(markup: &str) -> Option<String> {
    let dom = tl::parse(markup, tl::ParserOptions::default()).ok()?;
    let parser = dom.parser();
    let (start, end) = dom
        .nodes()
        .iter()
        .filter_map(tl::Node::as_tag)
        .filter(|tag| tag.name().as_utf8_str().eq_ignore_ascii_case("table"))
        .filter(|tag| tag.attributes().is_class_member(BORDERED_TABLE_CLASS))
        .map(|tag| tag.boundaries(parser))
        .min_by_key(|&(start, _)| start)?;
    markup.get(start..=end).map(str::to_string)
}

/// Fetch a detail page and pull its bordered table; every failure collapses to `None`.
pub async fn extract_fragment(source: &dyn DisclosureSource, address: &Url) -> Option<String> {
    match source.fetch_detail_page(address).await {
        DetailPage::Markup(markup) => {
            let fragment = extract_bordered_table(&markup);
            if fragment.is_none() {
                debug!(%address, "detail page has no bordered table");
            }
            fragment
        }
        DetailPage::NoData => None,
    }
}

/// Live MOPS endpoints over [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpDisclosureSource {
    http: HttpFetcher,
    listing_url: Url,
    detail_base: Url,
}

impl HttpDisclosureSource {
    pub fn new(http: HttpFetcher, listing_url: &str, detail_url: &str) -> Result<Self, AdapterError> {
        let parse = |role: &'static str, raw: &str| {
            Url::parse(raw).map_err(|source| AdapterError::InvalidUrl {
                role,
                url: raw.to_string(),
                source,
            })
        };
        Ok(Self {
            http,
            listing_url: parse("listing", listing_url)?,
            detail_base: parse("detail", detail_url)?,
        })
    }
}

#[async_trait]
impl DisclosureSource for HttpDisclosureSource {
    fn detail_base(&self) -> &Url {
        &self.detail_base
    }

    async fn fetch_listing(&self, window: &ListingWindow) -> Result<Vec<RawRow>, FetchError> {
        let body = encode_form(&listing_params(window));
        let resp = self.http.post_form(self.listing_url.as_str(), body).await?;
        let rows = decode_listing_rows(&resp.final_url, &resp.body)?;
        debug!(status = %resp.status, rows = rows.len(), "listing decoded");
        Ok(rows)
    }

    async fn fetch_detail_page(&self, address: &Url) -> DetailPage {
        match self.http.get_text(address.as_str()).await {
            Ok(markup) => DetailPage::Markup(markup),
            Err(err) => {
                warn!(%address, error = %err, "detail fetch failed; treating as no data");
                DetailPage::NoData
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> ListingWindow {
        ListingWindow {
            start_date: "2026/01/01".into(),
            end_date: "2026/01/31".into(),
        }
    }

    fn base() -> Url {
        Url::parse(DEFAULT_DETAIL_URL).unwrap()
    }

    struct CannedSource {
        base: Url,
        page: DetailPage,
    }

    #[async_trait]
    impl DisclosureSource for CannedSource {
        fn detail_base(&self) -> &Url {
            &self.base
        }

        async fn fetch_listing(&self, _window: &ListingWindow) -> Result<Vec<RawRow>, FetchError> {
            Ok(Vec::new())
        }

        async fn fetch_detail_page(&self, _address: &Url) -> DetailPage {
            self.page.clone()
        }
    }

    #[test]
    fn listing_params_append_dates_after_fixed_set() {
        let params = listing_params(&window());
        assert_eq!(params.len(), LISTING_FIXED_PARAMS.len() + 2);
        assert_eq!(params[0], ("encodeURIComponent".to_string(), "1".to_string()));
        assert_eq!(
            &params[params.len() - 2..],
            &[
                ("startDate".to_string(), "2026/01/01".to_string()),
                ("endDate".to_string(), "2026/01/31".to_string()),
            ]
        );
    }

    #[test]
    fn form_encoding_escapes_values_only() {
        let params = vec![
            ("keyword".to_string(), "股利".to_string()),
            ("startDate".to_string(), "2026/01/01".to_string()),
            ("TYPEK".to_string(), "sii,otc".to_string()),
            ("a b".to_string(), "x y".to_string()),
        ];
        assert_eq!(
            encode_form(&params),
            "keyword=%E8%82%A1%E5%88%A9&startDate=2026%2F01%2F01&TYPEK=sii%2Cotc&a b=x%20y"
        );
    }

    #[test]
    fn merge_is_right_biased_and_position_stable() {
        let merged = merge_params(
            owned_params(&[("a", "1"), ("b", "2")]),
            owned_params(&[("b", "3"), ("c", "4"), ("c", "5")]),
        );
        assert_eq!(merged, owned_params(&[("a", "1"), ("b", "3"), ("c", "5")]));
    }

    #[test]
    fn decode_listing_rows_stringifies_scalars() {
        let body = br#"{"result":{"data":[{"COMPANY_ID":"1101","SEQ_NO":3,"FLAG":true,"NOTE":null}]}}"#;
        let rows = decode_listing_rows("http://x", body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["COMPANY_ID"], "1101");
        assert_eq!(rows[0]["SEQ_NO"], "3");
        assert_eq!(rows[0]["FLAG"], "true");
        assert_eq!(rows[0]["NOTE"], "");
    }

    #[test]
    fn malformed_listing_bodies_are_rejected() {
        for body in [
            &b"<html>maintenance</html>"[..],
            br#"{"result":{}}"#,
            br#"{"result":{"data":{"COMPANY_ID":"1101"}}}"#,
            br#"{"result":{"data":["1101"]}}"#,
        ] {
            let err = decode_listing_rows("http://listing", body).expect_err("malformed");
            assert!(matches!(err, FetchError::InvalidBody { .. }), "{err}");
            assert!(err.to_string().contains("http://listing"));
        }
    }

    #[test]
    fn empty_listing_is_not_an_error() {
        let rows = decode_listing_rows("http://x", br#"{"result":{"data":[]}}"#).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn hyperlink_params_accept_bare_and_url_forms() {
        let expected = owned_params(&[("a", "1"), ("co_id", "1101")]);
        assert_eq!(hyperlink_params("a=1&co_id=1101"), expected);
        assert_eq!(hyperlink_params("?a=1&co_id=1101"), expected);
        assert_eq!(hyperlink_params("/mops/web/t05st01?a=1&co_id=1101"), expected);
        assert_eq!(hyperlink_params("https://host/p?a=1&co_id=1101#top"), expected);
        assert!(hyperlink_params("/mops/web/t05st01").is_empty());
        assert!(hyperlink_params("").is_empty());
    }

    #[test]
    fn detail_address_uses_defaults_then_record_params() {
        let address = build_detail_address(&base(), "a=1");
        assert_eq!(
            address.as_str(),
            "https://mops.twse.com.tw/mops/web/ajax_t05st01?encodeURIComponent=1&step=2&firstin=1&off=1&TYPEK=all&year=&month=all&b_date=&e_date=&queryName=co_id&inpuType=co_id&pgname=t05st01&a=1"
        );
    }

    #[test]
    fn detail_address_record_values_win_on_collision() {
        let address = build_detail_address(&base(), "TYPEK=sii&co_id=1101&month=3");
        let pairs: Vec<(String, String)> = address.query_pairs().into_owned().collect();
        assert_eq!(pairs.len(), DETAIL_DEFAULT_PARAMS.len() + 1);
        assert_eq!(pairs[4], ("TYPEK".to_string(), "sii".to_string()));
        assert_eq!(pairs[6], ("month".to_string(), "3".to_string()));
        assert_eq!(pairs.last().unwrap(), &("co_id".to_string(), "1101".to_string()));
    }

    #[test]
    fn bordered_table_is_returned_with_its_own_tags() {
        let markup = r#"<html><body><table class="plain"><tbody><tr><td>skip</td></tr></tbody></table><table class="hasBorder"><tbody><tr><td>X</td></tr></tbody></table><table class="hasBorder"><tbody><tr><td>second</td></tr></tbody></table></body></html>"#;
        assert_eq!(
            extract_bordered_table(markup).as_deref(),
            Some(r#"<table class="hasBorder"><tbody><tr><td>X</td></tr></tbody></table>"#)
        );
    }

    #[test]
    fn bordered_table_keeps_source_markup_verbatim() {
        assert_eq!(
            extract_bordered_table(r#"<table class="hasBorder">X</table>"#).as_deref(),
            Some(r#"<table class="hasBorder">X</table>"#)
        );
        assert_eq!(
            extract_bordered_table(r#"<div><table class="hasBorder"><tr><td>1</td></tr></table></div>"#)
                .as_deref(),
            Some(r#"<table class="hasBorder"><tr><td>1</td></tr></table>"#)
        );
    }

    #[test]
    fn outer_bordered_table_wins_over_nested_one() {
        let markup = r#"<table class="wide hasBorder"><tr><td><table class="hasBorder"><tr><td>in</td></tr></table></td></tr></table>"#;
        assert_eq!(extract_bordered_table(markup).as_deref(), Some(markup));
    }

    #[test]
    fn pages_without_marker_yield_nothing() {
        assert_eq!(extract_bordered_table("<p>查無資料</p>"), None);
        assert_eq!(extract_bordered_table(""), None);
    }

    #[tokio::test]
    async fn extract_fragment_maps_no_data_and_missing_marker_to_none() {
        let address = build_detail_address(&base(), "a=1");

        let no_data = CannedSource { base: base(), page: DetailPage::NoData };
        assert_eq!(extract_fragment(&no_data, &address).await, None);

        let no_table = CannedSource {
            base: base(),
            page: DetailPage::Markup("<div>nothing here</div>".into()),
        };
        assert_eq!(extract_fragment(&no_table, &address).await, None);

        let with_table = CannedSource {
            base: base(),
            page: DetailPage::Markup(
                r#"<table class="hasBorder"><tbody><tr><td>X</td></tr></tbody></table>"#.into(),
            ),
        };
        assert!(extract_fragment(&with_table, &address)
            .await
            .is_some_and(|f| f.contains("<td>X</td>")));
    }

    #[test]
    fn http_source_rejects_bad_urls() {
        let http = HttpFetcher::new(Default::default()).unwrap();
        let err = HttpDisclosureSource::new(http, "not a url", DEFAULT_DETAIL_URL).unwrap_err();
        assert!(err.to_string().contains("listing"));
    }
}
