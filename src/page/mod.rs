//! Listing-page structure
//!
//! This module knows what a search results page looks like in table view:
//! - The declared result count reported in the page title
//! - The "nothing found" marker that makes an empty result a normal state
//! - Listing rows (`tr.offer_container`) as raw fragments
//! - The handful of fields extracted from one fragment
//!
//! It deliberately stays dumb about networking; the fetch engine hands it
//! page bodies and fragment strings.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;
use url::Url;

/// Errors from fragment extraction
#[derive(Debug, Error)]
pub enum PageError {
    #[error("Fragment has no listing link")]
    MissingLink,

    #[error("Malformed listing id in '{0}'")]
    BadId(String),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// One extracted listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Listing id, parsed from the listing URL
    pub id: i64,

    /// Canonical listing URL
    pub url: String,

    /// Short object description ("2-room flat, 54 m²")
    pub description: String,

    /// Price lines as shown in the price column
    pub price: Vec<String>,

    /// Address lines
    pub address: Vec<String>,

    /// Free-form listing comment
    pub comment: String,
}

fn selector(cached: &'static OnceLock<Selector>, css: &'static str) -> &'static Selector {
    cached.get_or_init(|| Selector::parse(css).expect("static selector"))
}

fn fragment_selector() -> &'static Selector {
    static CACHE: OnceLock<Selector> = OnceLock::new();
    selector(&CACHE, "tr.offer_container")
}

/// Collapses runs of whitespace, the way listing markup needs everywhere
fn fix_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True if the page shows the "nothing found" header
pub fn page_is_empty(html: &str) -> bool {
    static CACHE: OnceLock<Selector> = OnceLock::new();
    let sel = selector(&CACHE, "div.serps-header_nothing-found__title");
    let document = Html::parse_document(html);
    document.select(sel).next().is_some()
}

/// Parses the declared total result count from the page title.
///
/// The title of a results page reads like "Аренда квартир - 45 объявлений".
/// A page carrying the "nothing found" marker, or a title the pattern does
/// not match, counts as zero results - a defined terminal state, not an
/// error.
pub fn declared_offer_count(html: &str) -> i64 {
    if page_is_empty(html) {
        return 0;
    }

    static TITLE: OnceLock<Selector> = OnceLock::new();
    static COUNT_RE: OnceLock<Regex> = OnceLock::new();
    let title_sel = selector(&TITLE, "title");
    let count_re = COUNT_RE
        .get_or_init(|| Regex::new(r"([1-9][0-9]*)\s*объявлен").expect("static regex"));

    let document = Html::parse_document(html);
    let title = match document.select(title_sel).next() {
        Some(el) => fix_text(&el.text().collect::<String>()),
        None => {
            tracing::warn!("Results page has no title; treating as zero results");
            return 0;
        }
    };

    match count_re.captures(&title).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().parse().unwrap_or(0),
        None => 0,
    }
}

/// Extracts the raw HTML of every listing row on the page
pub fn offer_fragments(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(fragment_selector())
        .map(|row| row.html())
        .collect()
}

fn select_text(root: &ElementRef, sel: &Selector) -> String {
    root.select(sel)
        .next()
        .map(|el| fix_text(&el.text().collect::<String>()))
        .unwrap_or_default()
}

fn select_texts(root: &ElementRef, sel: &Selector) -> Vec<String> {
    root.select(sel)
        .map(|el| fix_text(&el.text().collect::<String>()))
        .filter(|text| !text.is_empty())
        .collect()
}

/// Parses one listing fragment into an [`Offer`].
///
/// The listing id comes from the first anchor whose href ends in a numeric
/// path segment; a fragment without such a link is malformed. Other fields
/// degrade to empty values rather than failing the fragment.
pub fn parse_offer(fragment: &str) -> Result<Offer, PageError> {
    static ANCHOR: OnceLock<Selector> = OnceLock::new();
    static DESCRIPTION: OnceLock<Selector> = OnceLock::new();
    static PRICE: OnceLock<Selector> = OnceLock::new();
    static ADDRESS: OnceLock<Selector> = OnceLock::new();
    static COMMENT: OnceLock<Selector> = OnceLock::new();
    static ID_RE: OnceLock<Regex> = OnceLock::new();

    let anchor_sel = selector(&ANCHOR, "a[href]");
    let id_re = ID_RE.get_or_init(|| Regex::new(r"/([0-9]+)/?\s*$").expect("static regex"));

    // A bare <tr> outside a table gets stripped by the HTML5 parser, so the
    // fragment is re-wrapped before parsing.
    let document = Html::parse_fragment(&format!("<table>{}</table>", fragment));
    let root = document.root_element();

    let mut listing: Option<(i64, String)> = None;
    for a in root.select(anchor_sel) {
        let href = a.value().attr("href").unwrap_or_default();
        if let Some(captures) = id_re.captures(href) {
            let digits = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let id = digits
                .parse::<i64>()
                .map_err(|_| PageError::BadId(href.to_string()))?;
            listing = Some((id, href.to_string()));
            break;
        }
    }
    let (id, url) = listing.ok_or(PageError::MissingLink)?;

    Ok(Offer {
        id,
        url,
        description: select_text(&root, selector(&DESCRIPTION, "td.objects_item_info_col_2")),
        price: select_texts(&root, selector(&PRICE, "td.objects_item_info_col_4 div")),
        address: select_texts(&root, selector(&ADDRESS, "div.objects_item_addr")),
        comment: select_text(&root, selector(&COMMENT, "div.objects_item_comment")),
    })
}

/// Rewrites query parameters on `url`, replacing existing values for the
/// given keys and preserving everything else.
///
/// This is how pagination (`p`) and the time window (`totime`) are applied
/// to a search URL without disturbing the user's filters.
pub fn with_params(url: &str, params: &[(&str, String)]) -> Result<String, url::ParseError> {
    let mut parsed = Url::parse(url)?;
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !params.iter().any(|(k, _)| *k == key.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    {
        let mut query = parsed.query_pairs_mut();
        query.clear();
        for (key, value) in &kept {
            query.append_pair(key, value);
        }
        for (key, value) in params {
            query.append_pair(key, value);
        }
    }
    Ok(parsed.to_string())
}

/// Structural check that a URL points at a supported search page
pub fn looks_like_search_page(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default();
            (host == "cian.ru" || host.ends_with(".cian.ru")) && parsed.path() == "/cat.php"
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results_page(count: u32, rows: &str) -> String {
        format!(
            "<html><head><title>Аренда квартир - {} объявлений</title></head>\
             <body><table>{}</table></body></html>",
            count, rows
        )
    }

    fn offer_row(id: u64) -> String {
        format!(
            r#"<tr class="offer_container">
                <td class="objects_item_info_col_2"><div class="objects_item_info_col_w">2-комн. квартира, 54 м²</div></td>
                <td class="objects_item_info_col_4"><div>65 000 руб/мес</div></td>
                <td class="objects_item_info_col_1"><div class="objects_item_addr">Москва, Тверская 1</div></td>
                <td class="objects_item_info_col_9">
                    <div class="objects_item_comment">Уютная квартира <a href="https://cian.ru/rent/flat/{}/">подробнее</a></div>
                </td>
            </tr>"#,
            id
        )
    }

    #[test]
    fn test_declared_count_from_title() {
        let html = results_page(45, &offer_row(1));
        assert_eq!(declared_offer_count(&html), 45);
    }

    #[test]
    fn test_declared_count_zero_on_nothing_found() {
        let html = r#"<html><head><title>Аренда квартир - 45 объявлений</title></head>
            <body><div class="serps-header_nothing-found__title">Ничего не найдено</div></body></html>"#;
        assert!(page_is_empty(html));
        assert_eq!(declared_offer_count(html), 0);
    }

    #[test]
    fn test_declared_count_zero_on_unmatched_title() {
        let html = "<html><head><title>Аренда квартир</title></head><body></body></html>";
        assert_eq!(declared_offer_count(html), 0);
    }

    #[test]
    fn test_offer_fragments_extracted() {
        let rows: String = (1..=3).map(offer_row).collect();
        let fragments = offer_fragments(&results_page(3, &rows));
        assert_eq!(fragments.len(), 3);
        assert!(fragments[0].contains("offer_container"));
    }

    #[test]
    fn test_parse_offer_fields() {
        let offer = parse_offer(&offer_row(123456)).unwrap();
        assert_eq!(offer.id, 123456);
        assert_eq!(offer.url, "https://cian.ru/rent/flat/123456/");
        assert_eq!(offer.description, "2-комн. квартира, 54 м²");
        assert_eq!(offer.price, vec!["65 000 руб/мес".to_string()]);
        assert_eq!(offer.address, vec!["Москва, Тверская 1".to_string()]);
        assert!(offer.comment.starts_with("Уютная квартира"));
    }

    #[test]
    fn test_parse_offer_without_link_is_malformed() {
        let fragment = r#"<tr class="offer_container"><td>no link here</td></tr>"#;
        assert!(matches!(
            parse_offer(fragment),
            Err(PageError::MissingLink)
        ));
    }

    #[test]
    fn test_with_params_replaces_and_preserves() {
        let url = "http://cian.ru/cat.php?deal_type=rent&p=5";
        let rewritten = with_params(url, &[("p", "1".to_string()), ("totime", "3600".to_string())]).unwrap();
        let parsed = Url::parse(&rewritten).unwrap();
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("deal_type".to_string(), "rent".to_string())));
        assert!(pairs.contains(&("p".to_string(), "1".to_string())));
        assert!(pairs.contains(&("totime".to_string(), "3600".to_string())));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "p").count(), 1);
    }

    #[test]
    fn test_looks_like_search_page() {
        assert!(looks_like_search_page("https://www.cian.ru/cat.php?deal_type=rent"));
        assert!(looks_like_search_page("http://cian.ru/cat.php?x=1"));
        assert!(!looks_like_search_page("https://cian.ru/rent/flat/1/"));
        assert!(!looks_like_search_page("https://example.com/cat.php"));
        assert!(!looks_like_search_page("not a url"));
    }
}
