pub mod devices;
pub mod filters;
pub mod groups;
pub mod health;
pub mod tenants;

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};

pub const HEADER_TOTAL_COUNT: &str = "x-total-count";
pub const HEADER_LINK: &str = "link";

pub fn total_count_header(headers: &mut HeaderMap, total: u64) {
    headers.insert(
        HeaderName::from_static(HEADER_TOTAL_COUNT),
        HeaderValue::from_str(&total.to_string()).unwrap_or(HeaderValue::from_static("0")),
    );
}

/// RFC-5988 pagination links: always `first`, `prev`/`next` when they exist.
/// Non-pagination query parameters are carried over verbatim.
pub fn link_header(
    path: &str,
    raw_query: Option<&str>,
    page: i64,
    per_page: i64,
    total: u64,
) -> String {
    let carried: Vec<&str> = raw_query
        .unwrap_or("")
        .split('&')
        .filter(|s| !s.is_empty() && !s.starts_with("page=") && !s.starts_with("per_page="))
        .collect();
    let link = |target_page: i64, rel: &str| {
        let mut query = carried.join("&");
        if !query.is_empty() {
            query.push('&');
        }
        format!("<{path}?{query}page={target_page}&per_page={per_page}>; rel=\"{rel}\"")
    };

    let mut links = vec![link(1, "first")];
    if page > 1 {
        links.push(link(page - 1, "prev"));
    }
    if (page.max(0) as u64) * (per_page.max(0) as u64) < total {
        links.push(link(page + 1, "next"));
    }
    links.join(", ")
}

pub fn pagination_headers(
    headers: &mut HeaderMap,
    path: &str,
    raw_query: Option<&str>,
    page: i64,
    per_page: i64,
    total: u64,
) {
    total_count_header(headers, total);
    if let Ok(value) = HeaderValue::from_str(&link_header(path, raw_query, page, per_page, total)) {
        headers.insert(HeaderName::from_static(HEADER_LINK), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn middle_page_has_all_links() {
        let links = link_header("/devices", None, 2, 5, 20);
        assert!(links.contains(r#"</devices?page=1&per_page=5>; rel="first""#));
        assert!(links.contains(r#"</devices?page=1&per_page=5>; rel="prev""#));
        assert!(links.contains(r#"</devices?page=3&per_page=5>; rel="next""#));
    }

    #[test]
    fn last_page_has_no_next() {
        // 9 devices, page 2 of 5: shows 4, nothing follows
        let links = link_header("/devices", None, 2, 5, 9);
        assert!(links.contains(r#"rel="first""#));
        assert!(links.contains(r#"rel="prev""#));
        assert!(!links.contains(r#"rel="next""#));
    }

    #[test]
    fn first_page_has_no_prev() {
        let links = link_header("/devices", None, 1, 20, 100);
        assert!(!links.contains(r#"rel="prev""#));
        assert!(links.contains(r#"rel="next""#));
    }

    #[test]
    fn filters_carry_over_and_pagination_params_do_not() {
        let links = link_header(
            "/devices",
            Some("inventory/sn=eq:1&page=3&per_page=10"),
            3,
            10,
            100,
        );
        assert!(links.contains("</devices?inventory/sn=eq:1&page=4&per_page=10>; rel=\"next\""));
        assert!(!links.contains("page=3&per_page=10>; rel=\"next\""));
    }
}
