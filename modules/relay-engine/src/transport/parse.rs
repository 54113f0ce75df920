// Response parsing shared by both transports.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use reqwest::header::HeaderMap;
use relay_common::CandidateItem;

use super::FetchError;

static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).expect("valid regex"));

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(too many requests|rate limit exceeded|rate-limited|you are being rate limited)")
        .expect("valid regex")
});

static CHALLENGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(captcha|cf-challenge|challenge-platform|verify you are human|access denied)")
        .expect("valid regex")
});

/// Max items taken from one rendered page.
const MAX_LINKS: usize = 50;

/// Parse an RSS, Atom or JSON Feed body into candidate items.
///
/// An empty body or a document that isn't a feed is a parse error; a valid
/// feed with no entries is an empty batch.
pub fn parse_feed(body: &[u8]) -> Result<Vec<CandidateItem>, FetchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(FetchError::Parse("empty response body".to_string()));
    }

    let feed = feed_rs::parser::parse(body)
        .map_err(|e| FetchError::Parse(format!("not a feed: {e}")))?;

    let items = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let url = entry.links.first().map(|l| l.href.clone());
            let id = if entry.id.trim().is_empty() {
                url.clone()?
            } else {
                entry.id
            };
            Some(CandidateItem {
                id,
                url,
                title: entry.title.map(|t| t.content),
                created_at: entry.published.or(entry.updated),
            })
        })
        .collect();

    Ok(items)
}

/// True when the body is an RSS/Atom/JSON feed rather than an HTML page.
pub fn looks_like_feed(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(512).collect::<String>().to_ascii_lowercase();
    head.starts_with("<?xml")
        || head.starts_with("<rss")
        || head.starts_with("<feed")
        || (head.starts_with('{') && head.contains("jsonfeed"))
}

/// Turn rendered page HTML into candidate items.
///
/// Feeds are parsed as feeds. For HTML, throttling pages become
/// [`FetchError::RateLimited`], challenge pages a transport failure, and
/// otherwise every link containing `link_pattern` becomes an item keyed by
/// its absolute URL.
pub fn parse_rendered(
    html: &str,
    page_url: &str,
    link_pattern: Option<&str>,
    fallback_reset: DateTime<Utc>,
) -> Result<Vec<CandidateItem>, FetchError> {
    if html.trim().is_empty() {
        return Err(FetchError::Parse("empty rendered page".to_string()));
    }
    if looks_like_feed(html) {
        return parse_feed(html.as_bytes());
    }

    let links = match link_pattern {
        Some(pattern) => extract_links_by_pattern(html, page_url, pattern),
        None => Vec::new(),
    };

    if links.is_empty() {
        if RATE_LIMIT_RE.is_match(html) {
            return Err(FetchError::RateLimited {
                reset_at: fallback_reset,
            });
        }
        if CHALLENGE_RE.is_match(html) {
            return Err(FetchError::Transport("blocked by challenge page".to_string()));
        }
        return Err(FetchError::Parse(match link_pattern {
            Some(pattern) => format!("no links matching '{pattern}' on rendered page"),
            None => "rendered page is not a feed and source has no linkPattern".to_string(),
        }));
    }

    Ok(links
        .into_iter()
        .map(|link| CandidateItem {
            id: link.clone(),
            url: Some(link),
            title: None,
            created_at: None,
        })
        .collect())
}

/// Extract links from raw HTML that contain `pattern`.
/// Resolves relative URLs against `base_url`, drops fragments, deduplicates,
/// and keeps document order.
pub fn extract_links_by_pattern(html: &str, base_url: &str, pattern: &str) -> Vec<String> {
    let base = url::Url::parse(base_url).ok();

    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for cap in HREF_RE.captures_iter(html) {
        let raw = &cap[1];
        let resolved = match url::Url::parse(raw) {
            Ok(u) => u,
            Err(_) => match base.as_ref().and_then(|b| b.join(raw).ok()) {
                Some(u) => u,
                None => continue,
            },
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        let mut resolved = resolved;
        resolved.set_fragment(None);
        let resolved = resolved.to_string();

        if resolved.contains(pattern) && seen.insert(resolved.clone()) {
            links.push(resolved);
            if links.len() >= MAX_LINKS {
                break;
            }
        }
    }

    links
}

/// Longest wait a rate-limit hint is allowed to impose.
fn reset_horizon() -> Duration {
    Duration::hours(24)
}

/// Caps `reset` at 24 hours past `now`.
pub fn clamp_reset(reset: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let ceiling = now
        .checked_add_signed(reset_horizon())
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    reset.min(ceiling)
}

/// `now + wait`, capped like any other rate-limit hint.
pub fn reset_after(now: DateTime<Utc>, wait: std::time::Duration) -> DateTime<Utc> {
    let wait = Duration::from_std(wait).unwrap_or_else(|_| reset_horizon());
    clamp_reset(now.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC), now)
}

/// Reset time advertised by rate-limit headers, if any.
///
/// Understands `Retry-After` (delta seconds or HTTP date) and
/// `x-rate-limit-reset` / `x-ratelimit-reset` (epoch seconds). Values past
/// the horizon are capped rather than rejected.
pub fn rate_limit_reset(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(value) = header_str(headers, "retry-after") {
        if let Ok(secs) = value.parse::<i64>() {
            let wait = Duration::try_seconds(secs.max(0)).unwrap_or_else(reset_horizon);
            let reset = now.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC);
            return Some(clamp_reset(reset, now));
        }
        if let Ok(date) = DateTime::parse_from_rfc2822(value) {
            return Some(clamp_reset(date.with_timezone(&Utc), now));
        }
    }

    ["x-rate-limit-reset", "x-ratelimit-reset"]
        .into_iter()
        .filter_map(|name| header_str(headers, name))
        .filter_map(|v| v.parse::<i64>().ok())
        .find_map(|epoch| DateTime::from_timestamp(epoch, 0))
        .map(|reset| clamp_reset(reset, now))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Test Feed</title>
    <item>
      <title>First Post</title>
      <link>https://example.com/1</link>
      <guid>guid-1</guid>
      <pubDate>Mon, 01 Jan 2024 00:00:00 +0000</pubDate>
    </item>
    <item>
      <title>Second Post</title>
      <link>https://example.com/2</link>
      <guid>guid-2</guid>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_rss_items() {
        let items = parse_feed(RSS.as_bytes()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "guid-1");
        assert_eq!(items[0].title.as_deref(), Some("First Post"));
        assert_eq!(items[0].url.as_deref(), Some("https://example.com/1"));
        assert!(items[0].created_at.is_some());
        assert!(items[1].created_at.is_none());
    }

    #[test]
    fn parses_atom_feed() {
        let atom = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Channel</title>
  <id>urn:channel</id>
  <updated>2024-03-01T10:00:00Z</updated>
  <entry>
    <id>yt:video:abc123</id>
    <title>New video</title>
    <link rel="alternate" href="https://video.example/watch?v=abc123"/>
    <published>2024-03-01T09:00:00Z</published>
    <updated>2024-03-01T09:30:00Z</updated>
  </entry>
</feed>"#;
        let items = parse_feed(atom.as_bytes()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "yt:video:abc123");
        assert_eq!(
            items[0].created_at.unwrap().to_rfc3339(),
            "2024-03-01T09:00:00+00:00"
        );
    }

    #[test]
    fn empty_channel_is_valid_empty_batch() {
        let rss = r#"<?xml version="1.0"?><rss version="2.0"><channel><title>t</title></channel></rss>"#;
        assert!(parse_feed(rss.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn empty_or_garbage_body_is_parse_error() {
        assert!(matches!(parse_feed(b"  \n"), Err(FetchError::Parse(_))));
        assert!(matches!(parse_feed(b"<html><body>hi</body></html>"), Err(FetchError::Parse(_))));
    }

    #[test]
    fn rendered_page_links_become_items() {
        let html = r##"<html><body>
            <a href="/alice/status/1#m">one</a>
            <a href="https://social.example/alice/status/2">two</a>
            <a href="/alice/status/1">dup</a>
            <a href="/about">about</a>
            <a href="javascript:void(0)">js</a>
        </body></html>"##;
        let items =
            parse_rendered(html, "https://social.example/alice", Some("/status/"), Utc::now())
                .unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "https://social.example/alice/status/1",
                "https://social.example/alice/status/2"
            ]
        );
    }

    #[test]
    fn rendered_feed_is_parsed_as_feed() {
        let items = parse_rendered(RSS, "https://x.example", None, Utc::now()).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn throttle_page_is_rate_limited() {
        let reset = Utc::now() + Duration::minutes(5);
        let html = "<html><body><h1>429 Too Many Requests</h1></body></html>";
        match parse_rendered(html, "https://x.example", Some("/status/"), reset) {
            Err(FetchError::RateLimited { reset_at }) => assert_eq!(reset_at, reset),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn challenge_page_is_transport_failure() {
        let html = "<html><body><div class=\"g-recaptcha\">captcha</div></body></html>";
        assert!(matches!(
            parse_rendered(html, "https://x.example", Some("/status/"), Utc::now()),
            Err(FetchError::Transport(_))
        ));
    }

    #[test]
    fn page_without_matches_is_parse_error() {
        let html = "<html><body><a href=\"/about\">about</a></body></html>";
        assert!(matches!(
            parse_rendered(html, "https://x.example", Some("/status/"), Utc::now()),
            Err(FetchError::Parse(_))
        ));
        assert!(matches!(
            parse_rendered(html, "https://x.example", None, Utc::now()),
            Err(FetchError::Parse(_))
        ));
    }

    #[test]
    fn retry_after_seconds() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("120"));
        assert_eq!(rate_limit_reset(&headers, now), Some(now + Duration::seconds(120)));
    }

    #[test]
    fn retry_after_http_date() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        let reset = rate_limit_reset(&headers, Utc::now()).unwrap();
        assert_eq!(reset.to_rfc3339(), "2015-10-21T07:28:00+00:00");
    }

    #[test]
    fn epoch_reset_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-rate-limit-reset", HeaderValue::from_static("1700000000"));
        let reset = rate_limit_reset(&headers, Utc::now()).unwrap();
        assert_eq!(reset.timestamp(), 1_700_000_000);
    }

    #[test]
    fn huge_retry_after_is_capped() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("99999999999999"));
        let reset = rate_limit_reset(&headers, now).unwrap();
        assert_eq!(reset, now + Duration::hours(24));

        headers.insert("retry-after", HeaderValue::from_static("9223372036854775807"));
        assert_eq!(rate_limit_reset(&headers, now), Some(now + Duration::hours(24)));
    }

    #[test]
    fn far_future_epoch_reset_is_capped() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("100000000000"));
        assert_eq!(rate_limit_reset(&headers, now), Some(now + Duration::hours(24)));
    }

    #[test]
    fn reset_after_caps_unbounded_waits() {
        let now = Utc::now();
        assert_eq!(
            reset_after(now, std::time::Duration::from_secs(30)),
            now + Duration::seconds(30)
        );
        assert_eq!(reset_after(now, std::time::Duration::MAX), now + Duration::hours(24));
    }

    #[test]
    fn no_headers_no_reset() {
        assert!(rate_limit_reset(&HeaderMap::new(), Utc::now()).is_none());
    }
}
