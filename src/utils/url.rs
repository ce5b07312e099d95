//! URL helpers
//!
//! Small rewrites applied to download URLs: swapping host or port, and
//! appending query parameters.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::Url;

/// Everything but unreserved characters is escaped in parameter values
const PARAM_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Replace the host of `url`; `None` if the URL or host is unusable
pub fn url_replace_host(url: &str, host: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    if parsed.cannot_be_a_base() || host.is_empty() {
        return None;
    }
    parsed.set_host(Some(host)).ok()?;
    Some(parsed.to_string())
}

/// Replace the port of `url`; `None` if the URL cannot carry a port
pub fn url_replace_port(url: &str, port: u16) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    parsed.set_port(Some(port)).ok()?;
    Some(parsed.to_string())
}

/// Append `name=value` to the query of `url`, escaping the value
pub fn url_append_param(url: &str, name: &str, value: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", url, sep, name, escape_param(value))
}

/// Percent-encode a query parameter value
pub fn escape_param(value: &str) -> String {
    utf8_percent_encode(value, PARAM_VALUE).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_host() {
        assert_eq!(
            url_replace_host("http://10.0.0.1:8080/getfile?file=3", "192.168.1.7").as_deref(),
            Some("http://192.168.1.7:8080/getfile?file=3")
        );
        assert_eq!(url_replace_host("not a url", "192.168.1.7"), None);
        assert_eq!(url_replace_host("http://10.0.0.1/", ""), None);
    }

    #[test]
    fn test_replace_port() {
        assert_eq!(
            url_replace_port("https://10.0.0.1:8080/getfile?file=3", 8443).as_deref(),
            Some("https://10.0.0.1:8443/getfile?file=3")
        );
        assert_eq!(url_replace_port("mailto:someone@example.com", 25), None);
    }

    #[test]
    fn test_append_param() {
        let url = url_append_param("http://h:8080/getfile", "file", "9");
        assert_eq!(url, "http://h:8080/getfile?file=9");
        let url = url_append_param(&url, "sender", "RED FOX/2");
        assert_eq!(url, "http://h:8080/getfile?file=9&sender=RED%20FOX%2F2");
        assert_eq!(escape_param("a-b.c_d~e"), "a-b.c_d~e");
    }
}
