//! Who is talking to the proxy: a rough device summary from the User-Agent
//! plus the app bundle identifier when the client exposes one.

use http::HeaderMap;
use http::header::USER_AGENT;

const BUNDLE_ID_HEADERS: [&str; 2] = ["x-bundle-id", "cfbundleidentifier"];
const NETWORK_STACK_MARKER: &str = "CFNetwork";
const SIMULATOR_MARKER: &str = "Simulator";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientProfile {
    pub user_agent: String,
    pub device_info: String,
    pub is_simulator: bool,
    pub app_identifier: String,
}

impl ClientProfile {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let user_agent = header_str(headers, USER_AGENT.as_str()).unwrap_or_default().to_string();
        let ua = UserAgent::parse(&user_agent);

        let app_identifier = BUNDLE_ID_HEADERS
            .iter()
            .find_map(|name| header_str(headers, name).filter(|v| !v.is_empty()))
            .map(str::to_string)
            .or_else(|| app_from_user_agent(&user_agent))
            .unwrap_or_default();

        ClientProfile {
            is_simulator: ua.os == "iOS" && user_agent.contains(SIMULATOR_MARKER),
            device_info: if user_agent.is_empty() { String::new() } else { ua.summary() },
            user_agent,
            app_identifier,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// `MyApp/1.2 CFNetwork/1410 Darwin/22.6.0` -> `MyApp/1.2`
fn app_from_user_agent(user_agent: &str) -> Option<String> {
    let (before, _) = user_agent.split_once(NETWORK_STACK_MARKER)?;
    let app = before.trim();
    (!app.is_empty()).then(|| app.to_string())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct UserAgent<'a> {
    platform: &'a str,
    os: &'a str,
    browser: &'a str,
    version: &'a str,
}

impl<'a> UserAgent<'a> {
    fn parse(ua: &'a str) -> Self {
        let comment = ua
            .split_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(inside, _)| inside)
            .unwrap_or("");

        let platform = ["iPhone", "iPad", "iPod", "Macintosh", "Windows", "Android", "Linux"]
            .into_iter()
            .find(|p| comment.contains(p))
            .unwrap_or("");

        let os = if matches!(platform, "iPhone" | "iPad" | "iPod") || comment.contains("iOS") {
            "iOS"
        } else if comment.contains("Android") {
            "Android"
        } else if comment.contains("Mac OS X") {
            "Mac OS X"
        } else if comment.contains("Windows") {
            "Windows"
        } else if comment.contains("Linux") {
            "Linux"
        } else if ua.contains("Darwin/") {
            "Darwin"
        } else {
            ""
        };

        let (browser, version) = detect_browser(ua);
        UserAgent { platform, os, browser, version }
    }

    fn summary(&self) -> String {
        format!("{} {} / {} {}", self.platform, self.os, self.browser, self.version)
    }
}

/// Products are checked in order; Chrome also says Safari, Edge also says Chrome.
fn detect_browser(ua: &str) -> (&str, &str) {
    const PRODUCTS: [(&str, &str); 7] = [
        ("Edg/", "Edge"),
        ("OPR/", "Opera"),
        ("CriOS/", "Chrome"),
        ("Chrome/", "Chrome"),
        ("FxiOS/", "Firefox"),
        ("Firefox/", "Firefox"),
        ("Version/", "Safari"),
    ];
    for (token, name) in PRODUCTS {
        if let Some(version) = product_version(ua, token) {
            if token == "Version/" && !ua.contains("Safari/") {
                continue;
            }
            return (name, version);
        }
    }

    // First `name/version` token, e.g. an app's own identifier or curl.
    ua.split_whitespace()
        .find_map(|token| token.split_once('/'))
        .filter(|(name, _)| !name.is_empty())
        .unwrap_or(("", ""))
}

fn product_version<'a>(ua: &'a str, token: &str) -> Option<&'a str> {
    let start = ua.find(token)? + token.len();
    let rest = &ua[start..];
    let end = rest.find(|c: char| c.is_whitespace() || c == ';' || c == ')').unwrap_or(rest.len());
    Some(&rest[..end])
}
