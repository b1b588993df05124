//! Site identifier normalization (spec §6, bit-exact).

/// Normalize a URL into a stable site identifier: lowercase the host, strip a
/// leading `www.`, `m.`, or `forums.` label, and take the label before the
/// first remaining `.`.
///
/// ```text
/// https://www.fanfiction.net/s/123 -> "fanfiction"
/// https://forums.spacebattles.com/threads/x -> "spacebattles"
/// ```
pub fn normalize(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();

    let stripped = ["www.", "m.", "forums."]
        .iter()
        .find_map(|prefix| host.strip_prefix(prefix))
        .unwrap_or(host.as_str());

    let label = stripped.split('.').next()?;
    if label.is_empty() {
        return None;
    }
    Some(label.to_string())
}
