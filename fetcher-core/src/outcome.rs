//! Classifies story-fetcher CLI output into a [`FetcherOutcome`] (spec
//! §4.9). Deterministic given the output text; never panics.

/// Deterministic classification of one story-fetcher invocation's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetcherOutcome {
    Success { library_id: Option<String> },
    ForceIndicated,
    TransientFailure { reason: String },
    PermanentFailure { reason: String },
}

const FORCE_MARKERS: &[&str] = &["chapter count mismatch", "local copy is newer"];

const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "network is unreachable",
    "timed out",
    "timeout",
    "rate limit",
    "too many requests",
    "temporarily unavailable",
    "service unavailable",
    "challenge",
    "captcha",
    "failed to parse chapter",
];

const PERMANENT_MARKERS: &[&str] = &[
    "unsupported site",
    "no such story",
    "story has been removed",
    "story not found",
    "unrecoverable parse error",
];

/// Classify the combined stdout/stderr of a story-fetcher invocation.
///
/// Order of checks matters: force-indication and permanent failure are
/// checked before the broader transient-failure catch-all, since several
/// transient markers (e.g. "timeout") could otherwise shadow a more
/// specific signal.
pub fn classify(output: &str, success: bool) -> FetcherOutcome {
    let lower = output.to_ascii_lowercase();

    if success {
        return FetcherOutcome::Success {
            library_id: extract_added_id(&lower),
        };
    }

    if FORCE_MARKERS.iter().any(|m| lower.contains(m)) {
        return FetcherOutcome::ForceIndicated;
    }

    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return FetcherOutcome::PermanentFailure {
            reason: first_matching_line(output, PERMANENT_MARKERS),
        };
    }

    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return FetcherOutcome::TransientFailure {
            reason: first_matching_line(output, TRANSIENT_MARKERS),
        };
    }

    // Unrecognized failure text: treat as transient rather than silently
    // dropping the story (spec §7: infrastructure errors are retried).
    FetcherOutcome::TransientFailure {
        reason: "unrecognized fetcher failure".to_string(),
    }
}

fn extract_added_id(lower_output: &str) -> Option<String> {
    let marker = "added book ids:";
    let idx = lower_output.find(marker)?;
    let tail = &lower_output[idx + marker.len()..];
    tail.split_whitespace()
        .next()
        .map(|s| s.trim_matches(|c: char| !c.is_ascii_digit()).to_string())
        .filter(|s| !s.is_empty())
}

fn first_matching_line(output: &str, markers: &[&str]) -> String {
    output
        .lines()
        .find(|line| {
            let lower = line.to_ascii_lowercase();
            markers.iter().any(|m| lower.contains(m))
        })
        .unwrap_or(output)
        .trim()
        .to_string()
}
