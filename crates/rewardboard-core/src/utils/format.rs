/// Number of leading token characters shown in logs
const TOKEN_PREVIEW_LEN: usize = 20;

/// Shorten a bearer token for log output so the full credential never lands in a log file
pub fn redact_token(token: &str) -> String {
    let len = token.chars().count();
    let shown = if len <= TOKEN_PREVIEW_LEN { len / 2 } else { TOKEN_PREVIEW_LEN };
    format!("{}...", token.chars().take(shown).collect::<String>())
}

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Join an API base URL and a request path without doubling or dropping the slash
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
