//! Built-in detection rules.

use std::borrow::Cow;

/// Raw (undecoded) traversal tokens, matched case-insensitively
const RAW_TRAVERSAL_TOKENS: &[&str] = &[
    "..",
    "%2e%2e",
    "%2e.",
    ".%2e",
    "%252e",
    "%c0%ae",
    "%2f",
    "%5c",
];

/// Paths that only scanners and intruders ask for
pub const DEFAULT_MALICIOUS_PATTERNS: &[&str] = &[
    // dotfiles and VCS metadata
    r"(^|/)\.(env|git|svn|hg|htaccess|htpasswd|ds_store|aws|ssh|bash_history)(/|$|\.)",
    // admin panels of software this site does not run
    r"(^|/)(wp-admin|wp-login\.php|wp-content|wp-includes|xmlrpc\.php|phpmyadmin|pma|administrator|cgi-bin)(/|$)",
    // server-side script and backup extensions
    r"\.(php\d?|phtml|asp|aspx|jsp|jspx|cgi|pl|bak|old|sql|swp)$",
    // sensitive OS paths
    r"(^|/)(etc/(passwd|shadow|hosts|group)|proc/self|windows/win\.ini|boot\.ini)",
];

/// Injection signatures checked against the query string and text bodies
pub const INJECTION_PATTERNS: &[&str] = &[
    r"union(\s|\+|/\*.*?\*/)+(all(\s|\+)+)?select",
    r"insert(\s|\+)+into(\s|\+).+values",
    r"drop(\s|\+)+(table|database)",
    r"'(\s|\+)*or(\s|\+)+'?\d+'?(\s|\+)*=(\s|\+)*'?\d+",
    r"<script[\s>/]",
    r"javascript:",
    r"\bon(error|load)(\s|\+)*=",
];

/// Known scanner and attack tool user agents (lowercase substrings)
pub const DEFAULT_USER_AGENT_BLACKLIST: &[&str] = &[
    "sqlmap",
    "nikto",
    "nmap",
    "masscan",
    "zgrab",
    "dirbuster",
    "gobuster",
    "wpscan",
    "acunetix",
    "nessus",
    "openvas",
    "w3af",
    "havij",
    "nuclei",
    "fuzz faster u fool",
];

/// Percent-decode once. `None` when the result is not valid UTF-8.
pub fn decode_once(input: &str) -> Option<Cow<'_, str>> {
    urlencoding::decode(input).ok()
}

/// Detect directory traversal in a path, segment or query.
///
/// Checks the raw input, the once-decoded and the twice-decoded forms.
/// Input that cannot be decoded counts as traversal.
pub fn has_traversal_token(input: &str) -> bool {
    if contains_raw_token(input) {
        return true;
    }

    let Some(once) = decode_once(input) else {
        return true;
    };
    if once.contains("..") || contains_raw_token(&once) {
        return true;
    }

    let Some(twice) = decode_once(&once) else {
        return true;
    };
    twice.contains("..")
}

/// Detect `../` style traversal inside a query string.
///
/// Encoded slashes are legitimate in query values, so only an actual
/// parent-directory step counts here.
pub fn query_has_traversal(query: &str) -> bool {
    let plus_decoded = query.replace('+', " ");
    let Some(once) = decode_once(&plus_decoded) else {
        return false;
    };
    let twice = decode_once(&once).unwrap_or(Cow::Borrowed(once.as_ref()));

    [once.as_ref(), twice.as_ref()]
        .iter()
        .any(|form| form.contains("../") || form.contains("..\\"))
}

fn contains_raw_token(input: &str) -> bool {
    let lower = input.to_ascii_lowercase();
    RAW_TRAVERSAL_TOKENS.iter().any(|token| lower.contains(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_traversal() {
        assert!(has_traversal_token(".."));
        assert!(has_traversal_token("../../etc/passwd"));
        assert!(has_traversal_token("a/../b"));
    }

    #[test]
    fn test_encoded_traversal() {
        assert!(has_traversal_token("%2e%2e"));
        assert!(has_traversal_token("%2E%2E%2Fetc"));
        assert!(has_traversal_token("%252e%252e"));
        assert!(has_traversal_token(".%2e"));
        assert!(has_traversal_token("%c0%ae%c0%ae"));
    }

    #[test]
    fn test_undecodable_input_is_traversal() {
        assert!(has_traversal_token("%ff%fe"));
    }

    #[test]
    fn test_query_traversal() {
        assert!(query_has_traversal("file=../../etc/passwd"));
        assert!(query_has_traversal("file=%2e%2e%2fconfig"));
        assert!(query_has_traversal("file=%252e%252e%252fconfig"));
        assert!(!query_has_traversal("redirect=%2Fnews%2F2024"));
        assert!(!query_has_traversal("q=wait..."));
    }

    #[test]
    fn test_clean_input() {
        assert!(!has_traversal_token("report-2024.pdf"));
        assert!(!has_traversal_token("annual%20report.pdf"));
        assert!(!has_traversal_token("2024/06/slide.png"));
    }
}
