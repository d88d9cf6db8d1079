use anyhow::{Context, Result};
use url::Url;

/// Canonical form used to compare repository URLs: lowercase scheme and host,
/// no trailing slash, no `.git` suffix.
pub fn normalize_repo_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    match Url::parse(trimmed) {
        Ok(parsed) => {
            let mut out = format!("{}://", parsed.scheme());
            if let Some(host) = parsed.host_str() {
                out.push_str(&host.to_ascii_lowercase());
            }
            if let Some(port) = parsed.port() {
                out.push_str(&format!(":{port}"));
            }
            out.push_str(parsed.path().trim_end_matches('/'));
            out
        }
        Err(_) => trimmed.to_string(),
    }
}

/// `scheme://host[:port]` of a URL.
pub fn base_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("invalid URL {url}"))?;
    let host = parsed.host_str().with_context(|| format!("URL {url} has no host"))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

/// Strip `refs/heads/` from a ref name.
pub fn branch_name(reference: &str) -> &str {
    reference.strip_prefix("refs/heads/").unwrap_or(reference)
}

/// First line of a commit message.
pub fn first_line(message: &str) -> &str { message.lines().next().unwrap_or_default() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_repo_url() {
        let cases: &[(&str, &str)] = &[
            ("https://Example.COM/Owner/Repo", "https://example.com/Owner/Repo"),
            ("https://example.com/owner/repo/", "https://example.com/owner/repo"),
            ("https://example.com/owner/repo.git", "https://example.com/owner/repo"),
            ("http://example.com:3000/owner/repo", "http://example.com:3000/owner/repo"),
            ("not a url/", "not a url"),
        ];
        for &(input, expected) in cases {
            assert_eq!(normalize_repo_url(input), expected, "{input}");
        }
    }

    #[test]
    fn test_base_url() {
        assert_eq!(
            base_url("https://bb.example.com/projects/P/repos/r").unwrap(),
            "https://bb.example.com"
        );
        assert_eq!(base_url("http://localhost:7990/scm").unwrap(), "http://localhost:7990");
        assert!(base_url("nope").is_err());
    }

    #[test]
    fn test_branch_name() {
        assert_eq!(branch_name("refs/heads/main"), "main");
        assert_eq!(branch_name("refs/heads/feature/x"), "feature/x");
        assert_eq!(branch_name("main"), "main");
        assert_eq!(first_line("title\n\nbody"), "title");
        assert_eq!(first_line(""), "");
    }
}
