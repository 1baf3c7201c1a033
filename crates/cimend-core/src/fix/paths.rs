//! Repository-relative path checks and protected-path globs.

use super::error::FixError;

/// Default protected globs: CI configuration and secret material.
pub fn default_protected_globs() -> Vec<String> {
    vec![
        ".github/**".to_string(),
        ".gitlab-ci.yml".to_string(),
        "**/.env".to_string(),
        "**/.env.*".to_string(),
        "**/*.pem".to_string(),
        "**/*.key".to_string(),
        "**/secrets/**".to_string(),
    ]
}

/// Normalize a provider-supplied path to a clean repository-relative form.
///
/// Rejects absolute paths, drive prefixes, `..` components and anything
/// inside `.git`.
pub fn normalize_repo_path(raw: &str) -> Result<String, FixError> {
    let unified = raw.trim().replace('\\', "/");
    let outside = || FixError::OutsideRepository {
        path: raw.to_string(),
    };

    if unified.is_empty() || unified.starts_with('/') {
        return Err(outside());
    }
    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(outside());
    }

    let mut parts = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(outside()),
            ".git" => return Err(outside()),
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return Err(outside());
    }
    Ok(parts.join("/"))
}

/// Match one path segment against a pattern segment (`*` and `?` wildcards).
fn segment_match(pattern: &[u8], value: &[u8]) -> bool {
    let (mut pi, mut vi) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while vi < value.len() {
        if pi < pattern.len() && (pattern[pi] == b'?' || pattern[pi] == value[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < pattern.len() && pattern[pi] == b'*' {
            star = Some(pi);
            pi += 1;
            mark = vi;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            vi = mark;
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == b'*' {
        pi += 1;
    }
    pi == pattern.len()
}

fn segments_match(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| segments_match(rest, &path[skip..])),
        Some((head, rest)) => match path.split_first() {
            Some((seg, path_rest)) => {
                segment_match(head.as_bytes(), seg.as_bytes()) && segments_match(rest, path_rest)
            }
            None => false,
        },
    }
}

/// Glob match over `/`-separated paths: `*` and `?` stay within a segment,
/// `**` spans any number of segments (including none).
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let p: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let v: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    segments_match(&p, &v)
}
