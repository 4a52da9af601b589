//! Path rules for requests proxied to a service instance.

use axum::http::Method;

use crate::error::{Result, TsuruError};

/// Paths under an instance that only accept GET through the proxy.
pub const RESERVED_PROXY_PATHS: &[&str] = &["", "bind-app", "bind"];

/// Collapses repeated slashes and resolves `.`/`..`. A `..` that would climb
/// above the instance root is rejected.
pub fn normalize_proxy_path(path: &str) -> Result<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(TsuruError::InvalidProxyPath);
                }
            }
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

/// Service API path for `path` proxied to `instance` with `method`.
pub fn instance_target(instance: &str, method: &Method, path: &str) -> Result<String> {
    let path = normalize_proxy_path(path)?;
    if method != Method::GET && RESERVED_PROXY_PATHS.contains(&path.as_str()) {
        return Err(TsuruError::InvalidInput(format!(
            "proxy request {method} {path:?} is forbidden"
        )));
    }
    Ok(format!("/resources/{instance}/{path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_normalized() {
        assert_eq!(normalize_proxy_path("/").unwrap(), "");
        assert_eq!(normalize_proxy_path("//a///b/").unwrap(), "a/b");
        assert_eq!(normalize_proxy_path("./a/./b").unwrap(), "a/b");
        assert_eq!(normalize_proxy_path("a/../bind").unwrap(), "bind");
    }

    #[test]
    fn escaping_the_instance_is_rejected() {
        for bad in ["..", "../other", "a/../../x", "/../../resources"] {
            assert!(
                matches!(normalize_proxy_path(bad), Err(TsuruError::InvalidProxyPath)),
                "{bad}"
            );
        }
    }

    #[test]
    fn reserved_paths_only_allow_get() {
        assert_eq!(
            instance_target("my-mysql", &Method::GET, "/bind-app").unwrap(),
            "/resources/my-mysql/bind-app"
        );
        for path in ["", "/", "bind-app", "/bind/", "x/../bind"] {
            let err = instance_target("my-mysql", &Method::POST, path).unwrap_err();
            assert!(err.to_string().contains("is forbidden"), "{path}: {err}");
        }
        assert_eq!(
            instance_target("my-mysql", &Method::DELETE, "/backups//1").unwrap(),
            "/resources/my-mysql/backups/1"
        );
    }
}
