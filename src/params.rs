//! Runtime parameters for dynamic routes
//!
//! Before a terminal session on a dynamic route is tunneled, the query string
//! of the connecting request is written as JSON to a per-route file. The
//! backend finds the file through the `TTYGATE_PARAMS_FILE` environment
//! variable:
//!
//! ```json
//! {"type":"query_params","params":{"args":"--fast,--level=3"},"timestamp":"..."}
//! ```

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Serialize)]
struct ParamsFile<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    params: &'a BTreeMap<String, String>,
    timestamp: String,
}

/// Path of the parameter file for a route
///
/// The prefix is percent-encoded, so distinct prefixes never share a file.
pub fn params_file_path(dir: &Path, prefix: &str) -> PathBuf {
    let relative = prefix.strip_prefix('/').unwrap_or(prefix);
    dir.join(format!("ttygate_params_{}.json", urlencoding::encode(relative)))
}

/// Decode a query string into parameters; later keys win
pub fn parse_query(query: Option<&str>) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let Some(query) = query else {
        return params;
    };

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode(key);
        if key.is_empty() {
            continue;
        }
        params.insert(key, decode(value));
    }
    params
}

fn decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

/// Write the request's query parameters to `path`
///
/// The file is written to a temporary name and renamed so a backend never
/// reads a partial document.
pub fn write_query_params(path: &Path, query: Option<&str>) -> std::io::Result<()> {
    let params = parse_query(query);
    let doc = ParamsFile {
        kind: "query_params",
        params: &params,
        timestamp: Utc::now().to_rfc3339(),
    };
    let json = serde_json::to_vec(&doc).map_err(std::io::Error::other)?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;

    debug!(path = %path.display(), count = params.len(), "Wrote route parameters");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_file_path_is_per_route() {
        let dir = Path::new("/tmp");
        assert_eq!(
            params_file_path(dir, "/"),
            PathBuf::from("/tmp/ttygate_params_.json")
        );
        assert_eq!(
            params_file_path(dir, "/games/snake"),
            PathBuf::from("/tmp/ttygate_params_games%2Fsnake.json")
        );
        assert_ne!(params_file_path(dir, "/a"), params_file_path(dir, "/b"));
    }

    #[test]
    fn test_params_file_path_distinguishes_similar_prefixes() {
        let dir = Path::new("/tmp");
        let paths: std::collections::HashSet<PathBuf> = ["/a-b", "/a_b", "/a/b", "/a.b", "/root", "/"]
            .iter()
            .map(|prefix| params_file_path(dir, prefix))
            .collect();
        assert_eq!(paths.len(), 6);
    }

    #[test]
    fn test_parse_query() {
        let params = parse_query(Some("args=--fast%2C--level%3D3&name=a+b&flag"));
        assert_eq!(params.get("args").unwrap(), "--fast,--level=3");
        assert_eq!(params.get("name").unwrap(), "a b");
        assert_eq!(params.get("flag").unwrap(), "");

        assert!(parse_query(None).is_empty());
        assert!(parse_query(Some("")).is_empty());
    }

    #[test]
    fn test_write_query_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = params_file_path(dir.path(), "/snake");

        write_query_params(&path, Some("args=--fast")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["type"], "query_params");
        assert_eq!(json["params"]["args"], "--fast");
        assert!(json["timestamp"].is_string());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_write_overwrites_previous_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = params_file_path(dir.path(), "/snake");

        write_query_params(&path, Some("args=one")).unwrap();
        write_query_params(&path, None).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(json["params"].as_object().unwrap().is_empty());
    }
}
