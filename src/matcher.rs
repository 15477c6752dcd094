//! Request Matcher Module
//!
//! Classifies inbound requests into cacheable single-image operations. Only
//! two path shapes address cacheable binary content: the v1 single-image path
//! and the v2 `/file` data path. Everything else, including the v1 `detail`
//! listing endpoint, is left alone.

use hyper::{Method, Uri};

/// API generation a matched path belongs to. The generations expose image
/// integrity under different response headers, so downstream processing keys
/// off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiVersion::V1 => write!(f, "v1"),
            ApiVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Result of classifying a request against the cacheable path shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMatch {
    pub version: ApiVersion,
    pub method: Method,
    pub image_id: String,
}

/// Match a request against the cacheable image-data path shapes.
///
/// Recognized shapes:
/// - `/v1/images/{id}` for any verb, with `detail` excluded (that path is the
///   listing endpoint, not a single image)
/// - `/v2/images/{id}/file` for any verb; the bare v2 image path addresses
///   metadata, not bytes, and does not match
///
/// Matching is purely syntactic on the path; query strings never affect the
/// outcome. Returns `None` for anything else, including unknown API versions.
pub fn match_request(method: &Method, uri: &Uri) -> Option<CacheMatch> {
    let segments: Vec<&str> = uri.path().trim_start_matches('/').split('/').collect();

    let (version, image_id) = match segments.as_slice() {
        ["v1", "images", image_id] if !image_id.is_empty() && *image_id != "detail" => {
            (ApiVersion::V1, *image_id)
        }
        ["v2", "images", image_id, "file"] if !image_id.is_empty() => (ApiVersion::V2, *image_id),
        _ => return None,
    };

    Some(CacheMatch {
        version,
        method: method.clone(),
        image_id: image_id.to_string(),
    })
}
