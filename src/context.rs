//! Request Context Module
//!
//! Per-request stash carrying the matched image id and verb from the request
//! side of the pipeline to the response side. The stash lives in the
//! request's `Extensions` under a typed key, so it is scoped strictly to one
//! request and can never leak across requests. Absence means no cache
//! decision was made upstream and the response hook must pass through.

use hyper::{Method, Request};

/// Typed stash entry: the image id and verb a matched request was classified
/// as. Stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStash {
    pub image_id: String,
    pub method: Method,
}

/// Associate `(image_id, method)` with the request, overwriting any prior
/// association.
pub fn stash_request_info<B>(request: &mut Request<B>, image_id: &str, method: Method) {
    request.extensions_mut().insert(CacheStash {
        image_id: image_id.to_string(),
        method,
    });
}

/// Retrieve the stashed `(image_id, method)` pair, or `None` if the request
/// never matched.
pub fn fetch_request_info<B>(request: &Request<B>) -> Option<(String, Method)> {
    request
        .extensions()
        .get::<CacheStash>()
        .map(|stash| (stash.image_id.clone(), stash.method.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stash_then_fetch() {
        let mut request = Request::new(());
        stash_request_info(&mut request, "asdf", Method::GET);

        let (image_id, method) = fetch_request_info(&request).unwrap();
        assert_eq!("asdf", image_id);
        assert_eq!(Method::GET, method);
    }

    #[test]
    fn test_fetch_unset() {
        let request = Request::new(());
        assert_eq!(None, fetch_request_info(&request));
    }

    #[test]
    fn test_stash_overwrites() {
        let mut request = Request::new(());
        stash_request_info(&mut request, "first", Method::GET);
        stash_request_info(&mut request, "second", Method::DELETE);

        let (image_id, method) = fetch_request_info(&request).unwrap();
        assert_eq!("second", image_id);
        assert_eq!(Method::DELETE, method);
    }
}
