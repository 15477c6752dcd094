//! Response Serializer Module
//!
//! Renders a cached byte stream plus its registry metadata into a
//! protocol-correct response. The filter hands every cache hit through this
//! seam so the response shape stays in one place.

use crate::registry::ImageMetadata;
use crate::store::{body_from_stream, ByteStream, ImageBody};
use crate::Result;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Contract for rendering a cache hit into a response.
pub trait ImageSerializer: Send + Sync {
    fn show(&self, image_meta: &ImageMetadata, image_iter: ByteStream)
        -> Result<Response<ImageBody>>;
}

/// Default serializer: raw image bytes with the legacy metadata headers.
pub struct ImageResponseSerializer;

impl ImageSerializer for ImageResponseSerializer {
    fn show(
        &self,
        image_meta: &ImageMetadata,
        image_iter: ByteStream,
    ) -> Result<Response<ImageBody>> {
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, image_meta.size)
            .header("x-image-meta-id", image_meta.id.as_str())
            .header("x-image-meta-size", image_meta.size);

        if let Some(checksum) = &image_meta.checksum {
            builder = builder.header("x-image-meta-checksum", checksum.as_str());
        }

        Ok(builder.body(body_from_stream(image_iter))?)
    }
}
