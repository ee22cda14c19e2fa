//! Container runtime image service messages.

use std::collections::HashMap;

use super::Timestamp;

/// Content descriptor of an image target.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Descriptor {
    /// Media type.
    #[prost(string, tag = "1")]
    pub media_type: String,
    /// Content digest.
    #[prost(string, tag = "2")]
    pub digest: String,
    /// Content size.
    #[prost(int64, tag = "3")]
    pub size: i64,
}

/// A named image.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Image {
    /// Reference (`registry/repo:tag`, `registry/repo@digest` or a bare digest).
    #[prost(string, tag = "1")]
    pub name: String,
    /// Labels.
    #[prost(map = "string, string", tag = "2")]
    pub labels: HashMap<String, String>,
    /// Root descriptor.
    #[prost(message, optional, tag = "3")]
    pub target: Option<Descriptor>,
    /// Creation time.
    #[prost(message, optional, tag = "7")]
    pub created_at: Option<Timestamp>,
    /// Last update time.
    #[prost(message, optional, tag = "8")]
    pub updated_at: Option<Timestamp>,
}

/// Lists images.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ListImagesRequest {
    /// Filters; empty lists everything.
    #[prost(string, repeated, tag = "1")]
    pub filters: Vec<String>,
}

/// Image listing.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ListImagesResponse {
    /// Images.
    #[prost(message, repeated, tag = "1")]
    pub images: Vec<Image>,
}

/// Deletes an image by name.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteImageRequest {
    /// Image name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Wait for the deletion to be garbage collected.
    #[prost(bool, tag = "2")]
    pub sync: bool,
}
