//! Container runtime support: image cache, registry settings and image GC.

mod image_cache;
mod image_gc;
pub mod reference;
mod registries;

pub use image_cache::{ImageCacheConfigController, REGISTRYD_SERVICE_ID, VOLUME_IMAGE_CACHE_DISK, VOLUME_IMAGE_CACHE_ISO};
pub use image_gc::{
    build_expected_digests, ImageGCController, ImageService, ImageServiceProvider, SocketImageServiceProvider,
    IMAGE_CLEANUP_INTERVAL, IMAGE_GC_GRACE_PERIOD,
};
pub use registries::{build_registries, RegistriesConfigController, WILDCARD_MIRROR};
