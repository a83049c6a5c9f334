//! Creation and destruction of bdevs by URI. The scheme selects the leaf
//! driver, query parameters carry its configuration.

use std::convert::TryFrom;

use snafu::ResultExt;
use url::Url;

use crate::bdev::{
    aio,
    malloc,
    null,
    uri::{self, BdevError},
    CreateDestroy,
};

fn parse(uri: &str) -> Result<Device, BdevError> {
    let url = Url::parse(uri).context(uri::UriParseFailed {
        uri: uri.to_string(),
    })?;

    match url.scheme() {
        "aio" => Ok(Device::Aio(aio::Aio::try_from(&url)?)),
        "malloc" => Ok(Device::Malloc(malloc::Malloc::try_from(&url)?)),
        "null" => Ok(Device::Null(null::Null::try_from(&url)?)),
        scheme => Err(BdevError::UriSchemeUnsupported {
            scheme: scheme.to_string(),
        }),
    }
}

enum Device {
    Aio(aio::Aio),
    Malloc(malloc::Malloc),
    Null(null::Null),
}

/// Create a bdev from a URI; returns the bdev name.
pub async fn bdev_create(uri: &str) -> Result<String, BdevError> {
    info!("creating bdev from '{}'", uri);
    match parse(uri)? {
        Device::Aio(d) => d.create().await,
        Device::Malloc(d) => d.create().await,
        Device::Null(d) => d.create().await,
    }
}

/// Destroy the bdev previously created from the given URI.
pub async fn bdev_destroy(uri: &str) -> Result<(), BdevError> {
    info!("destroying bdev created from '{}'", uri);
    match parse(uri)? {
        Device::Aio(d) => Box::new(d).destroy().await,
        Device::Malloc(d) => Box::new(d).destroy().await,
        Device::Null(d) => Box::new(d).destroy().await,
    }
}
