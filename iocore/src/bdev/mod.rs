//! Leaf bdev drivers and URI based construction.

use async_trait::async_trait;

mod aio;
mod dev;
mod malloc;
mod null;
pub mod nvmx;
pub mod uri;

pub use dev::{bdev_create, bdev_destroy};
pub use uri::BdevError;

/// every leaf driver that can be built from a URI implements this
#[async_trait(? Send)]
pub(crate) trait CreateDestroy {
    type Error;

    async fn create(&self) -> Result<String, Self::Error>;
    async fn destroy(self: Box<Self>) -> Result<(), Self::Error>;
}

pub(crate) trait GetName {
    fn get_name(&self) -> String;
}
