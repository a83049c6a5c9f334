//! Errors and helpers for bdev construction by URI.

use std::{collections::HashMap, num::ParseIntError};

use snafu::Snafu;
use url::{ParseError, Url};

use crate::core::CoreError;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum BdevError {
    #[snafu(display("invalid URI '{}'", uri))]
    UriParseFailed { source: ParseError, uri: String },
    #[snafu(display("unsupported URI scheme '{}'", scheme))]
    UriSchemeUnsupported { scheme: String },
    #[snafu(display("invalid URI '{}': {}", uri, message))]
    UriInvalid { uri: String, message: String },
    #[snafu(display(
        "invalid value for parameter '{}' in URI '{}'",
        parameter,
        uri
    ))]
    IntParamParseFailed {
        source: ParseIntError,
        uri: String,
        parameter: String,
    },
    #[snafu(display("bdev {} already exists", name))]
    BdevExists { name: String },
    #[snafu(display("bdev {} not found", name))]
    BdevNotFound { name: String },
    #[snafu(display("failed to create bdev {}: {}", name, source))]
    CreateBdev { source: CoreError, name: String },
    #[snafu(display("failed to destroy bdev {}: {}", name, source))]
    DestroyBdev { source: CoreError, name: String },
}

/// path segments of the URL, empty strings filtered out
pub(crate) fn segments(url: &Url) -> Vec<&str> {
    url.path_segments()
        .map(|s| s.filter(|s| !s.is_empty()).collect())
        .unwrap_or_else(Vec::new)
}

/// remaining keys after parameter extraction, for warning about ignored
/// parameters
pub(crate) fn keys(parameters: HashMap<String, String>) -> Option<String> {
    if parameters.is_empty() {
        None
    } else {
        Some(
            parameters
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}
