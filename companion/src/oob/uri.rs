//! Pre-association seeding through companion URIs.
//!
//! A vehicle can hand out a URI (QR code, NFC tag) whose `oobData` query
//! parameter carries [`OutOfBandAssociationData`] as URL-safe base64 CBOR.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tracing::{info, instrument};
use url::Url;

use companion_common::messages::{self, CodecError, OutOfBandAssociationData};

/// Recognised query parameter holding pre-association data.
pub const OOB_DATA_PARAMETER: &str = "oobData";

// Parameter namespaces reserved for this protocol. A URI using them for
// anything unrecognised is not ours, or from a future build.
const RESERVED_PREFIXES: [&str; 2] = ["oob", "bat"];

#[derive(Debug, thiserror::Error)]
pub enum UriParseError {
    #[error("could not parse URI: {0}")]
    Parse(#[from] url::ParseError),
    #[error("query parameter '{0}' uses a reserved prefix")]
    ReservedParameter(String),
    #[error("could not decode out-of-band data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("could not interpret out-of-band data: {0}")]
    Codec(#[from] CodecError),
}

/// Extracts pre-association data from a companion URI.
///
/// Returns `Ok(None)` for a well-formed URI that simply does not carry any.
#[instrument(skip_all)]
pub fn parse_oob_uri(uri: &str) -> Result<Option<OutOfBandAssociationData>, UriParseError> {
    let url = Url::parse(uri)?;

    let mut oob_data = None;
    for (key, value) in url.query_pairs() {
        if key == OOB_DATA_PARAMETER {
            let bytes = URL_SAFE_NO_PAD.decode(value.as_bytes())?;
            oob_data = Some(messages::from_slice::<OutOfBandAssociationData>(&bytes)?);
        } else if RESERVED_PREFIXES.iter().any(|prefix| key.starts_with(prefix)) {
            return Err(UriParseError::ReservedParameter(key.into_owned()));
        }
    }

    if oob_data.is_some() {
        info!("URI carries pre-association data");
    }

    Ok(oob_data)
}
