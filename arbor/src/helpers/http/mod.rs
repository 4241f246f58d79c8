//! Helpers for HTTP request handling and response generation.

pub mod path;
pub mod status;

use log::trace;
use percent_encoding::percent_decode_str;

/// Represents data that has been successfully percent decoded and is valid UTF-8.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PercentDecoded {
    val: String,
}

impl PercentDecoded {
    /// Attempt to decode data that has been provided in a percent encoded format and ensure that
    /// the result is valid UTF-8.
    ///
    /// On success, the decoded data is returned as a `PercentDecoded` value, which allows a
    /// compile-time check that the decode has occurred in places where it's assumed to have
    /// occurred.
    pub(crate) fn new(raw: &str) -> Option<Self> {
        match percent_decode_str(raw).decode_utf8() {
            Ok(pd) => {
                trace!(" percent_decode: {}, src: {}", pd, raw);
                Some(PercentDecoded {
                    val: pd.into_owned(),
                })
            }
            Err(_) => {
                trace!(" percent_decode: error, src: {}", raw);
                None
            }
        }
    }

    /// The decoded value.
    pub(crate) fn val(&self) -> &str {
        &self.val
    }
}

impl AsRef<str> for PercentDecoded {
    fn as_ref(&self) -> &str {
        &self.val
    }
}

/// Decode form-urlencoded strings (e.g. a query string, or a request body with Content-Type:
/// application/x-www-form-urlencoded).
pub(crate) fn form_url_decode(raw: &str) -> Result<String, std::str::Utf8Error> {
    match percent_decode_str(&raw.replace('+', " ")).decode_utf8() {
        Ok(pd) => Ok(pd.into_owned()),
        Err(e) => {
            trace!(" form_url_decode: error, src: {}", raw);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_valid_percent_decode() {
        let pd = PercentDecoded::new("%41+%42%2B%63%20%64").unwrap();
        assert_eq!("A+B+c d", pd.as_ref());
    }

    #[test]
    fn ensure_valid_form_url_decode() {
        let v = form_url_decode("%41+%42%2B%63%20%64").unwrap();
        assert_eq!("A B+c d", v);
    }
}
