//! A utility module with helpers for making and classifying API requests.

mod error;
mod provider;

pub(crate) use error::Error as ReqwestError;
#[cfg(test)]
pub(crate) use error::ErrorKind as ReqwestErrorKind;
pub(crate) use reqwest::Url;

/// Returns the base URL of a node given its registered address. Addresses
/// are normally bare host:port pairs, but a scheme is kept if present.
pub(crate) fn node_base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');

    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}
