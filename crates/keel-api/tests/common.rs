//! Shared helpers for wire layer integration tests.

use keel_api::TlsMaterial;

/// Self-signed certificate for `localhost`.
pub fn self_signed() -> TlsMaterial {
    let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    TlsMaterial {
        cert_pem: ck.cert.pem().into_bytes(),
        key_pem: ck.key_pair.serialize_pem().into_bytes(),
    }
}
