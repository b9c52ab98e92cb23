//! TLS helpers shared by the TCP and HTTP probes.

use std::pin::Pin;

use openssl::asn1::Asn1Time;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509Ref;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use super::ProbeError;

/// Days until the certificate's `not_after`, negative once expired.
pub(crate) fn expires_in_days(cert: &X509Ref) -> Result<f64, ProbeError> {
    let now = Asn1Time::days_from_now(0).map_err(|e| ProbeError::Tls(e.to_string()))?;
    let diff = now
        .diff(cert.not_after())
        .map_err(|e| ProbeError::Tls(e.to_string()))?;
    Ok(diff.days as f64 + diff.secs as f64 / 86_400.0)
}

/// Perform a TLS handshake over an established TCP connection.
pub(crate) async fn handshake(
    tcp: TcpStream,
    server_name: &str,
    no_check_certificate: bool,
) -> Result<SslStream<TcpStream>, ProbeError> {
    let mut builder =
        SslConnector::builder(SslMethod::tls()).map_err(|e| ProbeError::Tls(e.to_string()))?;
    if no_check_certificate {
        builder.set_verify(SslVerifyMode::NONE);
    }
    let connector = builder.build();
    let ssl = connector
        .configure()
        .and_then(|config| config.into_ssl(server_name))
        .map_err(|e| ProbeError::Tls(e.to_string()))?;
    let mut stream =
        SslStream::new(ssl, tcp).map_err(|e| ProbeError::Tls(e.to_string()))?;
    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|e| ProbeError::Tls(e.to_string()))?;
    Ok(stream)
}

/// Dial `host:port`, handshake, and report the peer leaf certificate's
/// remaining validity in days.
pub(crate) async fn certificate_expires_in_days(
    host: &str,
    port: u16,
    no_check_certificate: bool,
) -> Result<f64, ProbeError> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| ProbeError::Connect(e.to_string()))?;
    let stream = handshake(tcp, host, no_check_certificate).await?;
    let cert = stream
        .ssl()
        .peer_certificate()
        .ok_or_else(|| ProbeError::Tls("no peer certificate".to_string()))?;
    expires_in_days(&cert)
}

#[cfg(test)]
pub(crate) mod testutil {
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::x509::{X509NameBuilder, X509};

    pub(crate) fn self_signed(valid_days: u32) -> (X509, PKey<Private>) {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(valid_days).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        (builder.build(), key)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::self_signed;
    use super::*;

    #[test]
    fn expiry_days_reflect_not_after() {
        let (cert, _) = self_signed(30);
        let days = expires_in_days(&cert).unwrap();
        assert!((29.0..=31.0).contains(&days), "got {days}");
    }

    #[test]
    fn expiry_days_near_zero_for_fresh_deadline() {
        let (cert, _) = self_signed(1);
        let days = expires_in_days(&cert).unwrap();
        assert!((0.0..=1.5).contains(&days), "got {days}");
    }
}
