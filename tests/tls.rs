mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use chrono::Datelike;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use ponghub::config::EndpointSpec;
use ponghub::monitors::probe::Prober;
use ponghub::monitors::validate::validate;
use ponghub::monitors::{EndpointKey, ProbeErrorKind, VerdictKind};

/// A private CA and a localhost certificate it signed, valid until 2040.
struct Pki {
    ca_pem: String,
    server_config: Arc<rustls::ServerConfig>,
}

fn pki() -> Pki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "PongHub Test CA");
    ca_params.distinguished_name = dn;
    ca_params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    ca_params.not_after = rcgen::date_time_ymd(2045, 1, 1);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let mut leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    leaf_params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "localhost");
    leaf_params.distinguished_name = dn;
    leaf_params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    leaf_params.not_after = rcgen::date_time_ymd(2040, 1, 1);
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    let chain = vec![leaf_cert.der().clone(), ca_cert.der().clone()];
    let key = rustls::pki_types::PrivateKeyDer::try_from(leaf_key.serialize_der()).unwrap();
    let server_config = rustls::ServerConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .unwrap();

    Pki {
        ca_pem: ca_cert.pem(),
        server_config: Arc::new(server_config),
    }
}

/// HTTPS server answering every request with `200 pong`.
async fn serve_tls(config: Arc<rustls::ServerConfig>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(config);
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                // Clients that reject the certificate abort the handshake.
                let Ok(mut tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\npong";
                if tls.write_all(response).await.is_ok() {
                    let _ = tls.shutdown().await;
                }
            });
        }
    });
    addr
}

fn spec(addr: SocketAddr, check_ssl: bool) -> EndpointSpec {
    let mut spec = EndpointSpec::new(format!("https://127.0.0.1:{}/health", addr.port()));
    spec.retries = Some(0);
    spec.timeout_secs = Some(5);
    spec.check_ssl = Some(check_ssl);
    spec
}

#[tokio::test]
async fn test_untrusted_certificate_is_a_tls_failure() {
    let pki = pki();
    let addr = serve_tls(pki.server_config).await;
    let prober = common::prober(common::env(&[]));
    let spec = spec(addr, true);

    let result = prober.probe(EndpointKey::new("secure", &spec.url), &spec).await;

    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ProbeErrorKind::Tls, "{}", error);
    assert!(result.status_code.is_none());
    assert_eq!(validate(&result, &spec).kind, VerdictKind::Down);
}

#[tokio::test]
async fn test_disabled_ssl_check_accepts_untrusted_certificate() {
    let pki = pki();
    let addr = serve_tls(pki.server_config).await;
    let prober = common::prober(common::env(&[]));
    let spec = spec(addr, false);

    let result = prober.probe(EndpointKey::new("secure", &spec.url), &spec).await;

    assert!(result.error.is_none(), "{:?}", result.error);
    assert_eq!(result.status_code, Some(200));
    assert!(result.cert_expiry.is_none());
    assert_eq!(validate(&result, &spec).kind, VerdictKind::Healthy);
}

#[tokio::test]
async fn test_trusted_root_reports_certificate_expiry() {
    let pki = pki();
    let addr = serve_tls(pki.server_config).await;
    let prober = Prober::with_root_certificates(
        common::fast_policy(),
        common::env(&[]),
        &[pki.ca_pem.into_bytes()],
    )
    .unwrap();
    let spec = spec(addr, true);

    let result = prober.probe(EndpointKey::new("secure", &spec.url), &spec).await;

    assert!(result.error.is_none(), "{:?}", result.error);
    assert_eq!(result.status_code, Some(200));
    assert_eq!(result.body.as_deref(), Some("pong"));
    assert_eq!(result.cert_expiry.unwrap().year(), 2040);
    assert!(validate(&result, &spec).is_healthy());
}
