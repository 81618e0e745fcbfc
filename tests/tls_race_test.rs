//! Symmetric TLS handshake race, exercised end to end with throwaway
//! certificates generated on the fly.

use cairn::tls::{self, TlsMaterial};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use std::fs;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const SERVER_NAME: &str = "cairn-test";

fn generate_material(dir: &std::path::Path) -> TlsMaterial {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "cairn test CA");
        dn
    };
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let mut leaf_params = CertificateParams::new(vec![SERVER_NAME.to_string()]).unwrap();
    leaf_params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, SERVER_NAME);
        dn
    };
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    let cert_path = dir.join("leaf.pem");
    let key_path = dir.join("leaf.key.pem");
    let ca_path = dir.join("ca.pem");
    fs::write(&cert_path, leaf_cert.pem()).unwrap();
    fs::write(&key_path, leaf_key.serialize_pem()).unwrap();
    fs::write(&ca_path, ca_cert.pem()).unwrap();

    TlsMaterial::load(&cert_path, &key_path, &ca_path).unwrap()
}

/// Both ends race the handshake concurrently and end up able to exchange
/// application data, regardless of which side's ClientHello random won the
/// tie-break.
#[tokio::test]
async fn race_completes_and_carries_data() {
    let dir = tempdir().unwrap();
    let material = generate_material(dir.path());

    let (a_io, b_io) = tokio::io::duplex(64 * 1024);
    let a_material = material.clone();
    let b_material = material.clone();

    let a_task = tokio::spawn(async move { tls::race(a_io, &a_material, SERVER_NAME).await });
    let b_task = tokio::spawn(async move { tls::race(b_io, &b_material, SERVER_NAME).await });

    let (a_result, b_result) = tokio::join!(a_task, b_task);
    let mut a_stream = a_result.unwrap().expect("side A handshake");
    let mut b_stream = b_result.unwrap().expect("side B handshake");

    a_stream.write_all(b"ping").await.unwrap();
    a_stream.flush().await.unwrap();
    let mut buf = [0u8; 4];
    b_stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    b_stream.write_all(b"pong").await.unwrap();
    b_stream.flush().await.unwrap();
    let mut buf = [0u8; 4];
    a_stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}
