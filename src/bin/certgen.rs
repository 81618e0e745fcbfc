//! `cairn-certgen`: generates a throwaway CA and a handful of peer
//! cert/key pairs for local testing. Not part of the exchange protocol
//! itself — a convenience tool, in the same spirit as the teacher's own
//! keygen binary.

use cairn::config::CertgenArgs;
use clap::Parser;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use std::fs;

fn main() {
    let args = CertgenArgs::parse();

    if let Err(e) = fs::create_dir_all(&args.out_dir) {
        eprintln!("failed to create output directory: {e}");
        std::process::exit(1);
    }

    let ca_key = KeyPair::generate().expect("CA key generation");
    let mut ca_params = CertificateParams::new(Vec::new()).expect("CA params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "cairn test CA");
        dn
    };
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .expect("CA self-signature");

    let ca_cert_path = args.out_dir.join("ca.pem");
    let ca_key_path = args.out_dir.join("ca.key.pem");
    fs::write(&ca_cert_path, ca_cert.pem()).expect("write CA cert");
    fs::write(&ca_key_path, ca_key.serialize_pem()).expect("write CA key");
    println!("CA cert: {}", ca_cert_path.display());
    println!("CA key:  {}", ca_key_path.display());

    for i in 0..args.peer_count {
        let peer_key = KeyPair::generate().expect("peer key generation");
        let common_name = format!("cairn-peer-{i}");
        let mut params =
            CertificateParams::new(vec![common_name.clone()]).expect("peer params");
        params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, common_name.clone());
            dn
        };
        let cert = params
            .signed_by(&peer_key, &ca_cert, &ca_key)
            .expect("peer cert signing");

        let cert_path = args.out_dir.join(format!("{common_name}.pem"));
        let key_path = args.out_dir.join(format!("{common_name}.key.pem"));
        fs::write(&cert_path, cert.pem()).expect("write peer cert");
        fs::write(&key_path, peer_key.serialize_pem()).expect("write peer key");
        println!("peer {i} cert: {}", cert_path.display());
        println!("peer {i} key:  {}", key_path.display());
    }
}
