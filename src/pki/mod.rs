//! Cluster PKI generation and CA discovery hashes
//!
//! The bootstrap engine asks the [`PkiProvider`] for a complete cluster PKI:
//! the cluster, front-proxy, and etcd certificate authorities, the
//! service-account signing keypair, and client-certificate kubeconfigs for
//! the admin, kubelet, controller-manager, and scheduler, plus the
//! customer-facing kubeconfig that points at the public endpoint.
//!
//! Joining nodes verify the control plane against a CA *discovery hash*: the
//! SHA-256 of the DER-encoded SubjectPublicKeyInfo of a cluster CA
//! certificate. [`discovery_hashes`] computes these from the CA bundle
//! embedded in a kubeconfig, so the pin a node checks is byte-for-byte the
//! pin the engine advertised.

pub mod kubeconfig;

use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use x509_parser::prelude::*;

#[cfg(test)]
use mockall::automock;

use kubeconfig::KubeConfig;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Certificate or kubeconfig parsing error
    #[error("parse error: {0}")]
    ParseError(String),

    /// A kubeconfig carried no CA certificates to pin
    #[error("no CA certificates found in kubeconfig")]
    MissingCaCertificates,
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// A certificate and its private key, both PEM-encoded
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertPair {
    /// Certificate PEM
    pub cert_pem: String,
    /// Private key PEM
    pub key_pem: String,
}

/// Inputs for PKI generation, all derived deterministically from the cloud
/// configuration before this is built
#[derive(Clone, Debug, Default)]
pub struct PkiParams {
    /// Cluster name used in kubeconfig cluster/context entries
    pub cluster_name: String,
    /// Public DNS name; the customer kubeconfig points at `https://<this>:443`
    pub public_dns_name: String,
    /// Internal DNS name; component kubeconfigs point at `https://<this>:6443`
    pub internal_dns_name: String,
}

/// Everything the PKI provider produces for one cluster
#[derive(Clone, Debug, Default)]
pub struct PkiBundle {
    /// Cluster CA
    pub ca: CertPair,
    /// Front-proxy CA
    pub front_proxy_ca: CertPair,
    /// etcd CA
    pub etcd_ca: CertPair,
    /// Service-account signing key (PEM)
    pub service_account_key_pem: String,
    /// Service-account public key (PEM)
    pub service_account_pub_pem: String,
    /// Admin kubeconfig against the internal endpoint
    pub admin_kubeconfig: String,
    /// Kubelet kubeconfig
    pub kubelet_kubeconfig: String,
    /// Controller-manager kubeconfig
    pub controller_manager_kubeconfig: String,
    /// Scheduler kubeconfig
    pub scheduler_kubeconfig: String,
    /// Admin-equivalent kubeconfig against `https://<publicDns>:443`
    pub customer_kubeconfig: String,
}

/// Generates a complete cluster PKI
#[cfg_attr(test, automock)]
pub trait PkiProvider: Send + Sync {
    /// Generate CAs, the service-account keypair, and all kubeconfigs
    fn create_pki(&self, params: &PkiParams) -> Result<PkiBundle>;
}

/// The kubeadm-compatible PKI provider
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeadmPki;

impl KubeadmPki {
    /// Create the provider
    pub fn new() -> Self {
        Self
    }

    fn new_ca(common_name: &str) -> Result<CertPair> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(10);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {e}"))
        })?;
        let key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {e}"))
        })?;

        Ok(CertPair {
            cert_pem: cert.pem(),
            key_pem,
        })
    }

    fn client_cert(ca: &CertPair, common_name: &str, organization: Option<&str>) -> Result<CertPair> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        if let Some(org) = organization {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
        }
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let (not_before, not_after) = compute_validity(1);
        params.not_before = not_before;
        params.not_after = not_after;

        let client_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate client key: {e}"))
        })?;
        let client_key_pem = client_key.serialize_pem();

        let ca_key = KeyPair::from_pem(&ca.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {e}")))?;

        let cert = params.signed_by(&client_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign client cert: {e}"))
        })?;

        Ok(CertPair {
            cert_pem: cert.pem(),
            key_pem: client_key_pem,
        })
    }

    fn component_kubeconfig(
        ca: &CertPair,
        params: &PkiParams,
        server: &str,
        user_name: &str,
        common_name: &str,
        organization: Option<&str>,
    ) -> Result<String> {
        let client = Self::client_cert(ca, common_name, organization)?;
        KubeConfig::with_client_cert(
            &params.cluster_name,
            server,
            &ca.cert_pem,
            user_name,
            &client.cert_pem,
            &client.key_pem,
        )
        .to_yaml()
        .map_err(|e| PkiError::ParseError(format!("failed to render kubeconfig: {e}")))
    }
}

impl PkiProvider for KubeadmPki {
    fn create_pki(&self, params: &PkiParams) -> Result<PkiBundle> {
        let ca = Self::new_ca("kubernetes")?;
        let front_proxy_ca = Self::new_ca("front-proxy-ca")?;
        let etcd_ca = Self::new_ca("etcd-ca")?;

        let sa_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate service-account key: {e}"))
        })?;

        let internal_server = format!("https://{}:6443", params.internal_dns_name);
        let public_server = format!("https://{}:443", params.public_dns_name);

        let admin_kubeconfig = Self::component_kubeconfig(
            &ca,
            params,
            &internal_server,
            "kubernetes-admin",
            "kubernetes-admin",
            Some("system:masters"),
        )?;
        let kubelet_kubeconfig = Self::component_kubeconfig(
            &ca,
            params,
            &internal_server,
            "default-auth",
            &format!("system:node:{}", params.cluster_name),
            Some("system:nodes"),
        )?;
        let controller_manager_kubeconfig = Self::component_kubeconfig(
            &ca,
            params,
            &internal_server,
            "system:kube-controller-manager",
            "system:kube-controller-manager",
            None,
        )?;
        let scheduler_kubeconfig = Self::component_kubeconfig(
            &ca,
            params,
            &internal_server,
            "system:kube-scheduler",
            "system:kube-scheduler",
            None,
        )?;
        let customer_kubeconfig = Self::component_kubeconfig(
            &ca,
            params,
            &public_server,
            "kubernetes-admin",
            "kubernetes-admin",
            Some("system:masters"),
        )?;

        Ok(PkiBundle {
            service_account_key_pem: sa_key.serialize_pem(),
            service_account_pub_pem: sa_key.public_key_pem(),
            ca,
            front_proxy_ca,
            etcd_ca,
            admin_kubeconfig,
            kubelet_kubeconfig,
            controller_manager_kubeconfig,
            scheduler_kubeconfig,
            customer_kubeconfig,
        })
    }
}

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

/// SPKI pin of a PEM-encoded certificate: `sha256:<hex>` over the
/// DER-encoded SubjectPublicKeyInfo
pub fn spki_pin(cert_pem: &str) -> Result<String> {
    let pem = ::pem::parse(cert_pem.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate PEM: {e}")))?;
    let (_, cert) = X509Certificate::from_der(pem.contents())
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate DER: {e}")))?;

    let digest = aws_lc_rs::digest::digest(
        &aws_lc_rs::digest::SHA256,
        cert.tbs_certificate.subject_pki.raw,
    );
    Ok(format!("sha256:{}", hex(digest.as_ref())))
}

/// SPKI pins of every CA certificate embedded in a kubeconfig.
///
/// Fails with [`PkiError::MissingCaCertificates`] when the kubeconfig
/// carries no `certificate-authority-data`.
pub fn discovery_hashes(kubeconfig_yaml: &str) -> Result<Vec<String>> {
    let config: KubeConfig = serde_yaml::from_str(kubeconfig_yaml)
        .map_err(|e| PkiError::ParseError(format!("failed to parse kubeconfig: {e}")))?;

    let ca_data = config
        .clusters
        .first()
        .map(|c| c.cluster.certificate_authority_data.as_str())
        .unwrap_or_default();
    if ca_data.is_empty() {
        return Err(PkiError::MissingCaCertificates);
    }

    let ca_bundle = STANDARD
        .decode(ca_data)
        .map_err(|e| PkiError::ParseError(format!("failed to decode CA bundle: {e}")))?;

    let mut pins = Vec::new();
    for pem in ::pem::parse_many(&ca_bundle)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA bundle: {e}")))?
    {
        let (_, cert) = X509Certificate::from_der(pem.contents())
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA certificate: {e}")))?;
        let digest = aws_lc_rs::digest::digest(
            &aws_lc_rs::digest::SHA256,
            cert.tbs_certificate.subject_pki.raw,
        );
        pins.push(format!("sha256:{}", hex(digest.as_ref())));
    }

    if pins.is_empty() {
        return Err(PkiError::MissingCaCertificates);
    }
    Ok(pins)
}
