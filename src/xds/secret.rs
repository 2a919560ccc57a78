//! SDS secret projection
//!
//! Serving certificates referenced by secure virtual hosts are delivered over
//! SDS under their content-hashed [`secret_name`], so a rotated certificate
//! gets a new name and listeners pick it up on their next update.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::{data_source::Specifier, DataSource};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret, Secret as EnvoySecret, TlsCertificate,
};
use tracing::{debug, warn};

use crate::dag::{Dag, Secret};
use crate::xds::envoy::secret_name;

fn inline_bytes(value: &str) -> Option<DataSource> {
    Some(DataSource {
        specifier: Some(Specifier::InlineBytes(value.as_bytes().to_vec())),
        ..Default::default()
    })
}

/// Render a certificate/key pair. Returns `None` when either half is missing.
pub fn envoy_secret(secret: &Secret) -> Option<EnvoySecret> {
    if secret.cert().is_empty() || secret.private_key().is_empty() {
        return None;
    }

    Some(EnvoySecret {
        name: secret_name(secret),
        r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
            certificate_chain: inline_bytes(secret.cert()),
            private_key: inline_bytes(secret.private_key()),
            ..Default::default()
        })),
    })
}

/// Project every serving certificate in the graph, keyed by SDS name.
pub fn visit_secrets(dag: &Dag) -> BTreeMap<String, EnvoySecret> {
    let mut secrets = BTreeMap::new();
    for (name, secret) in dag.secrets() {
        match envoy_secret(secret) {
            Some(rendered) => {
                secrets.insert(rendered.name.clone(), rendered);
            }
            None => {
                warn!(secret = %name, "Secret has no certificate/key pair, skipping");
            }
        }
    }
    debug!(secret_count = secrets.len(), "Projected secrets");
    secrets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{FullName, SecureVirtualHost};

    fn tls_secret(name: &str, cert: &str) -> Secret {
        Secret {
            name: FullName::new("default", name),
            data: BTreeMap::from([
                ("tls.crt".to_string(), cert.to_string()),
                ("tls.key".to_string(), "KEY".to_string()),
            ]),
        }
    }

    #[test]
    fn renders_inline_certificate() {
        let rendered = envoy_secret(&tls_secret("web", "CERT")).expect("secret");
        assert!(rendered.name.starts_with("default/web/"));
        let Some(secret::Type::TlsCertificate(cert)) = rendered.r#type else {
            panic!("expected tls certificate");
        };
        assert_eq!(
            cert.certificate_chain.and_then(|d| d.specifier),
            Some(Specifier::InlineBytes(b"CERT".to_vec()))
        );
    }

    #[test]
    fn rotated_certificate_changes_name() {
        let before = envoy_secret(&tls_secret("web", "CERT-1")).expect("secret");
        let after = envoy_secret(&tls_secret("web", "CERT-2")).expect("secret");
        assert_ne!(before.name, after.name);
    }

    #[test]
    fn incomplete_secret_is_skipped() {
        let ca_only = Secret {
            name: FullName::new("default", "ca"),
            data: BTreeMap::from([("ca.crt".to_string(), "CA".to_string())]),
        };
        assert!(envoy_secret(&ca_only).is_none());
    }

    #[test]
    fn collects_serving_and_fallback_certificates() {
        let mut a = SecureVirtualHost::new("a.example.com");
        a.secret = Some(tls_secret("shared", "CERT"));
        a.fallback_certificate = Some(tls_secret("fallback", "FALLBACK"));
        let mut b = SecureVirtualHost::new("b.example.com");
        b.secret = Some(tls_secret("shared", "CERT"));

        let dag = Dag {
            secure_virtual_hosts: BTreeMap::from([
                (a.name().to_string(), a),
                (b.name().to_string(), b),
            ]),
            ..Default::default()
        };

        let secrets = visit_secrets(&dag);
        assert_eq!(secrets.len(), 2);
    }
}
