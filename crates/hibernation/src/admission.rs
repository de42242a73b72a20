//! Node admission for resuming clusters
//!
//! Once machines are running, nodes must rejoin the cluster before it counts
//! as running again. Kubelets coming back from a long stop usually hold
//! expired certificates and request new ones; this module approves the
//! requests that match the node bootstrap policy and leaves everything else
//! pending for someone else to decide.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use k8s_openapi::api::{
    certificates::v1::{CertificateSigningRequest, CertificateSigningRequestCondition},
    core::v1::Node,
};
use thiserror::Error;
use tracing::{Level, instrument};
use x509_parser::{
    certification_request::X509CertificationRequest,
    extensions::{GeneralName, ParsedExtension},
    prelude::FromDer,
};

#[cfg(test)]
use mockall::automock;

use crate::{Result, remote::RemoteClient};

pub const NODE_USER_PREFIX: &str = "system:node:";
pub const NODES_GROUP: &str = "system:nodes";
pub const NODE_BOOTSTRAPPER: &str =
    "system:serviceaccount:openshift-machine-config-operator:node-bootstrapper";
pub const KUBELET_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client-kubelet";
pub const KUBELET_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";
pub const APPROVAL_REASON: &str = "HibernationControllerApprove";

const CLIENT_USAGES: [&str; 3] = ["digital signature", "key encipherment", "client auth"];
const SERVING_USAGES: [&str; 3] = ["digital signature", "key encipherment", "server auth"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsrError {
    #[error("unable to parse CSR: {0}")]
    Parse(String),
    #[error("CSR not authorized: {0}")]
    Unauthorized(String),
}

/// Subject details pulled out of a PKCS#10 request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCsr {
    pub common_name: Option<String>,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl ParsedCsr {
    fn has_sans(&self) -> bool {
        !self.dns_names.is_empty() || !self.ip_addresses.is_empty()
    }
}

#[cfg_attr(test, automock)]
pub trait CsrHelper: Send + Sync {
    fn is_approved(&self, csr: &CertificateSigningRequest) -> bool;

    fn parse(&self, csr: &CertificateSigningRequest) -> Result<ParsedCsr, CsrError>;

    /// Check the request against node bootstrap policy. `nodes` is the
    /// remote cluster's current node list.
    fn authorize(
        &self,
        csr: &CertificateSigningRequest,
        parsed: &ParsedCsr,
        nodes: &[Node],
    ) -> Result<(), CsrError>;

    /// The request with an `Approved` condition added
    fn approve(&self, csr: &CertificateSigningRequest) -> CertificateSigningRequest;
}

/// Approves kubelet client and serving certificates for cluster nodes
#[derive(Debug, Clone)]
pub struct NodeCsrHelper {
    bootstrappers: Vec<String>,
}

impl Default for NodeCsrHelper {
    fn default() -> Self {
        Self {
            bootstrappers: vec![NODE_BOOTSTRAPPER.to_string()],
        }
    }
}

impl NodeCsrHelper {
    pub fn with_bootstrappers(bootstrappers: Vec<String>) -> Self {
        Self { bootstrappers }
    }

    fn authorize_client(
        &self,
        csr: &CertificateSigningRequest,
        parsed: &ParsedCsr,
        common_name: &str,
    ) -> Result<(), CsrError> {
        let username = csr.spec.username.as_deref().unwrap_or_default();
        if username != common_name && !self.bootstrappers.iter().any(|b| b == username) {
            return Err(CsrError::Unauthorized(format!(
                "client CSR for {common_name} requested by {username}"
            )));
        }
        if parsed.has_sans() {
            return Err(CsrError::Unauthorized(
                "client CSR must not carry subject alternative names".to_string(),
            ));
        }
        check_usages(csr, &CLIENT_USAGES, "client auth")
    }

    fn authorize_serving(
        &self,
        csr: &CertificateSigningRequest,
        parsed: &ParsedCsr,
        common_name: &str,
        nodes: &[Node],
    ) -> Result<(), CsrError> {
        let username = csr.spec.username.as_deref().unwrap_or_default();
        if username != common_name {
            return Err(CsrError::Unauthorized(format!(
                "serving CSR for {common_name} requested by {username}"
            )));
        }
        check_usages(csr, &SERVING_USAGES, "server auth")?;

        let node_name = &common_name[NODE_USER_PREFIX.len()..];
        let node = nodes
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(node_name))
            .ok_or_else(|| CsrError::Unauthorized(format!("node {node_name} not found")))?;
        let addresses: Vec<&str> = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .map(|a| a.iter().map(|a| a.address.as_str()).collect())
            .unwrap_or_default();

        for dns in &parsed.dns_names {
            if !addresses.contains(&dns.as_str()) {
                return Err(CsrError::Unauthorized(format!(
                    "DNS name {dns} is not an address of node {node_name}"
                )));
            }
        }
        for ip in &parsed.ip_addresses {
            if !addresses.iter().any(|a| a.parse::<IpAddr>().ok() == Some(*ip)) {
                return Err(CsrError::Unauthorized(format!(
                    "IP {ip} is not an address of node {node_name}"
                )));
            }
        }
        Ok(())
    }
}

fn check_usages(
    csr: &CertificateSigningRequest,
    allowed: &[&str],
    required: &str,
) -> Result<(), CsrError> {
    let usages = csr.spec.usages.as_deref().unwrap_or_default();
    if let Some(bad) = usages.iter().find(|u| !allowed.contains(&u.as_str())) {
        return Err(CsrError::Unauthorized(format!("usage {bad} not allowed")));
    }
    if !usages.iter().any(|u| u == required) {
        return Err(CsrError::Unauthorized(format!("missing usage {required}")));
    }
    Ok(())
}

fn has_condition(csr: &CertificateSigningRequest, type_: &str) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == type_ && c.status == "True"))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

impl CsrHelper for NodeCsrHelper {
    fn is_approved(&self, csr: &CertificateSigningRequest) -> bool {
        has_condition(csr, "Approved")
    }

    fn parse(&self, csr: &CertificateSigningRequest) -> Result<ParsedCsr, CsrError> {
        let pem = ::pem::parse(&csr.spec.request.0)
            .map_err(|e| CsrError::Parse(format!("invalid PEM: {e}")))?;
        if pem.tag() != "CERTIFICATE REQUEST" {
            return Err(CsrError::Parse(format!("unexpected PEM block {}", pem.tag())));
        }
        let (_, request) = X509CertificationRequest::from_der(pem.contents())
            .map_err(|e| CsrError::Parse(e.to_string()))?;

        let subject = &request.certification_request_info.subject;
        let mut parsed = ParsedCsr {
            common_name: subject
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string),
            organizations: subject
                .iter_organization()
                .filter_map(|o| o.as_str().ok())
                .map(str::to_string)
                .collect(),
            ..Default::default()
        };

        for extension in request.requested_extensions().into_iter().flatten() {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => parsed.dns_names.push(dns.to_string()),
                        GeneralName::IPAddress(bytes) => {
                            let ip = ip_from_bytes(bytes).ok_or_else(|| {
                                CsrError::Parse("malformed IP address SAN".to_string())
                            })?;
                            parsed.ip_addresses.push(ip);
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(parsed)
    }

    fn authorize(
        &self,
        csr: &CertificateSigningRequest,
        parsed: &ParsedCsr,
        nodes: &[Node],
    ) -> Result<(), CsrError> {
        let common_name = parsed
            .common_name
            .as_deref()
            .filter(|cn| cn.starts_with(NODE_USER_PREFIX) && cn.len() > NODE_USER_PREFIX.len())
            .ok_or_else(|| {
                CsrError::Unauthorized(format!(
                    "common name {:?} is not a node identity",
                    parsed.common_name
                ))
            })?;
        if parsed.organizations != [NODES_GROUP] {
            return Err(CsrError::Unauthorized(format!(
                "organizations {:?} must be exactly [{NODES_GROUP}]",
                parsed.organizations
            )));
        }

        match csr.spec.signer_name.as_str() {
            KUBELET_CLIENT_SIGNER => self.authorize_client(csr, parsed, common_name),
            KUBELET_SERVING_SIGNER => self.authorize_serving(csr, parsed, common_name, nodes),
            other => Err(CsrError::Unauthorized(format!("unexpected signer {other}"))),
        }
    }

    fn approve(&self, csr: &CertificateSigningRequest) -> CertificateSigningRequest {
        let mut approved = csr.clone();
        approved
            .status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
            .push(CertificateSigningRequestCondition {
                type_: "Approved".to_string(),
                status: "True".to_string(),
                reason: Some(APPROVAL_REASON.to_string()),
                message: Some("Approved by the hibernation controller".to_string()),
                ..Default::default()
            });
        approved
    }
}

/// Every node reports Ready=True. No nodes is not ready.
pub fn nodes_ready(nodes: &[Node]) -> bool {
    !nodes.is_empty() && nodes.iter().all(node_ready)
}

fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    NodesReady,
    /// Nodes still joining; `approved` CSRs were approved on this pass
    Waiting { approved: usize },
}

/// Check node readiness and, while nodes are not ready, approve pending
/// node CSRs. Unparseable or unauthorized requests are left pending.
#[instrument(level = Level::DEBUG, skip_all)]
pub async fn admit_nodes(remote: &dyn RemoteClient, helper: &dyn CsrHelper) -> Result<Admission> {
    let nodes = remote.list_nodes().await?;
    if nodes_ready(&nodes) {
        return Ok(Admission::NodesReady);
    }
    tracing::info!(nodes = nodes.len(), "nodes not ready, checking for pending CSRs");

    let mut approved = 0;
    for csr in remote.list_csrs().await? {
        let name = csr.metadata.name.as_deref().unwrap_or_default();
        if helper.is_approved(&csr) || has_condition(&csr, "Denied") {
            continue;
        }
        let parsed = match helper.parse(&csr) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(csr = name, "skipping CSR: {e}");
                continue;
            }
        };
        if let Err(e) = helper.authorize(&csr, &parsed, &nodes) {
            tracing::info!(csr = name, "not approving CSR: {e}");
            continue;
        }
        remote.update_approval(&helper.approve(&csr)).await?;
        tracing::info!(csr = name, "approved CSR");
        approved += 1;
    }

    Ok(Admission::Waiting { approved })
}
