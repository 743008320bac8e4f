use pip_selector::SelectorError;

use crate::model::ResourceId;

#[derive(Debug, thiserror::Error)]
pub enum CalcError {
    #[error("policy {policy}: {source}")]
    Selector { policy: String, #[source] source: SelectorError },
    #[error("policy {policy}: invalid CIDR {cidr:?}")]
    InvalidCidr { policy: String, cidr: String },
    #[error("policy {policy}: invalid port {port:?}")]
    InvalidPort { policy: String, port: String },
    #[error("policy {policy}: unknown protocol {protocol:?}")]
    InvalidProtocol { policy: String, protocol: String },
    #[error("tier {0:?} does not exist")]
    UnknownTier(String),
    #[error("{0} does not exist")]
    MissingResource(ResourceId),
    #[error("{0} already exists")]
    DuplicateResource(ResourceId),
    #[error("{0} resource has no name")]
    Unnamed(&'static str),
    #[error("{0}: {1}")]
    InvalidResource(ResourceId, String),
}

pub type CalcResult<T> = Result<T, CalcError>;
