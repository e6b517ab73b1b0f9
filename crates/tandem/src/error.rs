/// Mistakes caught while assembling endpoints and routers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("endpoint name must not be empty")]
    EmptyEndpointName,

    #[error("endpoint {0:?} is registered twice")]
    DuplicateEndpoint(String),

    #[error("method {method:?} is declared twice on endpoint {endpoint:?}")]
    DuplicateMethod { endpoint: String, method: String },
}
