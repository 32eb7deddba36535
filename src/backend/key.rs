use crate::ValidationError;
use std::fmt::{Display, Formatter};

/// Identifies one rate limit log: a caller and the resource it is calling.
///
/// Two keys are equal only when both the identity and the resource are equal.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RequestKey {
    identity: String,
    resource: String,
}

impl RequestKey {
    /// # Errors
    ///
    /// Returns [ValidationError::EmptyIdentity] if `identity` is empty. An empty `resource`
    /// is accepted and means the limit is global for that identity.
    pub fn new(
        identity: impl Into<String>,
        resource: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(ValidationError::EmptyIdentity);
        }
        Ok(Self {
            identity,
            resource: resource.into(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_global(&self) -> bool {
        self.resource.is_empty()
    }

    /// Encodes the key as a single string for external stores.
    ///
    /// The identity is length prefixed, so the encoding stays unique even when the identity
    /// or resource contain the separator.
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.identity.len(), self.identity, self.resource)
    }
}

impl Display for RequestKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_global() {
            write!(f, "{}", self.identity)
        } else {
            write!(f, "{}/{}", self.identity, self.resource)
        }
    }
}
