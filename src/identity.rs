//! Request identity supplied by the upstream auth gateway.
//!
//! The engine trusts whatever [`IdentityVerifier`] returns. The shipped
//! [`GatewayHeaders`] reads the identity headers the gateway injects after
//! authenticating the terminal, optionally checking a shared secret so the
//! server cannot be reached around the gateway.

use axum::http::HeaderMap;
use thiserror::Error;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const BRANCH_HEADER: &str = "x-branch-id";
pub const TERMINAL_HEADER: &str = "x-terminal-id";
pub const EMPLOYEE_HEADER: &str = "x-employee-id";
pub const GATEWAY_SECRET_HEADER: &str = "x-gateway-secret";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub tenant_id: i64,
    pub branch_id: Option<i64>,
    pub terminal_id: Option<String>,
    pub employee_id: Option<i64>,
}

impl RequestIdentity {
    pub fn tenant(tenant_id: i64) -> Self {
        Self {
            tenant_id,
            branch_id: None,
            terminal_id: None,
            employee_id: None,
        }
    }

    pub fn with_branch(mut self, branch_id: i64) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    pub fn with_terminal(mut self, terminal_id: impl Into<String>) -> Self {
        self.terminal_id = Some(terminal_id.into());
        self
    }

    pub fn with_employee(mut self, employee_id: i64) -> Self {
        self.employee_id = Some(employee_id);
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("missing or invalid tenant")]
    MissingTenant,
    #[error("invalid {0} header")]
    InvalidHeader(&'static str),
    #[error("request did not come through the gateway")]
    BadGatewaySecret,
}

pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, headers: &HeaderMap) -> Result<RequestIdentity, IdentityError>;
}

#[derive(Debug, Clone, Default)]
pub struct GatewayHeaders {
    secret: Option<String>,
}

impl GatewayHeaders {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }
}

impl IdentityVerifier for GatewayHeaders {
    fn verify(&self, headers: &HeaderMap) -> Result<RequestIdentity, IdentityError> {
        if let Some(secret) = &self.secret {
            let presented = header_str(headers, GATEWAY_SECRET_HEADER).unwrap_or_default();
            if !constant_time_eq(presented.as_bytes(), secret.as_bytes()) {
                return Err(IdentityError::BadGatewaySecret);
            }
        }

        let tenant_id = header_str(headers, TENANT_HEADER)
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|id| *id > 0)
            .ok_or(IdentityError::MissingTenant)?;

        let branch_id = optional_id(headers, BRANCH_HEADER)?;
        let employee_id = optional_id(headers, EMPLOYEE_HEADER)?;
        let terminal_id = match header_str(headers, TERMINAL_HEADER) {
            Some(raw) if crate::record::is_well_formed_id(raw) => Some(raw.to_string()),
            Some(_) => return Err(IdentityError::InvalidHeader(TERMINAL_HEADER)),
            None => None,
        };

        Ok(RequestIdentity {
            tenant_id,
            branch_id,
            terminal_id,
            employee_id,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn optional_id(headers: &HeaderMap, name: &'static str) -> Result<Option<i64>, IdentityError> {
    match header_str(headers, name) {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .map(Some)
            .ok_or(IdentityError::InvalidHeader(name)),
        None => Ok(None),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn reads_gateway_headers() {
        let identity = GatewayHeaders::default()
            .verify(&headers(&[
                (TENANT_HEADER, "7"),
                (BRANCH_HEADER, "3"),
                (TERMINAL_HEADER, "T-01"),
                (EMPLOYEE_HEADER, "42"),
            ]))
            .unwrap();
        assert_eq!(
            identity,
            RequestIdentity::tenant(7)
                .with_branch(3)
                .with_terminal("T-01")
                .with_employee(42)
        );
    }

    #[test]
    fn tenant_is_mandatory() {
        let verifier = GatewayHeaders::default();
        assert_eq!(
            verifier.verify(&headers(&[])).unwrap_err(),
            IdentityError::MissingTenant
        );
        assert_eq!(
            verifier.verify(&headers(&[(TENANT_HEADER, "abc")])).unwrap_err(),
            IdentityError::MissingTenant
        );
        assert_eq!(
            verifier
                .verify(&headers(&[(TENANT_HEADER, "1"), (BRANCH_HEADER, "x")]))
                .unwrap_err(),
            IdentityError::InvalidHeader(BRANCH_HEADER)
        );
    }

    #[test]
    fn gateway_secret_is_enforced() {
        let verifier = GatewayHeaders::new(Some("s3cret".into()));
        assert_eq!(
            verifier.verify(&headers(&[(TENANT_HEADER, "1")])).unwrap_err(),
            IdentityError::BadGatewaySecret
        );
        assert!(verifier
            .verify(&headers(&[(TENANT_HEADER, "1"), (GATEWAY_SECRET_HEADER, "s3cret")]))
            .is_ok());
        // Empty secret configured means no check.
        assert!(GatewayHeaders::new(Some(String::new()))
            .verify(&headers(&[(TENANT_HEADER, "1")]))
            .is_ok());
    }
}
