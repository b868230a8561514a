//! Resolving the acting principal from call credentials
use crate::error::WorkflowError;
use crate::types::{AdminId, ArtisanId, ClientId, GuestToken, Principal};
use crate::utils::bech32_hrp;

/// Credentials presented with a call, as extracted by the API layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// An authenticated account id (`client1…`, `artisan1…`, `admin1…`).
    pub account: Option<String>,
    /// The opaque token of an anonymous submitter.
    pub guest_token: Option<String>,
}

impl RequestContext {
    pub fn account(id: impl Into<String>) -> Self {
        Self {
            account: Some(id.into()),
            guest_token: None,
        }
    }
    pub fn guest(token: impl Into<String>) -> Self {
        Self {
            account: None,
            guest_token: Some(token.into()),
        }
    }
}

pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, context: &RequestContext) -> Result<Principal, WorkflowError>;
}

/// Derives the role from the human readable part of a bech32 account id.
/// An account takes precedence over a guest token.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenResolver;

impl IdentityResolver for TokenResolver {
    fn resolve(&self, context: &RequestContext) -> Result<Principal, WorkflowError> {
        if let Some(account) = &context.account {
            let hrp = bech32_hrp(account).ok_or_else(|| {
                WorkflowError::Unauthenticated(format!("{account} is not a valid account id"))
            })?;
            let account = account.clone();
            return match hrp.as_str() {
                ClientId::HRP => Ok(Principal::Client(ClientId::from(account))),
                ArtisanId::HRP => Ok(Principal::Artisan(ArtisanId::from(account))),
                AdminId::HRP => Ok(Principal::Admin(AdminId::from(account))),
                other => Err(WorkflowError::Unauthenticated(format!(
                    "unknown account kind {other}"
                ))),
            };
        }
        match &context.guest_token {
            Some(token) if !token.trim().is_empty() => {
                Ok(Principal::Guest(GuestToken::from(token.as_str())))
            }
            _ => Err(WorkflowError::Unauthenticated("no credentials presented".into())),
        }
    }
}
