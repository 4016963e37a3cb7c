use std::sync::Arc;

use mediaflow_types::CredentialId;

use crate::ports::CredentialProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub credential_id: Option<CredentialId>,
    pub bearer: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollCredential {
    Ready {
        credential: ResolvedCredential,
        /// The id was looked up through the remote job and should be pinned.
        newly_pinned: bool,
    },
    /// The credential could not be resolved this time.
    Unavailable(String),
}

/// Resolves bearers through the credential provider, falling back to a
/// statically configured key when no provider is attached.
#[derive(Clone, Default)]
pub struct CredentialResolver {
    provider: Option<Arc<dyn CredentialProvider>>,
    fallback_bearer: Option<String>,
}

impl CredentialResolver {
    pub fn new(
        provider: Option<Arc<dyn CredentialProvider>>,
        fallback_bearer: Option<String>,
    ) -> Self {
        Self {
            provider,
            fallback_bearer: fallback_bearer.filter(|b| !b.trim().is_empty()),
        }
    }

    /// Whether any way of obtaining a bearer exists at all.
    pub fn has_mechanism(&self) -> bool {
        self.provider.is_some() || self.fallback_bearer.is_some()
    }

    pub fn fallback_bearer(&self) -> Option<&str> {
        self.fallback_bearer.as_deref()
    }

    /// Picks a credential for a new job. The error is the user-facing reason.
    pub async fn acquire_for_submission(&self) -> Result<ResolvedCredential, String> {
        if let Some(provider) = &self.provider {
            return provider
                .pick_random_credential()
                .await
                .map(|grant| ResolvedCredential {
                    credential_id: Some(grant.credential_id),
                    bearer: grant.bearer,
                })
                .map_err(|err| err.to_string());
        }
        self.fallback_bearer
            .clone()
            .map(|bearer| ResolvedCredential {
                credential_id: None,
                bearer,
            })
            .ok_or_else(|| "no credential available".to_string())
    }

    /// Resolves the bearer a poller should use, looking up the credential
    /// id through the remote job when it was never pinned.
    pub async fn resolve_for_poll(
        &self,
        pinned: Option<CredentialId>,
        remote_job_id: &str,
    ) -> anyhow::Result<PollCredential> {
        let Some(provider) = &self.provider else {
            return Ok(match &self.fallback_bearer {
                Some(bearer) => PollCredential::Ready {
                    credential: ResolvedCredential {
                        credential_id: None,
                        bearer: bearer.clone(),
                    },
                    newly_pinned: false,
                },
                None => PollCredential::Unavailable("no credential mechanism".to_string()),
            });
        };

        let (credential_id, newly_pinned) = match pinned {
            Some(id) => (id, false),
            None => match provider.credential_id_for_remote_job(remote_job_id).await? {
                Some(id) => (id, true),
                None => {
                    return Ok(PollCredential::Unavailable(format!(
                        "no credential recorded for remote job {remote_job_id}"
                    )))
                }
            },
        };

        match provider.bearer_for(credential_id).await? {
            Some(bearer) if !bearer.trim().is_empty() => Ok(PollCredential::Ready {
                credential: ResolvedCredential {
                    credential_id: Some(credential_id),
                    bearer,
                },
                newly_pinned,
            }),
            _ => Ok(PollCredential::Unavailable(format!(
                "no bearer for credential {credential_id}"
            ))),
        }
    }
}
